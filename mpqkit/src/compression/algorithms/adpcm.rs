//! IMA ADPCM for 16-bit PCM sectors (lossy)
//!
//! Layout: `[0][bit shift]`, the first sample of every channel as a
//! little-endian i16, then one code byte per sample. `0x80` repeats the
//! predicted sample and lowers the step index; `0x81` raises the step index
//! by 8 without producing a sample.

use crate::{Error, Result};

const INITIAL_STEP_INDEX: i32 = 0x2C;
const MAX_STEP_INDEX: i32 = 88;
const REPEAT_MARKER: u8 = 0x80;
const STEP_UP_MARKER: u8 = 0x81;
const SIGN_BIT: u8 = 0x40;

/// Compression level used by the encoder; bit shift is level - 1
const DEFAULT_LEVEL: u32 = 5;

const NEXT_STEP: [i32; 32] = [
    -1, 0, -1, 4, -1, 2, -1, 6, -1, 1, -1, 5, -1, 3, -1, 7, -1, 1, -1, 5, -1, 3, -1, 7, -1, 2, -1,
    4, -1, 6, -1, 8,
];

const STEP_SIZE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

fn next_step_index(index: i32, code: u8) -> i32 {
    (index + NEXT_STEP[(code & 0x1F) as usize]).clamp(0, MAX_STEP_INDEX)
}

fn apply_difference(predicted: i32, code: u8, difference: i32) -> i32 {
    if code & SIGN_BIT != 0 {
        (predicted - difference).max(-32768)
    } else {
        (predicted + difference).min(32767)
    }
}

fn decode_sample(predicted: i32, code: u8, step: i32, shift: u32) -> i32 {
    let mut difference = step >> shift;
    for bit in 0..6 {
        if code & (1 << bit) != 0 {
            difference += step >> bit;
        }
    }
    apply_difference(predicted, code, difference)
}

/// Encode little-endian i16 samples interleaved over `channels`
pub(crate) fn compress(data: &[u8], channels: usize) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(Error::compression("ADPCM input must be whole 16-bit samples"));
    }

    let samples: Vec<i32> = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as i32)
        .collect();

    let level = DEFAULT_LEVEL;
    let shift = level - 1;
    let mut out = Vec::with_capacity(data.len() / 2 + 4);
    out.push(0);
    out.push(shift as u8);

    let mut predicted = [0i32; 2];
    let mut step_index = [INITIAL_STEP_INDEX; 2];

    let initial = samples.len().min(channels);
    for (channel, &sample) in samples[..initial].iter().enumerate() {
        predicted[channel] = sample;
        out.extend_from_slice(&(sample as i16).to_le_bytes());
    }

    let max_bit = (1u8 << (shift - 1)).min(0x20);
    let mut channel = channels - 1;

    for &sample in &samples[initial..] {
        channel = (channel + 1) % channels;

        let mut code = 0u8;
        let mut distance = sample - predicted[channel];
        if distance < 0 {
            distance = -distance;
            code |= SIGN_BIT;
        }

        let mut step = STEP_SIZE[step_index[channel] as usize];
        if distance < (step >> level) {
            if step_index[channel] != 0 {
                step_index[channel] -= 1;
            }
            out.push(REPEAT_MARKER);
            continue;
        }

        while distance > (step << 1) && step_index[channel] < MAX_STEP_INDEX {
            step_index[channel] = (step_index[channel] + 8).min(MAX_STEP_INDEX);
            step = STEP_SIZE[step_index[channel] as usize];
            out.push(STEP_UP_MARKER);
        }

        let base = step >> shift;
        let mut total = 0;
        let mut bit = 1u8;
        while bit <= max_bit {
            if total + step <= distance {
                total += step;
                code |= bit;
            }
            step >>= 1;
            bit <<= 1;
        }

        predicted[channel] = apply_difference(predicted[channel], code, base + total);
        out.push(code);
        step_index[channel] = next_step_index(step_index[channel], code);
    }

    Ok(out)
}

/// Decode to little-endian i16 samples interleaved over `channels`,
/// stopping once the output passes `limit`
pub(crate) fn decompress(data: &[u8], channels: usize, limit: usize) -> Result<Vec<u8>> {
    if data.len() < 2 {
        return Err(Error::compression("ADPCM stream too short"));
    }

    let shift = data[1] as u32;
    if shift > 15 {
        return Err(Error::compression(format!("invalid ADPCM bit shift {}", shift)));
    }

    let mut out = super::output_buffer(limit);
    let mut predicted = [0i32; 2];
    let mut step_index = [INITIAL_STEP_INDEX; 2];
    let mut pos = 2;

    for slot in predicted.iter_mut().take(channels) {
        let Some(pair) = data.get(pos..pos + 2) else {
            return Ok(out);
        };
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        *slot = sample as i32;
        out.extend_from_slice(&sample.to_le_bytes());
        pos += 2;
    }

    let mut channel = channels - 1;
    for &code in &data[pos..] {
        if out.len() > limit {
            break;
        }
        channel = (channel + 1) % channels;

        match code {
            REPEAT_MARKER => {
                if step_index[channel] != 0 {
                    step_index[channel] -= 1;
                }
                out.extend_from_slice(&(predicted[channel] as i16).to_le_bytes());
            }
            STEP_UP_MARKER => {
                step_index[channel] = (step_index[channel] + 8).min(MAX_STEP_INDEX);
                // the marker carries no sample; stay on this channel
                channel = (channel + channels - 1) % channels;
            }
            _ => {
                let index = step_index[channel];
                let step = STEP_SIZE[index as usize];
                predicted[channel] = decode_sample(predicted[channel], code, step, shift);
                out.extend_from_slice(&(predicted[channel] as i16).to_le_bytes());
                step_index[channel] = next_step_index(index, code);
            }
        }
    }

    Ok(out)
}
