//! Huffman coding over a weight-sorted sibling list
//!
//! The first byte of a stream selects the initial weight table. Table 0
//! gives every byte a nonzero weight and adapts: each coded byte bumps its
//! leaf and the tree is rebalanced in place, so encoder and decoder stay in
//! step without ever rebuilding.
//!
//! All nodes live in one list ordered by descending weight. The root is
//! the first entry and the two children of a node sit next to each other,
//! the heavier ("hi") directly before the lighter ("lo"). A 0 bit follows
//! the lo child and a 1 bit the hi child. Bits are packed LSB first, root
//! decision first.

use super::bits::{BitReader, BitWriter};
use crate::{Error, Result};

const SYMBOL_COUNT: usize = 258;
const END_OF_STREAM: usize = 0x100;
const ESCAPE: usize = 0x101;
/// Capacity of the node pool; a full table-0 tree uses all of it
const MAX_NODES: usize = 0x203;
const NO_NODE: u32 = u32::MAX;

/// The adaptive weight table
const ADAPTIVE_TABLE: u8 = 0;
/// Highest weight table identifier a stream may name
const LAST_TABLE: u8 = 8;

fn initial_weights(table: u8) -> Result<[u8; 256]> {
    match table {
        ADAPTIVE_TABLE => {
            let mut weights = [0x01; 256];
            weights[0] = 0x0A;
            weights[1] = 0x02;
            Ok(weights)
        }
        1..=LAST_TABLE => Err(Error::compression(format!(
            "static Huffman weight table {} is not supported",
            table
        ))),
        _ => Err(Error::compression(format!(
            "invalid Huffman weight table {}",
            table
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    symbol: u16,
    weight: u32,
    parent: u32,
    /// List slot of the lo child, `NO_NODE` for leaves. The hi child is
    /// always at `lo_slot - 1`.
    lo_slot: u32,
}

#[derive(Debug)]
struct WeightTree {
    nodes: Vec<Node>,
    /// Node id at each list slot, heaviest first
    order: Vec<u32>,
    /// List slot of each node id
    slot: Vec<u32>,
    leaf: [u32; SYMBOL_COUNT],
}

impl WeightTree {
    fn new(table: u8) -> Result<Self> {
        let weights = initial_weights(table)?;
        let mut tree = Self {
            nodes: Vec::with_capacity(MAX_NODES),
            order: Vec::with_capacity(MAX_NODES),
            slot: Vec::with_capacity(MAX_NODES),
            leaf: [NO_NODE; SYMBOL_COUNT],
        };

        // Leaves go behind every entry at least as heavy, so equal weights
        // keep byte order
        let mut list: Vec<u32> = Vec::with_capacity(MAX_NODES);
        for (symbol, &weight) in weights.iter().enumerate() {
            if weight == 0 {
                continue;
            }
            let id = tree.push_node(symbol, weight as u32);
            let at = tree.insertion_point(&list, weight as u32);
            list.insert(at, id);
            tree.leaf[symbol] = id;
        }
        for symbol in [END_OF_STREAM, ESCAPE] {
            let id = tree.push_node(symbol, 1);
            list.push(id);
            tree.leaf[symbol] = id;
        }

        // Pair from the light end; each parent is placed by weight and may
        // itself be the next lo child
        let mut lo_children = Vec::with_capacity(MAX_NODES / 2);
        let mut lo_at = list.len() - 1;
        while lo_at > 0 {
            let lo = list[lo_at];
            let hi = list[lo_at - 1];
            let weight = tree.nodes[hi as usize].weight + tree.nodes[lo as usize].weight;
            let parent = tree.push_node(0, weight);
            tree.nodes[lo as usize].parent = parent;
            tree.nodes[hi as usize].parent = parent;
            lo_children.push((parent, lo));

            let at = tree.insertion_point(&list, weight);
            list.insert(at, parent);

            match list.iter().position(|&id| id == hi) {
                Some(hi_at) if hi_at > 0 => lo_at = hi_at - 1,
                _ => break,
            }
        }

        tree.slot = vec![0; tree.nodes.len()];
        for (at, &id) in list.iter().enumerate() {
            tree.slot[id as usize] = at as u32;
        }
        for (parent, lo) in lo_children {
            tree.nodes[parent as usize].lo_slot = tree.slot[lo as usize];
        }
        tree.order = list;
        Ok(tree)
    }

    fn push_node(&mut self, symbol: usize, weight: u32) -> u32 {
        self.nodes.push(Node {
            symbol: symbol as u16,
            weight,
            parent: NO_NODE,
            lo_slot: NO_NODE,
        });
        (self.nodes.len() - 1) as u32
    }

    /// Slot just behind the last entry weighing at least `weight`
    fn insertion_point(&self, list: &[u32], weight: u32) -> usize {
        list.iter()
            .rposition(|&id| self.nodes[id as usize].weight >= weight)
            .map_or(0, |at| at + 1)
    }

    fn weight_at(&self, slot: usize) -> u32 {
        self.nodes[self.order[slot] as usize].weight
    }

    /// Bump a leaf and every ancestor. A node that outgrows its
    /// predecessors trades places, and parents, with the first node of
    /// its old weight.
    fn increment(&mut self, mut node: u32) {
        while node != NO_NODE {
            let weight = {
                let n = &mut self.nodes[node as usize];
                n.weight += 1;
                n.weight
            };

            let at = self.slot[node as usize] as usize;
            let mut target = at;
            while target > 0 && self.weight_at(target - 1) < weight {
                target -= 1;
            }
            if target != at {
                self.swap(node, self.order[target]);
            }

            node = self.nodes[node as usize].parent;
        }
    }

    /// Exchange the list slots and parents of two nodes. Children are
    /// addressed by slot, so no child link needs fixing.
    fn swap(&mut self, a: u32, b: u32) {
        let (slot_a, slot_b) = (self.slot[a as usize], self.slot[b as usize]);
        self.order[slot_a as usize] = b;
        self.order[slot_b as usize] = a;
        self.slot[a as usize] = slot_b;
        self.slot[b as usize] = slot_a;

        let parent_a = self.nodes[a as usize].parent;
        self.nodes[a as usize].parent = self.nodes[b as usize].parent;
        self.nodes[b as usize].parent = parent_a;
    }

    fn encode(&self, writer: &mut BitWriter, symbol: usize, path: &mut Vec<u8>) {
        path.clear();
        let mut node = self.leaf[symbol];
        loop {
            let parent = self.nodes[node as usize].parent;
            if parent == NO_NODE {
                break;
            }
            let is_lo = self.nodes[parent as usize].lo_slot == self.slot[node as usize];
            path.push(if is_lo { 0 } else { 1 });
            node = parent;
        }
        for &bit in path.iter().rev() {
            writer.bit(bit as u32);
        }
    }

    fn decode(&self, reader: &mut BitReader<'_>) -> Result<usize> {
        let mut node = &self.nodes[self.order[0] as usize];
        while node.lo_slot != NO_NODE {
            let slot = if reader.bit()? == 1 {
                node.lo_slot - 1
            } else {
                node.lo_slot
            };
            node = &self.nodes[self.order[slot as usize] as usize];
        }
        Ok(node.symbol as usize)
    }
}

/// Compress with the adaptive table
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut tree = WeightTree::new(ADAPTIVE_TABLE)?;
    let mut writer = BitWriter::with_prefix(&[ADAPTIVE_TABLE], data.len() + 2);
    let mut path = Vec::with_capacity(32);

    for &byte in data {
        let symbol = byte as usize;
        tree.encode(&mut writer, symbol, &mut path);
        tree.increment(tree.leaf[symbol]);
    }

    tree.encode(&mut writer, END_OF_STREAM, &mut path);
    Ok(writer.finish())
}

/// Decompress a Huffman stream, stopping one byte past `limit`
pub(crate) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let (&table, stream) = data
        .split_first()
        .ok_or_else(|| Error::compression("empty Huffman stream"))?;

    let mut tree = WeightTree::new(table)?;
    let mut reader = BitReader::new(stream);
    let mut out = super::output_buffer(limit);

    while out.len() <= limit {
        let symbol = match tree.decode(&mut reader)? {
            END_OF_STREAM => break,
            // every byte already has a leaf and the pool has no room left
            ESCAPE => {
                return Err(Error::compression(
                    "Huffman escape in a stream whose tree is already full",
                ))
            }
            symbol => symbol,
        };
        out.push(symbol as u8);
        tree.increment(tree.leaf[symbol]);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_known_vectors() {
        let cases: [(&[u8], &str); 4] = [
            (b"", "00f701"),
            (b"aab", "0072af92af01"),
            (b"MPQ\x1a", "004afa7a81ef01"),
            (b"abracadabra", "0072929eaf120fe9c7cbf3f51e"),
        ];
        for (input, packed) in cases {
            assert_eq!(compress(input).unwrap(), hex(packed), "{:?}", input);
            assert_eq!(decompress(&hex(packed), input.len()).unwrap(), input);
        }
    }

    #[test]
    fn test_repeated_zeros_vector() {
        let packed = hex("00efbdf7dedbbdbbbbbbfd");
        assert_eq!(compress(&[0u8; 16]).unwrap(), packed);
        assert_eq!(decompress(&packed, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_initial_tree_shape() {
        let tree = WeightTree::new(ADAPTIVE_TABLE).unwrap();
        assert_eq!(tree.nodes.len(), MAX_NODES);
        assert_eq!(tree.weight_at(0), 10 + 2 + 254 + 2);

        for at in 1..tree.order.len() {
            assert!(tree.weight_at(at - 1) >= tree.weight_at(at));
        }
        for node in &tree.nodes {
            if node.lo_slot != NO_NODE {
                let lo = tree.weight_at(node.lo_slot as usize);
                let hi = tree.weight_at(node.lo_slot as usize - 1);
                assert_eq!(node.weight, lo + hi);
            }
        }
    }

    #[test]
    fn test_rebalancing_keeps_sibling_order() {
        let mut tree = WeightTree::new(ADAPTIVE_TABLE).unwrap();
        for i in 0..5000u32 {
            let symbol = [b'e', b'e', b't', b'a', 0, (i % 251) as u8][(i % 6) as usize];
            tree.increment(tree.leaf[symbol as usize]);
        }

        for at in 1..tree.order.len() {
            assert!(tree.weight_at(at - 1) >= tree.weight_at(at));
        }
        for (id, node) in tree.nodes.iter().enumerate() {
            assert_eq!(tree.order[tree.slot[id] as usize], id as u32);
            if node.lo_slot != NO_NODE {
                let lo = tree.order[node.lo_slot as usize];
                let hi = tree.order[node.lo_slot as usize - 1];
                assert_eq!(tree.nodes[lo as usize].parent, id as u32);
                assert_eq!(tree.nodes[hi as usize].parent, id as u32);
                assert_eq!(
                    node.weight,
                    tree.nodes[lo as usize].weight + tree.nodes[hi as usize].weight
                );
            }
        }
    }

    #[test]
    fn test_round_trip() {
        let inputs: Vec<Vec<u8>> = vec![
            b"a".to_vec(),
            b"hello world hello world".to_vec(),
            (0..=255u8).cycle().take(512).collect(),
            (0..3000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect(),
        ];

        for input in inputs {
            let packed = compress(&input).unwrap();
            assert_eq!(decompress(&packed, input.len()).unwrap(), input);
        }
    }

    #[test]
    fn test_skewed_data_shrinks() {
        let input = vec![0u8; 4096];
        assert!(compress(&input).unwrap().len() < 600);
    }

    #[test]
    fn test_table_selection() {
        assert!(decompress(&[0x03, 0x00], 0).is_err());
        assert!(decompress(&[0x09, 0x00], 0).is_err());
        assert!(decompress(&[], 0).is_err());
    }

    #[test]
    fn test_escape_rejected_for_full_tree() {
        let tree = WeightTree::new(ADAPTIVE_TABLE).unwrap();
        let mut writer = BitWriter::with_prefix(&[ADAPTIVE_TABLE], 8);
        let mut path = Vec::new();
        tree.encode(&mut writer, ESCAPE, &mut path);
        writer.bits(b'A' as u32, 8);
        assert!(decompress(&writer.finish(), 16).is_err());
    }

    #[test]
    fn test_output_stops_past_limit() {
        let packed = compress(&[7u8; 10_000]).unwrap();
        assert_eq!(decompress(&packed, 100).unwrap().len(), 101);
    }

    #[test]
    fn test_truncated_stream() {
        let packed = compress(b"some text that is long enough").unwrap();
        assert!(decompress(&packed[..4], 29).is_err());
    }
}
