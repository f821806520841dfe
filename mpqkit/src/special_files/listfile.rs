//! `(listfile)`: the archive's list of known paths

use crate::crypto::normalize_path;
use std::collections::HashMap;

/// Name of the listfile inside an archive
pub const LISTFILE_NAME: &str = "(listfile)";

fn is_separator(c: char) -> bool {
    matches!(c, ';' | '\r' | '\n')
}

/// Split listfile text on maximal runs of `;`, CR and LF
pub fn split_entries(text: &str) -> Vec<&str> {
    text.split(is_separator).filter(|s| !s.is_empty()).collect()
}

/// Parse raw listfile bytes into paths
///
/// Invalid UTF-8 is replaced rather than rejected; listfiles written by old
/// tools are frequently in a legacy code page.
pub fn parse_listfile(data: &[u8]) -> Vec<String> {
    let content = match std::str::from_utf8(data) {
        Ok(s) => std::borrow::Cow::Borrowed(s),
        Err(_) => {
            log::warn!("(listfile) contains invalid UTF-8, using lossy conversion");
            String::from_utf8_lossy(data)
        }
    };

    let entries: Vec<String> = split_entries(&content)
        .into_iter()
        .map(str::to_string)
        .collect();

    log::debug!("parsed {} entries from (listfile)", entries.len());
    entries
}

/// Canonicalize every path prefix to the casing it was first seen with
///
/// `Data\Foo.txt` followed by `DATA\bar.txt` yields `Data\Foo.txt` and
/// `Data\bar.txt`. Separators are normalized to `\`.
pub fn normalize_case<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut canonical: HashMap<String, String> = HashMap::new();

    entries
        .iter()
        .map(|entry| {
            let mut folded = String::new();
            let mut out = String::new();
            for (i, segment) in entry.as_ref().split(['\\', '/']).enumerate() {
                if i > 0 {
                    folded.push('\\');
                    out.push('\\');
                }
                folded.push_str(&segment.to_ascii_uppercase());
                let chosen = canonical
                    .entry(folded.clone())
                    .or_insert_with(|| segment.to_string());
                out.push_str(chosen);
            }
            out
        })
        .collect()
}

/// An editable listfile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listfile {
    entries: Vec<String>,
}

impl Listfile {
    /// Empty listfile
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse raw listfile bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            entries: parse_listfile(data),
        }
    }

    /// Build from a list of paths, dropping case-insensitive duplicates
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut listfile = Self::new();
        for entry in entries {
            listfile.insert(entry);
        }
        listfile
    }

    /// All paths in file order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the listfile has no paths
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, path: &str) -> Option<usize> {
        let wanted = fold(path);
        self.entries.iter().position(|e| fold(e) == wanted)
    }

    /// Case- and separator-insensitive membership
    pub fn contains(&self, path: &str) -> bool {
        self.position(path).is_some()
    }

    /// Add a path unless it is already present; returns whether it was added.
    /// Stored paths use backslash separators.
    pub fn insert<S: Into<String>>(&mut self, path: S) -> bool {
        let path = normalize_path(&path.into());
        if path.is_empty() || self.contains(&path) {
            return false;
        }
        self.entries.push(path);
        true
    }

    /// Remove a path; returns whether it was present
    pub fn remove(&mut self, path: &str) -> bool {
        match self.position(path) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Serialize with CRLF line endings
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.entries.iter().map(|e| e.len() + 2).sum());
        for entry in &self.entries {
            out.push_str(entry);
            out.push_str("\r\n");
        }
        out.into_bytes()
    }
}

fn fold(path: &str) -> String {
    normalize_path(path).to_ascii_uppercase()
}
