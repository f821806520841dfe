//! Archive-internal pseudo-files: `(listfile)`, `(attributes)`, `(signature)`

pub mod attributes;
pub mod listfile;
pub mod signature;

pub use attributes::{
    filetime_to_posix, posix_to_filetime, AttributeFlags, Attributes, FileAttributes,
    ATTRIBUTES_NAME,
};
pub use listfile::{normalize_case, parse_listfile, split_entries, Listfile, LISTFILE_NAME};
pub use signature::{SignatureStatus, StrongSignature, WeakSignature, SIGNATURE_NAME};

/// Whether `path` names one of the internal pseudo-files
pub fn is_special_file(path: &str) -> bool {
    matches!(path, LISTFILE_NAME | ATTRIBUTES_NAME | SIGNATURE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_names() {
        assert!(is_special_file("(listfile)"));
        assert!(is_special_file("(attributes)"));
        assert!(is_special_file("(signature)"));
        assert!(!is_special_file("war3map.j"));
    }
}
