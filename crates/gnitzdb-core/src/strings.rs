//! German-string representation used by string-typed columns
//! [spec §3 GLOSSARY, §4.1 "String representation"].
//!
//! A real mmap-backed shard or WAL block stores the inline/blob-offset
//! encoding directly in the region bytes (see `gnitzdb-storage`'s codec
//! modules for that wire packing). In memory, a `PayloadRow` simply owns
//! its string bytes; `GermanString` precomputes the length and 4-byte
//! prefix so comparisons and future serialization can short-circuit on
//! the prefix before touching the full bytes, exactly like the on-disk
//! format does.

/// Strings of this length or shorter are eligible for fully-inline
/// encoding (no blob heap entry) when serialized to a shard or WAL block.
pub const SHORT_STRING_THRESHOLD: usize = 12;

/// An owned string value carrying its German-string metadata.
#[derive(Debug, Clone, Eq)]
pub struct GermanString {
    value: String,
    prefix: [u8; 4],
}

impl GermanString {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let mut prefix = [0u8; 4];
        let bytes = value.as_bytes();
        let n = bytes.len().min(4);
        prefix[..n].copy_from_slice(&bytes[..n]);
        GermanString { value, prefix }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn len(&self) -> u32 {
        self.value.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn prefix(&self) -> [u8; 4] {
        self.prefix
    }

    /// Whether this string is short enough to be stored fully inline
    /// (no blob heap entry) by a shard/WAL writer.
    pub fn is_short(&self) -> bool {
        self.value.len() <= SHORT_STRING_THRESHOLD
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl PartialEq for GermanString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Ord for GermanString {
    /// Prefix-first comparison: compare the 4-byte prefix before falling
    /// back to the full bytes, matching the on-disk comparator that
    /// avoids touching the blob heap on a prefix mismatch.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.prefix.cmp(&other.prefix) {
            std::cmp::Ordering::Equal => self.value.as_bytes().cmp(other.value.as_bytes()),
            ord => ord,
        }
    }
}

impl PartialOrd for GermanString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for GermanString {
    fn from(s: &str) -> Self {
        GermanString::new(s)
    }
}

impl From<String> for GermanString {
    fn from(s: String) -> Self {
        GermanString::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long() {
        assert!(GermanString::new("short").is_short());
        assert!(!GermanString::new("a".repeat(13)).is_short());
        assert!(GermanString::new("a".repeat(12)).is_short());
    }

    #[test]
    fn prefix_short_circuit_ordering() {
        let a = GermanString::new("aaaa_z");
        let b = GermanString::new("aaab_a");
        assert!(a < b, "prefix compare should order by first differing byte");
    }

    #[test]
    fn prefix_tie_falls_back_to_full_bytes() {
        let a = GermanString::new("same_suffix_a");
        let b = GermanString::new("same_suffix_b");
        assert!(a < b);
    }
}
