/// Version tag embedded in the hash header. Bumping it invalidates every
/// on-disk artifact written by an older release.
pub const HASH_VERSION: u32 = 4;

/// Computes content hashes and checks them against the header line of
/// previously generated files.
#[derive(Debug, Clone)]
pub struct HashValidator {
    prefix: String,
}

impl Default for HashValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl HashValidator {
    pub fn new() -> Self {
        Self {
            prefix: format!("// @hash v{}-", HASH_VERSION),
        }
    }

    /// The text preceding the hash on the first line of a generated file.
    pub fn hash_prefix(&self) -> &str {
        &self.prefix
    }

    /// Compute Blake3 hash of the input
    pub fn calculate_hash(&self, input: &str) -> String {
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }

    /// The header line that `validate_hash` expects for `hash`.
    pub fn header_line(&self, hash: &str) -> String {
        format!("{}{}", self.prefix, hash)
    }

    /// Check whether the first line of `cache_contents` carries `hash`.
    ///
    /// Empty contents, a missing first line or a different prefix are all
    /// treated as a mismatch.
    pub fn validate_hash(&self, cache_contents: &str, hash: &str) -> bool {
        if cache_contents.is_empty() {
            return false;
        }

        let first_line = match cache_contents.lines().next() {
            Some(line) => line.trim_end_matches('\r'),
            None => return false,
        };

        match first_line.strip_prefix(self.prefix.as_str()) {
            Some(cached_hash) => !cached_hash.is_empty() && cached_hash == hash,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_consistency() {
        let validator = HashValidator::new();
        let hash1 = validator.calculate_hash("test content");
        let hash2 = validator.calculate_hash("test content");
        assert_eq!(hash1, hash2, "Hash should be consistent");
    }

    #[test]
    fn test_hash_different_content() {
        let validator = HashValidator::new();
        assert_ne!(
            validator.calculate_hash("content A"),
            validator.calculate_hash("content B"),
            "Different content should produce different hashes"
        );
    }

    #[test]
    fn test_validate_matching_header() {
        let validator = HashValidator::new();
        let hash = validator.calculate_hash("var x = 1;");
        let cached = format!("{}\nvar x = 1;", validator.header_line(&hash));
        assert!(validator.validate_hash(&cached, &hash));
    }

    #[test]
    fn test_validate_handles_crlf() {
        let validator = HashValidator::new();
        let cached = format!("{}\r\ncode", validator.header_line("abc"));
        assert!(validator.validate_hash(&cached, "abc"));
    }

    #[test]
    fn test_validate_rejects_stale_hash() {
        let validator = HashValidator::new();
        let cached = format!("{}AAAA\nold code", validator.hash_prefix());
        assert!(!validator.validate_hash(&cached, "BBBB"));
    }

    #[test]
    fn test_validate_rejects_empty_and_headerless() {
        let validator = HashValidator::new();
        assert!(!validator.validate_hash("", "abc"));
        assert!(!validator.validate_hash("\nabc", "abc"));
        assert!(!validator.validate_hash("var x = 1;", "abc"));
        assert!(!validator.validate_hash(validator.hash_prefix(), ""));
    }

    #[test]
    fn test_validate_rejects_older_version_prefix() {
        let validator = HashValidator::new();
        let cached = format!("// @hash v{}-abc\ncode", HASH_VERSION - 1);
        assert!(!validator.validate_hash(&cached, "abc"));
    }

    proptest! {
        #[test]
        fn prop_header_always_validates(body in ".*", source in ".*") {
            let validator = HashValidator::new();
            let hash = validator.calculate_hash(&source);
            let cached = format!("{}\n{}", validator.header_line(&hash), body);
            prop_assert!(validator.validate_hash(&cached, &hash));
        }

        #[test]
        fn prop_other_hash_never_validates(a in ".+", b in ".+") {
            prop_assume!(a != b);
            let validator = HashValidator::new();
            let cached = format!("{}\ncode", validator.header_line(&validator.calculate_hash(&a)));
            prop_assert!(!validator.validate_hash(&cached, &validator.calculate_hash(&b)));
        }
    }
}
