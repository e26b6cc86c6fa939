//! Short identifiers for roots and worktrees.
//!
//! Both roots and linked worktrees are addressed by the first 12 hexadecimal
//! characters of the SHA-256 digest of their canonical path. The same path
//! therefore maps to the same id across restarts.
//!
//! # Example
//!
//! ```
//! use pgch_server::utils::ids::{is_short_id, short_id};
//!
//! let id = short_id("/home/user/project");
//! assert_eq!(id.len(), 12);
//! assert!(is_short_id(&id));
//! ```

use sha2::{Digest, Sha256};

/// Number of hexadecimal characters kept from the digest.
pub const SHORT_ID_LEN: usize = 12;

/// Derives the short id for a canonical path string.
pub fn short_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(SHORT_ID_LEN);
    encoded
}

/// Returns `true` if `value` has the exact shape of a short id
/// (12 lowercase hexadecimal characters).
pub fn is_short_id(value: &str) -> bool {
    value.len() == SHORT_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_stable() {
        assert_eq!(short_id("/tmp/project"), short_id("/tmp/project"));
        assert_ne!(short_id("/tmp/project"), short_id("/tmp/project2"));
    }

    #[test]
    fn short_id_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        assert_eq!(short_id("abc"), "ba7816bf8f01");
    }

    #[test]
    fn is_short_id_rejects_wrong_shapes() {
        assert!(is_short_id("0123456789ab"));
        assert!(!is_short_id("0123456789AB"));
        assert!(!is_short_id("0123456789a"));
        assert!(!is_short_id("0123456789abc"));
        assert!(!is_short_id("0123456789ag"));
    }
}
