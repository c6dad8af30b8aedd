//! Safety numbers: a short fingerprint two users can compare out of band
//! to confirm they hold each other's real identity keys.

use crate::primitives::sha256;

/// First 16 hex characters of `SHA-256` over the two encoded identity
/// keys in lexicographic order. Symmetric in its arguments.
pub fn safety_number(identity_a: &str, identity_b: &str) -> String {
    let (lo, hi) = if identity_a <= identity_b {
        (identity_a, identity_b)
    } else {
        (identity_b, identity_a)
    };
    let digest = sha256(&[lo.as_bytes(), hi.as_bytes()]);
    hex::encode(digest)[..16].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric() {
        let a = "AAAAc29tZSBrZXk=";
        let b = "ZZZZb3RoZXIga2V5";
        assert_eq!(safety_number(a, b), safety_number(b, a));
    }

    #[test]
    fn test_deterministic_and_16_chars() {
        let n1 = safety_number("key-one", "key-two");
        let n2 = safety_number("key-one", "key-two");
        assert_eq!(n1, n2);
        assert_eq!(n1.len(), 16);
        assert!(n1.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_pairs_differ() {
        assert_ne!(
            safety_number("key-one", "key-two"),
            safety_number("key-one", "key-three")
        );
    }
}
