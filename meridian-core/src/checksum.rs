//! Integrity digest over serialized payloads.
//!
//! FNV-1a (64-bit). Non-cryptographic: it detects corruption and divergence,
//! not tampering by an adversary.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Raw FNV-1a 64-bit hash of `bytes`.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Compute the checksum string stored in entry metadata.
pub fn compute_checksum(payload: &[u8]) -> String {
    hex::encode(fnv1a_64(payload).to_be_bytes())
}

/// Check a payload against a stored checksum.
pub fn verify_checksum(payload: &[u8], expected: &str) -> bool {
    compute_checksum(payload).eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_checksum_is_fixed_width_hex() {
        let checksum = compute_checksum(br#"{"name":"alice"}"#);
        assert_eq!(checksum.len(), 16);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_detects_single_byte_change() {
        let checksum = compute_checksum(b"[1,2,3]");
        assert!(verify_checksum(b"[1,2,3]", &checksum));
        assert!(!verify_checksum(b"[1,2,4]", &checksum));
    }

    #[test]
    fn test_verify_rejects_garbage_checksum() {
        assert!(!verify_checksum(b"payload", "not-a-checksum"));
    }
}
