/// DJB2 hash function.
/// Produces a deterministic hash for any byte slice.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Advisory lock key for a logical resource name.
///
/// Postgres advisory locks take a signed 64-bit key. The 32-bit hash keeps
/// keys small and readable in `pg_locks` while staying stable across
/// processes and releases.
pub fn advisory_key(name: &str) -> i64 {
    djb2_hash(name.as_bytes()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(djb2_hash(b"hello"), djb2_hash(b"hello"));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(djb2_hash(b"hello"), djb2_hash(b"world"));
    }

    #[test]
    fn advisory_key_is_stable_and_non_negative() {
        let a = advisory_key("scheduled-jobs:courier");
        let b = advisory_key("scheduled-jobs:courier");
        assert_eq!(a, b);
        assert!(a >= 0);
        assert_ne!(a, advisory_key("scheduled-jobs:tenant_red"));
    }

    #[test]
    fn known_value() {
        // djb2("a") = 5381 * 33 + 97
        assert_eq!(djb2_hash(b"a"), 177_670);
        assert_eq!(advisory_key("a"), 177_670);
    }
}
