/// DJB2 hash function for deterministic key placement.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Compute the partition a record key is written to.
///
/// Returns a 0-indexed partition in `[0, partitions)`. Records sharing a key
/// always land in the same partition, which is what gives per-key ordering.
///
/// # Panics
///
/// Panics if `partitions` is less than 1.
pub fn partition_for_key(key: &str, partitions: i32) -> i32 {
    assert!(partitions >= 1, "partitions must be >= 1, got {partitions}");
    (djb2_hash(key.as_bytes()) % partitions as u32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(djb2_hash(b"device-1"), djb2_hash(b"device-1"));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(djb2_hash(b"hello"), djb2_hash(b"world"));
    }

    #[test]
    fn same_key_same_partition() {
        for i in 0..100 {
            let key = format!("device-{i}");
            assert_eq!(partition_for_key(&key, 8), partition_for_key(&key, 8));
        }
    }

    #[test]
    fn partition_in_range() {
        for i in 0..1000 {
            let p = partition_for_key(&format!("id-{i}"), 12);
            assert!((0..12).contains(&p));
        }
    }

    #[test]
    fn distribution() {
        let partitions = 16;
        let keys = 8_000;
        let mut counts = vec![0u32; partitions as usize];
        for i in 0..keys {
            counts[partition_for_key(&format!("device-{i}"), partitions) as usize] += 1;
        }
        let expected = keys as f64 / partitions as f64;
        let max_allowed = (expected * 2.0) as u32;
        for (i, &count) in counts.iter().enumerate() {
            assert!(
                count <= max_allowed,
                "partition {i} has {count} keys, expected at most {max_allowed}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "partitions must be >= 1")]
    fn zero_partitions_panics() {
        partition_for_key("k", 0);
    }
}
