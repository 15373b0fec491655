//! 64-bit rolling hash stored alongside every chunk, plus the group shard index.
//!
//! The hash is only an integrity tag here. Chunk boundaries are fixed at 1 MiB and are
//! never derived from it.

use crate::types::Guid;

const POLY: u64 = 0xC96C5795D7870F42;

/// Lookup table, one entry per byte value.
static TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut seed = 0;
    while seed < 256 {
        let mut v = seed as u64;
        let mut round = 0;
        while round < 8 {
            v = if v & 1 != 0 { (v >> 1) ^ POLY } else { v >> 1 };
            round += 1;
        }
        table[seed] = v;
        seed += 1;
    }
    table
}

/// Hashes `data` with the rotate-left/xor scheme.
pub fn hash(data: &[u8]) -> u64 {
    data.iter()
        .fold(0u64, |h, &b| h.rotate_left(1) ^ TABLE[b as usize])
}

/// Shard index in `[0, 100)` used for storage and CDN paths.
pub fn group_num(guid: &Guid) -> u8 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&guid.to_le_bytes());
    (hasher.finalize() % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_hashes_to_zero() {
        assert_eq!(hash(&[]), 0);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(hash(b"hello"), 0x058B665393BD872A);
        assert_eq!(hash(&[0xFF; 10]), 0x3218245E5789C849);
        assert_eq!(
            hash(b"Nuclear Throne save data test"),
            0x828E301B81D11B24
        );
    }

    #[test]
    fn test_zero_buffer_hashes_to_zero() {
        // table[0] is zero, so any run of zero bytes leaves h at zero
        assert_eq!(hash(&vec![0u8; 1024 * 1024]), 0);
    }

    #[test]
    fn test_single_byte_mutation_changes_hash() {
        let base: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let reference = hash(&base);
        assert_eq!(reference, hash(&base));

        for idx in [0usize, 1, 100, 2047, 4095] {
            let mut mutated = base.clone();
            mutated[idx] ^= 0x01;
            assert_ne!(hash(&mutated), reference, "mutation at {} collapsed", idx);
        }
    }

    #[test]
    fn test_order_sensitive() {
        assert_ne!(hash(b"ab"), hash(b"ba"));
    }

    #[test]
    fn test_group_num_known_values() {
        assert_eq!(group_num(&Guid([0, 0, 0, 0])), 93);
        let guid = Guid([
            u32::from_le_bytes([0, 1, 2, 3]),
            u32::from_le_bytes([4, 5, 6, 7]),
            u32::from_le_bytes([8, 9, 10, 11]),
            u32::from_le_bytes([12, 13, 14, 15]),
        ]);
        assert_eq!(group_num(&guid), 4);
    }

    #[test]
    fn test_group_num_range_and_stability() {
        for _ in 0..500 {
            let guid = Guid::random();
            let g = group_num(&guid);
            assert!(g < 100);
            assert_eq!(g, group_num(&Guid(guid.0)));
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_any_single_byte_change_changes_hash(
                data in prop::collection::vec(any::<u8>(), 1..4096),
                at in any::<prop::sample::Index>(),
                flip in 1u8..=255
            ) {
                let mut mutated = data.clone();
                mutated[at.index(data.len())] ^= flip;
                prop_assert_ne!(hash(&mutated), hash(&data));
            }

            #[test]
            fn test_group_num_always_below_100(words in any::<[u32; 4]>()) {
                prop_assert!(group_num(&Guid(words)) < 100);
            }
        }
    }
}
