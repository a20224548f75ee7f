//! Mini-pack framing used inside some archive sub-blobs.
//!
//! ```text
//! [tag: 2 ASCII bytes][count: u16]
//! [offset 0: u32] ... [offset count: u32]   relative to the block start
//! entry 0 | entry 1 | ... | padding to 4 bytes
//! ```
//!
//! Entry `i` spans `offset[i]..offset[i + 1]`. Entries are written
//! back-to-back so lengths survive a round trip exactly; blocks produced by
//! the original tools pad each entry to 4 bytes, and that padding is kept
//! as part of the entry when such a block is unpacked.

use crate::{LayoutError, Result};

pub struct MiniPack;

fn read_u32(bytes: &[u8], pos: usize) -> Result<usize> {
    bytes
        .get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| LayoutError::MalformedArchive(format!("mini-pack directory truncated at {pos:#X}")))
}

impl MiniPack {
    pub fn peek_tag(bytes: &[u8]) -> Option<[u8; 2]> {
        match bytes {
            [a, b, ..] => Some([*a, *b]),
            _ => None,
        }
    }

    pub fn unpack(tag: [u8; 2], bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let found = Self::peek_tag(bytes)
            .ok_or_else(|| LayoutError::MalformedArchive("mini-pack shorter than its tag".to_string()))?;
        if found != tag {
            return Err(LayoutError::WrongTag { expected: tag, found });
        }

        let count = bytes
            .get(2..4)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| LayoutError::MalformedArchive("mini-pack has no entry count".to_string()))?;

        let header_len = 4 + 4 * (count + 1);
        let offsets = (0..=count)
            .map(|i| read_u32(bytes, 4 + 4 * i))
            .collect::<Result<Vec<usize>>>()?;

        if offsets[0] < header_len || offsets[count] > bytes.len() {
            return Err(LayoutError::MalformedArchive(format!(
                "mini-pack entries span {:#X}..{:#X} outside {header_len:#X}..{:#X}",
                offsets[0],
                offsets[count],
                bytes.len()
            )));
        }

        offsets
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                if w[1] < w[0] || w[1] > bytes.len() {
                    return Err(LayoutError::MalformedArchive(format!(
                        "mini-pack entry {i} spans {:#X}..{:#X} in a {:#X}-byte block",
                        w[0],
                        w[1],
                        bytes.len()
                    )));
                }
                Ok(bytes[w[0]..w[1]].to_vec())
            })
            .collect()
    }

    /// Fails when the entries do not fit the 16-bit count or 32-bit offsets.
    pub fn pack(tag: [u8; 2], entries: &[Vec<u8>]) -> Result<Vec<u8>> {
        let count = entries.len();
        let count_field = u16::try_from(count).map_err(|_| {
            LayoutError::MalformedArchive(format!("mini-pack holds at most {} entries, got {count}", u16::MAX))
        })?;
        let header_len = 4 + 4 * (count + 1);
        let body_len: usize = entries.iter().map(Vec::len).sum();

        if u32::try_from(header_len + body_len).is_err() {
            return Err(LayoutError::MalformedArchive(format!(
                "mini-pack of {:#X} bytes does not fit 32-bit offsets",
                header_len + body_len
            )));
        }

        let mut out = Vec::with_capacity(header_len + body_len + 3);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&count_field.to_le_bytes());

        let mut offset = header_len;
        for entry in entries {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += entry.len();
        }
        out.extend_from_slice(&(offset as u32).to_le_bytes());

        for entry in entries {
            out.extend_from_slice(entry);
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn pack_layout_matches_directory() {
        let packed = MiniPack::pack(*b"WD", &[vec![1, 2, 3], vec![], vec![4]]).unwrap();
        assert_eq!(
            packed,
            vec![
                b'W', b'D', 3, 0, //
                20, 0, 0, 0, 23, 0, 0, 0, 23, 0, 0, 0, 24, 0, 0, 0, //
                1, 2, 3, 4,
            ]
        );
    }

    #[test]
    fn unpack_inverts_pack_for_any_lengths() {
        let mut rng = StdRng::seed_from_u64(0x4D49_4E49);
        for _ in 0..50 {
            let count = rng.gen_range(1..12);
            let entries: Vec<Vec<u8>> = (0..count)
                .map(|_| {
                    let len = rng.gen_range(0..40);
                    (0..len).map(|_| rng.gen()).collect()
                })
                .collect();
            let packed = MiniPack::pack(*b"PB", &entries).unwrap();
            assert_eq!(packed.len() % 4, 0);
            assert_eq!(MiniPack::unpack(*b"PB", &packed).unwrap(), entries);
        }
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let packed = MiniPack::pack(*b"WD", &[vec![9]]).unwrap();
        assert!(matches!(
            MiniPack::unpack(*b"PB", &packed),
            Err(LayoutError::WrongTag {
                expected: [b'P', b'B'],
                found: [b'W', b'D']
            })
        ));
    }

    #[test]
    fn truncated_directory_is_malformed() {
        let mut packed = MiniPack::pack(*b"WD", &[vec![1, 2, 3, 4], vec![5, 6]]).unwrap();
        packed.truncate(10);
        assert!(matches!(
            MiniPack::unpack(*b"WD", &packed),
            Err(LayoutError::MalformedArchive(_))
        ));

        let mut bad = MiniPack::pack(*b"WD", &[vec![1, 2, 3, 4]]).unwrap();
        bad[8] = 0xF0;
        assert!(MiniPack::unpack(*b"WD", &bad).is_err());
    }

    #[test]
    fn middle_offset_past_end_is_malformed() {
        let mut block = vec![b'W', b'D', 2, 0];
        for offset in [16u32, 1000, 20] {
            block.extend_from_slice(&offset.to_le_bytes());
        }
        block.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(block.len(), 20);
        assert!(matches!(
            MiniPack::unpack(*b"WD", &block),
            Err(LayoutError::MalformedArchive(_))
        ));
    }

    #[test]
    fn pack_rejects_more_entries_than_the_count_holds() {
        let entries = vec![Vec::new(); u16::MAX as usize + 1];
        assert!(matches!(
            MiniPack::pack(*b"WD", &entries),
            Err(LayoutError::MalformedArchive(_))
        ));
        assert!(MiniPack::pack(*b"WD", &entries[1..]).is_ok());
    }
}
