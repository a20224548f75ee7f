//! GARC archive container.
//!
//! ```text
//! CRAG header   magic, header size, 0xFEFF, version, section count (4),
//!               data offset, archive length, largest-entry fields
//! OTAF          slot count, 0xFFFF, one u32 offset per slot into BTAF
//! BTAF          slot count; per slot a u32 bit vector followed by a
//!               (start, end, length) triple for every set bit
//! BMIF          data length, then the data section
//! ```
//!
//! Opening only parses the directories. Sub-blob bytes stay in the source
//! buffer until read, and only mutated sub-blobs are re-encoded by
//! [`Archive::save`].

pub mod lz11;
pub mod mini;

use log::debug;
use std::cell::{Cell, OnceCell};
use std::ops::Range;

use crate::{LayoutError, Result};

const GARC_MAGIC: [u8; 4] = *b"CRAG";
const FATO_MAGIC: [u8; 4] = *b"OTAF";
const FATB_MAGIC: [u8; 4] = *b"BTAF";
const FIMB_MAGIC: [u8; 4] = *b"BMIF";

const SECTION_HEADER_LEN: usize = 0x0C;
const BYTE_ORDER_MARK: u16 = 0xFEFF;
const SECTION_COUNT: u32 = 4;
const PAD_BYTE: u8 = 0xFF;
const MAX_SUBBLOBS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarcVersion {
    V4,
    V6,
}

impl GarcVersion {
    fn header_len(self) -> usize {
        match self {
            GarcVersion::V4 => 0x1C,
            GarcVersion::V6 => 0x24,
        }
    }

    fn raw(self) -> u16 {
        match self {
            GarcVersion::V4 => 0x0400,
            GarcVersion::V6 => 0x0600,
        }
    }
}

fn malformed(msg: impl Into<String>) -> LayoutError {
    LayoutError::MalformedArchive(msg.into())
}

fn read_u16(raw: &[u8], pos: usize) -> Result<u16> {
    raw.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed(format!("truncated at {pos:#X}")))
}

fn read_u32(raw: &[u8], pos: usize) -> Result<u32> {
    raw.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed(format!("truncated at {pos:#X}")))
}

fn expect_magic(raw: &[u8], pos: usize, magic: [u8; 4]) -> Result<()> {
    match raw.get(pos..pos + 4) {
        Some(found) if found == magic => Ok(()),
        _ => Err(malformed(format!(
            "expected {} section at {pos:#X}",
            String::from_utf8_lossy(&magic)
        ))),
    }
}

fn align(len: usize, to: usize) -> usize {
    len.div_ceil(to) * to
}

#[derive(Debug)]
struct SubBlob {
    bit: u8,
    /// Padded range in the source buffer, `None` for blobs created in memory.
    stored: Option<Range<usize>>,
    len: usize,
    replaced: Option<Vec<u8>>,
    decompressed: OnceCell<Vec<u8>>,
}

impl SubBlob {
    fn owned(bit: u8, bytes: Vec<u8>) -> Self {
        SubBlob {
            bit,
            stored: None,
            len: bytes.len(),
            replaced: Some(bytes),
            decompressed: OnceCell::new(),
        }
    }

    fn bytes<'a>(&'a self, source: &'a [u8]) -> &'a [u8] {
        match (&self.replaced, &self.stored) {
            (Some(bytes), _) => bytes.as_slice(),
            (None, Some(range)) => &source[range.start..range.start + self.len],
            (None, None) => &[],
        }
    }

    /// Bytes written on save, including alignment padding.
    fn encoded_len(&self, pad_to: usize) -> usize {
        match (&self.replaced, &self.stored) {
            (None, Some(range)) => range.len(),
            _ => align(self.len, pad_to),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    subblobs: Vec<SubBlob>,
}

#[derive(Debug)]
pub struct Archive {
    source: Vec<u8>,
    version: GarcVersion,
    pad_to: usize,
    slots: Vec<Slot>,
    total_size: Cell<Option<usize>>,
}

impl Archive {
    pub fn open(source: Vec<u8>) -> Result<Archive> {
        expect_magic(&source, 0, GARC_MAGIC)?;
        let header_len = read_u32(&source, 4)? as usize;
        if read_u16(&source, 8)? != BYTE_ORDER_MARK {
            return Err(malformed("only little-endian archives are supported"));
        }

        let version = match (read_u16(&source, 10)?, header_len) {
            (0x0400, 0x1C) => GarcVersion::V4,
            (0x0600, 0x24) => GarcVersion::V6,
            (v, len) => {
                return Err(malformed(format!(
                    "unsupported version {v:#06X} with header length {len:#X}"
                )))
            }
        };

        let data_offset = read_u32(&source, 16)? as usize;
        let pad_to = match version {
            GarcVersion::V4 => 4,
            GarcVersion::V6 => (read_u32(&source, 0x20)? as usize).max(1),
        };

        let fato = header_len;
        expect_magic(&source, fato, FATO_MAGIC)?;
        let fato_len = read_u32(&source, fato + 4)? as usize;
        let slot_count = read_u16(&source, fato + 8)? as usize;
        let fatb = fato + fato_len + 4 * slot_count;

        expect_magic(&source, fatb, FATB_MAGIC)?;
        let fatb_len = read_u32(&source, fatb + 4)? as usize;
        if read_u32(&source, fatb + 8)? as usize != slot_count {
            return Err(malformed("OTAF and BTAF disagree on slot count"));
        }
        let entries = fatb + fatb_len;

        let mut slots = Vec::with_capacity(slot_count);
        let mut fatb_end = entries;
        for index in 0..slot_count {
            let mut pos = entries + read_u32(&source, fato + fato_len + 4 * index)? as usize;
            let vector = read_u32(&source, pos)?;
            pos += 4;

            let mut slot = Slot::default();
            for bit in 0..MAX_SUBBLOBS {
                if vector & (1 << bit) == 0 {
                    continue;
                }
                let start = read_u32(&source, pos)? as usize;
                let end = read_u32(&source, pos + 4)? as usize;
                let len = read_u32(&source, pos + 8)? as usize;
                pos += 12;

                if start > end || len > end - start || data_offset + end > source.len() {
                    return Err(malformed(format!(
                        "slot {index} sub-blob {bit} spans {start:#X}..{end:#X} (len {len:#X}) outside the data section"
                    )));
                }

                slot.subblobs.push(SubBlob {
                    bit: bit as u8,
                    stored: Some(data_offset + start..data_offset + end),
                    len,
                    replaced: None,
                    decompressed: OnceCell::new(),
                });
            }
            fatb_end = fatb_end.max(pos);
            slots.push(slot);
        }

        expect_magic(&source, fatb_end, FIMB_MAGIC)?;

        Ok(Archive {
            source,
            version,
            pad_to,
            slots,
            total_size: Cell::new(None),
        })
    }

    /// Builds an archive in memory; sub-blobs get consecutive bits.
    pub fn from_slots(version: GarcVersion, pad_to: usize, slots: Vec<Vec<Vec<u8>>>) -> Result<Archive> {
        let pad_to = match version {
            GarcVersion::V4 => 4,
            GarcVersion::V6 => pad_to.max(1),
        };

        let slots = slots
            .into_iter()
            .enumerate()
            .map(|(index, blobs)| {
                if blobs.len() > MAX_SUBBLOBS {
                    return Err(malformed(format!(
                        "slot {index} has {} sub-blobs, at most {MAX_SUBBLOBS} fit",
                        blobs.len()
                    )));
                }
                Ok(Slot {
                    subblobs: blobs
                        .into_iter()
                        .enumerate()
                        .map(|(bit, bytes)| SubBlob::owned(bit as u8, bytes))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Archive {
            source: Vec::new(),
            version,
            pad_to,
            slots,
            total_size: Cell::new(None),
        })
    }

    pub fn version(&self) -> GarcVersion {
        self.version
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn subblob_count(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, |s| s.subblobs.len())
    }

    fn blob(&self, slot: usize, index: usize) -> Result<&SubBlob> {
        self.slots
            .get(slot)
            .and_then(|s| s.subblobs.get(index))
            .ok_or(LayoutError::NoSuchSubBlob { slot, index })
    }

    fn blob_mut(&mut self, slot: usize, index: usize) -> Result<&mut SubBlob> {
        self.slots
            .get_mut(slot)
            .and_then(|s| s.subblobs.get_mut(index))
            .ok_or(LayoutError::NoSuchSubBlob { slot, index })
    }

    /// Stored bytes of a sub-blob, still compressed if it was stored so.
    pub fn get_subblob(&self, slot: usize, index: usize) -> Result<&[u8]> {
        Ok(self.blob(slot, index)?.bytes(&self.source))
    }

    /// LZ11-decoded contents, decoded on first use and cached.
    pub fn decompressed_subblob(&self, slot: usize, index: usize) -> Result<&[u8]> {
        let blob = self.blob(slot, index)?;
        if blob.decompressed.get().is_none() {
            let plain = lz11::decompress(blob.bytes(&self.source))?;
            let _ = blob.decompressed.set(plain);
        }
        blob.decompressed
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| LayoutError::Compression("decoded sub-blob was not cached".to_string()))
    }

    pub fn set_subblob(&mut self, slot: usize, index: usize, bytes: Vec<u8>) -> Result<()> {
        let blob = self.blob_mut(slot, index)?;
        blob.len = bytes.len();
        blob.replaced = Some(bytes);
        blob.decompressed = OnceCell::new();
        self.total_size.set(None);
        Ok(())
    }

    /// Stores `plain` LZ11-compressed.
    pub fn set_subblob_compressed(&mut self, slot: usize, index: usize, plain: Vec<u8>) -> Result<()> {
        let packed = lz11::compress(&plain);
        self.set_subblob(slot, index, packed)?;
        let _ = self.blob_mut(slot, index)?.decompressed.set(plain);
        Ok(())
    }

    pub fn is_modified(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.subblobs.iter().any(|b| b.replaced.is_some()))
    }

    fn directory_len(&self) -> usize {
        let fatb_entries: usize = self
            .slots
            .iter()
            .map(|s| 4 + 12 * s.subblobs.len())
            .sum();
        self.version.header_len()
            + SECTION_HEADER_LEN
            + 4 * self.slots.len()
            + SECTION_HEADER_LEN
            + fatb_entries
            + SECTION_HEADER_LEN
    }

    fn data_len(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.subblobs.iter())
            .map(|b| b.encoded_len(self.pad_to))
            .sum()
    }

    /// Size [`save`](Self::save) will produce.
    pub fn total_size(&self) -> usize {
        if let Some(size) = self.total_size.get() {
            return size;
        }
        let size = self.directory_len() + self.data_len();
        self.total_size.set(Some(size));
        size
    }

    pub fn save(&self) -> Vec<u8> {
        let data_offset = self.directory_len();
        let total = self.total_size();

        let mut fato = Vec::with_capacity(4 * self.slots.len());
        let mut fatb = Vec::new();
        let mut data = Vec::with_capacity(total - data_offset);
        let mut largest_padded = 0usize;
        let mut largest_unpadded = 0usize;

        for slot in &self.slots {
            fato.extend_from_slice(&(fatb.len() as u32).to_le_bytes());

            let vector = slot.subblobs.iter().fold(0u32, |v, b| v | (1 << b.bit));
            fatb.extend_from_slice(&vector.to_le_bytes());

            for blob in &slot.subblobs {
                let start = data.len();
                match (&blob.replaced, &blob.stored) {
                    (None, Some(range)) => data.extend_from_slice(&self.source[range.clone()]),
                    _ => {
                        data.extend_from_slice(blob.bytes(&self.source));
                        data.resize(start + align(blob.len, self.pad_to), PAD_BYTE);
                    }
                }
                let end = data.len();

                largest_padded = largest_padded.max(end - start);
                largest_unpadded = largest_unpadded.max(blob.len);

                fatb.extend_from_slice(&(start as u32).to_le_bytes());
                fatb.extend_from_slice(&(end as u32).to_le_bytes());
                fatb.extend_from_slice(&(blob.len as u32).to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&GARC_MAGIC);
        out.extend_from_slice(&(self.version.header_len() as u32).to_le_bytes());
        out.extend_from_slice(&BYTE_ORDER_MARK.to_le_bytes());
        out.extend_from_slice(&self.version.raw().to_le_bytes());
        out.extend_from_slice(&SECTION_COUNT.to_le_bytes());
        out.extend_from_slice(&(data_offset as u32).to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        match self.version {
            GarcVersion::V4 => {
                out.extend_from_slice(&(largest_unpadded as u32).to_le_bytes());
            }
            GarcVersion::V6 => {
                out.extend_from_slice(&(largest_padded as u32).to_le_bytes());
                out.extend_from_slice(&(largest_unpadded as u32).to_le_bytes());
                out.extend_from_slice(&(self.pad_to as u32).to_le_bytes());
            }
        }

        out.extend_from_slice(&FATO_MAGIC);
        out.extend_from_slice(&(SECTION_HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u16).to_le_bytes());
        out.extend_from_slice(&0xFFFFu16.to_le_bytes());
        out.extend_from_slice(&fato);

        out.extend_from_slice(&FATB_MAGIC);
        out.extend_from_slice(&(SECTION_HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        out.extend_from_slice(&fatb);

        out.extend_from_slice(&FIMB_MAGIC);
        out.extend_from_slice(&(SECTION_HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);

        debug!(
            "saved archive: {} slots, {} modified, {} bytes",
            self.slots.len(),
            (0..self.slots.len()).filter(|&i| self.is_modified(i)).count(),
            out.len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::mini::MiniPack;

    fn sample_slots() -> Vec<Vec<Vec<u8>>> {
        vec![
            vec![b"personal".to_vec()],
            vec![vec![1, 2, 3], vec![4, 5, 6, 7, 8]],
            vec![MiniPack::pack(*b"WD", &[vec![0xAA; 6], vec![0xBB; 3]]).unwrap()],
            vec![],
            vec![vec![0x42; 33]],
        ]
    }

    fn contents(archive: &Archive) -> Vec<Vec<Vec<u8>>> {
        (0..archive.slot_count())
            .map(|slot| {
                (0..archive.subblob_count(slot))
                    .map(|i| archive.get_subblob(slot, i).unwrap().to_vec())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn save_then_open_preserves_slots() {
        for version in [GarcVersion::V4, GarcVersion::V6] {
            let built = Archive::from_slots(version, 4, sample_slots()).unwrap();
            let bytes = built.save();
            assert_eq!(bytes.len(), built.total_size());
            assert_eq!(&bytes[0..4], b"CRAG");

            let opened = Archive::open(bytes.clone()).unwrap();
            assert_eq!(opened.version(), version);
            assert_eq!(contents(&opened), sample_slots());
            // Nothing touched: byte-identical.
            assert_eq!(opened.save(), bytes);
        }
    }

    #[test]
    fn padding_follows_alignment() {
        let archive = Archive::from_slots(GarcVersion::V6, 0x80, vec![vec![vec![1; 3]], vec![vec![2; 0x81]]]).unwrap();
        let bytes = archive.save();
        let data_offset = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
        assert_eq!(bytes.len() - data_offset, 0x80 + 0x100);
        assert_eq!(bytes[data_offset + 3], PAD_BYTE);
        // Largest padded and unpadded sizes.
        assert_eq!(&bytes[0x18..0x20], &[0x00, 0x01, 0, 0, 0x81, 0, 0, 0]);
    }

    #[test]
    fn mutation_leaves_other_slots_untouched() {
        let original = Archive::from_slots(GarcVersion::V6, 4, sample_slots()).unwrap().save();
        let baseline = contents(&Archive::open(original.clone()).unwrap());

        let mut archive = Archive::open(original).unwrap();
        let mut entries = MiniPack::unpack(*b"WD", archive.get_subblob(2, 0).unwrap()).unwrap();
        entries[1].extend_from_slice(&[0xCC; 17]);
        archive.set_subblob(2, 0, MiniPack::pack(*b"WD", &entries).unwrap()).unwrap();
        assert!(archive.is_modified(2));
        assert!(!archive.is_modified(1));

        let reopened = Archive::open(archive.save()).unwrap();
        let after = contents(&reopened);
        for slot in [0, 1, 3, 4] {
            assert_eq!(after[slot], baseline[slot]);
        }
        assert_eq!(
            MiniPack::unpack(*b"WD", reopened.get_subblob(2, 0).unwrap()).unwrap(),
            entries
        );
    }

    #[test]
    fn total_size_tracks_mutation() {
        let mut archive = Archive::from_slots(GarcVersion::V4, 4, sample_slots()).unwrap();
        let before = archive.total_size();
        archive.set_subblob(0, 0, vec![0; 100]).unwrap();
        assert_eq!(archive.total_size(), before - 8 + 100);
        assert_eq!(archive.save().len(), archive.total_size());
    }

    #[test]
    fn compressed_subblobs_decode_lazily() {
        let plain: Vec<u8> = (0..500).map(|i| (i % 13) as u8).collect();
        let mut archive = Archive::from_slots(GarcVersion::V6, 4, vec![vec![vec![0]]]).unwrap();
        archive.set_subblob_compressed(0, 0, plain.clone()).unwrap();

        let reopened = Archive::open(archive.save()).unwrap();
        assert!(lz11::is_lz11(reopened.get_subblob(0, 0).unwrap()));
        assert_eq!(reopened.decompressed_subblob(0, 0).unwrap(), plain.as_slice());
        assert_eq!(reopened.decompressed_subblob(0, 0).unwrap(), plain.as_slice());
    }

    #[test]
    fn bad_archives_fail_fast() {
        assert!(matches!(
            Archive::open(b"GARC\x1C\x00\x00\x00".to_vec()),
            Err(LayoutError::MalformedArchive(_))
        ));

        let mut bytes = Archive::from_slots(GarcVersion::V4, 4, sample_slots()).unwrap().save();
        let len = bytes.len();
        bytes.truncate(len - 10);
        assert!(Archive::open(bytes).is_err());

        let archive = Archive::from_slots(GarcVersion::V4, 4, sample_slots()).unwrap();
        assert!(matches!(
            archive.get_subblob(1, 2),
            Err(LayoutError::NoSuchSubBlob { slot: 1, index: 2 })
        ));
    }
}
