//! Fixed-position encounter records declared as schema record lists.

use crate::address::{check_range, FlatImage};
use crate::schema::RawRecord;
use crate::{LayoutError, Result};

/// Text terminator used to pad fixed-width names.
pub const NAME_TERMINATOR: u8 = 0x50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncounterKind {
    Simple,
    /// A prize counter that also prints the species name.
    GameCorner { name_offset: usize, name_len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEncounter {
    pub species_offsets: Vec<usize>,
    pub level_offsets: Vec<usize>,
    pub kind: EncounterKind,
}

fn offsets(index: usize, record: &RawRecord, field: &str) -> Result<Vec<usize>> {
    record
        .field(field)
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| LayoutError::MalformedRecord {
                index,
                reason: format!("{field} offset {v} is negative"),
            })
        })
        .collect()
}

impl StaticEncounter {
    /// Builds encounter `index` of a record list from its `Species`,
    /// `Level` and optional `Name` / `NameLength` fields.
    pub fn from_raw(index: usize, record: &RawRecord) -> Result<Self> {
        let species_offsets = offsets(index, record, "Species")?;
        if species_offsets.is_empty() {
            return Err(LayoutError::MalformedRecord {
                index,
                reason: "encounter declares no species offsets".to_string(),
            });
        }
        let level_offsets = offsets(index, record, "Level")?;

        let kind = match record.first("Name") {
            Some(name) => EncounterKind::GameCorner {
                name_offset: usize::try_from(name).map_err(|_| LayoutError::MalformedRecord {
                    index,
                    reason: format!("name offset {name} is negative"),
                })?,
                name_len: record.first("NameLength").unwrap_or(10).max(0) as usize,
            },
            None => EncounterKind::Simple,
        };

        Ok(StaticEncounter {
            species_offsets,
            level_offsets,
            kind,
        })
    }

    pub fn read_species(&self, image: &FlatImage) -> Result<u8> {
        let off = self.species_offsets.first().ok_or_else(|| LayoutError::MalformedRecord {
            index: 0,
            reason: "encounter declares no species offsets".to_string(),
        })?;
        image.read_u8(*off)
    }

    pub fn read_level(&self, image: &FlatImage) -> Result<Option<u8>> {
        self.level_offsets
            .first()
            .map(|&off| image.read_u8(off))
            .transpose()
    }

    /// Writes `species` everywhere this encounter stores it. `encoded_name`
    /// is only used by game-corner encounters and must already be in the
    /// image's text encoding; it is truncated or padded to the slot width.
    /// Every target is bounds-checked before the first byte is written.
    pub fn apply(&self, image: &mut FlatImage, species: u8, encoded_name: &[u8]) -> Result<()> {
        for &off in &self.species_offsets {
            check_range(off, 1, image.len())?;
        }
        if let EncounterKind::GameCorner {
            name_offset,
            name_len,
        } = self.kind
        {
            check_range(name_offset, name_len, image.len())?;
        }

        for &off in &self.species_offsets {
            image.write_u8(off, species)?;
        }

        match self.kind {
            EncounterKind::Simple => Ok(()),
            EncounterKind::GameCorner {
                name_offset,
                name_len,
            } => {
                let mut name = vec![NAME_TERMINATOR; name_len];
                let n = encoded_name.len().min(name_len);
                name[..n].copy_from_slice(&encoded_name[..n]);
                image.write_slice(name_offset, &name)
            }
        }
    }
}
