//! Re-packing of variable-length records that live back-to-back behind a
//! table of two-byte bank-relative pointers.
//!
//! Layout handled here:
//!
//! ```text
//! table_offset: [ptr 0][ptr 1] ... [ptr N-1]
//! region_start: record 0 .. term | record 1 .. term | ...
//! region_end:   (start of the next bank, or a schema override)
//! ```
//!
//! Nothing is written to the image until the whole layout has been built
//! and checked, so a failed pass leaves the image untouched.

use log::debug;
use std::collections::BTreeMap;

use crate::address::{check_range, resolve_in_bank, FlatImage};
use crate::schema::SchemaEntrySet;
use crate::{LayoutError, Result};

const POINTER_WIDTH: usize = 2;

/// How one record is delimited: `segments` runs, each closed by
/// `terminator`. The terminator is only looked for at multiples of
/// `stride` from the start of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    pub terminator: u8,
    pub stride: usize,
    pub segments: usize,
}

impl RecordFormat {
    /// Evolution entries followed by a level/move list, each closed by 0x00.
    pub const EVOS_MOVES: RecordFormat = RecordFormat {
        terminator: 0x00,
        stride: 1,
        segments: 2,
    };

    /// Level/move pairs closed by 0x00.
    pub const MOVES: RecordFormat = RecordFormat {
        terminator: 0x00,
        stride: 2,
        segments: 1,
    };

    pub const TRAINERS: RecordFormat = RecordFormat {
        terminator: 0xFF,
        stride: 1,
        segments: 1,
    };

    pub const fn new(terminator: u8) -> Self {
        RecordFormat {
            terminator,
            stride: 1,
            segments: 1,
        }
    }

    /// Encoded length of the record at the start of `bytes`, including
    /// every terminator; `None` if it runs off the end or the format has
    /// no segments.
    pub fn measure(&self, bytes: &[u8]) -> Option<usize> {
        if self.segments == 0 {
            return None;
        }
        let stride = self.stride.max(1);
        let mut pos = 0usize;
        for _ in 0..self.segments {
            loop {
                if *bytes.get(pos)? == self.terminator {
                    pos += 1;
                    break;
                }
                pos += stride;
            }
        }
        Some(pos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerTable {
    pub offset: u32,
    pub count: usize,
}

impl PointerTable {
    pub fn len_bytes(&self) -> usize {
        self.count * POINTER_WIDTH
    }

    /// Data starts immediately after the table.
    pub fn region_start(&self) -> u32 {
        self.offset + self.len_bytes() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepackPlan {
    pub table: PointerTable,
    pub format: RecordFormat,
    /// Explicit end of the data region; defaults to the end of the table's bank.
    pub region_end: Option<u32>,
    /// Point empty records at the previous record's terminator.
    pub alias_empty: bool,
}

impl RepackPlan {
    pub fn new(table: PointerTable, format: RecordFormat) -> Self {
        RepackPlan {
            table,
            format,
            region_end: None,
            alias_empty: true,
        }
    }

    /// Reads `"<prefix>TableOffset"` and the optional `"<prefix>DataEnd"`.
    /// Returns `None` when the table is not declared for this variant.
    pub fn from_schema(
        schema: &SchemaEntrySet,
        prefix: &str,
        count: usize,
        format: RecordFormat,
    ) -> Option<Self> {
        let offset = u32::try_from(schema.get_scalar(&format!("{prefix}TableOffset"))).ok()?;
        if offset == 0 {
            return None;
        }
        let region_end = schema
            .scalar(&format!("{prefix}DataEnd"))
            .and_then(|v| u32::try_from(v).ok())
            .filter(|&v| v > 0);

        Some(RepackPlan {
            region_end,
            ..RepackPlan::new(PointerTable { offset, count }, format)
        })
    }

    fn resolve_region(&self, image: &FlatImage) -> Result<(u32, u32)> {
        let layout = image.layout();
        let start = self.table.region_start();
        let end = self
            .region_end
            .unwrap_or_else(|| layout.bank_end(layout.bank_of(self.table.offset)));

        check_range(self.table.offset as usize, self.table.len_bytes(), image.len())?;
        check_range(start as usize, end.saturating_sub(start) as usize, image.len())?;
        if end < start {
            return Err(LayoutError::RegionOverflow {
                needed: 0,
                available: 0,
            });
        }
        Ok((start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackReport {
    pub region_start: u32,
    pub region_end: u32,
    pub packed_len: usize,
    /// Absolute offset each table slot now points at.
    pub pointers: Vec<u32>,
}

impl RepackReport {
    pub fn free_bytes(&self) -> usize {
        (self.region_end - self.region_start) as usize - self.packed_len
    }
}

fn existing_record(image: &FlatImage, plan: &RepackPlan, index: usize, region_end: u32) -> Result<Vec<u8>> {
    let layout = image.layout();
    let slot = plan.table.offset as usize + index * POINTER_WIDTH;
    let ptr = image.read_u16(slot)?;
    let target = resolve_in_bank(layout, layout.bank_of(plan.table.offset), ptr) as usize;

    let limit = (region_end as usize).max(target).min(image.len());
    let window = image.as_bytes().get(target..limit).unwrap_or(&[]);
    let len = plan
        .format
        .measure(window)
        .ok_or_else(|| LayoutError::MalformedRecord {
            index,
            reason: format!("record at {target:#X} is not terminated before {region_end:#X}"),
        })?;

    Ok(window[..len - 1].to_vec())
}

/// Decodes every record's payload, without its final terminator.
pub fn read_records(image: &FlatImage, plan: &RepackPlan) -> Result<Vec<Vec<u8>>> {
    let (_, region_end) = plan.resolve_region(image)?;
    (0..plan.table.count)
        .map(|index| existing_record(image, plan, index, region_end))
        .collect()
}

/// Re-encodes all records of `plan` in ascending index order. Indices
/// missing from `replacements` keep their current bytes.
pub fn repack(
    image: &mut FlatImage,
    plan: &RepackPlan,
    replacements: &BTreeMap<usize, Vec<u8>>,
) -> Result<RepackReport> {
    let (region_start, region_end) = plan.resolve_region(image)?;
    let layout = *image.layout();
    let table_bank = layout.bank_of(plan.table.offset);
    let terminator = plan.format.terminator;

    if let Some((&index, _)) = replacements.range(plan.table.count..).next() {
        return Err(LayoutError::MalformedRecord {
            index,
            reason: format!("table only has {} records", plan.table.count),
        });
    }

    let mut table_bytes = vec![0u8; plan.table.len_bytes()];
    let mut data: Vec<u8> = Vec::new();
    let mut pointers = Vec::with_capacity(plan.table.count);
    let mut table_cursor = 0usize;
    let mut data_cursor = 0usize;

    for index in 0..plan.table.count {
        let mut encoded = match replacements.get(&index) {
            Some(payload) => payload.clone(),
            None => existing_record(image, plan, index, region_end)?,
        };
        encoded.push(terminator);

        if plan.format.measure(&encoded) != Some(encoded.len()) {
            return Err(LayoutError::MalformedRecord {
                index,
                reason: "payload does not match the record format".to_string(),
            });
        }

        let aliases_previous = plan.alias_empty
            && encoded.iter().all(|&b| b == terminator)
            && data.ends_with(&encoded);

        let record_start = if aliases_previous {
            data_cursor - encoded.len()
        } else {
            data.extend_from_slice(&encoded);
            let start = data_cursor;
            data_cursor += encoded.len();
            start
        };
        debug_assert_eq!(data_cursor, data.len());

        let target = region_start + record_start as u32;
        let found = layout.bank_of(target);
        if found != table_bank {
            return Err(LayoutError::BankBoundaryViolation {
                index,
                expected: table_bank,
                found,
            });
        }

        let ptr = layout.make_pointer(target).to_le_bytes();
        table_bytes[table_cursor..table_cursor + POINTER_WIDTH].copy_from_slice(&ptr);
        table_cursor += POINTER_WIDTH;
        pointers.push(target);
    }

    let available = (region_end - region_start) as usize;
    if data.len() > available {
        return Err(LayoutError::RegionOverflow {
            needed: data.len(),
            available,
        });
    }

    image.write_slice(plan.table.offset as usize, &table_bytes)?;
    image.write_slice(region_start as usize, &data)?;

    debug!(
        "repacked {} records at {:#X}: {} of {} bytes used",
        plan.table.count,
        plan.table.offset,
        data.len(),
        available
    );

    Ok(RepackReport {
        region_start,
        region_end,
        packed_len: data.len(),
        pointers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FlatLayout;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const TABLE: u32 = 0x3B000;

    fn blank_image() -> FlatImage {
        FlatImage::new(vec![0xCC; 0x8_0000], FlatLayout::GAME_BOY).unwrap()
    }

    fn all(records: &[Vec<u8>]) -> BTreeMap<usize, Vec<u8>> {
        records.iter().cloned().enumerate().collect()
    }

    fn plan(count: usize, format: RecordFormat) -> RepackPlan {
        RepackPlan::new(PointerTable { offset: TABLE, count }, format)
    }

    #[test]
    fn measures_chained_and_strided_records() {
        assert_eq!(RecordFormat::EVOS_MOVES.measure(&[1, 16, 2, 0, 1, 33, 0, 9]), Some(7));
        assert_eq!(RecordFormat::EVOS_MOVES.measure(&[0, 0]), Some(2));
        // A zero move id inside a pair is not a terminator.
        assert_eq!(RecordFormat::MOVES.measure(&[5, 0, 7, 3, 0]), Some(5));
        assert_eq!(RecordFormat::TRAINERS.measure(&[1, 2, 3]), None);
    }

    #[test]
    fn empty_records_alias_previous_terminator() {
        let mut image = blank_image();
        let records = vec![
            vec![1, 2, 3],
            vec![],
            vec![4, 5, 6, 7, 8],
            vec![],
            vec![9, 10],
        ];
        let plan = plan(5, RecordFormat::new(0x00));

        let report = repack(&mut image, &plan, &all(&records)).unwrap();

        let start = TABLE + 10;
        assert_eq!(report.region_start, start);
        assert_eq!(report.region_end, 0x3C000);
        assert_eq!(report.packed_len, 3 + 1 + 5 + 1 + 2 + 1);
        assert_eq!(
            report.pointers,
            vec![start, start + 3, start + 4, start + 9, start + 10]
        );
        assert_eq!(
            image.slice(start as usize, 13).unwrap(),
            &[1, 2, 3, 0, 4, 5, 6, 7, 8, 0, 9, 10, 0]
        );
        assert_eq!(image.read_u16(TABLE as usize).unwrap(), 0x700A);
        assert_eq!(image.read_pointer(TABLE as usize + 2).unwrap(), start + 3);
        assert_eq!(read_records(&image, &plan).unwrap(), records);
    }

    #[test]
    fn leading_empty_record_gets_its_own_terminator() {
        let mut image = blank_image();
        let records = vec![vec![], vec![], vec![7]];
        let report = repack(&mut image, &plan(3, RecordFormat::new(0x00)), &all(&records)).unwrap();
        assert_eq!(report.packed_len, 3);
        assert_eq!(report.pointers[0], report.pointers[1]);
    }

    #[test]
    fn aliasing_can_be_disabled() {
        let mut image = blank_image();
        let mut plan = plan(3, RecordFormat::new(0x00));
        plan.alias_empty = false;
        let records = vec![vec![1], vec![], vec![2]];
        let report = repack(&mut image, &plan, &all(&records)).unwrap();
        assert_eq!(report.packed_len, 5);
        assert_eq!(read_records(&image, &plan).unwrap(), records);
    }

    #[test]
    fn repack_without_replacements_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(0x5EED_0001);
        let records: Vec<Vec<u8>> = (0..64)
            .map(|_| {
                let len = rng.gen_range(0..9);
                (0..len).map(|_| rng.gen_range(1..=0xFFu8)).collect()
            })
            .collect();

        let mut image = blank_image();
        let plan = plan(records.len(), RecordFormat::new(0x00));
        let first = repack(&mut image, &plan, &all(&records)).unwrap();
        let snapshot = image.as_bytes().to_vec();

        let second = repack(&mut image, &plan, &BTreeMap::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(image.as_bytes(), snapshot.as_slice());
        assert_eq!(read_records(&image, &plan).unwrap(), records);
    }

    #[test]
    fn overflow_leaves_image_untouched() {
        let mut image = blank_image();
        let mut plan = plan(5, RecordFormat::new(0x00));
        plan.region_end = Some(plan.table.region_start() + 12);
        let records = vec![vec![1, 2, 3], vec![], vec![4, 5, 6, 7, 8], vec![], vec![9, 10]];
        let snapshot = image.as_bytes().to_vec();

        let err = repack(&mut image, &plan, &all(&records)).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::RegionOverflow {
                needed: 13,
                available: 12
            }
        ));
        assert_eq!(image.as_bytes(), snapshot.as_slice());
    }

    #[test]
    fn region_crossing_bank_is_rejected() {
        let mut image = blank_image();
        let mut plan = RepackPlan::new(
            PointerTable {
                offset: 0x3BFF0,
                count: 2,
            },
            RecordFormat::new(0x00),
        );
        plan.region_end = Some(0x3C100);
        let records = vec![vec![1; 20], vec![2]];
        let snapshot = image.as_bytes().to_vec();

        let err = repack(&mut image, &plan, &all(&records)).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::BankBoundaryViolation {
                index: 1,
                expected: 0x0E,
                found: 0x0F
            }
        ));
        assert_eq!(image.as_bytes(), snapshot.as_slice());
    }

    #[test]
    fn replacing_one_record_keeps_the_others() {
        let mut image = blank_image();
        let plan = plan(3, RecordFormat::EVOS_MOVES);
        let records = vec![
            vec![1, 16, 2, 0, 1, 33, 1, 45],
            vec![0, 1, 33],
            vec![2, 0x0A, 3, 0, 1, 10, 12, 55],
        ];
        repack(&mut image, &plan, &all(&records)).unwrap();

        let mut replacement = BTreeMap::new();
        replacement.insert(1, vec![1, 30, 4, 0, 1, 33, 9, 40]);
        let report = repack(&mut image, &plan, &replacement).unwrap();

        let decoded = read_records(&image, &plan).unwrap();
        assert_eq!(decoded[0], records[0]);
        assert_eq!(decoded[1], replacement[&1]);
        assert_eq!(decoded[2], records[2]);
        assert_eq!(report.packed_len, 9 + 9 + 9);
    }

    #[test]
    fn malformed_replacements_are_rejected() {
        let mut image = blank_image();
        let plan = plan(2, RecordFormat::EVOS_MOVES);
        let mut replacements = BTreeMap::new();
        // A single run cannot stand in for evolutions + moves.
        replacements.insert(0, vec![1, 2]);
        replacements.insert(1, vec![0]);
        assert!(matches!(
            repack(&mut image, &plan, &replacements),
            Err(LayoutError::MalformedRecord { index: 0, .. })
        ));

        let mut out_of_range = BTreeMap::new();
        out_of_range.insert(5, vec![1]);
        assert!(matches!(
            repack(&mut image, &plan, &out_of_range),
            Err(LayoutError::MalformedRecord { index: 5, .. })
        ));
    }

    #[test]
    fn format_without_segments_is_malformed() {
        let mut image = blank_image();
        let format = RecordFormat {
            terminator: 0x00,
            stride: 1,
            segments: 0,
        };
        assert_eq!(format.measure(&[0, 0]), None);

        let plan = plan(2, format);
        assert!(matches!(
            read_records(&image, &plan),
            Err(LayoutError::MalformedRecord { index: 0, .. })
        ));
        let snapshot = image.as_bytes().to_vec();
        assert!(matches!(
            repack(&mut image, &plan, &BTreeMap::new()),
            Err(LayoutError::MalformedRecord { index: 0, .. })
        ));
        assert_eq!(image.as_bytes(), snapshot.as_slice());
    }

    #[test]
    fn plan_reads_schema_offsets() {
        use crate::schema::SchemaEntry;

        let mut set = SchemaEntrySet::new("Gold");
        set.insert("EvosMovesTableOffset", SchemaEntry::Scalar(0x427BD));
        set.insert("EvosMovesDataEnd", SchemaEntry::Scalar(0x43E00));
        let plan = RepackPlan::from_schema(&set, "EvosMoves", 251, RecordFormat::EVOS_MOVES).unwrap();
        assert_eq!(plan.table.offset, 0x427BD);
        assert_eq!(plan.region_end, Some(0x43E00));
        assert!(RepackPlan::from_schema(&set, "Trainers", 67, RecordFormat::TRAINERS).is_none());
    }
}
