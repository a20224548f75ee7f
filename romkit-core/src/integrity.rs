//! Image recognition and checksum verification.
//!
//! Nothing here is fatal: an image that matches no schema variant, or
//! whose checksum differs from the declared one, can still be edited. The
//! result only decides whether the image is reported as known-good.

use flate2::Crc;
use log::info;

use crate::schema::{SchemaEntry, SchemaEntrySet, SchemaStore};
use crate::{LayoutError, Result};

/// Standard CRC-32 of `bytes`.
pub fn compute_checksum(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// CRC-32 over data that arrives in pieces, e.g. archive members.
pub struct StreamingChecksum {
    crc: Crc,
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self { crc: Crc::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.crc.update(bytes);
    }

    pub fn finish(&self) -> u32 {
        self.crc.sum()
    }
}

pub fn is_trusted(actual: u32, expected: u32) -> bool {
    actual == expected
}

/// Identifying fields read from an image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity {
    pub signature: String,
    pub version: i64,
    pub region: i64,
    pub header_checksum: Option<i64>,
}

const GB_TITLE: std::ops::Range<usize> = 0x134..0x143;
const GB_REGION: usize = 0x14A;
const GB_VERSION: usize = 0x14C;
const GB_GLOBAL_CHECKSUM: usize = 0x14E;

impl ImageIdentity {
    pub fn from_game_boy_header(image: &[u8]) -> Result<Self> {
        if image.len() < GB_GLOBAL_CHECKSUM + 2 {
            return Err(LayoutError::OutOfBounds {
                offset: GB_GLOBAL_CHECKSUM,
                len: 2,
                image_len: image.len(),
            });
        }

        let title = &image[GB_TITLE];
        let end = title.iter().position(|&b| b == 0).unwrap_or(title.len());
        let signature = String::from_utf8_lossy(&title[..end]).trim_end().to_string();
        let checksum = u16::from_be_bytes([image[GB_GLOBAL_CHECKSUM], image[GB_GLOBAL_CHECKSUM + 1]]);

        Ok(ImageIdentity {
            signature,
            version: image[GB_VERSION] as i64,
            region: image[GB_REGION] as i64,
            header_checksum: Some(checksum as i64),
        })
    }
}

fn identity_matches(identity: &ImageIdentity, entry: &SchemaEntrySet) -> bool {
    match entry.entry("Signature") {
        Some(SchemaEntry::Text(sig)) if !sig.is_empty() => {
            *sig == identity.signature
                && entry.scalar("Version").unwrap_or(0) == identity.version
                && entry.scalar("Region").unwrap_or(0) == identity.region
        }
        _ => false,
    }
}

/// `HeaderChecksum` of -1 (or none at all) marks a family entry that
/// accepts any checksum.
fn declared_header_checksum(entry: &SchemaEntrySet) -> Option<i64> {
    entry.scalar("HeaderChecksum").filter(|&c| c >= 0)
}

/// Finds the schema variant describing `identity`: an exact match on the
/// header checksum first, then any family entry.
pub fn is_recognized<'a>(identity: &ImageIdentity, store: &'a SchemaStore) -> Option<&'a SchemaEntrySet> {
    let candidates = || {
        store
            .variants()
            .iter()
            .filter(|entry| identity_matches(identity, entry))
    };

    let found = candidates()
        .find(|entry| {
            declared_header_checksum(entry).is_some()
                && declared_header_checksum(entry) == identity.header_checksum
        })
        .or_else(|| candidates().find(|entry| declared_header_checksum(entry).is_none()));

    match found {
        Some(entry) => info!("recognised image '{}' as '{}'", identity.signature, entry.name),
        None => info!("image '{}' matches no schema variant", identity.signature),
    }
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Trusted { actual: u32 },
    ChecksumMismatch { expected: Vec<u32>, actual: u32 },
    /// The variant declares no checksum for this member.
    Undeclared { actual: u32 },
}

impl Verification {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Verification::Trusted { .. })
    }
}

/// Checks `bytes` against `"ExpectedChecksums"`, or `"<member>Checksums"`
/// for an archive member or code segment. Either may hold one value or two
/// (base release and patched release).
pub fn verify(entry: &SchemaEntrySet, member: Option<&str>, bytes: &[u8]) -> Verification {
    let key = match member {
        Some(name) => format!("{name}Checksums"),
        None => "ExpectedChecksums".to_string(),
    };
    let actual = compute_checksum(bytes);

    let expected: Vec<u32> = match entry.entry(&key) {
        Some(SchemaEntry::OffsetArray(values)) => values.iter().map(|&v| v as u32).collect(),
        Some(SchemaEntry::Scalar(v)) => vec![*v as u32],
        _ => Vec::new(),
    };

    let result = if expected.is_empty() {
        Verification::Undeclared { actual }
    } else if expected.iter().any(|&e| is_trusted(actual, e)) {
        Verification::Trusted { actual }
    } else {
        Verification::ChecksumMismatch { expected, actual }
    };

    info!("'{}' {}: {:?}", entry.name, key, result);
    result
}
