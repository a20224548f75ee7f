use thiserror::Error;

pub mod address;
pub mod archive;
pub mod encounter;
pub mod integrity;
pub mod repack;
pub mod schema;

pub use address::{Address, FlatImage, FlatLayout};
pub use archive::{mini::MiniPack, Archive, GarcVersion};
pub use encounter::{EncounterKind, StaticEncounter};
pub use integrity::{compute_checksum, is_recognized, is_trusted, ImageIdentity, Verification};
pub use repack::{read_records, repack, PointerTable, RecordFormat, RepackPlan, RepackReport};
pub use schema::{
    merge, CopyFlags, Declaration, RawRecord, SchemaEntry, SchemaEntrySet, SchemaSource,
    SchemaStore, VariantSource,
};

/// Errors raised while loading a schema or reading and rewriting image data.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed declaration '{key}' in variant '{variant}': {reason}")]
    MalformedSchemaLine {
        variant: String,
        key: String,
        reason: String,
    },

    #[error("variant '{variant}' copies from unknown base '{base}'")]
    UnknownBase { variant: String, base: String },

    #[error("image of {len:#X} bytes is not a multiple of {bank_size:#X} within {min:#X}..={max:#X}")]
    ImageSize {
        len: usize,
        min: usize,
        max: usize,
        bank_size: u32,
    },

    #[error("access of {len} bytes at {offset:#X} is outside the {image_len:#X}-byte image")]
    OutOfBounds {
        offset: usize,
        len: usize,
        image_len: usize,
    },

    #[error("packed data needs {needed} bytes but the region holds {available}")]
    RegionOverflow { needed: usize, available: usize },

    #[error("record {index} resolves to bank {found:#X}, expected bank {expected:#X}")]
    BankBoundaryViolation { index: usize, expected: u8, found: u8 },

    #[error("record {index} is malformed: {reason}")]
    MalformedRecord { index: usize, reason: String },

    #[error("wrong block tag: expected {expected:?}, found {found:?}")]
    WrongTag { expected: [u8; 2], found: [u8; 2] },

    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("archive has no sub-blob {index} in slot {slot}")]
    NoSuchSubBlob { slot: usize, index: usize },

    #[error("compression error: {0}")]
    Compression(String),
}

pub type Result<T> = std::result::Result<T, LayoutError>;
