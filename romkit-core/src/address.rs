//! Bank-relative addressing for flat, single-image cartridges.
//!
//! A pointer stored in the image is only meaningful together with the bank
//! of the location that holds it: bank 0 is always mapped at `0..BANK`,
//! every other bank is seen through the switchable window `BANK..2*BANK`.

use crate::schema::SchemaEntrySet;
use crate::{LayoutError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatLayout {
    pub bank_size: u32,
    pub min_image_len: usize,
    pub max_image_len: usize,
}

impl FlatLayout {
    pub const GAME_BOY: FlatLayout = FlatLayout {
        bank_size: 0x4000,
        min_image_len: 0x8_0000,
        max_image_len: 0x20_0000,
    };

    pub fn to_flat(&self, bank: u8, in_bank_ptr: u16) -> u32 {
        bank as u32 * self.bank_size + (in_bank_ptr as u32 & (self.bank_size - 1))
    }

    pub fn bank_of(&self, flat: u32) -> u8 {
        (flat / self.bank_size) as u8
    }

    pub fn bank_start(&self, bank: u8) -> u32 {
        bank as u32 * self.bank_size
    }

    /// First offset past `bank`.
    pub fn bank_end(&self, bank: u8) -> u32 {
        (bank as u32 + 1) * self.bank_size
    }

    /// The pointer value the hardware uses to reach `flat` once its bank is
    /// mapped.
    pub fn make_pointer(&self, flat: u32) -> u16 {
        if flat < self.bank_size {
            flat as u16
        } else {
            ((flat % self.bank_size) + self.bank_size) as u16
        }
    }

    pub fn to_banked(&self, flat: u32) -> Address {
        Address::Banked {
            bank: self.bank_of(flat),
            in_bank_ptr: self.make_pointer(flat),
        }
    }

    pub fn validate_len(&self, len: usize) -> Result<()> {
        if len < self.min_image_len || len > self.max_image_len || len % self.bank_size as usize != 0 {
            return Err(LayoutError::ImageSize {
                len,
                min: self.min_image_len,
                max: self.max_image_len,
                bank_size: self.bank_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Flat(u32),
    Banked { bank: u8, in_bank_ptr: u16 },
}

impl Address {
    pub fn to_flat(self, layout: &FlatLayout) -> u32 {
        match self {
            Address::Flat(flat) => flat,
            Address::Banked { bank, in_bank_ptr } => layout.to_flat(bank, in_bank_ptr),
        }
    }
}

/// A size-checked image buffer with bounds-checked accessors.
#[derive(Debug, Clone)]
pub struct FlatImage {
    layout: FlatLayout,
    data: Vec<u8>,
}

impl FlatImage {
    pub fn new(data: Vec<u8>, layout: FlatLayout) -> Result<Self> {
        layout.validate_len(data.len())?;
        Ok(Self { layout, data })
    }

    pub fn layout(&self) -> &FlatLayout {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        check_range(offset, len, self.data.len())?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn write_slice(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_range(offset, bytes.len(), self.data.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_slice(offset, &[value])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_slice(offset, &value.to_le_bytes())
    }

    /// Reads the two-byte pointer at `at` and resolves it against the bank
    /// that contains `at`.
    pub fn read_pointer(&self, at: usize) -> Result<u32> {
        let ptr = self.read_u16(at)?;
        Ok(resolve_in_bank(&self.layout, self.layout.bank_of(at as u32), ptr))
    }

    /// Reads a three-byte `[bank, lo, hi]` far pointer.
    pub fn read_far_pointer(&self, at: usize) -> Result<u32> {
        let bank = self.read_u8(at)?;
        let ptr = self.read_u16(at + 1)?;
        Ok(resolve_in_bank(&self.layout, bank, ptr))
    }

    /// Stores a pointer to `target` at `at`. The target must be reachable
    /// from the bank of `at`: the same bank, or bank 0.
    pub fn write_pointer(&mut self, at: usize, target: u32) -> Result<()> {
        let expected = self.layout.bank_of(at as u32);
        let found = self.layout.bank_of(target);
        if found != expected && found != 0 {
            return Err(LayoutError::BankBoundaryViolation {
                index: at,
                expected,
                found,
            });
        }
        let ptr = self.layout.make_pointer(target);
        self.write_u16(at, ptr)
    }

    pub fn write_far_pointer(&mut self, at: usize, target: u32) -> Result<()> {
        let bank = self.layout.bank_of(target);
        let ptr = self.layout.make_pointer(target);
        self.write_u8(at, bank)?;
        self.write_u16(at + 1, ptr)
    }
}

/// Pointers below the bank size always address bank 0.
pub(crate) fn resolve_in_bank(layout: &FlatLayout, bank: u8, ptr: u16) -> u32 {
    if (ptr as u32) < layout.bank_size {
        ptr as u32
    } else {
        layout.to_flat(bank, ptr)
    }
}

pub(crate) fn check_range(offset: usize, len: usize, image_len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= image_len => Ok(()),
        _ => Err(LayoutError::OutOfBounds {
            offset,
            len,
            image_len,
        }),
    }
}

/// Looks up `"<name>Offset"`; an undeclared offset reads as `None`.
pub fn resolve_offset(schema: &SchemaEntrySet, name: &str) -> Option<u32> {
    match schema.get_scalar(&format!("{name}Offset")) {
        v if v > 0 => u32::try_from(v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;

    const GB: FlatLayout = FlatLayout::GAME_BOY;

    #[test]
    fn bank_of_inverts_to_flat() {
        for bank in [0u8, 1, 0x0E, 0x3F, 0x7F] {
            for ptr in [0u16, 1, 0x1234, 0x3FFF] {
                assert_eq!(GB.bank_of(GB.to_flat(bank, ptr)), bank);
            }
        }
    }

    #[test]
    fn window_pointers_fold_into_bank() {
        assert_eq!(GB.to_flat(0x0E, 0x4000), 0x38000);
        assert_eq!(GB.to_flat(0x0E, 0x7FFF), 0x3BFFF);
        assert_eq!(GB.make_pointer(0x3B1E5), 0x71E5);
        assert_eq!(GB.make_pointer(0x1234), 0x1234);
        assert_eq!(
            GB.to_banked(0x3B1E5),
            Address::Banked {
                bank: 0x0E,
                in_bank_ptr: 0x71E5
            }
        );
        assert_eq!(GB.to_banked(0x3B1E5).to_flat(&GB), 0x3B1E5);
        assert_eq!(Address::Flat(0x100).to_flat(&GB), 0x100);
    }

    #[test]
    fn image_size_is_validated() {
        assert!(FlatImage::new(vec![0; 0x8_0000], GB).is_ok());
        assert!(matches!(
            FlatImage::new(vec![0; 0x8_0001], GB),
            Err(LayoutError::ImageSize { .. })
        ));
        assert!(FlatImage::new(vec![0; 0x4000], GB).is_err());
        assert!(FlatImage::new(vec![0; 0x24_0000], GB).is_err());
    }

    #[test]
    fn pointers_resolve_against_containing_bank() {
        let mut image = FlatImage::new(vec![0; 0x8_0000], GB).unwrap();
        image.write_pointer(0x3B000, 0x3B1E5).unwrap();
        assert_eq!(image.read_u16(0x3B000).unwrap(), 0x71E5);
        assert_eq!(image.read_pointer(0x3B000).unwrap(), 0x3B1E5);

        // Bank 0 stays reachable from anywhere.
        image.write_pointer(0x3B002, 0x0150).unwrap();
        assert_eq!(image.read_pointer(0x3B002).unwrap(), 0x0150);

        assert!(matches!(
            image.write_pointer(0x3B004, 0x40000),
            Err(LayoutError::BankBoundaryViolation {
                expected: 0x0E,
                found: 0x10,
                ..
            })
        ));

        image.write_far_pointer(0x100, 0x40010).unwrap();
        assert_eq!(image.slice(0x100, 3).unwrap(), &[0x10, 0x10, 0x40]);
        assert_eq!(image.read_far_pointer(0x100).unwrap(), 0x40010);
    }

    #[test]
    fn accessors_are_bounds_checked() {
        let image = FlatImage::new(vec![0; 0x8_0000], GB).unwrap();
        assert!(matches!(
            image.read_u16(0x7_FFFF),
            Err(LayoutError::OutOfBounds { offset: 0x7_FFFF, len: 2, .. })
        ));
    }

    #[test]
    fn offsets_come_from_schema() {
        let mut set = SchemaEntrySet::new("Red");
        set.insert("PokemonNamesOffset", SchemaEntry::Scalar(0x1C21E));
        assert_eq!(resolve_offset(&set, "PokemonNames"), Some(0x1C21E));
        assert_eq!(resolve_offset(&set, "MoveTutor"), None);
    }
}
