//! LZ11 as used for compressed archive members.
//!
//! Stream layout: `0x11`, 24-bit little-endian output size (0 means a
//! 32-bit size follows), then groups of eight tokens led by a flag byte,
//! most significant bit first. A set bit is a back-reference, a clear bit
//! a literal byte.

use crate::{LayoutError, Result};

const MAGIC: u8 = 0x11;
const WINDOW: usize = 0x1000;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 0x1_0110;

pub fn is_lz11(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == MAGIC
}

fn truncated(pos: usize) -> LayoutError {
    LayoutError::Compression(format!("LZ11 stream truncated at {pos:#X}"))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if !is_lz11(data) {
        return Err(LayoutError::Compression("missing LZ11 header".to_string()));
    }

    let mut size = u32::from_le_bytes([data[1], data[2], data[3], 0]) as usize;
    let mut pos = 4usize;
    if size == 0 {
        if data.len() < 8 {
            return Err(truncated(data.len()));
        }
        size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        pos = 8;
    }

    let next = |pos: &mut usize| -> Result<u8> {
        let b = *data.get(*pos).ok_or_else(|| truncated(*pos))?;
        *pos += 1;
        Ok(b)
    };

    // The header size is untrusted until the stream has produced it.
    let mut out: Vec<u8> = Vec::with_capacity(size.min(data.len().saturating_mul(8)));
    while out.len() < size {
        let flags = next(&mut pos)?;

        for bit in (0..8).rev() {
            if out.len() >= size {
                break;
            }

            if flags & (1 << bit) == 0 {
                out.push(next(&mut pos)?);
                continue;
            }

            let b0 = next(&mut pos)? as usize;
            let (len, disp) = match b0 >> 4 {
                0 => {
                    let b1 = next(&mut pos)? as usize;
                    let b2 = next(&mut pos)? as usize;
                    ((((b0 & 0xF) << 4) | (b1 >> 4)) + 0x11, (((b1 & 0xF) << 8) | b2) + 1)
                }
                1 => {
                    let b1 = next(&mut pos)? as usize;
                    let b2 = next(&mut pos)? as usize;
                    let b3 = next(&mut pos)? as usize;
                    (
                        (((b0 & 0xF) << 12) | (b1 << 4) | (b2 >> 4)) + 0x111,
                        (((b2 & 0xF) << 8) | b3) + 1,
                    )
                }
                n => {
                    let b1 = next(&mut pos)? as usize;
                    (n + 1, (((b0 & 0xF) << 8) | b1) + 1)
                }
            };

            if disp > out.len() {
                return Err(LayoutError::Compression(format!(
                    "LZ11 back-reference {disp} reaches before start of output ({} bytes)",
                    out.len()
                )));
            }

            for _ in 0..len {
                let b = out[out.len() - disp];
                out.push(b);
            }
        }
    }

    out.truncate(size);
    Ok(out)
}

fn longest_match(input: &[u8], at: usize) -> (usize, usize) {
    let start = at.saturating_sub(WINDOW);
    let max_len = MAX_MATCH.min(input.len() - at);
    let mut best = (0usize, 0usize);

    for candidate in start..at {
        let mut len = 0usize;
        while len < max_len && input[candidate + len] == input[at + len] {
            len += 1;
        }
        if len > best.0 {
            best = (len, at - candidate);
            if len == max_len {
                break;
            }
        }
    }
    best
}

/// Greedy compressor; the output always decodes with [`decompress`].
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + 8);
    out.push(MAGIC);
    if !input.is_empty() && input.len() < 0x100_0000 {
        out.extend_from_slice(&(input.len() as u32).to_le_bytes()[..3]);
    } else {
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&(input.len() as u32).to_le_bytes());
    }

    let mut i = 0usize;
    while i < input.len() {
        let flag_pos = out.len();
        out.push(0);

        for bit in (0..8).rev() {
            if i >= input.len() {
                break;
            }

            let (len, dist) = longest_match(input, i);
            if len < MIN_MATCH {
                out.push(input[i]);
                i += 1;
                continue;
            }

            out[flag_pos] |= 1 << bit;
            let disp = dist - 1;
            if len <= 0x10 {
                out.push((((len - 1) << 4) | (disp >> 8)) as u8);
                out.push((disp & 0xFF) as u8);
            } else if len <= 0x110 {
                let l = len - 0x11;
                out.push((l >> 4) as u8);
                out.push((((l & 0xF) << 4) | (disp >> 8)) as u8);
                out.push((disp & 0xFF) as u8);
            } else {
                let l = len - 0x111;
                out.push((0x10 | (l >> 12)) as u8);
                out.push(((l >> 4) & 0xFF) as u8);
                out.push((((l & 0xF) << 4) | (disp >> 8)) as u8);
                out.push((disp & 0xFF) as u8);
            }
            i += len;
        }
    }

    out
}
