//! Element and block codecs for every storage format.
//!
//! All multi-byte values are little-endian. Block layouts:
//!
//! - Q8: one unsigned code per element, `code = q + 128`
//! - Q4: two codes per byte, element `2j` in the low nibble and `2j + 1` in
//!   the high nibble, `code = q + 8`
//! - Q5: the Q4 nibble stream of `q + 16`, plus one u32 per block holding the
//!   fifth bit of every code. For the pair sharing byte `j` of a block, the
//!   even element's bit sits at bit `j` and the odd element's at `j + 16`.
//!
//! Every block also stores one f32 scale; `value = q * scale`.

use half::{bf16, f16};

use crate::dtype::{DType, BLOCK_SIZE};

const HALF_BLOCK: usize = BLOCK_SIZE / 2;

pub(crate) fn read_f32(bytes: &[u8], index: usize) -> f32 {
    let at = index * 4;
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn write_f32(bytes: &mut [u8], index: usize, value: f32) {
    let at = index * 4;
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u32(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn read_f16(bytes: &[u8], index: usize) -> f32 {
    let at = index * 2;
    f16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f32()
}

pub(crate) fn write_f16(bytes: &mut [u8], index: usize, value: f32) {
    let at = index * 2;
    bytes[at..at + 2].copy_from_slice(&f16::from_f32(value).to_le_bytes());
}

pub(crate) fn read_bf16(bytes: &[u8], index: usize) -> f32 {
    let at = index * 2;
    bf16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f32()
}

pub(crate) fn write_bf16(bytes: &mut [u8], index: usize, value: f32) {
    let at = index * 2;
    // Truncate: keep the upper half of the f32 bit pattern.
    let bits = (value.to_bits() >> 16) as u16;
    bytes[at..at + 2].copy_from_slice(&bits.to_le_bytes());
}

/// The value with the largest magnitude in a block; ties keep the first.
fn extreme(block: &[f32; BLOCK_SIZE]) -> f32 {
    let mut extreme = 0.0f32;
    let mut magnitude = 0.0f32;
    for &v in block {
        let a = v.abs();
        if a > magnitude {
            magnitude = a;
            extreme = v;
        }
    }
    extreme
}

/// Scale and reciprocal scale for a block whose signed codes span
/// `[-midpoint, midpoint)`. The extreme value maps to `-midpoint`.
fn block_scale(block: &[f32; BLOCK_SIZE], midpoint: i32) -> (f32, f32) {
    let extreme = extreme(block);
    if extreme == 0.0 {
        return (0.0, 0.0);
    }
    let scale = extreme / -(midpoint as f32);
    (scale, 1.0 / scale)
}

fn biased_code(value: f32, inverse_scale: f32, midpoint: i32) -> u8 {
    let q = (value * inverse_scale + 0.5).floor() as i32;
    (q + midpoint).clamp(0, 2 * midpoint - 1) as u8
}

/// Encode one block as Q8 codes. Returns the block scale.
pub fn encode_q8_block(block: &[f32; BLOCK_SIZE], codes: &mut [u8]) -> f32 {
    let (scale, inverse) = block_scale(block, 128);
    for (code, &v) in codes.iter_mut().zip(block.iter()) {
        *code = biased_code(v, inverse, 128);
    }
    scale
}

/// Encode one block as 16 bytes of Q4 nibbles. Returns the block scale.
pub fn encode_q4_block(block: &[f32; BLOCK_SIZE], codes: &mut [u8]) -> f32 {
    let (scale, inverse) = block_scale(block, 8);
    for (j, byte) in codes.iter_mut().take(HALF_BLOCK).enumerate() {
        let lo = biased_code(block[2 * j], inverse, 8);
        let hi = biased_code(block[2 * j + 1], inverse, 8);
        *byte = lo | (hi << 4);
    }
    scale
}

/// Encode one block as 16 bytes of Q5 nibbles plus its fifth-bit plane.
/// Returns `(scale, high_bits)`.
pub fn encode_q5_block(block: &[f32; BLOCK_SIZE], codes: &mut [u8]) -> (f32, u32) {
    let (scale, inverse) = block_scale(block, 16);
    let mut high_bits = 0u32;
    for (j, byte) in codes.iter_mut().take(HALF_BLOCK).enumerate() {
        let lo = biased_code(block[2 * j], inverse, 16);
        let hi = biased_code(block[2 * j + 1], inverse, 16);
        *byte = (lo & 0x0F) | ((hi & 0x0F) << 4);
        high_bits |= u32::from(lo >> 4) << j;
        high_bits |= u32::from(hi >> 4) << (j + HALF_BLOCK);
    }
    (scale, high_bits)
}

fn nibble(codes: &[u8], index: usize) -> i32 {
    let byte = codes[index / 2];
    if index % 2 == 0 {
        i32::from(byte & 0x0F)
    } else {
        i32::from(byte >> 4)
    }
}

fn fifth_bit(high_bits: &[u8], index: usize) -> i32 {
    let plane = read_u32(high_bits, index / BLOCK_SIZE);
    let j = (index % BLOCK_SIZE) / 2;
    let bit = if index % 2 == 0 { j } else { j + HALF_BLOCK };
    ((plane >> bit) & 1) as i32
}

/// Signed Q8 code of element `index`.
pub(crate) fn q8_code(codes: &[u8], index: usize) -> i32 {
    i32::from(codes[index]) - 128
}

/// Signed Q4 code of element `index`.
pub(crate) fn q4_code(codes: &[u8], index: usize) -> i32 {
    nibble(codes, index) - 8
}

/// Signed Q5 code of element `index`.
pub(crate) fn q5_code(codes: &[u8], high_bits: &[u8], index: usize) -> i32 {
    (nibble(codes, index) | (fifth_bit(high_bits, index) << 4)) - 16
}

/// Scale of the block containing element `index`.
pub(crate) fn scale_for(scales: &[u8], index: usize) -> f32 {
    read_f32(scales, index / BLOCK_SIZE)
}

/// Number of blocks needed to cover `numel` elements.
pub fn block_count(numel: usize) -> usize {
    numel.div_ceil(BLOCK_SIZE)
}

/// Bytes of scale (or bit-plane) storage needed for `numel` elements.
pub fn block_region_bytes(dtype: DType, numel: usize) -> usize {
    if dtype.is_quantized() {
        block_count(numel) * 4
    } else {
        0
    }
}
