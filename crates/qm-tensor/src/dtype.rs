use std::fmt;

/// Number of consecutive elements along the last dimension that share one
/// scale factor in the block-quantized formats.
pub const BLOCK_SIZE: usize = 32;

/// Supported storage formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit IEEE 754 half precision (via `half::f16`).
    F16,
    /// 16-bit brain float: the upper half of an f32, truncated on encode.
    BF16,
    /// One 8-bit code per element, one f32 scale per block.
    ///
    /// The signed value `q` in `-128..=127` is persisted biased as the
    /// unsigned byte `q + 128`. Files holding two's-complement `i8` codes
    /// convert by flipping the top bit of every byte (`b ^ 0x80`).
    Q8,
    /// Two biased 4-bit codes per byte, one f32 scale per block.
    Q4,
    /// Q4-style nibbles plus a 32-bit plane holding each element's fifth bit.
    Q5,
}

impl DType {
    /// Bytes occupied by `numel` elements in the packed data region.
    ///
    /// Scales and Q5 bit-planes live in separate regions and are not counted.
    ///
    /// - F32: 4 bytes per element
    /// - F16 / BF16: 2 bytes per element
    /// - Q8: 1 byte per element
    /// - Q4 / Q5: 1 byte per 2 elements
    pub fn data_bytes(&self, numel: usize) -> usize {
        match self {
            DType::F32 => numel * 4,
            DType::F16 | DType::BF16 => numel * 2,
            DType::Q8 => numel,
            DType::Q4 | DType::Q5 => numel / 2,
        }
    }

    /// Number of elements a data region of `bytes` bytes can hold.
    pub fn elements_in(&self, bytes: usize) -> usize {
        match self {
            DType::F32 => bytes / 4,
            DType::F16 | DType::BF16 => bytes / 2,
            DType::Q8 => bytes,
            DType::Q4 | DType::Q5 => bytes * 2,
        }
    }

    /// Returns the number of elements per quantization block, or 1 for
    /// non-quantized types.
    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::BF16 => 1,
            DType::Q8 | DType::Q4 | DType::Q5 => BLOCK_SIZE,
        }
    }

    /// Returns true if this dtype is a block-quantized (write-once) format.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::Q8 | DType::Q4 | DType::Q5)
    }

    /// Bias added to a signed code to obtain its unsigned storage code.
    ///
    /// Half of the representable signed range: codes span
    /// `[-midpoint, midpoint)`. Returns `None` for non-quantized types.
    pub fn midpoint(&self) -> Option<i32> {
        match self {
            DType::Q8 => Some(128),
            DType::Q4 => Some(8),
            DType::Q5 => Some(16),
            DType::F32 | DType::F16 | DType::BF16 => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::Q8 => write!(f, "q8"),
            DType::Q4 => write!(f, "q4"),
            DType::Q5 => write!(f, "q5"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DType; 6] = [
        DType::F32,
        DType::F16,
        DType::BF16,
        DType::Q8,
        DType::Q4,
        DType::Q5,
    ];

    #[test]
    fn test_data_bytes() {
        assert_eq!(DType::F32.data_bytes(32), 128);
        assert_eq!(DType::F16.data_bytes(32), 64);
        assert_eq!(DType::BF16.data_bytes(32), 64);
        assert_eq!(DType::Q8.data_bytes(32), 32);
        assert_eq!(DType::Q4.data_bytes(32), 16);
        assert_eq!(DType::Q5.data_bytes(32), 16);
    }

    #[test]
    fn test_elements_in_inverts_data_bytes() {
        for dtype in ALL {
            assert_eq!(dtype.elements_in(dtype.data_bytes(64)), 64, "{}", dtype);
        }
    }

    #[test]
    fn test_quantized_flags() {
        assert!(!DType::F32.is_quantized());
        assert!(!DType::BF16.is_quantized());
        assert!(DType::Q4.is_quantized());
        assert_eq!(DType::Q5.block_size(), BLOCK_SIZE);
        assert_eq!(DType::F16.block_size(), 1);
        assert_eq!(DType::Q4.midpoint(), Some(8));
        assert_eq!(DType::Q5.midpoint(), Some(16));
        assert_eq!(DType::Q8.midpoint(), Some(128));
        assert_eq!(DType::F32.midpoint(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(DType::BF16.to_string(), "bf16");
        assert_eq!(DType::Q5.to_string(), "q5");
    }
}
