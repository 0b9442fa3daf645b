use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// A contiguous byte region backing a tensor.
#[derive(Debug, Clone)]
pub enum Region {
    /// Heap memory owned exclusively by one tensor.
    Owned(Vec<u8>),
    /// Read-only window into a memory-mapped file. The mapping is owned by
    /// the loader and outlives every tensor that points into it.
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl Region {
    /// Wrap an owned byte buffer.
    pub fn owned(bytes: Vec<u8>) -> Self {
        Region::Owned(bytes)
    }

    /// Allocate `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Region::Owned(vec![0u8; len])
    }

    /// A window of `len` bytes starting at `offset` within a mapped file.
    pub fn mapped(map: Arc<Mmap>, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map_or(true, |end| end > map.len()) {
            return Err(TensorError::Range {
                offset,
                length: len,
                size: map.len(),
            });
        }
        Ok(Region::Mapped { map, offset, len })
    }

    /// Number of bytes in this region.
    pub fn len(&self) -> usize {
        match self {
            Region::Owned(v) => v.len(),
            Region::Mapped { len, .. } => *len,
        }
    }

    /// Returns true if the region contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the region is backed by a file mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self, Region::Mapped { .. })
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Region::Owned(v) => v.as_slice(),
            Region::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    /// Mutable access to the bytes of an owned region.
    ///
    /// # Errors
    /// Returns `ReadOnly` for mapped regions.
    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Region::Owned(v) => Ok(v.as_mut_slice()),
            Region::Mapped { .. } => Err(TensorError::ReadOnly(
                "memory-mapped region".to_string(),
            )),
        }
    }
}

/// Memory-map a weight file for read-only tensor access.
pub fn map_file(path: &Path) -> Result<Arc<Mmap>> {
    let file = File::open(path)?;
    // The mapping is read-only; the caller must not truncate the file while
    // tensors still point into it.
    let map = unsafe { Mmap::map(&file)? };
    Ok(Arc::new(map))
}

/// The separately stored regions that make up a tensor in its persisted
/// layout.
///
/// - `data`: packed element codes (or raw little-endian floats)
/// - `scales`: one little-endian f32 per block (quantized types only)
/// - `high_bits`: one little-endian u32 bit-plane per block (Q5 only)
#[derive(Debug, Clone)]
pub struct TensorParts {
    pub data: Region,
    pub scales: Option<Region>,
    pub high_bits: Option<Region>,
}

impl TensorParts {
    /// Parts for a non-quantized tensor.
    pub fn dense(data: Region) -> Self {
        TensorParts {
            data,
            scales: None,
            high_bits: None,
        }
    }

    /// Parts for a Q4 or Q8 tensor.
    pub fn blocks(data: Region, scales: Region) -> Self {
        TensorParts {
            data,
            scales: Some(scales),
            high_bits: None,
        }
    }

    /// Parts for a Q5 tensor.
    pub fn blocks_with_high_bits(data: Region, scales: Region, high_bits: Region) -> Self {
        TensorParts {
            data,
            scales: Some(scales),
            high_bits: Some(high_bits),
        }
    }
}

/// Block-quantized regions: packed codes plus the parallel per-block scale
/// region and, for Q5, the per-block fifth-bit planes (empty otherwise).
#[derive(Debug, Clone)]
pub struct BlockRegions {
    pub codes: Region,
    pub scales: Region,
    pub high_bits: Region,
}

impl BlockRegions {
    fn is_mapped(&self) -> bool {
        self.codes.is_mapped() || self.scales.is_mapped() || self.high_bits.is_mapped()
    }
}

/// Tensor storage: a closed set of formats sharing one shape abstraction.
#[derive(Debug, Clone)]
pub enum Storage {
    F32(Region),
    F16(Region),
    BF16(Region),
    Q8(BlockRegions),
    Q4(BlockRegions),
    Q5(BlockRegions),
}

impl Storage {
    /// Zero-filled owned storage for `n` elements.
    ///
    /// # Errors
    /// Quantized formats are write-once and can only be produced by encoding
    /// a source tensor, so they return `UnsupportedOperation`.
    pub fn zeros(dtype: DType, n: usize) -> Result<Self> {
        let data = Region::zeroed(dtype.data_bytes(n));
        match dtype {
            DType::F32 => Ok(Storage::F32(data)),
            DType::F16 => Ok(Storage::F16(data)),
            DType::BF16 => Ok(Storage::BF16(data)),
            other => Err(TensorError::UnsupportedOperation(format!(
                "cannot allocate empty {} storage; quantize a source tensor instead",
                other
            ))),
        }
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::Q8(_) => DType::Q8,
            Storage::Q4(_) => DType::Q4,
            Storage::Q5(_) => DType::Q5,
        }
    }

    /// The packed data region.
    pub fn data(&self) -> &Region {
        match self {
            Storage::F32(r) | Storage::F16(r) | Storage::BF16(r) => r,
            Storage::Q8(b) | Storage::Q4(b) | Storage::Q5(b) => &b.codes,
        }
    }

    /// The block regions of a quantized storage.
    pub fn blocks(&self) -> Option<&BlockRegions> {
        match self {
            Storage::Q8(b) | Storage::Q4(b) | Storage::Q5(b) => Some(b),
            Storage::F32(_) | Storage::F16(_) | Storage::BF16(_) => None,
        }
    }

    /// Element capacity of the data region.
    pub fn capacity(&self) -> usize {
        self.dtype().elements_in(self.data().len())
    }

    /// Returns true if any backing region is memory-mapped.
    pub fn is_mapped(&self) -> bool {
        match self {
            Storage::F32(r) | Storage::F16(r) | Storage::BF16(r) => r.is_mapped(),
            Storage::Q8(b) | Storage::Q4(b) | Storage::Q5(b) => b.is_mapped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_zeros_dense() {
        let s = Storage::zeros(DType::F32, 5).unwrap();
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.capacity(), 5);
        assert_eq!(s.data().as_bytes(), &[0u8; 20]);

        let s = Storage::zeros(DType::BF16, 4).unwrap();
        assert_eq!(s.data().len(), 8);
        assert!(!s.is_mapped());
    }

    #[test]
    fn test_zeros_quantized_unsupported() {
        for dtype in [DType::Q8, DType::Q4, DType::Q5] {
            assert!(matches!(
                Storage::zeros(dtype, 32),
                Err(TensorError::UnsupportedOperation(_))
            ));
        }
    }

    #[test]
    fn test_owned_region_is_writable() {
        let mut r = Region::owned(vec![1, 2, 3]);
        r.as_bytes_mut().unwrap()[0] = 42;
        assert_eq!(r.as_bytes(), &[42, 2, 3]);
        assert!(!r.is_empty());
    }

    #[test]
    fn test_mapped_region_is_read_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9u8, 8, 7, 6, 5]).unwrap();
        file.flush().unwrap();

        let map = map_file(file.path()).unwrap();
        let mut r = Region::mapped(map, 1, 3).unwrap();
        assert!(r.is_mapped());
        assert_eq!(r.as_bytes(), &[8, 7, 6]);
        assert!(matches!(r.as_bytes_mut(), Err(TensorError::ReadOnly(_))));
    }

    #[test]
    fn test_mapped_region_bounds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 4]).unwrap();
        file.flush().unwrap();

        let map = map_file(file.path()).unwrap();
        assert!(matches!(
            Region::mapped(map.clone(), 2, 4),
            Err(TensorError::Range { offset: 2, length: 4, size: 4 })
        ));
        assert!(matches!(
            Region::mapped(map, 1, usize::MAX),
            Err(TensorError::Range { .. })
        ));
    }
}
