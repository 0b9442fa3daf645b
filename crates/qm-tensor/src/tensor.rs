use rayon::prelude::*;
use tracing::debug;

use crate::cpu::elementwise;
use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};
use crate::quant;
use crate::shape::Shape;
use crate::storage::{BlockRegions, Region, Storage, TensorParts};
use crate::view::{check_reshape, Data, DataMut, TensorView, TensorViewMut};

/// A tensor over owned or memory-mapped storage.
///
/// The shape is fixed at construction and its element count never exceeds
/// the storage capacity. Element access decodes from the native format;
/// mutation is only possible on owned dense (F32/F16/BF16) storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    /// Create a zero-filled owned tensor.
    ///
    /// # Errors
    /// Quantized dtypes return `UnsupportedOperation`; use [`Tensor::quantize`].
    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self> {
        let storage = Storage::zeros(dtype, shape.numel())?;
        Ok(Tensor { storage, shape })
    }

    /// Create an owned F32 tensor from a vector and a shape.
    pub fn from_f32(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![shape.numel()],
                got: vec![data.len()],
            });
        }
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(Tensor {
            storage: Storage::F32(Region::owned(bytes)),
            shape,
        })
    }

    /// Assemble a tensor from regions in the persisted layout.
    ///
    /// Regions may be owned or mapped and may be larger than the shape
    /// requires; the tensor only ever addresses `shape.numel()` elements.
    pub fn from_parts(dtype: DType, shape: Shape, parts: TensorParts) -> Result<Self> {
        let numel = shape.numel();
        let need = |region: &Region, bytes: usize, what: &str| -> Result<()> {
            if region.len() < bytes {
                return Err(TensorError::Construction(format!(
                    "{} {} region holds {} bytes, shape {} needs {}",
                    dtype,
                    what,
                    region.len(),
                    shape,
                    bytes
                )));
            }
            Ok(())
        };
        need(&parts.data, dtype.data_bytes(numel), "data")?;

        if !dtype.is_quantized() {
            if parts.scales.is_some() || parts.high_bits.is_some() {
                return Err(TensorError::Construction(format!(
                    "{} tensors carry no block regions",
                    dtype
                )));
            }
            let storage = match dtype {
                DType::F16 => Storage::F16(parts.data),
                DType::BF16 => Storage::BF16(parts.data),
                _ => Storage::F32(parts.data),
            };
            return Ok(Tensor { storage, shape });
        }

        check_block_multiple(dtype, &shape)?;
        let block_bytes = quant::block_region_bytes(dtype, numel);
        let scales = parts.scales.ok_or_else(|| {
            TensorError::Construction(format!("{} tensor is missing its scale region", dtype))
        })?;
        need(&scales, block_bytes, "scale")?;

        let high_bits = match (dtype, parts.high_bits) {
            (DType::Q5, Some(bits)) => {
                need(&bits, block_bytes, "bit-plane")?;
                bits
            }
            (DType::Q5, None) => {
                return Err(TensorError::Construction(
                    "q5 tensor is missing its bit-plane region".to_string(),
                ))
            }
            (_, Some(_)) => {
                return Err(TensorError::Construction(format!(
                    "{} tensors carry no bit-plane region",
                    dtype
                )))
            }
            (_, None) => Region::owned(Vec::new()),
        };

        let blocks = BlockRegions {
            codes: parts.data,
            scales,
            high_bits,
        };
        let storage = match dtype {
            DType::Q8 => Storage::Q8(blocks),
            DType::Q4 => Storage::Q4(blocks),
            _ => Storage::Q5(blocks),
        };
        Ok(Tensor { storage, shape })
    }

    /// Encode `source` into a new owned tensor of `dtype`.
    ///
    /// The source must be dense (F32/F16/BF16). Block formats require the
    /// last dimension to be a multiple of [`BLOCK_SIZE`]; blocks are encoded
    /// independently and in parallel.
    pub fn quantize(source: &TensorView<'_>, dtype: DType) -> Result<Self> {
        if source.dtype().is_quantized() {
            return Err(TensorError::TypeMismatch {
                expected: DType::F32,
                got: source.dtype(),
            });
        }
        let shape = source.shape().clone();

        if !dtype.is_quantized() {
            let mut tensor = Tensor::zeros(dtype, shape)?;
            tensor.view_mut()?.write_from(0, &source.to_f32_vec())?;
            return Ok(tensor);
        }

        check_block_multiple(dtype, &shape)?;
        let numel = shape.numel();
        let n_blocks = quant::block_count(numel);
        let block_code_bytes = dtype.data_bytes(BLOCK_SIZE);
        let mut codes = vec![0u8; dtype.data_bytes(numel)];
        let mut scales = vec![0u8; n_blocks * 4];
        let mut high_bits = vec![0u8; if dtype == DType::Q5 { n_blocks * 4 } else { 0 }];

        debug!(%dtype, %shape, blocks = n_blocks, "quantizing tensor");

        let encode = |block: usize, codes: &mut [u8], scale: &mut [u8]| -> Result<u32> {
            let mut values = [0.0f32; BLOCK_SIZE];
            source.decode_into(block * BLOCK_SIZE, &mut values)?;
            let (s, bits) = match dtype {
                DType::Q8 => (quant::encode_q8_block(&values, codes), 0),
                DType::Q4 => (quant::encode_q4_block(&values, codes), 0),
                _ => quant::encode_q5_block(&values, codes),
            };
            scale.copy_from_slice(&s.to_le_bytes());
            Ok(bits)
        };

        if dtype == DType::Q5 {
            codes
                .par_chunks_mut(block_code_bytes)
                .zip(scales.par_chunks_mut(4))
                .zip(high_bits.par_chunks_mut(4))
                .enumerate()
                .try_for_each(|(block, ((c, s), h))| {
                    let bits = encode(block, c, s)?;
                    h.copy_from_slice(&bits.to_le_bytes());
                    Ok::<(), TensorError>(())
                })?;
        } else {
            codes
                .par_chunks_mut(block_code_bytes)
                .zip(scales.par_chunks_mut(4))
                .enumerate()
                .try_for_each(|(block, (c, s))| encode(block, c, s).map(|_| ()))?;
        }

        let parts = if dtype == DType::Q5 {
            TensorParts::blocks_with_high_bits(
                Region::owned(codes),
                Region::owned(scales),
                Region::owned(high_bits),
            )
        } else {
            TensorParts::blocks(Region::owned(codes), Region::owned(scales))
        };
        Tensor::from_parts(dtype, shape, parts)
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Element capacity of the backing data region.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Returns true if the tensor points into a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        self.storage.is_mapped()
    }

    fn data(&self) -> Data<'_> {
        let numel = self.shape.numel();
        let full = match &self.storage {
            Storage::F32(r) => Data::F32(r.as_bytes()),
            Storage::F16(r) => Data::F16(r.as_bytes()),
            Storage::BF16(r) => Data::BF16(r.as_bytes()),
            Storage::Q8(b) => Data::Q8 {
                codes: b.codes.as_bytes(),
                scales: b.scales.as_bytes(),
            },
            Storage::Q4(b) => Data::Q4 {
                codes: b.codes.as_bytes(),
                scales: b.scales.as_bytes(),
            },
            Storage::Q5(b) => Data::Q5 {
                codes: b.codes.as_bytes(),
                scales: b.scales.as_bytes(),
                high_bits: b.high_bits.as_bytes(),
            },
        };
        full.narrow(0, numel)
    }

    /// Read-only view over the whole tensor.
    pub fn view(&self) -> TensorView<'_> {
        TensorView::new(self.data(), self.shape.clone())
    }

    /// Mutable view over the whole tensor.
    ///
    /// # Errors
    /// Returns `ReadOnly` for mapped or quantized (write-once) storage.
    pub fn view_mut(&mut self) -> Result<TensorViewMut<'_>> {
        let dtype = self.storage.dtype();
        let bytes = dtype.data_bytes(self.shape.numel());
        let data = match &mut self.storage {
            Storage::F32(r) => DataMut::F32(&mut r.as_bytes_mut()?[..bytes]),
            Storage::F16(r) => DataMut::F16(&mut r.as_bytes_mut()?[..bytes]),
            Storage::BF16(r) => DataMut::BF16(&mut r.as_bytes_mut()?[..bytes]),
            Storage::Q8(_) | Storage::Q4(_) | Storage::Q5(_) => {
                return Err(TensorError::ReadOnly(format!(
                    "{} storage is write-once",
                    dtype
                )))
            }
        };
        Ok(TensorViewMut::new(data, self.shape.clone()))
    }

    /// Decode the element at the given coordinates.
    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        self.view().get(indices)
    }

    /// Encode `value` into the element at the given coordinates.
    pub fn set(&mut self, value: f32, indices: &[usize]) -> Result<()> {
        self.view_mut()?.set(value, indices)
    }

    /// View of the sub-array with the leading coordinates fixed to `indices`.
    pub fn slice(&self, indices: &[usize]) -> Result<TensorView<'_>> {
        let (offset, shape) = self.shape.narrow_leading(indices)?;
        Ok(TensorView::new(self.data().narrow(offset, shape.numel()), shape))
    }

    /// Mutable view of the sub-array with the leading coordinates fixed.
    pub fn slice_mut(&mut self, indices: &[usize]) -> Result<TensorViewMut<'_>> {
        self.view_mut()?.into_slice(indices)
    }

    /// The same elements under a different shape.
    pub fn reshape(&self, shape: Shape) -> Result<TensorView<'_>> {
        check_reshape(self.dtype(), &self.shape, &shape)?;
        Ok(TensorView::new(self.data(), shape))
    }

    /// Bulk copy `length` elements from `source` (same dtype required).
    pub fn copy_range(
        &mut self,
        source: &TensorView<'_>,
        source_offset: usize,
        dest_offset: usize,
        length: usize,
    ) -> Result<()> {
        if source.dtype() != self.dtype() {
            return Err(TensorError::TypeMismatch {
                expected: self.dtype(),
                got: source.dtype(),
            });
        }
        self.view_mut()?
            .copy_from(source, source_offset, dest_offset, length)
    }

    /// Multiply `length` elements starting at `offset` by `factor` in place.
    ///
    /// # Errors
    /// `UnsupportedOperation` on quantized storage, `ReadOnly` when mapped.
    pub fn scale(&mut self, factor: f32, offset: usize, length: usize) -> Result<()> {
        if self.dtype().is_quantized() {
            return Err(TensorError::UnsupportedOperation(format!(
                "in-place scale on {} storage",
                self.dtype()
            )));
        }
        elementwise::scale(&mut self.view_mut()?, factor, offset, length)
    }

    /// Zero every element.
    pub fn clear(&mut self) -> Result<()> {
        self.view_mut()?.clear();
        Ok(())
    }

    /// Decode every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.view().to_f32_vec()
    }

    /// Packed data bytes in the persisted layout.
    pub fn data_bytes(&self) -> &[u8] {
        let bytes = self.storage.data().as_bytes();
        &bytes[..self.dtype().data_bytes(self.numel())]
    }

    /// Per-block little-endian f32 scales (quantized types only).
    pub fn scale_bytes(&self) -> Option<&[u8]> {
        let len = quant::block_region_bytes(self.dtype(), self.numel());
        self.storage.blocks().map(|b| &b.scales.as_bytes()[..len])
    }

    /// Per-block little-endian u32 fifth-bit planes (Q5 only).
    pub fn high_bit_bytes(&self) -> Option<&[u8]> {
        let len = quant::block_region_bytes(self.dtype(), self.numel());
        match &self.storage {
            Storage::Q5(b) => Some(&b.high_bits.as_bytes()[..len]),
            _ => None,
        }
    }

    /// An empty F32 placeholder that owns no allocation.
    pub(crate) fn empty() -> Self {
        Tensor {
            storage: Storage::F32(Region::owned(Vec::new())),
            shape: Shape::new(vec![0]),
        }
    }
}

fn check_block_multiple(dtype: DType, shape: &Shape) -> Result<()> {
    if shape.last_dim() % BLOCK_SIZE != 0 {
        return Err(TensorError::Construction(format!(
            "{} requires the last dimension to be a multiple of {}, got shape {}",
            dtype, BLOCK_SIZE, shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::map_file;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Write;

    fn random_rows(rows: usize, cols: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
        Tensor::from_f32(data, Shape::new(vec![rows, cols])).unwrap()
    }

    #[test]
    fn test_from_f32_and_get() {
        let t = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3]))
            .unwrap();
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.get(&[1, 0]).unwrap(), 4.0);
        assert!(!t.is_mapped());
    }

    #[test]
    fn test_from_f32_length_mismatch() {
        assert!(matches!(
            Tensor::from_f32(vec![1.0; 5], Shape::new(vec![2, 3])),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_set_dense_formats() {
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let mut t = Tensor::zeros(dtype, Shape::new(vec![2, 2])).unwrap();
            t.set(1.5, &[1, 1]).unwrap();
            assert_eq!(t.get(&[1, 1]).unwrap(), 1.5);
            assert_eq!(t.get(&[0, 1]).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_quantized_round_trip_within_one_step() {
        let source = random_rows(4, 64, 7);
        for dtype in [DType::Q8, DType::Q4, DType::Q5] {
            let q = Tensor::quantize(&source.view(), dtype).unwrap();
            assert_eq!(q.dtype(), dtype);
            assert_eq!(q.shape(), source.shape());
            let scales = q.scale_bytes().unwrap();
            let original = source.to_f32_vec();
            for (i, decoded) in q.to_f32_vec().into_iter().enumerate() {
                let scale = quant::scale_for(scales, i).abs();
                assert!(
                    (decoded - original[i]).abs() <= scale + 1e-6,
                    "{} element {} decoded {} from {}",
                    dtype,
                    i,
                    decoded,
                    original[i]
                );
            }
        }
    }

    #[test]
    fn test_quantize_requires_block_multiple() {
        let source = random_rows(2, 48, 1);
        for dtype in [DType::Q8, DType::Q4, DType::Q5] {
            assert!(
                matches!(
                    Tensor::quantize(&source.view(), dtype),
                    Err(TensorError::Construction(_))
                ),
                "{} accepted a 48-wide row",
                dtype
            );

            let parts = TensorParts::blocks_with_high_bits(
                Region::zeroed(64),
                Region::zeroed(8),
                Region::zeroed(8),
            );
            let parts = if dtype == DType::Q5 {
                parts
            } else {
                TensorParts::blocks(parts.data, Region::zeroed(8))
            };
            assert!(
                matches!(
                    Tensor::from_parts(dtype, Shape::new(vec![48]), parts),
                    Err(TensorError::Construction(_))
                ),
                "{} from_parts accepted 48 elements",
                dtype
            );
        }
    }

    #[test]
    fn test_quantize_rejects_quantized_source() {
        let source = random_rows(1, 32, 2);
        let q = Tensor::quantize(&source.view(), DType::Q8).unwrap();
        assert!(matches!(
            Tensor::quantize(&q.view(), DType::Q4),
            Err(TensorError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_quantize_to_dense() {
        let source = random_rows(2, 3, 3);
        let half = Tensor::quantize(&source.view(), DType::F16).unwrap();
        for (a, b) in half.to_f32_vec().iter().zip(source.to_f32_vec()) {
            assert_relative_eq!(*a, b, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_quantized_tensors_are_write_once() {
        let source = random_rows(1, 32, 4);
        let mut q = Tensor::quantize(&source.view(), DType::Q5).unwrap();
        assert!(matches!(q.set(1.0, &[0, 0]), Err(TensorError::ReadOnly(_))));
        assert!(matches!(
            q.scale(2.0, 0, 32),
            Err(TensorError::UnsupportedOperation(_))
        ));
        assert!(q.view_mut().is_err());
    }

    #[test]
    fn test_quantized_slice_keeps_block_alignment() {
        let source = random_rows(3, 64, 5);
        let q = Tensor::quantize(&source.view(), DType::Q4).unwrap();
        let row = q.slice(&[2]).unwrap();
        assert_eq!(row.shape().dims(), &[64]);
        for j in 0..64 {
            assert_eq!(row.get(&[j]).unwrap(), q.get(&[2, j]).unwrap());
        }
    }

    #[test]
    fn test_slice_mut_and_copy_range() {
        let mut t = Tensor::zeros(DType::F32, Shape::new(vec![2, 3])).unwrap();
        t.slice_mut(&[1]).unwrap().write_from(0, &[7.0, 8.0, 9.0]).unwrap();
        assert_eq!(t.to_f32_vec(), vec![0.0, 0.0, 0.0, 7.0, 8.0, 9.0]);

        let src = Tensor::from_f32(vec![1.0, 2.0, 3.0], Shape::new(vec![3])).unwrap();
        t.copy_range(&src.view(), 1, 0, 2).unwrap();
        assert_eq!(t.to_f32_vec(), vec![2.0, 3.0, 0.0, 7.0, 8.0, 9.0]);
        assert!(matches!(
            t.copy_range(&src.view(), 2, 0, 2),
            Err(TensorError::Range { .. })
        ));
    }

    #[test]
    fn test_scale_range() {
        let mut t = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![4])).unwrap();
        t.scale(2.0, 1, 2).unwrap();
        assert_eq!(t.to_f32_vec(), vec![1.0, 4.0, 6.0, 4.0]);
        assert!(t.scale(2.0, 3, 2).is_err());
    }

    #[test]
    fn test_reshape_quantized_last_dim() {
        let source = random_rows(2, 64, 6);
        let q = Tensor::quantize(&source.view(), DType::Q8).unwrap();
        assert!(q.reshape(Shape::new(vec![4, 32])).is_ok());
        assert!(matches!(
            q.reshape(Shape::new(vec![8, 16])),
            Err(TensorError::Construction(_))
        ));
    }

    #[test]
    fn test_from_parts_validation() {
        let too_small = TensorParts::blocks(Region::zeroed(8), Region::zeroed(4));
        assert!(matches!(
            Tensor::from_parts(DType::Q4, Shape::new(vec![32]), too_small),
            Err(TensorError::Construction(_))
        ));

        let missing_plane = TensorParts::blocks(Region::zeroed(16), Region::zeroed(4));
        assert!(Tensor::from_parts(DType::Q5, Shape::new(vec![32]), missing_plane).is_err());

        let stray_plane = TensorParts::blocks_with_high_bits(
            Region::zeroed(32),
            Region::zeroed(4),
            Region::zeroed(4),
        );
        assert!(Tensor::from_parts(DType::Q8, Shape::new(vec![32]), stray_plane).is_err());

        let dense_with_scales = TensorParts::blocks(Region::zeroed(16), Region::zeroed(4));
        assert!(Tensor::from_parts(DType::F32, Shape::new(vec![4]), dense_with_scales).is_err());
    }

    #[test]
    fn test_from_parts_capacity_may_exceed_shape() {
        let parts = TensorParts::dense(Region::zeroed(40));
        let t = Tensor::from_parts(DType::F32, Shape::new(vec![4]), parts).unwrap();
        assert_eq!(t.capacity(), 10);
        assert_eq!(t.numel(), 4);
        assert_eq!(t.data_bytes().len(), 16);
    }

    #[test]
    fn test_persisted_layout_survives_mapping() {
        let source = random_rows(2, 32, 8);
        let q = Tensor::quantize(&source.view(), DType::Q5).unwrap();

        let data = q.data_bytes().to_vec();
        let scales = q.scale_bytes().unwrap().to_vec();
        let bits = q.high_bit_bytes().unwrap().to_vec();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.write_all(&scales).unwrap();
        file.write_all(&bits).unwrap();
        file.flush().unwrap();

        let map = map_file(file.path()).unwrap();
        let parts = TensorParts::blocks_with_high_bits(
            Region::mapped(map.clone(), 0, data.len()).unwrap(),
            Region::mapped(map.clone(), data.len(), scales.len()).unwrap(),
            Region::mapped(map, data.len() + scales.len(), bits.len()).unwrap(),
        );
        let mapped = Tensor::from_parts(DType::Q5, Shape::new(vec![2, 32]), parts).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.to_f32_vec(), q.to_f32_vec());
    }

    #[test]
    fn test_mapped_dense_tensor_is_read_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            file.write_all(&v.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();

        let map = map_file(file.path()).unwrap();
        let parts = TensorParts::dense(Region::mapped(map, 0, 16).unwrap());
        let mut t = Tensor::from_parts(DType::F32, Shape::new(vec![2, 2]), parts).unwrap();
        assert_eq!(t.get(&[1, 0]).unwrap(), 3.0);
        assert!(matches!(t.set(0.0, &[0, 0]), Err(TensorError::ReadOnly(_))));
        assert!(matches!(t.scale(2.0, 0, 4), Err(TensorError::ReadOnly(_))));
    }
}
