//! Borrowed tensor views.
//!
//! A view holds byte slices into its parent's regions, so a slice can never
//! outlive the tensor it was cut from and slicing never copies. Only the
//! dense float formats have a mutable view.

use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};
use crate::quant;
use crate::shape::Shape;

/// Format-tagged byte slices for exactly the elements a view covers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Data<'a> {
    F32(&'a [u8]),
    F16(&'a [u8]),
    BF16(&'a [u8]),
    Q8 {
        codes: &'a [u8],
        scales: &'a [u8],
    },
    Q4 {
        codes: &'a [u8],
        scales: &'a [u8],
    },
    Q5 {
        codes: &'a [u8],
        scales: &'a [u8],
        high_bits: &'a [u8],
    },
}

fn block_range(offset: usize, len: usize) -> std::ops::Range<usize> {
    let first = offset / BLOCK_SIZE;
    let last = (offset + len).div_ceil(BLOCK_SIZE);
    first * 4..last * 4
}

impl<'a> Data<'a> {
    pub(crate) fn dtype(&self) -> DType {
        match self {
            Data::F32(_) => DType::F32,
            Data::F16(_) => DType::F16,
            Data::BF16(_) => DType::BF16,
            Data::Q8 { .. } => DType::Q8,
            Data::Q4 { .. } => DType::Q4,
            Data::Q5 { .. } => DType::Q5,
        }
    }

    /// Sub-range of `len` elements starting at `offset`.
    ///
    /// Quantized offsets must be block-aligned; callers guarantee this by
    /// only narrowing along leading dimensions of block-multiple rows.
    pub(crate) fn narrow(self, offset: usize, len: usize) -> Data<'a> {
        match self {
            Data::F32(b) => Data::F32(&b[offset * 4..(offset + len) * 4]),
            Data::F16(b) => Data::F16(&b[offset * 2..(offset + len) * 2]),
            Data::BF16(b) => Data::BF16(&b[offset * 2..(offset + len) * 2]),
            Data::Q8 { codes, scales } => Data::Q8 {
                codes: &codes[offset..offset + len],
                scales: &scales[block_range(offset, len)],
            },
            Data::Q4 { codes, scales } => Data::Q4 {
                codes: &codes[offset / 2..(offset + len) / 2],
                scales: &scales[block_range(offset, len)],
            },
            Data::Q5 {
                codes,
                scales,
                high_bits,
            } => Data::Q5 {
                codes: &codes[offset / 2..(offset + len) / 2],
                scales: &scales[block_range(offset, len)],
                high_bits: &high_bits[block_range(offset, len)],
            },
        }
    }

    /// Decode element `i`. O(1) for every format.
    pub(crate) fn get(&self, i: usize) -> f32 {
        match *self {
            Data::F32(b) => quant::read_f32(b, i),
            Data::F16(b) => quant::read_f16(b, i),
            Data::BF16(b) => quant::read_bf16(b, i),
            Data::Q8 { codes, scales } => {
                quant::q8_code(codes, i) as f32 * quant::scale_for(scales, i)
            }
            Data::Q4 { codes, scales } => {
                quant::q4_code(codes, i) as f32 * quant::scale_for(scales, i)
            }
            Data::Q5 {
                codes,
                scales,
                high_bits,
            } => quant::q5_code(codes, high_bits, i) as f32 * quant::scale_for(scales, i),
        }
    }

    /// Decode `out.len()` consecutive elements starting at `offset`.
    pub(crate) fn decode_into(&self, offset: usize, out: &mut [f32]) {
        match *self {
            Data::F32(b) => {
                let bytes = &b[offset * 4..(offset + out.len()) * 4];
                for (o, c) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                    *o = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                }
            }
            _ => {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = self.get(offset + j);
                }
            }
        }
    }

    /// Signed, unscaled codes of block `block` written to `out`.
    /// Returns the block scale. Dense formats decode the values and return 1.
    pub(crate) fn block_codes(&self, block: usize, out: &mut [f32; BLOCK_SIZE]) -> f32 {
        let base = block * BLOCK_SIZE;
        match *self {
            Data::Q8 { codes, scales } => {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = quant::q8_code(codes, base + j) as f32;
                }
                quant::read_f32(scales, block)
            }
            Data::Q4 { codes, scales } => {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = quant::q4_code(codes, base + j) as f32;
                }
                quant::read_f32(scales, block)
            }
            Data::Q5 {
                codes,
                scales,
                high_bits,
            } => {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = quant::q5_code(codes, high_bits, base + j) as f32;
                }
                quant::read_f32(scales, block)
            }
            Data::F32(_) | Data::F16(_) | Data::BF16(_) => {
                self.decode_into(base, out);
                1.0
            }
        }
    }
}

fn check_range(offset: usize, length: usize, size: usize) -> Result<()> {
    if offset.checked_add(length).map_or(true, |end| end > size) {
        return Err(TensorError::Range {
            offset,
            length,
            size,
        });
    }
    Ok(())
}

/// A read-only view over a tensor or a slice of one.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    data: Data<'a>,
    shape: Shape,
}

impl<'a> TensorView<'a> {
    pub(crate) fn new(data: Data<'a>, shape: Shape) -> Self {
        TensorView { data, shape }
    }

    pub(crate) fn data(&self) -> Data<'a> {
        self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Number of elements covered by the view.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Decode the element at the given coordinates.
    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let i = self.shape.offset_of(indices)?;
        Ok(self.data.get(i))
    }

    /// Sub-view with the leading coordinates fixed to `indices`.
    pub fn slice(&self, indices: &[usize]) -> Result<TensorView<'a>> {
        let (offset, shape) = self.shape.narrow_leading(indices)?;
        Ok(TensorView {
            data: self.data.narrow(offset, shape.numel()),
            shape,
        })
    }

    /// The same elements under a different shape.
    pub fn reshape(&self, shape: Shape) -> Result<TensorView<'a>> {
        check_reshape(self.dtype(), &self.shape, &shape)?;
        Ok(TensorView {
            data: self.data,
            shape,
        })
    }

    /// Fails with `Range` unless `offset..offset + length` lies inside the view.
    pub fn check_range(&self, offset: usize, length: usize) -> Result<()> {
        check_range(offset, length, self.numel())
    }

    /// Decode `out.len()` consecutive elements starting at flat `offset`.
    pub fn decode_into(&self, offset: usize, out: &mut [f32]) -> Result<()> {
        self.check_range(offset, out.len())?;
        self.data.decode_into(offset, out);
        Ok(())
    }

    /// Decode every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.numel()];
        self.data.decode_into(0, &mut out);
        out
    }
}

pub(crate) fn check_reshape(dtype: DType, from: &Shape, to: &Shape) -> Result<()> {
    if from.numel() != to.numel() {
        return Err(TensorError::ShapeMismatch {
            expected: from.dims().to_vec(),
            got: to.dims().to_vec(),
        });
    }
    if dtype.is_quantized() && to.last_dim() % BLOCK_SIZE != 0 {
        return Err(TensorError::Construction(format!(
            "{} last dimension {} is not a multiple of {}",
            dtype,
            to.last_dim(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) enum DataMut<'a> {
    F32(&'a mut [u8]),
    F16(&'a mut [u8]),
    BF16(&'a mut [u8]),
}

impl DataMut<'_> {
    fn width(&self) -> usize {
        match self {
            DataMut::F32(_) => 4,
            DataMut::F16(_) | DataMut::BF16(_) => 2,
        }
    }

    fn as_data(&self) -> Data<'_> {
        match self {
            DataMut::F32(b) => Data::F32(b),
            DataMut::F16(b) => Data::F16(b),
            DataMut::BF16(b) => Data::BF16(b),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            DataMut::F32(b) | DataMut::F16(b) | DataMut::BF16(b) => b,
        }
    }

    fn set(&mut self, i: usize, value: f32) {
        match self {
            DataMut::F32(b) => quant::write_f32(b, i, value),
            DataMut::F16(b) => quant::write_f16(b, i, value),
            DataMut::BF16(b) => quant::write_bf16(b, i, value),
        }
    }
}

/// A mutable view over an owned dense (F32/F16/BF16) tensor or a slice of one.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    data: DataMut<'a>,
    shape: Shape,
}

impl<'a> TensorViewMut<'a> {
    pub(crate) fn new(data: DataMut<'a>, shape: Shape) -> Self {
        TensorViewMut { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.as_data().dtype()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Read-only view of the same elements.
    pub fn as_view(&self) -> TensorView<'_> {
        TensorView::new(self.data.as_data(), self.shape.clone())
    }

    /// Reborrow as a shorter-lived mutable view.
    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        let data = match &mut self.data {
            DataMut::F32(b) => DataMut::F32(b),
            DataMut::F16(b) => DataMut::F16(b),
            DataMut::BF16(b) => DataMut::BF16(b),
        };
        TensorViewMut {
            data,
            shape: self.shape.clone(),
        }
    }

    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let i = self.shape.offset_of(indices)?;
        Ok(self.data.as_data().get(i))
    }

    /// Encode `value` into the element at the given coordinates.
    pub fn set(&mut self, value: f32, indices: &[usize]) -> Result<()> {
        let i = self.shape.offset_of(indices)?;
        self.data.set(i, value);
        Ok(())
    }

    /// Mutable sub-view with the leading coordinates fixed to `indices`.
    pub fn slice_mut(&mut self, indices: &[usize]) -> Result<TensorViewMut<'_>> {
        let (offset, shape) = self.shape.narrow_leading(indices)?;
        let width = self.data.width();
        let range = offset * width..(offset + shape.numel()) * width;
        let data = match &mut self.data {
            DataMut::F32(b) => DataMut::F32(&mut b[range]),
            DataMut::F16(b) => DataMut::F16(&mut b[range]),
            DataMut::BF16(b) => DataMut::BF16(&mut b[range]),
        };
        Ok(TensorViewMut { data, shape })
    }

    /// Consuming form of [`TensorViewMut::slice_mut`] that keeps the full lifetime.
    pub fn into_slice(self, indices: &[usize]) -> Result<TensorViewMut<'a>> {
        let (offset, shape) = self.shape.narrow_leading(indices)?;
        let width = self.data.width();
        let range = offset * width..(offset + shape.numel()) * width;
        let data = match self.data {
            DataMut::F32(b) => DataMut::F32(&mut b[range]),
            DataMut::F16(b) => DataMut::F16(&mut b[range]),
            DataMut::BF16(b) => DataMut::BF16(&mut b[range]),
        };
        Ok(TensorViewMut { data, shape })
    }

    /// Split into two disjoint flat views at element `mid`.
    pub fn split_at_mut(self, mid: usize) -> Result<(TensorViewMut<'a>, TensorViewMut<'a>)> {
        let n = self.numel();
        check_range(0, mid, n)?;
        let width = self.data.width();
        let (head, tail) = match self.data {
            DataMut::F32(b) => {
                let (h, t) = b.split_at_mut(mid * width);
                (DataMut::F32(h), DataMut::F32(t))
            }
            DataMut::F16(b) => {
                let (h, t) = b.split_at_mut(mid * width);
                (DataMut::F16(h), DataMut::F16(t))
            }
            DataMut::BF16(b) => {
                let (h, t) = b.split_at_mut(mid * width);
                (DataMut::BF16(h), DataMut::BF16(t))
            }
        };
        Ok((
            TensorViewMut::new(head, Shape::new(vec![mid])),
            TensorViewMut::new(tail, Shape::new(vec![n - mid])),
        ))
    }

    /// Split into consecutive disjoint flat views of the given sizes.
    pub fn into_chunks<I>(self, sizes: I) -> Result<Vec<TensorViewMut<'a>>>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut rest = self;
        let mut chunks = Vec::new();
        for size in sizes {
            let (head, tail) = rest.split_at_mut(size)?;
            chunks.push(head);
            rest = tail;
        }
        Ok(chunks)
    }

    pub fn check_range(&self, offset: usize, length: usize) -> Result<()> {
        check_range(offset, length, self.numel())
    }

    /// Decode `out.len()` consecutive elements starting at flat `offset`.
    pub fn decode_into(&self, offset: usize, out: &mut [f32]) -> Result<()> {
        self.check_range(offset, out.len())?;
        self.data.as_data().decode_into(offset, out);
        Ok(())
    }

    /// Encode `values` into consecutive elements starting at flat `offset`.
    pub fn write_from(&mut self, offset: usize, values: &[f32]) -> Result<()> {
        self.check_range(offset, values.len())?;
        if let DataMut::F32(b) = &mut self.data {
            let bytes = &mut b[offset * 4..(offset + values.len()) * 4];
            for (c, v) in bytes.chunks_exact_mut(4).zip(values) {
                c.copy_from_slice(&v.to_le_bytes());
            }
            return Ok(());
        }
        for (j, &v) in values.iter().enumerate() {
            self.data.set(offset + j, v);
        }
        Ok(())
    }

    /// Bulk copy `length` elements of identical dtype from `source`.
    pub fn copy_from(
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
        source.check_range(source_offset, length)?;
        self.check_range(dest_offset, length)?;

        let width = self.data.width();
        let src = match source.data() {
            Data::F32(b) | Data::F16(b) | Data::BF16(b) => b,
            // Dest is dense and the dtypes match, so the source is dense too.
            _ => return Err(TensorError::TypeMismatch {
                expected: self.dtype(),
                got: source.dtype(),
            }),
        };
        self.data.bytes_mut()[dest_offset * width..(dest_offset + length) * width]
            .copy_from_slice(&src[source_offset * width..(source_offset + length) * width]);
        Ok(())
    }

    /// Zero every element.
    pub fn clear(&mut self) {
        self.data.bytes_mut().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn test_view_get_and_slice() {
        let t = Tensor::from_f32(iota(24), Shape::new(vec![2, 3, 4])).unwrap();
        let v = t.view();
        assert_eq!(v.get(&[1, 2, 3]).unwrap(), 23.0);

        let row = v.slice(&[1, 1]).unwrap();
        assert_eq!(row.shape().dims(), &[4]);
        assert_eq!(row.to_f32_vec(), vec![16.0, 17.0, 18.0, 19.0]);

        let plane = v.slice(&[1]).unwrap();
        let nested = plane.slice(&[2]).unwrap();
        assert_eq!(nested.get(&[0]).unwrap(), 20.0);
    }

    #[test]
    fn test_view_errors() {
        let t = Tensor::from_f32(iota(6), Shape::new(vec![2, 3])).unwrap();
        let v = t.view();
        assert!(matches!(
            v.get(&[1]),
            Err(TensorError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            v.get(&[2, 0]),
            Err(TensorError::IndexOutOfRange { .. })
        ));
        let mut out = [0.0f32; 4];
        assert!(matches!(
            v.decode_into(3, &mut out),
            Err(TensorError::Range { offset: 3, length: 4, size: 6 })
        ));
    }

    #[test]
    fn test_reshape_view() {
        let t = Tensor::from_f32(iota(6), Shape::new(vec![2, 3])).unwrap();
        let r = t.view().reshape(Shape::new(vec![3, 2])).unwrap();
        assert_eq!(r.get(&[2, 1]).unwrap(), 5.0);
        assert!(t.view().reshape(Shape::new(vec![4])).is_err());
    }

    #[test]
    fn test_slice_mut_writes_through() {
        let mut t = Tensor::zeros(DType::F32, Shape::new(vec![2, 4])).unwrap();
        {
            let mut v = t.view_mut().unwrap();
            let mut row = v.slice_mut(&[1]).unwrap();
            row.set(7.0, &[2]).unwrap();
        }
        assert_eq!(t.get(&[1, 2]).unwrap(), 7.0);
    }

    #[test]
    fn test_split_and_chunks_are_disjoint() {
        let mut t = Tensor::zeros(DType::BF16, Shape::new(vec![10])).unwrap();
        let chunks = t.view_mut().unwrap().into_chunks([3, 3, 4]).unwrap();
        assert_eq!(chunks.len(), 3);
        for (c, mut chunk) in chunks.into_iter().enumerate() {
            let n = chunk.numel();
            chunk.write_from(0, &vec![c as f32; n]).unwrap();
        }
        assert_eq!(
            t.to_f32_vec(),
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]
        );
    }

    #[test]
    fn test_split_past_end_fails() {
        let mut t = Tensor::zeros(DType::F32, Shape::new(vec![4])).unwrap();
        assert!(t.view_mut().unwrap().split_at_mut(5).is_err());
    }

    #[test]
    fn test_copy_from_type_mismatch() {
        let src = Tensor::from_f32(iota(4), Shape::new(vec![4])).unwrap();
        let mut dst = Tensor::zeros(DType::F16, Shape::new(vec![4])).unwrap();
        let mut v = dst.view_mut().unwrap();
        assert!(matches!(
            v.copy_from(&src.view(), 0, 0, 4),
            Err(TensorError::TypeMismatch { expected: DType::F16, got: DType::F32 })
        ));
    }

    #[test]
    fn test_copy_from_ranges() {
        let src = Tensor::from_f32(iota(8), Shape::new(vec![8])).unwrap();
        let mut dst = Tensor::zeros(DType::F32, Shape::new(vec![8])).unwrap();
        {
            let mut v = dst.view_mut().unwrap();
            v.copy_from(&src.view(), 2, 5, 3).unwrap();
            assert!(v.copy_from(&src.view(), 6, 0, 3).is_err());
        }
        assert_eq!(
            dst.to_f32_vec(),
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 3.0, 4.0]
        );
    }
}
