//! Shape, stride and element type of one memory region.

use std::fmt;
use std::str::FromStr;

use crate::error::{PrismError, Result};
use crate::types::DataType;

/// Immutable description of a (possibly strided) tensor.
///
/// Strides are in bytes, one per dimension.  A `TensorInfo` never owns
/// memory; it is cloned freely between tensors, slices and mapped copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    shape: Vec<usize>,
    stride: Vec<usize>,
    dtype: DataType,
}

impl TensorInfo {
    /// Contiguous row-major tensor.
    ///
    /// # Panics
    ///
    /// Panics if the byte size of `shape` overflows `usize`.  Use
    /// [`TensorInfo::try_new`] for shapes that come from outside the process.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DataType) -> Self {
        match Self::try_new(shape, dtype) {
            Ok(info) => info,
            Err(err) => panic!("{err}"),
        }
    }

    /// Contiguous row-major tensor, rejecting shapes whose byte size
    /// overflows `usize`.
    pub fn try_new(shape: impl Into<Vec<usize>>, dtype: DataType) -> Result<Self> {
        let shape = shape.into();
        let stride = Self::contiguous_stride(&shape, dtype)?;
        Self::with_stride(shape, stride, dtype)
    }

    /// Tensor with explicit byte strides.  `stride.len()` must equal `shape.len()`.
    pub fn with_stride(
        shape: impl Into<Vec<usize>>,
        stride: impl Into<Vec<usize>>,
        dtype: DataType,
    ) -> Result<Self> {
        let shape = shape.into();
        let stride = stride.into();
        if shape.len() != stride.len() {
            return Err(PrismError::invalid(format!(
                "stride rank {} does not match shape rank {}",
                stride.len(),
                shape.len()
            )));
        }
        let info = Self {
            shape,
            stride,
            dtype,
        };
        // nbytes() and span() rely on these fitting in usize.
        let mut extents = info.shape.iter().zip(&info.stride);
        let fits = extents.clone().all(|(dim, stride)| dim.checked_mul(*stride).is_some())
            && extents
                .try_fold(info.dtype.size(), |acc, (dim, stride)| {
                    acc.checked_add(dim.saturating_sub(1) * stride)
                })
                .is_some();
        if !fits {
            return Err(PrismError::invalid(format!("tensor {info:?} overflows usize")));
        }
        Ok(info)
    }

    /// Row-major byte strides for `shape`.
    pub fn contiguous_stride(shape: &[usize], dtype: DataType) -> Result<Vec<usize>> {
        let mut stride = vec![0usize; shape.len()];
        let mut acc = dtype.size();
        for (s, &dim) in stride.iter_mut().zip(shape).rev() {
            *s = acc;
            acc = acc.checked_mul(dim).ok_or_else(|| {
                PrismError::invalid(format!("shape {shape:?} of {dtype} overflows usize"))
            })?;
        }
        Ok(stride)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes spanned by the tensor, padding included.
    pub fn nbytes(&self) -> usize {
        if self.shape.is_empty() {
            return self.dtype.size();
        }
        if self.shape.contains(&0) {
            return 0;
        }
        self.shape
            .iter()
            .zip(&self.stride)
            .map(|(dim, stride)| dim * stride)
            .max()
            .unwrap_or(0)
    }

    /// Bytes from the first element to the end of the last one.  This is
    /// what a view needs to be addressable; unlike [`nbytes`](Self::nbytes)
    /// it leaves out the padding after the last row.
    pub fn span(&self) -> usize {
        if self.shape.contains(&0) {
            return 0;
        }
        self.shape
            .iter()
            .zip(&self.stride)
            .map(|(dim, stride)| (dim - 1) * stride)
            .sum::<usize>()
            + self.dtype.size()
    }

    pub fn is_contiguous(&self) -> bool {
        Self::contiguous_stride(&self.shape, self.dtype).is_ok_and(|stride| stride == self.stride)
    }

    /// Copy of this info with a different shape and the same strides.
    pub(crate) fn reshaped(&self, shape: Vec<usize>) -> Self {
        Self {
            shape,
            stride: self.stride.clone(),
            dtype: self.dtype,
        }
    }

    /// Calls `f(byte_offset, len)` for every run of bytes contiguous in memory,
    /// in row-major element order.
    pub(crate) fn for_each_run(&self, mut f: impl FnMut(usize, usize)) {
        if self.is_contiguous() || self.shape.is_empty() {
            f(0, self.nbytes());
            return;
        }
        if self.shape.contains(&0) {
            return;
        }

        let last = self.rank() - 1;
        let (outer, run) = if self.stride[last] == self.dtype.size() {
            (last, self.shape[last] * self.dtype.size())
        } else {
            (self.rank(), self.dtype.size())
        };

        let mut index = vec![0usize; outer];
        loop {
            let offset: usize = index.iter().zip(&self.stride).map(|(i, s)| i * s).sum();
            f(offset, run);

            // Odometer increment over the outer dimensions.
            let mut d = outer;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
    }
}

fn join(values: &[usize]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn split(text: &str) -> Result<Vec<usize>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(':')
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| PrismError::invalid(format!("bad dimension '{v}'")))
        })
        .collect()
}

/// `uint8, 64:64:3`, with strides appended only when non-contiguous.
impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.dtype, join(&self.shape))?;
        if !self.is_contiguous() {
            write!(f, ", {}", join(&self.stride))?;
        }
        Ok(())
    }
}

impl FromStr for TensorInfo {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',').map(str::trim);
        let dtype: DataType = parts
            .next()
            .ok_or_else(|| PrismError::invalid("empty tensor info"))?
            .parse()?;
        let shape = split(parts.next().unwrap_or(""))?;
        match parts.next() {
            Some(stride) => Self::with_stride(shape, split(stride)?, dtype),
            None => Self::try_new(shape, dtype),
        }
    }
}
