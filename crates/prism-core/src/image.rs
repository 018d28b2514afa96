//! Image layout inference over tensor shapes.

use std::fmt;

use crate::error::{PrismError, Result};
use crate::tensor_info::TensorInfo;

/// Dimension order of an image tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Any,
    Hw,
    Chw,
    Hwc,
    Nchw,
    Nhwc,
}

/// Dimensions at or below this size are treated as channels.
const MAX_CHANNELS: usize = 4;

impl ImageLayout {
    /// Infer the layout from a shape; ambiguous shapes yield [`ImageLayout::Any`].
    pub fn from_shape(shape: &[usize]) -> Self {
        let is_c = |d: usize| d <= MAX_CHANNELS;
        let is_s = |d: usize| d > MAX_CHANNELS;
        match *shape {
            [_, _] => Self::Hw,
            [h, w, c] if is_s(h) && is_s(w) && is_c(c) => Self::Hwc,
            [c, h, w] if is_c(c) && is_s(h) && is_s(w) => Self::Chw,
            [_, h, w, c] if is_s(h) && is_s(w) && is_c(c) => Self::Nhwc,
            [_, c, h, w] if is_c(c) && is_s(h) && is_s(w) => Self::Nchw,
            _ => Self::Any,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::Hw => "HW",
            Self::Chw => "CHW",
            Self::Hwc => "HWC",
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
        }
    }

    fn position(self, dim: char) -> Option<usize> {
        match self {
            Self::Any => None,
            other => other.as_str().find(dim),
        }
    }

    pub fn h_position(self) -> Option<usize> {
        self.position('H')
    }

    pub fn w_position(self) -> Option<usize> {
        self.position('W')
    }

    pub fn c_position(self) -> Option<usize> {
        self.position('C')
    }

    pub fn n_position(self) -> Option<usize> {
        self.position('N')
    }
}

impl fmt::Display for ImageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image view over a [`TensorInfo`].
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo<'a> {
    info: &'a TensorInfo,
    layout: ImageLayout,
    h: usize,
    w: usize,
}

impl<'a> ImageInfo<'a> {
    /// Fails when the shape has no recognisable spatial dimensions.
    pub fn new(info: &'a TensorInfo) -> Result<Self> {
        let layout = ImageLayout::from_shape(info.shape());
        match (layout.h_position(), layout.w_position()) {
            (Some(h), Some(w)) => Ok(Self { info, layout, h, w }),
            _ => Err(PrismError::invalid(format!(
                "cannot infer image layout from shape {:?}",
                info.shape()
            ))),
        }
    }

    #[inline]
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn width(&self) -> usize {
        self.info.shape()[self.w]
    }

    pub fn height(&self) -> usize {
        self.info.shape()[self.h]
    }

    pub fn channels(&self) -> usize {
        self.layout.c_position().map_or(1, |c| self.info.shape()[c])
    }

    pub fn batch(&self) -> usize {
        self.layout.n_position().map_or(1, |n| self.info.shape()[n])
    }

    /// Bytes between consecutive rows.
    pub fn row_stride(&self) -> usize {
        self.info.stride()[self.h]
    }

    /// Bytes between horizontally adjacent pixels.
    pub fn pixel_stride(&self) -> usize {
        self.info.stride()[self.w]
    }

    /// Bytes between channel planes, for planar layouts.
    pub fn channel_stride(&self) -> Option<usize> {
        self.layout.c_position().map(|c| self.info.stride()[c])
    }

    pub(crate) fn spatial_dims(&self) -> (usize, usize) {
        (self.h, self.w)
    }
}
