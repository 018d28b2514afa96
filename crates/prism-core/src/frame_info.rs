//! Frame descriptions used in negotiation and diagnostics.

use std::fmt;

use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::tensor_info::TensorInfo;
use crate::types::{Format, ImageFormat, MediaType, MemoryType};

/// What a frame looks like, without its memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub media_type: MediaType,
    pub memory_type: Option<MemoryType>,
    pub format: Format,
    pub tensors: Vec<TensorInfo>,
}

impl FrameInfo {
    pub fn new(media_type: MediaType, memory_type: MemoryType, format: Format) -> Self {
        Self {
            media_type,
            memory_type: Some(memory_type),
            format,
            tensors: Vec::new(),
        }
    }

    /// Image description of `format` at `width x height`, one tensor per plane.
    pub fn image(memory_type: MemoryType, format: ImageFormat, width: usize, height: usize) -> Self {
        let tensors = (0..format.planes())
            .filter_map(|plane| format.plane_shape(plane, width, height))
            .map(|shape| TensorInfo::new(shape, crate::types::DataType::UInt8))
            .collect();
        Self {
            media_type: MediaType::Image,
            memory_type: Some(memory_type),
            format: format.code(),
            tensors,
        }
    }

    pub fn nbytes(&self) -> usize {
        self.tensors.iter().map(TensorInfo::nbytes).sum()
    }
}

/// Describe `frame`; fails if its tensors disagree on memory type.
pub fn frame_info(frame: &Frame) -> Result<FrameInfo> {
    let mut memory_type = None;
    let mut tensors = Vec::with_capacity(frame.num_tensors());
    for tensor in frame.tensors() {
        match memory_type {
            None => memory_type = Some(tensor.memory_type()),
            Some(expected) if expected != tensor.memory_type() => {
                return Err(PrismError::TypeMismatch {
                    expected,
                    actual: tensor.memory_type(),
                });
            }
            Some(_) => {}
        }
        tensors.push(tensor.info().clone());
    }
    Ok(FrameInfo {
        media_type: frame.media_type(),
        memory_type,
        format: frame.format(),
        tensors,
    })
}

/// `Image, VAAPI, NV12, {uint8, 64:64:1}, {uint8, 32:32:2}`
impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let memory = self.memory_type.unwrap_or(MemoryType::Any);
        write!(f, "{}, {}", self.media_type, memory)?;
        if self.media_type == MediaType::Image {
            match ImageFormat::from_code(self.format) {
                Some(format) => write!(f, ", {format}")?,
                None => write!(f, ", Unknown format: {}", self.format)?,
            }
        }
        for tensor in &self.tensors {
            write!(f, ", {{{tensor}}}")?;
        }
        Ok(())
    }
}
