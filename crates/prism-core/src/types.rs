//! Backend, media, access and element type tags.
//!
//! Every [`Tensor`](crate::tensor::Tensor) and [`Context`](crate::context::Context)
//! carries a [`MemoryType`] that says where its bytes physically live.  Mappers
//! are identified by the ordered pair of memory types they bridge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

/// Opaque native handle (pointer, file descriptor, surface id, ...).
pub type Handle = isize;

/// Well-known native handle keys shared by tensors and contexts.
pub mod keys {
    /// Host data pointer of CPU-addressable memory.
    pub const DATA: &str = "data";
    /// Byte offset into the primary handle for non-addressable memory.
    pub const OFFSET: &str = "offset";
    /// `SoftDevice` the context or allocation belongs to.
    pub const DEVICE: &str = "device";
    pub const VA_DISPLAY: &str = "va_display";
    pub const VA_SURFACE_ID: &str = "vaapi.surface";
    pub const DMA_FD: &str = "dma_fd";
    pub const DRM_MODIFIER: &str = "drm_modifier";
    pub const PLANE_INDEX: &str = "plane_index";
    pub const CL_CONTEXT: &str = "cl_context";
    pub const CL_MEM: &str = "cl_mem";
    pub const ZE_CONTEXT: &str = "ze_context";
    pub const USM_PTR: &str = "usm_ptr";
    pub const OV_REMOTE_CONTEXT: &str = "ov_remote_context";
    pub const OV_TENSOR: &str = "ov_tensor";
    pub const CU_DEVICE: &str = "cu_device";
    pub const CU_DEVICE_PTR: &str = "cu_device_ptr";
}

// ─── Memory type ─────────────────────────────────────────────────────────────

/// Where and how a tensor's bytes physically live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Wildcard used in negotiation; never attached to real memory.
    Any,
    /// Host RAM addressable through a plain pointer.
    Cpu,
    /// DMA-buf file descriptor exportable between drivers.
    Dma,
    /// VA-API video surface.
    Vaapi,
    /// OpenCL buffer object.
    OpenCl,
    /// Level Zero unified shared memory pointer.
    LevelZero,
    /// Tensor owned by the OpenVINO inference runtime.
    OpenVino,
    /// CUDA device allocation.
    Cuda,
    /// Out-of-tree backend identified by name.
    Other(&'static str),
}

impl MemoryType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::Cpu => "CPU",
            Self::Dma => "DMA",
            Self::Vaapi => "VAAPI",
            Self::OpenCl => "OpenCL",
            Self::LevelZero => "USM",
            Self::OpenVino => "OpenVINO",
            Self::Cuda => "CUDA",
            Self::Other(name) => name,
        }
    }

    /// Whether tensors of this type expose a host pointer without mapping.
    #[inline]
    pub const fn is_host_addressable(self) -> bool {
        matches!(self, Self::Cpu | Self::LevelZero)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "cpu" | "system" => Ok(Self::Cpu),
            "dma" | "dmabuf" => Ok(Self::Dma),
            "vaapi" | "va" => Ok(Self::Vaapi),
            "opencl" | "cl" => Ok(Self::OpenCl),
            "usm" | "levelzero" | "ze" => Ok(Self::LevelZero),
            "openvino" | "ov" => Ok(Self::OpenVino),
            "cuda" => Ok(Self::Cuda),
            other => Err(PrismError::InvalidArgument(format!(
                "Unknown memory type '{other}'"
            ))),
        }
    }
}

// ─── Media type ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Any,
    Tensors,
    Image,
    Audio,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "Any",
            Self::Tensors => "Tensors",
            Self::Image => "Image",
            Self::Audio => "Audio",
        })
    }
}

// ─── Access mode ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl AccessMode {
    #[inline]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

// ─── Element data type ───────────────────────────────────────────────────────

/// Tensor element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    Int32,
    Int64,
    Float16,
    Float32,
}

impl DataType {
    /// Size of a single element in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::Float16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UInt8 => "uint8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "uint8" | "u8" => Ok(Self::UInt8),
            "int32" | "i32" => Ok(Self::Int32),
            "int64" | "i64" => Ok(Self::Int64),
            "float16" | "f16" => Ok(Self::Float16),
            "float32" | "f32" => Ok(Self::Float32),
            other => Err(PrismError::InvalidArgument(format!(
                "Unknown data type '{other}'"
            ))),
        }
    }
}

// ─── Image format ────────────────────────────────────────────────────────────

/// Frame format code; interpretation depends on [`MediaType`].  `0` means
/// unspecified.
pub type Format = u32;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Pixel layout of an image frame, encoded as a fourcc.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ImageFormat {
    Bgr = fourcc(b"BGR "),
    Rgb = fourcc(b"RGB "),
    Bgrx = fourcc(b"BGRX"),
    Rgbx = fourcc(b"RGBX"),
    Bgrp = fourcc(b"BGRP"),
    Rgbp = fourcc(b"RGBP"),
    Nv12 = fourcc(b"NV12"),
    I420 = fourcc(b"I420"),
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 8] = [
        Self::Bgr,
        Self::Rgb,
        Self::Bgrx,
        Self::Rgbx,
        Self::Bgrp,
        Self::Rgbp,
        Self::Nv12,
        Self::I420,
    ];

    #[inline]
    pub const fn code(self) -> Format {
        self as u32
    }

    pub fn from_code(code: Format) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bgr => "BGR",
            Self::Rgb => "RGB",
            Self::Bgrx => "BGRX",
            Self::Rgbx => "RGBX",
            Self::Bgrp => "BGRP",
            Self::Rgbp => "RGBP",
            Self::Nv12 => "NV12",
            Self::I420 => "I420",
        }
    }

    /// Number of separately addressed planes.
    pub const fn planes(self) -> usize {
        match self {
            Self::Bgr | Self::Rgb | Self::Bgrx | Self::Rgbx => 1,
            Self::Nv12 => 2,
            Self::Bgrp | Self::Rgbp | Self::I420 => 3,
        }
    }

    /// Shape `[rows, cols, channels]` of plane `index` for a `width × height` image.
    pub fn plane_shape(self, index: usize, width: usize, height: usize) -> Option<[usize; 3]> {
        if index >= self.planes() {
            return None;
        }
        Some(match self {
            Self::Bgr | Self::Rgb => [height, width, 3],
            Self::Bgrx | Self::Rgbx => [height, width, 4],
            Self::Bgrp | Self::Rgbp => [height, width, 1],
            Self::Nv12 if index == 0 => [height, width, 1],
            Self::Nv12 => [height / 2, width / 2, 2],
            Self::I420 if index == 0 => [height, width, 1],
            Self::I420 => [height / 2, width / 2, 1],
        })
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = PrismError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == upper)
            .ok_or_else(|| PrismError::InvalidArgument(format!("Unknown image format '{s}'")))
    }
}
