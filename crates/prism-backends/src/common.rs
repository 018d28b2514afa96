//! Helpers shared by the backend mappers.

use std::any::Any;
use std::sync::Arc;

use prism_core::context::Context;
use prism_core::mapper::MapperEndpoints;
use prism_core::{DataType, MemoryType, Result, Tensor, TensorInfo, keys};

use crate::device::{DeviceMemory, SoftDevice};

/// The soft device behind a context's `device` handle.
pub fn device_of(ctx: &Context) -> Result<Arc<SoftDevice>> {
    ctx.session::<SoftDevice>(keys::DEVICE)
}

/// Endpoints of a mapper plus the device it issues native calls on, taken
/// from whichever endpoint is bound to one.
pub(crate) fn bind(
    input: &Arc<Context>,
    output: &Arc<Context>,
    from: MemoryType,
    to: MemoryType,
) -> Result<(MapperEndpoints, Arc<SoftDevice>)> {
    let endpoints = MapperEndpoints::new(Arc::clone(input), Arc::clone(output), from, to)?;
    let device = device_of(input).or_else(|_| device_of(output))?;
    Ok((endpoints, device))
}

/// Contiguous layout with the same shape and dtype as `info`.
pub(crate) fn contiguous(info: &TensorInfo) -> Result<TensorInfo> {
    TensorInfo::try_new(info.shape().to_vec(), info.dtype())
}

/// Row-pitched `[rows, cols, channels]` u8 plane layout.
pub(crate) fn plane_info(shape: [usize; 3], pitch: usize) -> Result<TensorInfo> {
    TensorInfo::with_stride(shape.to_vec(), vec![pitch, shape[2], 1], DataType::UInt8)
}

/// Whatever keeps the memory behind `src`'s host pointer alive: the device
/// allocation found through `src` or its view ancestors, else `src` itself.
///
/// Host views own this instead of relying on their parent link, which a
/// mapping cache clears.
pub(crate) fn memory_owner(src: &Arc<Tensor>) -> Arc<dyn Any + Send + Sync> {
    let mut cursor = Some(Arc::clone(src));
    while let Some(node) = cursor {
        if let Some(memory) = node.resource::<Arc<DeviceMemory>>() {
            return Arc::clone(memory) as Arc<dyn Any + Send + Sync>;
        }
        cursor = node.parent();
    }
    Arc::clone(src) as Arc<dyn Any + Send + Sync>
}

/// Write `bytes` (row-major, unpadded) into host memory laid out as `info`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `info.span()` bytes.
pub(crate) unsafe fn write_host(ptr: *mut u8, info: &TensorInfo, bytes: &[u8]) -> Result<()> {
    // SAFETY: forwarded from this function's contract; the view is dropped
    // before returning.
    let view = unsafe { Tensor::builder(info.clone(), MemoryType::Cpu).host_ptr(ptr) }.build()?;
    view.write_bytes(bytes)
}
