//! Host memory context.

use std::sync::Arc;

use tracing::info;

use prism_core::context::Session;
use prism_core::host_alloc::HostAllocator;
use prism_core::{
    Context, ContextBackend, DataType, Frame, Handle, ImageFormat, MediaType, MemoryType,
    PrismError, Result, Tensor, TensorInfo, keys,
};

use crate::device::SoftDevice;

/// CPU context.  Optionally bound to a device so contexts of that device can
/// be derived from it.
pub struct CpuContext {
    device: Option<Arc<SoftDevice>>,
    allocator: HostAllocator,
}

impl CpuContext {
    pub fn create() -> Arc<Context> {
        Self::build(None, None)
    }

    pub fn with_device(device: &Arc<SoftDevice>) -> Arc<Context> {
        Self::build(Some(Arc::clone(device)), None)
    }

    pub(crate) fn build(
        device: Option<Arc<SoftDevice>>,
        parent: Option<Arc<Context>>,
    ) -> Arc<Context> {
        let backend = Self {
            device,
            allocator: HostAllocator::new(),
        };
        let bound = backend.device.is_some();
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), bound, "CPU context created");
        ctx
    }

    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }
}

impl ContextBackend for CpuContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Cpu
    }

    fn primary_key(&self) -> &'static str {
        keys::DEVICE
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        match key {
            keys::DEVICE => self.device.as_ref().map(|device| device.id()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&'static str> {
        if self.device.is_some() {
            vec![keys::DEVICE]
        } else {
            Vec::new()
        }
    }

    fn session(&self, key: &str) -> Option<Session> {
        match key {
            keys::DEVICE => self.device.clone().map(|device| device as Session),
            _ => None,
        }
    }
}

pub(crate) fn allocator_of(ctx: &Context) -> Result<&HostAllocator> {
    ctx.backend::<CpuContext>()
        .map(CpuContext::allocator)
        .ok_or_else(|| PrismError::InvalidContext {
            memory_type: ctx.memory_type(),
            reason: "not a CPU context created by this crate".into(),
        })
}

/// Host tensor from the context's recycling allocator.
pub fn allocate(ctx: &Arc<Context>, info: TensorInfo) -> Result<Arc<Tensor>> {
    let buffer = allocator_of(ctx)?.alloc(info.nbytes())?;
    // SAFETY: `buffer` holds `nbytes()` bytes, at least the span of `info`,
    // and the tensor owns it.
    unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(buffer.as_ptr()) }
        .owning(buffer)
        .context(ctx)
        .build()
}

/// Contiguous image frame with one tensor per plane.
pub fn allocate_image(
    ctx: &Arc<Context>,
    format: ImageFormat,
    width: usize,
    height: usize,
) -> Result<Arc<Frame>> {
    let tensors = (0..format.planes())
        .map(|index| {
            let shape = format
                .plane_shape(index, width, height)
                .ok_or_else(|| PrismError::InvalidArgument(format!("{format} plane {index}")))?;
            allocate(ctx, TensorInfo::new(shape.to_vec(), DataType::UInt8))
        })
        .collect::<Result<Vec<_>>>()?;
    Frame::new(MediaType::Image, format.code(), tensors)
}
