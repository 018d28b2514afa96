//! Level Zero unified shared memory.
//!
//! USM allocations are visible to the host once the device queue is idle,
//! so tensors carry both the `usm_ptr` handle and a host pointer.  Readers
//! on the CPU side go through [`UsmToCpu`], which synchronizes first.

use std::sync::Arc;

use tracing::info;

use prism_core::context::Session;
use prism_core::mapper::MapperEndpoints;
use prism_core::{
    AccessMode, Context, ContextBackend, Handle, MemoryMapper, MemoryType, Result, Tensor,
    TensorInfo, keys,
};

use crate::common::{bind, device_of, memory_owner};
use crate::device::SoftDevice;

pub struct LevelZeroContext {
    device: Arc<SoftDevice>,
    ze_context: Handle,
}

impl LevelZeroContext {
    pub fn create(device: &Arc<SoftDevice>) -> Arc<Context> {
        Self::build(Arc::clone(device), None)
    }

    pub(crate) fn build(device: Arc<SoftDevice>, parent: Option<Arc<Context>>) -> Arc<Context> {
        let ze_context = device.next_handle();
        let backend = Self { device, ze_context };
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), ze_context, "Level Zero context created");
        ctx
    }
}

impl ContextBackend for LevelZeroContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::LevelZero
    }

    fn primary_key(&self) -> &'static str {
        keys::ZE_CONTEXT
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        match key {
            keys::ZE_CONTEXT => Some(self.ze_context),
            keys::DEVICE => Some(self.device.id()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&'static str> {
        vec![keys::ZE_CONTEXT, keys::DEVICE]
    }

    fn session(&self, key: &str) -> Option<Session> {
        (key == keys::DEVICE).then(|| Arc::clone(&self.device) as Session)
    }

    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let mapper: Arc<dyn MemoryMapper> = match (input.memory_type(), output.memory_type()) {
            (MemoryType::Dma, MemoryType::LevelZero) => Arc::new(DmaToUsm::new(input, output)?),
            (MemoryType::LevelZero, MemoryType::Cpu) => Arc::new(UsmToCpu::new(input, output)?),
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

/// Shared USM allocation of `info`'s size.
pub fn allocate_shared(ctx: &Arc<Context>, info: TensorInfo) -> Result<Arc<Tensor>> {
    let device = device_of(ctx)?;
    device.call(MemoryType::LevelZero, "zeMemAllocShared")?;
    let memory = device.allocate(MemoryType::LevelZero, info.nbytes())?;
    let ptr = memory.as_ptr();
    // SAFETY: `memory` holds `nbytes()` bytes, at least the span of `info`,
    // and the tensor owns it.
    unsafe { Tensor::builder(info, MemoryType::LevelZero).host_ptr(ptr) }
        .handle(keys::USM_PTR, ptr as Handle)
        .owning(memory)
        .context(ctx)
        .build()
}

// ─── DMA → USM ──────────────────────────────────────────────────────────────

/// Imports a DMA-buf as a device allocation.
pub struct DmaToUsm {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl DmaToUsm {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Dma, MemoryType::LevelZero)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let memory = self
            .device
            .import_fd(MemoryType::LevelZero, src.handle(keys::DMA_FD)?)?;
        self.device.call(MemoryType::LevelZero, "zeMemAllocDevice")?;
        let ptr = memory.ptr_at(src.offset(), src.span())?;
        // SAFETY: `ptr_at` checked `span()` bytes of `memory`, which the
        // tensor owns.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::LevelZero).host_ptr(ptr) }
            .handle(keys::USM_PTR, ptr as Handle)
            .owning(memory)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(DmaToUsm, "dma_to_usm");

// ─── USM → CPU ──────────────────────────────────────────────────────────────

/// Hands out the shared pointer once queued device work has finished.
pub struct UsmToCpu {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl UsmToCpu {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::LevelZero, MemoryType::Cpu)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        self.device.synchronize()?;
        let ptr = src.data()?;
        // SAFETY: `src` guarantees `span()` bytes at `ptr`; the tensor owns
        // the allocation behind them.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(memory_owner(src))
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(UsmToCpu, "usm_to_cpu");
