//! DMA-buf descriptors and the DMA→CPU mapper.

use std::sync::Arc;

use tracing::info;

use prism_core::context::Session;
use prism_core::mapper::MapperEndpoints;
use prism_core::{
    AccessMode, Context, ContextBackend, Handle, MemoryMapper, MemoryType, Result, Tensor, keys,
};

use crate::common::bind;
use crate::device::SoftDevice;
use crate::vaapi::{DmaToVaapi, VaapiToDma};

/// DMA-buf context.  Descriptors are process-wide, so the only native state
/// is the device that exports and imports them.
pub struct DmaContext {
    device: Arc<SoftDevice>,
}

impl DmaContext {
    pub fn create(device: &Arc<SoftDevice>) -> Arc<Context> {
        Self::build(Arc::clone(device), None)
    }

    pub(crate) fn build(device: Arc<SoftDevice>, parent: Option<Arc<Context>>) -> Arc<Context> {
        let backend = Self { device };
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), "DMA context created");
        ctx
    }
}

impl ContextBackend for DmaContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Dma
    }

    fn primary_key(&self) -> &'static str {
        keys::DEVICE
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        (key == keys::DEVICE).then(|| self.device.id())
    }

    fn keys(&self) -> Vec<&'static str> {
        vec![keys::DEVICE]
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
            (MemoryType::Dma, MemoryType::Cpu) => Arc::new(DmaToCpu::new(input, output)?),
            (MemoryType::Vaapi, MemoryType::Dma) => Arc::new(VaapiToDma::new(input, output)?),
            (MemoryType::Dma, MemoryType::Vaapi) => Arc::new(DmaToVaapi::new(input, output)?),
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

/// Maps a descriptor's pages into the process.  The mapping holds the
/// exported memory until the CPU tensor drops.
pub struct DmaToCpu {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl DmaToCpu {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Dma, MemoryType::Cpu)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let memory = self.device.import_fd(MemoryType::Dma, src.handle(keys::DMA_FD)?)?;
        self.device.call(MemoryType::Dma, "mmap")?;
        let ptr = memory.ptr_at(src.offset(), src.span())?;
        // SAFETY: `ptr_at` checked `span()` bytes of `memory`, which the
        // tensor owns.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(memory)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(DmaToCpu, "dma_to_cpu");
