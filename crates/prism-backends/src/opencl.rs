//! OpenCL buffers: context, VA media sharing and the CPU/DMA mappers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use prism_core::context::Session;
use prism_core::mapper::MapperEndpoints;
use prism_core::{
    AccessMode, Context, ContextBackend, Handle, MemoryMapper, MemoryType, PrismError, Result,
    Tensor, keys,
};

use crate::common::{bind, device_of, memory_owner};
use crate::device::{ClBuffer, ClStorage, SoftDevice};
use crate::vaapi::VaDisplay;

pub struct OpenClContext {
    device: Arc<SoftDevice>,
    cl_context: Handle,
    va_display: Option<Arc<VaDisplay>>,
}

impl OpenClContext {
    pub fn create(device: &Arc<SoftDevice>) -> Arc<Context> {
        Self::build(Arc::clone(device), None, None)
    }

    /// Context sharing media surfaces with the VA display of `va`.
    pub fn with_va_display(va: &Arc<Context>) -> Result<Arc<Context>> {
        let device = device_of(va)?;
        let display = va.session::<VaDisplay>(keys::VA_DISPLAY)?;
        Ok(Self::build(device, Some(display), None))
    }

    pub(crate) fn build(
        device: Arc<SoftDevice>,
        va_display: Option<Arc<VaDisplay>>,
        parent: Option<Arc<Context>>,
    ) -> Arc<Context> {
        let cl_context = device.next_handle();
        let va_shared = va_display.is_some();
        let backend = Self {
            device,
            cl_context,
            va_display,
        };
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), cl_context, va_shared, "OpenCL context created");
        ctx
    }

    pub fn va_display(&self) -> Option<&Arc<VaDisplay>> {
        self.va_display.as_ref()
    }
}

impl ContextBackend for OpenClContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::OpenCl
    }

    fn primary_key(&self) -> &'static str {
        keys::CL_CONTEXT
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        match key {
            keys::CL_CONTEXT => Some(self.cl_context),
            keys::DEVICE => Some(self.device.id()),
            keys::VA_DISPLAY => self.va_display.as_ref().map(|display| display.handle()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&'static str> {
        let mut keys = vec![keys::CL_CONTEXT, keys::DEVICE];
        if self.va_display.is_some() {
            keys.push(keys::VA_DISPLAY);
        }
        keys
    }

    fn session(&self, key: &str) -> Option<Session> {
        match key {
            keys::DEVICE => Some(Arc::clone(&self.device) as Session),
            keys::VA_DISPLAY => self.va_display.clone().map(|display| display as Session),
            _ => None,
        }
    }

    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let mapper: Arc<dyn MemoryMapper> = match (input.memory_type(), output.memory_type()) {
            (MemoryType::Dma, MemoryType::OpenCl) => Arc::new(DmaToOpenCl::new(input, output)?),
            (MemoryType::Vaapi, MemoryType::OpenCl) if self.va_display.is_some() => {
                Arc::new(VaapiToOpenCl::new(input, output)?)
            }
            (MemoryType::OpenCl, MemoryType::Cpu) => Arc::new(OpenClToCpu::new(input, output)?),
            (MemoryType::Cpu, MemoryType::OpenCl) => Arc::new(CpuToOpenCl::new(input, output)?),
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

/// OpenCL tensor over `buffer`, owning it.
fn cl_tensor(
    src: &Arc<Tensor>,
    buffer: Arc<ClBuffer>,
    output: &Arc<Context>,
) -> Result<Arc<Tensor>> {
    Tensor::builder(src.info().clone(), MemoryType::OpenCl)
        .handle(keys::CL_MEM, buffer.id())
        .owning(buffer)
        .context(output)
        .parent(src)
        .build()
}

// ─── DMA → OpenCL ───────────────────────────────────────────────────────────

pub struct DmaToOpenCl {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl DmaToOpenCl {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Dma, MemoryType::OpenCl)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let memory = self
            .device
            .import_fd(MemoryType::OpenCl, src.handle(keys::DMA_FD)?)?;
        self.device.call(MemoryType::OpenCl, "clImportMemoryARM")?;
        let storage = ClStorage::Device {
            memory,
            offset: src.offset(),
        };
        let buffer = self.device.create_cl_buffer(storage, src.span())?;
        cl_tensor(src, buffer, &self.endpoints.output)
    }
}

memory_mapper!(DmaToOpenCl, "dma_to_opencl");

// ─── VAAPI → OpenCL ─────────────────────────────────────────────────────────

/// Media sharing between a VA display and the OpenCL context created on it.
/// Acquire and release on the shared surfaces are serialized.
pub struct VaapiToOpenCl {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
    sharing: Mutex<()>,
}

impl VaapiToOpenCl {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Vaapi, MemoryType::OpenCl)?;
        let display = input.handle(keys::VA_DISPLAY)?;
        if output.handle_or(keys::VA_DISPLAY, 0) != display {
            return Err(PrismError::InvalidContext {
                memory_type: MemoryType::OpenCl,
                reason: format!("not created on VA display {display:#x}"),
            });
        }
        Ok(Self {
            endpoints,
            device,
            sharing: Mutex::new(()),
        })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let surface = self.device.surface(src.handle(keys::VA_SURFACE_ID)?)?;
        let buffer = {
            let _sharing = self.sharing.lock();
            self.device
                .share_va_surface(&surface, src.offset(), src.span())?
        };
        debug!(surface = surface.id(), cl_mem = buffer.id(), "Acquired VA surface for OpenCL");
        cl_tensor(src, buffer, &self.endpoints.output)
    }
}

memory_mapper!(VaapiToOpenCl, "vaapi_to_opencl");

// ─── OpenCL → CPU ───────────────────────────────────────────────────────────

pub struct OpenClToCpu {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl OpenClToCpu {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::OpenCl, MemoryType::Cpu)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let buffer = self.device.cl_buffer(src.handle(keys::CL_MEM)?)?;
        self.device.call(MemoryType::OpenCl, "clEnqueueMapBuffer")?;
        let ptr = buffer_ptr(&buffer, src)?;
        // SAFETY: `ptr` is `span()` bytes inside `buffer`, which the tensor owns.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(buffer)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(OpenClToCpu, "opencl_to_cpu");

/// Host address of `src`'s first byte inside `buffer`.
pub(crate) fn buffer_ptr(buffer: &ClBuffer, src: &Tensor) -> Result<*mut u8> {
    let end = src.offset().checked_add(src.span());
    if end.is_none_or(|end| end > buffer.len()) {
        return Err(PrismError::InvalidArgument(format!(
            "view of {} bytes at offset {} exceeds OpenCL buffer of {} bytes",
            src.span(),
            src.offset(),
            buffer.len()
        )));
    }
    // SAFETY: the view lies inside the buffer, checked above.
    Ok(unsafe { buffer.as_ptr().add(src.offset()) })
}

// ─── CPU → OpenCL ───────────────────────────────────────────────────────────

/// Wraps host memory with `CL_MEM_USE_HOST_PTR`; no copy.
pub struct CpuToOpenCl {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl CpuToOpenCl {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Cpu, MemoryType::OpenCl)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let storage = ClStorage::Host {
            ptr: src.data()?,
            owner: memory_owner(src),
        };
        let buffer = self.device.create_cl_buffer(storage, src.span())?;
        cl_tensor(src, buffer, &self.endpoints.output)
    }
}

memory_mapper!(CpuToOpenCl, "cpu_to_opencl");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoftDeviceConfig;
    use crate::cpu::{self, CpuContext};
    use crate::vaapi::{VaapiContext, allocate_frame};
    use prism_core::{DataType, ImageFormat, TensorInfo};

    fn device() -> Arc<SoftDevice> {
        SoftDevice::new(SoftDeviceConfig::default()).unwrap()
    }

    #[test]
    fn host_round_trip_is_zero_copy() {
        let device = device();
        let cl = OpenClContext::create(&device);
        let cpu_ctx = CpuContext::with_device(&device);
        let host = cpu::allocate(&cpu_ctx, TensorInfo::new([4, 4], DataType::UInt8)).unwrap();
        host.write_bytes(&[3; 16]).unwrap();

        let buffer = CpuToOpenCl::new(&cpu_ctx, &cl)
            .unwrap()
            .map_tensor(&host, AccessMode::ReadWrite)
            .unwrap();
        let back = OpenClToCpu::new(&cl, &cpu_ctx)
            .unwrap()
            .map_tensor(&buffer, AccessMode::Read)
            .unwrap();
        assert_eq!(back.data().unwrap(), host.data().unwrap());
        assert_eq!(device.live_cl_buffers(), 1);
        drop((back, buffer));
        assert_eq!(device.live_cl_buffers(), 0);
    }

    #[test]
    fn unshared_context_does_not_bridge_vaapi() {
        let device = device();
        let va = VaapiContext::create(&device);
        let cl = OpenClContext::create(&device);
        assert!(cl.get_mapper(&va, &cl).unwrap().is_none());
    }

    #[test]
    fn media_sharing_acquires_until_drop() {
        let device = device();
        let va = VaapiContext::create(&device);
        let cl = OpenClContext::with_va_display(&va).unwrap();
        assert_eq!(
            cl.handle(keys::VA_DISPLAY).unwrap(),
            va.handle(keys::VA_DISPLAY).unwrap()
        );

        let frame = allocate_frame(&va, ImageFormat::Nv12, 16, 16).unwrap();
        let mapper = cl.get_mapper(&va, &cl).unwrap().expect("VA-shared context");
        let shared = mapper.map_frame(&frame, AccessMode::Read).unwrap();
        assert_eq!(shared.num_tensors(), 2);
        assert_eq!(device.acquired_surfaces(), 1);
        drop(shared);
        assert_eq!(device.acquired_surfaces(), 0);
    }

    #[test]
    fn other_display_is_rejected() {
        let device = device();
        let va = VaapiContext::create(&device);
        let other = VaapiContext::create(&device);
        let cl = OpenClContext::with_va_display(&other).unwrap();
        let err = VaapiToOpenCl::new(&va, &cl).err().expect("displays differ");
        assert!(matches!(err, PrismError::InvalidContext { .. }));
    }

    #[test]
    fn failed_acquire_releases_nothing() {
        let device = device();
        let va = VaapiContext::create(&device);
        let cl = OpenClContext::with_va_display(&va).unwrap();
        let frame = allocate_frame(&va, ImageFormat::Bgrx, 8, 8).unwrap();
        device.inject_fault("clEnqueueAcquireVA_APIMediaSurfacesINTEL", -5);

        let err = VaapiToOpenCl::new(&va, &cl)
            .unwrap()
            .map_frame(&frame, AccessMode::Read)
            .expect_err("acquire fails");
        match err {
            PrismError::BackendFailure { backend, status, .. } => {
                assert_eq!(backend, MemoryType::OpenCl);
                assert_eq!(status, -5);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert_eq!(device.acquired_surfaces(), 0);
        assert_eq!(device.live_cl_buffers(), 0);
    }
}
