//! Inference-runtime tensors.
//!
//! An OpenVINO tensor either wraps host memory or is a remote tensor over an
//! OpenCL buffer or a VA surface plane.  Remote tensors need a context
//! created on the matching OpenCL context or VA display.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

use tracing::info;

use prism_core::context::Session;
use prism_core::mapper::{MapperEndpoints, map_frame_per_tensor};
use prism_core::tensor::TensorBuilder;
use prism_core::{
    AccessMode, Context, ContextBackend, DataType, Frame, Handle, ImageFormat, MediaType,
    MemoryMapper, MemoryType, PrismError, Result, Tensor, TensorInfo, keys,
};

use crate::common::{device_of, memory_owner};
use crate::device::SoftDevice;
use crate::opencl::buffer_ptr;
use crate::vaapi::VaDisplay;

static NEXT_OV_TENSOR: AtomicIsize = AtomicIsize::new(1);

/// Remote context on a GPU device, shared with OpenCL or VA.
struct Remote {
    handle: Handle,
    cl_context: Option<Handle>,
    va_display: Option<Arc<VaDisplay>>,
}

pub struct OpenVinoContext {
    device: Option<Arc<SoftDevice>>,
    remote: Option<Remote>,
}

impl OpenVinoContext {
    /// Host-only context; tensors wrap CPU memory.
    pub fn create() -> Arc<Context> {
        Self::build(None, None, None)
    }

    /// Remote context over the OpenCL context of `cl`.
    pub fn with_cl_context(cl: &Arc<Context>) -> Result<Arc<Context>> {
        let device = device_of(cl)?;
        let remote = Remote {
            handle: device.next_handle(),
            cl_context: Some(cl.handle(keys::CL_CONTEXT)?),
            va_display: None,
        };
        Ok(Self::build(Some(device), Some(remote), None))
    }

    /// Remote context sharing surfaces with the VA display of `va`.
    pub fn with_va_display(va: &Arc<Context>) -> Result<Arc<Context>> {
        let device = device_of(va)?;
        let remote = Remote {
            handle: device.next_handle(),
            cl_context: None,
            va_display: Some(va.session::<VaDisplay>(keys::VA_DISPLAY)?),
        };
        Ok(Self::build(Some(device), Some(remote), None))
    }

    pub(crate) fn build_remote_cl(
        device: Arc<SoftDevice>,
        cl_context: Handle,
        parent: Arc<Context>,
    ) -> Arc<Context> {
        let remote = Remote {
            handle: device.next_handle(),
            cl_context: Some(cl_context),
            va_display: None,
        };
        Self::build(Some(device), Some(remote), Some(parent))
    }

    pub(crate) fn build_remote_va(
        device: Arc<SoftDevice>,
        display: Arc<VaDisplay>,
        parent: Arc<Context>,
    ) -> Arc<Context> {
        let remote = Remote {
            handle: device.next_handle(),
            cl_context: None,
            va_display: Some(display),
        };
        Self::build(Some(device), Some(remote), Some(parent))
    }

    fn build(
        device: Option<Arc<SoftDevice>>,
        remote: Option<Remote>,
        parent: Option<Arc<Context>>,
    ) -> Arc<Context> {
        let remote_handle = remote.as_ref().map(|remote| remote.handle);
        let backend = Self { device, remote };
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), remote = ?remote_handle, "OpenVINO context created");
        ctx
    }

    fn va_display(&self) -> Option<&Arc<VaDisplay>> {
        self.remote.as_ref()?.va_display.as_ref()
    }
}

impl ContextBackend for OpenVinoContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::OpenVino
    }

    fn primary_key(&self) -> &'static str {
        keys::OV_REMOTE_CONTEXT
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        match key {
            keys::OV_REMOTE_CONTEXT => self.remote.as_ref().map(|remote| remote.handle),
            keys::CL_CONTEXT => self.remote.as_ref()?.cl_context,
            keys::VA_DISPLAY => self.va_display().map(|display| display.handle()),
            keys::DEVICE => self.device.as_ref().map(|device| device.id()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&'static str> {
        [
            keys::OV_REMOTE_CONTEXT,
            keys::CL_CONTEXT,
            keys::VA_DISPLAY,
            keys::DEVICE,
        ]
        .into_iter()
        .filter(|key| self.handle(key).is_some())
        .collect()
    }

    fn session(&self, key: &str) -> Option<Session> {
        match key {
            keys::DEVICE => self.device.clone().map(|device| device as Session),
            keys::VA_DISPLAY => self.va_display().cloned().map(|display| display as Session),
            _ => None,
        }
    }

    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let remote_cl = self.handle(keys::CL_CONTEXT).is_some();
        let remote_va = self.va_display().is_some();
        let mapper: Arc<dyn MemoryMapper> = match (input.memory_type(), output.memory_type()) {
            (MemoryType::Cpu, MemoryType::OpenVino) => Arc::new(CpuToOpenVino::new(input, output)?),
            (MemoryType::OpenVino, MemoryType::Cpu) => Arc::new(OpenVinoToCpu::new(input, output)?),
            (MemoryType::OpenCl, MemoryType::OpenVino) if remote_cl => {
                Arc::new(OpenClToOpenVino::new(input, output)?)
            }
            (MemoryType::Vaapi, MemoryType::OpenVino) if remote_va => {
                Arc::new(VaapiToOpenVino::new(input, output)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

/// Builder for a new runtime tensor; `ov_tensor` is its primary handle.
fn ov_tensor(info: TensorInfo, src: &Arc<Tensor>, output: &Arc<Context>) -> TensorBuilder {
    Tensor::builder(info, MemoryType::OpenVino)
        .handle(keys::OV_TENSOR, NEXT_OV_TENSOR.fetch_add(1, Ordering::Relaxed))
        .context(output)
        .parent(src)
}

// ─── CPU → OpenVINO ─────────────────────────────────────────────────────────

/// Wraps host memory.  Image frames become a single tensor over plane 0.
pub struct CpuToOpenVino {
    endpoints: MapperEndpoints,
}

impl CpuToOpenVino {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let endpoints = MapperEndpoints::new(
            Arc::clone(input),
            Arc::clone(output),
            MemoryType::Cpu,
            MemoryType::OpenVino,
        )?;
        Ok(Self { endpoints })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let ptr = src.data()?;
        // SAFETY: `src` guarantees `span()` bytes at `ptr`; the tensor owns
        // the allocation behind them.
        unsafe { ov_tensor(src.info().clone(), src, &self.endpoints.output).host_ptr(ptr) }
            .owning(memory_owner(src))
            .build()
    }

    fn map_frame_impl(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        match src.media_type() {
            MediaType::Tensors => map_frame_per_tensor(self, src, mode),
            MediaType::Image if src.format() == ImageFormat::I420.code() => Err(
                PrismError::InvalidArgument(format!("Unsupported color format {}", src.format())),
            ),
            MediaType::Image => {
                let plane = src.tensor(0)?;
                let info = TensorInfo::with_stride(
                    plane.info().shape().to_vec(),
                    plane.info().stride().to_vec(),
                    DataType::UInt8,
                )?;
                let ptr = plane.data()?;
                // SAFETY: same layout as `plane`, which guarantees its span at
                // `ptr`; the tensor owns the allocation behind it.
                let tensor = unsafe { ov_tensor(info, plane, &self.endpoints.output).host_ptr(ptr) }
                    .owning(memory_owner(plane))
                    .build()?;
                let frame = Frame::new(MediaType::Tensors, 0, vec![tensor])?;
                frame.set_parent(Some(Arc::clone(src)))?;
                Ok(frame)
            }
            other => Err(PrismError::InvalidArgument(format!(
                "Unsupported media type {other}"
            ))),
        }
    }
}

memory_mapper!(CpuToOpenVino, "cpu_to_openvino", frames);

// ─── OpenVINO → CPU ─────────────────────────────────────────────────────────

/// Host view of a runtime tensor: its own host pointer, or the memory of
/// the OpenCL buffer or VA surface behind a remote tensor.
pub struct OpenVinoToCpu {
    endpoints: MapperEndpoints,
    device: Option<Arc<SoftDevice>>,
}

impl OpenVinoToCpu {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let endpoints = MapperEndpoints::new(
            Arc::clone(input),
            Arc::clone(output),
            MemoryType::OpenVino,
            MemoryType::Cpu,
        )?;
        let device = device_of(input).or_else(|_| device_of(output)).ok();
        Ok(Self { endpoints, device })
    }

    /// Host address of a remote tensor and the allocation behind it.
    fn remote_ptr(&self, src: &Tensor) -> Result<(*mut u8, Arc<dyn Any + Send + Sync>)> {
        let device = self
            .device
            .as_ref()
            .ok_or(PrismError::NotHostAddressable(MemoryType::OpenVino))?;
        if let Ok(cl_mem) = src.handle(keys::CL_MEM) {
            let buffer = device.cl_buffer(cl_mem)?;
            device.call(MemoryType::OpenCl, "clEnqueueMapBuffer")?;
            let ptr = buffer_ptr(&buffer, src)?;
            return Ok((ptr, buffer as Arc<dyn Any + Send + Sync>));
        }
        let surface = device.surface(src.handle(keys::VA_SURFACE_ID)?)?;
        surface.memory().fence().wait(device.sync_timeout())?;
        device.call(MemoryType::Vaapi, "vaMapBuffer")?;
        let ptr = surface.memory().ptr_at(src.offset(), src.span())?;
        Ok((ptr, Arc::clone(surface.memory()) as Arc<dyn Any + Send + Sync>))
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let (ptr, owner) = match src.data() {
            Ok(ptr) => (ptr, memory_owner(src)),
            Err(_) => self.remote_ptr(src)?,
        };
        // SAFETY: `ptr` addresses `span()` bytes of the allocation held by
        // `owner`, which the tensor owns.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(owner)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(OpenVinoToCpu, "openvino_to_cpu");

// ─── OpenCL → OpenVINO ──────────────────────────────────────────────────────

/// Remote tensor over an OpenCL buffer of the context's own `cl_context`.
pub struct OpenClToOpenVino {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl OpenClToOpenVino {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) =
            crate::common::bind(input, output, MemoryType::OpenCl, MemoryType::OpenVino)?;
        let cl_context = input.handle(keys::CL_CONTEXT)?;
        if output.handle_or(keys::CL_CONTEXT, 0) != cl_context {
            return Err(PrismError::InvalidContext {
                memory_type: MemoryType::OpenVino,
                reason: format!("remote context is not on cl_context {cl_context:#x}"),
            });
        }
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let cl_mem = src.handle(keys::CL_MEM)?;
        let buffer = self.device.cl_buffer(cl_mem)?;
        ov_tensor(src.info().clone(), src, &self.endpoints.output)
            .handle(keys::CL_MEM, cl_mem)
            .offset(src.offset())
            .owning(buffer)
            .build()
    }
}

memory_mapper!(OpenClToOpenVino, "opencl_to_openvino");

// ─── VAAPI → OpenVINO ───────────────────────────────────────────────────────

/// NV12 remote tensors, one per plane of the surface.
pub struct VaapiToOpenVino {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl VaapiToOpenVino {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) =
            crate::common::bind(input, output, MemoryType::Vaapi, MemoryType::OpenVino)?;
        let display = input.handle(keys::VA_DISPLAY)?;
        if output.handle_or(keys::VA_DISPLAY, 0) != display {
            return Err(PrismError::InvalidContext {
                memory_type: MemoryType::OpenVino,
                reason: format!("remote context is not on VA display {display:#x}"),
            });
        }
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let surface_id = src.handle(keys::VA_SURFACE_ID)?;
        let surface = self.device.surface(surface_id)?;
        ov_tensor(src.info().clone(), src, &self.endpoints.output)
            .handle(keys::VA_SURFACE_ID, surface_id)
            .handle(keys::PLANE_INDEX, src.handle_or(keys::PLANE_INDEX, 0))
            .offset(src.offset())
            .owning(surface)
            .build()
    }

    fn map_frame_impl(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        if src.media_type() != MediaType::Image
            || src.format() != ImageFormat::Nv12.code()
            || src.num_tensors() != 2
        {
            return Err(PrismError::InvalidArgument(format!(
                "VA surfaces map to remote tensors only as NV12 images, got {} format {}",
                src.media_type(),
                src.format()
            )));
        }
        map_frame_per_tensor(self, src, mode)
    }
}

memory_mapper!(VaapiToOpenVino, "vaapi_to_openvino", frames);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoftDeviceConfig;
    use crate::cpu::{self, CpuContext};
    use crate::opencl::OpenClContext;
    use crate::vaapi::{VaapiContext, allocate_frame};

    #[test]
    fn host_only_context_has_no_remote_handles() {
        let ctx = OpenVinoContext::create();
        assert!(ctx.keys().is_empty());
        assert!(matches!(ctx.handle(""), Err(PrismError::HandleNotFound { .. })));
    }

    #[test]
    fn image_frame_becomes_single_tensor() {
        let cpu_ctx = CpuContext::create();
        let ov = OpenVinoContext::create();
        let frame = cpu::allocate_image(&cpu_ctx, ImageFormat::Bgrx, 16, 8).unwrap();
        let mapper = CpuToOpenVino::new(&cpu_ctx, &ov).unwrap();

        let out = mapper.map_frame(&frame, AccessMode::Read).unwrap();
        assert_eq!(out.media_type(), MediaType::Tensors);
        assert_eq!(out.format(), 0);
        assert_eq!(out.num_tensors(), 1);
        let tensor = out.tensor(0).unwrap();
        assert_eq!(tensor.data().unwrap(), frame.tensor(0).unwrap().data().unwrap());
        assert!(tensor.handle(keys::OV_TENSOR).is_ok());
    }

    #[test]
    fn i420_and_audio_are_rejected() {
        let cpu_ctx = CpuContext::create();
        let ov = OpenVinoContext::create();
        let mapper = CpuToOpenVino::new(&cpu_ctx, &ov).unwrap();

        let i420 = cpu::allocate_image(&cpu_ctx, ImageFormat::I420, 16, 16).unwrap();
        let err = mapper
            .map_frame(&i420, AccessMode::Read)
            .expect_err("I420 has no host tensor form");
        assert!(err.to_string().contains("Unsupported color format"));

        let info = TensorInfo::new([1, 160], DataType::Float32);
        let samples = cpu::allocate(&cpu_ctx, info).unwrap();
        let audio = Frame::new(MediaType::Audio, 0, vec![samples]).unwrap();
        let err = mapper
            .map_frame(&audio, AccessMode::Read)
            .expect_err("audio is not mappable");
        assert!(err.to_string().contains("Unsupported media type"));
    }

    #[test]
    fn remote_cl_tensor_reads_back_through_buffer() {
        let device = SoftDevice::new(SoftDeviceConfig::default()).unwrap();
        let cpu_ctx = CpuContext::with_device(&device);
        let cl = OpenClContext::create(&device);
        let ov = OpenVinoContext::with_cl_context(&cl).unwrap();
        assert_eq!(
            ov.handle(keys::CL_CONTEXT).unwrap(),
            cl.handle(keys::CL_CONTEXT).unwrap()
        );

        let host = cpu::allocate(&cpu_ctx, TensorInfo::new([8], DataType::UInt8)).unwrap();
        host.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let cl_tensor = cl
            .get_mapper(&cpu_ctx, &cl)
            .unwrap()
            .unwrap()
            .map_tensor(&host, AccessMode::Read)
            .unwrap();
        let remote = OpenClToOpenVino::new(&cl, &ov)
            .unwrap()
            .map_tensor(&cl_tensor, AccessMode::Read)
            .unwrap();
        assert!(matches!(
            remote.data(),
            Err(PrismError::NotHostAddressable(MemoryType::OpenVino))
        ));

        let back = OpenVinoToCpu::new(&ov, &cpu_ctx)
            .unwrap()
            .map_tensor(&remote, AccessMode::Read)
            .unwrap();
        assert_eq!(back.read_bytes().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn va_remote_tensors_require_nv12() {
        let device = SoftDevice::new(SoftDeviceConfig::default()).unwrap();
        let va = VaapiContext::create(&device);
        let ov = OpenVinoContext::with_va_display(&va).unwrap();
        let mapper = VaapiToOpenVino::new(&va, &ov).unwrap();

        let nv12 = allocate_frame(&va, ImageFormat::Nv12, 32, 16).unwrap();
        let out = mapper.map_frame(&nv12, AccessMode::Read).unwrap();
        assert_eq!(out.num_tensors(), 2);
        assert_eq!(out.tensor(1).unwrap().handle(keys::PLANE_INDEX).unwrap(), 1);

        let bgrx = allocate_frame(&va, ImageFormat::Bgrx, 32, 16).unwrap();
        assert!(matches!(
            mapper.map_frame(&bgrx, AccessMode::Read),
            Err(PrismError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cl_remote_context_rejects_vaapi_input() {
        let device = SoftDevice::new(SoftDeviceConfig::default()).unwrap();
        let va = VaapiContext::create(&device);
        let cl = OpenClContext::create(&device);
        let ov = OpenVinoContext::with_cl_context(&cl).unwrap();
        assert!(ov.get_mapper(&va, &ov).unwrap().is_none());
    }
}
