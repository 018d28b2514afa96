//! VA-API surfaces: context, allocation and the VAAPI↔CPU / VAAPI↔DMA mappers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use prism_core::context::Session;
use prism_core::image::ImageInfo;
use prism_core::mapper::{MapperEndpoints, map_frame_per_tensor};
use prism_core::pool::FrameAllocator;
use prism_core::{
    AccessMode, Context, ContextBackend, Frame, Handle, ImageFormat, MediaType, MemoryMapper,
    MemoryType, PrismError, Result, Tensor, keys,
};

use crate::common::{bind, contiguous, plane_info, write_host};
use crate::device::{DmaBuf, Plane, SoftDevice, Surface};

/// An open VA display.  Picture-level operations (derive, map, export) on
/// one display are serialized through its session lock.
pub struct VaDisplay {
    handle: Handle,
    session: Mutex<()>,
}

impl VaDisplay {
    pub(crate) fn open(device: &SoftDevice) -> Arc<Self> {
        Arc::new(Self {
            handle: device.next_handle(),
            session: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

pub struct VaapiContext {
    device: Arc<SoftDevice>,
    display: Arc<VaDisplay>,
}

impl VaapiContext {
    pub fn create(device: &Arc<SoftDevice>) -> Arc<Context> {
        Self::build(Arc::clone(device), VaDisplay::open(device), None)
    }

    pub(crate) fn build(
        device: Arc<SoftDevice>,
        display: Arc<VaDisplay>,
        parent: Option<Arc<Context>>,
    ) -> Arc<Context> {
        let display_handle = display.handle;
        let backend = Self { device, display };
        let ctx = match parent {
            Some(parent) => Context::with_parent(backend, parent),
            None => Context::new(backend),
        };
        info!(id = ctx.id(), va_display = display_handle, "VAAPI context created");
        ctx
    }
}

impl ContextBackend for VaapiContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Vaapi
    }

    fn primary_key(&self) -> &'static str {
        keys::VA_DISPLAY
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        match key {
            keys::VA_DISPLAY => Some(self.display.handle),
            keys::DEVICE => Some(self.device.id()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&'static str> {
        vec![keys::VA_DISPLAY, keys::DEVICE]
    }

    fn session(&self, key: &str) -> Option<Session> {
        match key {
            keys::VA_DISPLAY => Some(Arc::clone(&self.display) as Session),
            keys::DEVICE => Some(Arc::clone(&self.device) as Session),
            _ => None,
        }
    }

    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let mapper: Arc<dyn MemoryMapper> = match (input.memory_type(), output.memory_type()) {
            (MemoryType::Vaapi, MemoryType::Cpu) => Arc::new(VaapiToCpu::new(input, output)?),
            (MemoryType::Cpu, MemoryType::Vaapi) => Arc::new(CpuToVaapi::new(input, output)?),
            (MemoryType::Vaapi, MemoryType::Dma) => Arc::new(VaapiToDma::new(input, output)?),
            (MemoryType::Dma, MemoryType::Vaapi) => Arc::new(DmaToVaapi::new(input, output)?),
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

fn display_of(ctx: &Context) -> Result<Arc<VaDisplay>> {
    ctx.session::<VaDisplay>(keys::VA_DISPLAY)
}

// ─── Allocation ─────────────────────────────────────────────────────────────

/// One VAAPI tensor per plane of `surface`, each owning a share of it.
pub fn surface_frame(ctx: &Arc<Context>, surface: Arc<Surface>) -> Result<Arc<Frame>> {
    let format = surface.format().map_or(0, ImageFormat::code);
    let media = if surface.format().is_some() {
        MediaType::Image
    } else {
        MediaType::Tensors
    };
    let tensors = surface
        .planes()
        .iter()
        .enumerate()
        .map(|(index, plane)| {
            Tensor::builder(plane_info(plane.shape, plane.pitch)?, MemoryType::Vaapi)
                .handle(keys::VA_SURFACE_ID, surface.id())
                .handle(keys::PLANE_INDEX, index as Handle)
                .handle(keys::OFFSET, plane.offset as Handle)
                .offset(plane.offset)
                .owning(Arc::clone(&surface))
                .context(ctx)
                .build()
        })
        .collect::<Result<Vec<_>>>()?;
    Frame::new(media, format, tensors)
}

/// Allocate one surface of `format` and wrap its planes in a frame.
pub fn allocate_frame(
    ctx: &Arc<Context>,
    format: ImageFormat,
    width: usize,
    height: usize,
) -> Result<Arc<Frame>> {
    let device = crate::common::device_of(ctx)?;
    let surface = device.create_surface(format, width, height)?;
    debug!(surface = surface.id(), %format, width, height, "Allocated VA surface");
    surface_frame(ctx, surface)
}

/// [`FrameAllocator`] handing out surfaces of a fixed geometry, for
/// [`FramePool`](prism_core::pool::FramePool).
pub struct VaapiFrameAllocator {
    context: Arc<Context>,
    width: usize,
    height: usize,
}

impl VaapiFrameAllocator {
    pub fn new(context: &Arc<Context>, width: usize, height: usize) -> Self {
        Self {
            context: Arc::clone(context),
            width,
            height,
        }
    }
}

impl FrameAllocator for VaapiFrameAllocator {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Vaapi
    }

    fn allocate(&self, format: ImageFormat) -> Result<Arc<Frame>> {
        allocate_frame(&self.context, format, self.width, self.height)
    }
}

/// The surface behind `frame`, when all its tensors share one.
fn single_surface(device: &SoftDevice, frame: &Frame) -> Result<Option<Arc<Surface>>> {
    let id = frame.tensor(0)?.handle(keys::VA_SURFACE_ID)?;
    for tensor in frame.tensors() {
        if tensor.handle(keys::VA_SURFACE_ID)? != id {
            return Ok(None);
        }
    }
    device.surface(id).map(Some)
}

// ─── VAAPI → CPU ────────────────────────────────────────────────────────────

/// Derives an image from the surface and maps it into host memory.
pub struct VaapiToCpu {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
    display: Arc<VaDisplay>,
}

impl VaapiToCpu {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Vaapi, MemoryType::Cpu)?;
        let display = display_of(input)?;
        Ok(Self {
            endpoints,
            device,
            display,
        })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let surface = self.device.surface(src.handle(keys::VA_SURFACE_ID)?)?;
        let ptr = {
            let _session = self.display.session.lock();
            surface.memory().fence().wait(self.device.sync_timeout())?;
            self.device.call(MemoryType::Vaapi, "vaDeriveImage")?;
            self.device.call(MemoryType::Vaapi, "vaMapBuffer")?;
            surface.memory().ptr_at(src.offset(), src.span())?
        };
        // SAFETY: `ptr_at` checked `span()` bytes of the surface memory, which
        // the tensor owns.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(Arc::clone(surface.memory()))
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(VaapiToCpu, "vaapi_to_cpu");

// ─── CPU → VAAPI ────────────────────────────────────────────────────────────

/// Uploads host data into new surfaces.  Image frames are packed into one
/// surface of the frame's format.
pub struct CpuToVaapi {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl CpuToVaapi {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Cpu, MemoryType::Vaapi)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let bytes = src.read_bytes()?;
        let surface = self.device.create_linear_surface(bytes.len())?;
        let info = contiguous(src.info())?;
        // SAFETY: the linear surface was allocated with exactly `bytes.len()`
        // bytes, the span of a contiguous `info`.
        unsafe { write_host(surface.memory().as_ptr(), &info, &bytes)? };
        prism_core::host_copy!(
            self.device.copies(),
            "cpu_to_vaapi",
            MemoryType::Cpu => MemoryType::Vaapi,
            bytes.len()
        );

        Tensor::builder(info, MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, surface.id())
            .owning(surface)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }

    fn map_frame_impl(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        let format = match (src.media_type(), ImageFormat::from_code(src.format())) {
            (MediaType::Image, Some(format)) if format.planes() == src.num_tensors() => format,
            _ => return map_frame_per_tensor(self, src, mode),
        };
        let luma = ImageInfo::new(src.tensor(0)?.info())?;
        let (width, height) = (luma.width(), luma.height());

        let surface = self.device.create_surface(format, width, height)?;
        let mut uploaded = 0usize;
        for (tensor, plane) in src.tensors().zip(surface.planes()) {
            let bytes = tensor.read_bytes()?;
            let info = plane_info(plane.shape, plane.pitch)?;
            if bytes.len() != info.size() {
                return Err(PrismError::InvalidArgument(format!(
                    "{format} plane of {} bytes does not fit a {width}x{height} surface",
                    bytes.len()
                )));
            }
            let ptr = surface.memory().ptr_at(plane.offset, plane.nbytes())?;
            // SAFETY: `ptr_at` checked the whole pitched plane, which covers
            // the span of `info`.
            unsafe { write_host(ptr, &info, &bytes)? };
            uploaded += bytes.len();
        }
        prism_core::host_copy!(
            self.device.copies(),
            "cpu_to_vaapi",
            MemoryType::Cpu => MemoryType::Vaapi,
            uploaded
        );

        let frame = surface_frame(&self.endpoints.output, surface)?;
        frame.set_parent(Some(Arc::clone(src)))?;
        Ok(frame)
    }
}

memory_mapper!(CpuToVaapi, "cpu_to_vaapi", frames);

// ─── VAAPI → DMA ────────────────────────────────────────────────────────────

/// Exports surfaces as DMA-buf descriptors after the surface is idle.
pub struct VaapiToDma {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
    display: Arc<VaDisplay>,
}

impl VaapiToDma {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Vaapi, MemoryType::Dma)?;
        let display = display_of(input)?;
        Ok(Self {
            endpoints,
            device,
            display,
        })
    }

    fn export(&self, surface: &Surface) -> Result<DmaBuf> {
        let _session = self.display.session.lock();
        surface.memory().fence().wait(self.device.sync_timeout())?;
        self.device.call(MemoryType::Vaapi, "vaExportSurfaceHandle")?;
        Ok(self.device.export_fd(surface.memory()))
    }

    fn dma_tensor(
        &self,
        src: &Arc<Tensor>,
        buf: impl std::any::Any + Send + Sync,
        fd: Handle,
        plane: Handle,
    ) -> Result<Arc<Tensor>> {
        Tensor::builder(src.info().clone(), MemoryType::Dma)
            .handle(keys::DMA_FD, fd)
            .handle(keys::DRM_MODIFIER, 0)
            .handle(keys::PLANE_INDEX, plane)
            .handle(keys::OFFSET, src.offset() as Handle)
            .offset(src.offset())
            .owning(buf)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let surface = self.device.surface(src.handle(keys::VA_SURFACE_ID)?)?;
        let buf = self.export(&surface)?;
        let fd = buf.fd();
        self.dma_tensor(src, buf, fd, src.handle_or(keys::PLANE_INDEX, 0))
    }

    /// All planes of a surface go out through one descriptor.
    fn map_frame_impl(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        let Some(surface) = single_surface(&self.device, src)? else {
            return map_frame_per_tensor(self, src, mode);
        };
        let buf = Arc::new(self.export(&surface)?);
        let tensors = src
            .tensors()
            .enumerate()
            .map(|(index, tensor)| {
                let plane = tensor.handle_or(keys::PLANE_INDEX, index as Handle);
                self.dma_tensor(tensor, Arc::clone(&buf), buf.fd(), plane)
            })
            .collect::<Result<Vec<_>>>()?;
        let frame = Frame::new(src.media_type(), src.format(), tensors)?;
        frame.set_parent(Some(Arc::clone(src)))?;
        Ok(frame)
    }
}

memory_mapper!(VaapiToDma, "vaapi_to_dma", frames);

// ─── DMA → VAAPI ────────────────────────────────────────────────────────────

/// Imports DMA-buf descriptors as surfaces without copying.
pub struct DmaToVaapi {
    endpoints: MapperEndpoints,
    device: Arc<SoftDevice>,
}

impl DmaToVaapi {
    pub fn new(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let (endpoints, device) = bind(input, output, MemoryType::Dma, MemoryType::Vaapi)?;
        Ok(Self { endpoints, device })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let memory = self.device.import_fd(MemoryType::Vaapi, src.handle(keys::DMA_FD)?)?;
        let len = src.span();
        let plane = Plane {
            offset: src.offset(),
            pitch: len,
            shape: [1, len, 1],
        };
        let surface = self.device.import_surface(memory, None, len, 1, vec![plane])?;
        Tensor::builder(src.info().clone(), MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, surface.id())
            .handle(keys::OFFSET, src.offset() as Handle)
            .offset(src.offset())
            .owning(surface)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }

    /// An image frame whose planes share one descriptor becomes one surface.
    fn map_frame_impl(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        let format = ImageFormat::from_code(src.format());
        let fd = src.tensor(0)?.handle(keys::DMA_FD)?;
        let mut shared = src.media_type() == MediaType::Image && format.is_some();
        for tensor in src.tensors() {
            shared &= tensor.handle(keys::DMA_FD)? == fd && tensor.info().rank() == 3;
        }
        if !shared {
            return map_frame_per_tensor(self, src, mode);
        }

        let planes = src
            .tensors()
            .map(|tensor| {
                let shape = tensor.info().shape();
                Plane {
                    offset: tensor.offset(),
                    pitch: tensor.info().stride()[0],
                    shape: [shape[0], shape[1], shape[2]],
                }
            })
            .collect::<Vec<_>>();
        let luma = ImageInfo::new(src.tensor(0)?.info())?;
        let memory = self.device.import_fd(MemoryType::Vaapi, fd)?;
        let surface =
            self.device
                .import_surface(memory, format, luma.width(), luma.height(), planes)?;

        let frame = surface_frame(&self.endpoints.output, surface)?;
        frame.set_parent(Some(Arc::clone(src)))?;
        Ok(frame)
    }
}

memory_mapper!(DmaToVaapi, "dma_to_vaapi", frames);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoftDeviceConfig;
    use crate::cpu::{self, CpuContext};
    use crate::dma::DmaContext;
    use prism_core::copy_audit::{CopyPath, CopyTotals};

    fn setup() -> (Arc<SoftDevice>, Arc<Context>, Arc<Context>) {
        let device = SoftDevice::new(SoftDeviceConfig::default()).unwrap();
        let va = VaapiContext::create(&device);
        let cpu = CpuContext::with_device(&device);
        (device, va, cpu)
    }

    #[test]
    fn allocated_frame_has_one_tensor_per_plane() {
        let (device, va, _) = setup();
        let frame = allocate_frame(&va, ImageFormat::Nv12, 64, 32).unwrap();
        assert_eq!(frame.num_tensors(), 2);
        let uv = frame.tensor(1).unwrap();
        assert_eq!(uv.info().shape(), &[16, 32, 2]);
        assert_eq!(uv.handle(keys::PLANE_INDEX).unwrap(), 1);
        assert_eq!(uv.offset(), 64 * 32);
        assert_eq!(device.live_surfaces(), 1);
        drop(frame);
        assert_eq!(device.live_surfaces(), 0);
    }

    #[test]
    fn upload_then_read_back_round_trips_pixels() {
        let (device, va, cpu_ctx) = setup();
        let src = cpu::allocate_image(&cpu_ctx, ImageFormat::Nv12, 16, 8).unwrap();
        let y: Vec<u8> = (0..128).map(|i| i as u8).collect();
        src.tensor(0).unwrap().write_bytes(&y).unwrap();

        let up = CpuToVaapi::new(&cpu_ctx, &va).unwrap();
        let uploaded = up.map_frame(&src, AccessMode::Write).unwrap();
        assert_eq!(uploaded.num_tensors(), 2);
        let id = uploaded.tensor(0).unwrap().handle(keys::VA_SURFACE_ID).unwrap();
        assert_eq!(uploaded.tensor(1).unwrap().handle(keys::VA_SURFACE_ID).unwrap(), id);

        let down = VaapiToCpu::new(&va, &cpu_ctx).unwrap();
        let back = down.map_frame(&uploaded, AccessMode::Read).unwrap();
        assert_eq!(back.tensor(0).unwrap().read_bytes().unwrap(), y);
        assert!(Arc::ptr_eq(&back.parent().unwrap(), &uploaded));

        // Only the upload copies: a 16x8 luma plane and an 8x4 interleaved
        // chroma plane.
        let upload = CopyPath {
            mapper: "cpu_to_vaapi",
            input: MemoryType::Cpu,
            output: MemoryType::Vaapi,
        };
        if cfg!(feature = "audit-zero-copy") {
            assert_eq!(device.copies().snapshot().len(), 1);
            assert_eq!(
                device.copies().totals(&upload),
                CopyTotals {
                    copies: 1,
                    bytes: 128 + 64
                }
            );
        } else {
            assert!(device.copies().is_empty());
        }
    }

    #[test]
    fn frame_export_shares_one_descriptor() {
        let (device, va, _) = setup();
        let dma = DmaContext::create(&device);
        let frame = allocate_frame(&va, ImageFormat::Nv12, 32, 32).unwrap();
        let mapper = VaapiToDma::new(&va, &dma).unwrap();

        let out = mapper.map_frame(&frame, AccessMode::Read).unwrap();
        let fd = out.tensor(0).unwrap().handle(keys::DMA_FD).unwrap();
        assert_eq!(out.tensor(1).unwrap().handle(keys::DMA_FD).unwrap(), fd);
        assert_eq!(out.tensor(1).unwrap().handle(keys::OFFSET).unwrap(), 32 * 64);
        assert_eq!(device.open_fds(), 1);
        drop(out);
        assert_eq!(device.open_fds(), 0);
    }

    #[test]
    fn busy_surface_times_out() {
        let config = SoftDeviceConfig {
            sync_timeout_ms: 5,
            ..SoftDeviceConfig::default()
        };
        let device = SoftDevice::new(config).unwrap();
        let va = VaapiContext::create(&device);
        let dma = DmaContext::create(&device);
        let frame = allocate_frame(&va, ImageFormat::Bgrx, 8, 8).unwrap();
        device
            .surface(frame.tensor(0).unwrap().handle(keys::VA_SURFACE_ID).unwrap())
            .unwrap()
            .memory()
            .fence()
            .reset();

        let mapper = VaapiToDma::new(&va, &dma).unwrap();
        let err = mapper
            .map_frame(&frame, AccessMode::Read)
            .expect_err("surface never becomes idle");
        assert!(matches!(err, PrismError::Timeout { .. }));
        assert_eq!(device.open_fds(), 0);
    }

    #[test]
    fn import_round_trip_reuses_memory() {
        let (device, va, _) = setup();
        let dma = DmaContext::create(&device);
        let frame = allocate_frame(&va, ImageFormat::Nv12, 32, 16).unwrap();
        let exported = VaapiToDma::new(&va, &dma)
            .unwrap()
            .map_frame(&frame, AccessMode::Read)
            .unwrap();
        let imported = DmaToVaapi::new(&dma, &va)
            .unwrap()
            .map_frame(&exported, AccessMode::Read)
            .unwrap();

        let a = device.surface(frame.tensor(0).unwrap().handle(keys::VA_SURFACE_ID).unwrap());
        let b = device.surface(imported.tensor(0).unwrap().handle(keys::VA_SURFACE_ID).unwrap());
        assert!(Arc::ptr_eq(a.unwrap().memory(), b.unwrap().memory()));
        assert_eq!(imported.tensor(1).unwrap().offset(), frame.tensor(1).unwrap().offset());
        assert_eq!(device.live_allocations(), 1);
    }

    #[test]
    fn wrong_source_type_fails_fast() {
        let (_, va, cpu_ctx) = setup();
        let mapper = VaapiToCpu::new(&va, &cpu_ctx).unwrap();
        let info = prism_core::TensorInfo::new([4], prism_core::DataType::UInt8);
        let host = cpu::allocate(&cpu_ctx, info).unwrap();
        assert!(matches!(
            mapper.map_tensor(&host, AccessMode::Read),
            Err(PrismError::TypeMismatch { .. })
        ));
    }
}
