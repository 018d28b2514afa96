//! Software model of one accelerator device.
//!
//! `SoftDevice` stands in for the driver stack behind every backend: it
//! hands out page-aligned device memory, VA surfaces, DMA-buf style file
//! descriptors and OpenCL buffer objects, keeps live counts of each, and can
//! be told to fail a named native call once.  Every resource is an RAII guard
//! so a mapper that bails out half way releases what it created.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use prism_core::copy_audit::CopyLedger;
use prism_core::host_alloc::{HostAllocator, HostBuffer};
use prism_core::sync::Fence;
use prism_core::{Handle, ImageFormat, MemoryType, PrismError, Result};

use crate::config::SoftDeviceConfig;

// ── Native status codes reported through `BackendFailure` ──
pub const ENOMEM: i32 = -12;
pub const EBADF: i32 = -9;
pub const VA_STATUS_ERROR_INVALID_SURFACE: i32 = 6;
pub const VA_STATUS_ERROR_INVALID_PARAMETER: i32 = 18;
pub const CL_INVALID_MEM_OBJECT: i32 = -38;

static NEXT_DEVICE_ID: AtomicIsize = AtomicIsize::new(1);

#[derive(Default)]
struct Counters {
    allocations: AtomicUsize,
    bytes: AtomicUsize,
    surfaces: AtomicUsize,
    cl_buffers: AtomicUsize,
}

// ─── Device memory ──────────────────────────────────────────────────────────

/// One device allocation.  Its fence tracks outstanding work on it.
pub struct DeviceMemory {
    buffer: HostBuffer,
    fence: Fence,
    counters: Arc<Counters>,
}

impl DeviceMemory {
    pub fn as_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Pointer `offset` bytes into the allocation, bounds-checked against
    /// a view of `len` bytes.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(PrismError::InvalidArgument(format!(
                "view of {len} bytes at offset {offset} exceeds device allocation of {} bytes",
                self.len()
            )));
        }
        // SAFETY: `offset + len <= len()`, checked above.
        Ok(unsafe { self.as_ptr().add(offset) })
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        self.counters.allocations.fetch_sub(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_sub(self.buffer.capacity(), Ordering::Relaxed);
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

// ─── VA surfaces ────────────────────────────────────────────────────────────

/// Placement of one image plane inside a surface allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub pitch: usize,
    /// `[rows, cols, channels]`
    pub shape: [usize; 3],
}

impl Plane {
    pub fn nbytes(&self) -> usize {
        self.shape[0] * self.pitch
    }
}

pub struct Surface {
    id: Handle,
    format: Option<ImageFormat>,
    width: usize,
    height: usize,
    planes: Vec<Plane>,
    memory: Arc<DeviceMemory>,
    counters: Arc<Counters>,
}

impl Surface {
    pub fn id(&self) -> Handle {
        self.id
    }

    /// `None` for linear surfaces holding plain tensor data.
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.counters.surfaces.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("planes", &self.planes)
            .finish()
    }
}

// ─── DMA-buf descriptors ────────────────────────────────────────────────────

/// Open descriptor exporting a device allocation.  Closed on drop.
pub struct DmaBuf {
    fd: Handle,
    memory: Arc<DeviceMemory>,
    device: Arc<SoftDevice>,
}

impl DmaBuf {
    pub fn fd(&self) -> Handle {
        self.fd
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        self.device.fds.lock().remove(&self.fd);
        debug!(fd = self.fd, "Closed dma-buf descriptor");
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf").field("fd", &self.fd).finish()
    }
}

// ─── OpenCL buffers ─────────────────────────────────────────────────────────

/// What an OpenCL buffer object wraps.
pub enum ClStorage {
    /// Device memory at a byte offset (imported fd, shared VA surface).
    Device {
        memory: Arc<DeviceMemory>,
        offset: usize,
    },
    /// Host memory (`CL_MEM_USE_HOST_PTR`) kept alive by `owner` for as
    /// long as the buffer exists.
    Host {
        ptr: *mut u8,
        owner: Arc<dyn Any + Send + Sync>,
    },
}

pub struct ClBuffer {
    id: Handle,
    ptr: NonNull<u8>,
    len: usize,
    _owner: Arc<dyn Any + Send + Sync>,
    acquired_surface: Option<Handle>,
    device: Arc<SoftDevice>,
}

// SAFETY: `ptr` points into memory kept alive by `_owner`; the buffer never
// dereferences it itself.
unsafe impl Send for ClBuffer {}
unsafe impl Sync for ClBuffer {}

impl ClBuffer {
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ClBuffer {
    fn drop(&mut self) {
        self.device.counters.cl_buffers.fetch_sub(1, Ordering::Relaxed);
        if let Some(surface) = self.acquired_surface {
            self.device.release_va_surface(surface);
        }
    }
}

impl fmt::Debug for ClBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("acquired_surface", &self.acquired_surface)
            .finish()
    }
}

// ─── Device ─────────────────────────────────────────────────────────────────

pub struct SoftDevice {
    id: Handle,
    config: SoftDeviceConfig,
    host: HostAllocator,
    counters: Arc<Counters>,
    faults: Mutex<HashMap<&'static str, i32>>,
    surfaces: Mutex<HashMap<Handle, Weak<Surface>>>,
    fds: Mutex<HashMap<Handle, Arc<DeviceMemory>>>,
    cl_buffers: Mutex<HashMap<Handle, Weak<ClBuffer>>>,
    acquired: Mutex<HashMap<Handle, usize>>,
    copies: CopyLedger,
    queue: Fence,
    next_handle: AtomicIsize,
}

impl SoftDevice {
    pub fn new(config: SoftDeviceConfig) -> Result<Arc<Self>> {
        if !config.pitch_alignment.is_power_of_two() {
            return Err(PrismError::Config(format!(
                "pitch_alignment must be a power of two, got {}",
                config.pitch_alignment
            )));
        }
        let device = Arc::new(Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            host: HostAllocator::new(),
            counters: Arc::new(Counters::default()),
            faults: Mutex::new(HashMap::new()),
            surfaces: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
            cl_buffers: Mutex::new(HashMap::new()),
            acquired: Mutex::new(HashMap::new()),
            copies: CopyLedger::new(),
            queue: Fence::signaled("zeCommandQueueSynchronize"),
            // Low numbers look like stdio descriptors; start above them.
            next_handle: AtomicIsize::new(16),
        });
        info!(
            device = %device.config.name,
            id = device.id,
            memory_limit_bytes = device.config.memory_limit_bytes,
            "Soft device created"
        );
        Ok(device)
    }

    #[inline]
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn config(&self) -> &SoftDeviceConfig {
        &self.config
    }

    pub fn sync_timeout(&self) -> Duration {
        self.config.sync_timeout()
    }

    /// Fresh process-unique native handle value.
    pub fn next_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ── Fault injection ──

    /// Make the next invocation of native call `call` fail with `status`.
    pub fn inject_fault(&self, call: &'static str, status: i32) {
        self.faults.lock().insert(call, status);
    }

    /// Entry point of every simulated native call.
    pub fn call(&self, backend: MemoryType, call: &'static str) -> Result<()> {
        if let Some(status) = self.faults.lock().remove(call) {
            debug!(%backend, call, status, "Injected fault fired");
            return Err(PrismError::backend(backend, call, status));
        }
        Ok(())
    }

    // ── Memory ──

    pub fn allocate(&self, backend: MemoryType, size: usize) -> Result<Arc<DeviceMemory>> {
        let limit = self.config.memory_limit_bytes;
        if limit > 0 && self.allocated_bytes().saturating_add(size) > limit {
            return Err(PrismError::backend(backend, "allocate", ENOMEM));
        }
        let buffer = self.host.alloc(size)?;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(buffer.capacity(), Ordering::Relaxed);
        Ok(Arc::new(DeviceMemory {
            buffer,
            fence: Fence::signaled("device work"),
            counters: Arc::clone(&self.counters),
        }))
    }

    /// Work queue fence; USM readers wait on it before touching memory.
    pub fn queue(&self) -> &Fence {
        &self.queue
    }

    pub fn synchronize(&self) -> Result<()> {
        self.queue.wait(self.sync_timeout())
    }

    // ── Surfaces ──

    /// New surface with planes laid out at the configured pitch alignment.
    pub fn create_surface(
        &self,
        format: ImageFormat,
        width: usize,
        height: usize,
    ) -> Result<Arc<Surface>> {
        self.call(MemoryType::Vaapi, "vaCreateSurfaces")?;
        let subsampled = matches!(format, ImageFormat::Nv12 | ImageFormat::I420);
        if width == 0 || height == 0 || (subsampled && (width % 2 != 0 || height % 2 != 0)) {
            return Err(PrismError::backend(
                MemoryType::Vaapi,
                "vaCreateSurfaces",
                VA_STATUS_ERROR_INVALID_PARAMETER,
            ));
        }

        let align = self.config.pitch_alignment;
        let mut planes = Vec::with_capacity(format.planes());
        let mut offset = 0;
        for index in 0..format.planes() {
            let shape = format
                .plane_shape(index, width, height)
                .ok_or_else(|| PrismError::InvalidArgument(format!("{format} plane {index}")))?;
            let pitch = (shape[1] * shape[2] + align - 1) & !(align - 1);
            let plane = Plane {
                offset,
                pitch,
                shape,
            };
            offset += plane.nbytes();
            planes.push(plane);
        }

        let memory = self.allocate(MemoryType::Vaapi, offset)?;
        Ok(self.register_surface(Some(format), width, height, planes, memory))
    }

    /// Surface holding `len` bytes of plain tensor data.
    pub fn create_linear_surface(&self, len: usize) -> Result<Arc<Surface>> {
        self.call(MemoryType::Vaapi, "vaCreateSurfaces")?;
        let memory = self.allocate(MemoryType::Vaapi, len)?;
        let plane = Plane {
            offset: 0,
            pitch: len,
            shape: [1, len, 1],
        };
        Ok(self.register_surface(None, len, 1, vec![plane], memory))
    }

    /// Surface over existing memory, e.g. an imported descriptor.
    pub fn import_surface(
        &self,
        memory: Arc<DeviceMemory>,
        format: Option<ImageFormat>,
        width: usize,
        height: usize,
        planes: Vec<Plane>,
    ) -> Result<Arc<Surface>> {
        self.call(MemoryType::Vaapi, "vaCreateSurfaces")?;
        for plane in &planes {
            memory.ptr_at(plane.offset, plane.nbytes())?;
        }
        Ok(self.register_surface(format, width, height, planes, memory))
    }

    fn register_surface(
        &self,
        format: Option<ImageFormat>,
        width: usize,
        height: usize,
        planes: Vec<Plane>,
        memory: Arc<DeviceMemory>,
    ) -> Arc<Surface> {
        let surface = Arc::new(Surface {
            id: self.next_handle(),
            format,
            width,
            height,
            planes,
            memory,
            counters: Arc::clone(&self.counters),
        });
        self.counters.surfaces.fetch_add(1, Ordering::Relaxed);
        let mut surfaces = self.surfaces.lock();
        surfaces.retain(|_, weak| weak.strong_count() > 0);
        surfaces.insert(surface.id, Arc::downgrade(&surface));
        surface
    }

    pub fn surface(&self, id: Handle) -> Result<Arc<Surface>> {
        self.surfaces
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(PrismError::BackendFailure {
                backend: MemoryType::Vaapi,
                call: "vaQuerySurfaceStatus",
                status: VA_STATUS_ERROR_INVALID_SURFACE,
            })
    }

    // ── DMA-buf ──

    pub fn export_fd(self: &Arc<Self>, memory: &Arc<DeviceMemory>) -> DmaBuf {
        let fd = self.next_handle();
        self.fds.lock().insert(fd, Arc::clone(memory));
        debug!(fd, "Exported dma-buf descriptor");
        DmaBuf {
            fd,
            memory: Arc::clone(memory),
            device: Arc::clone(self),
        }
    }

    pub fn import_fd(&self, backend: MemoryType, fd: Handle) -> Result<Arc<DeviceMemory>> {
        self.fds
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(PrismError::BackendFailure {
                backend,
                call: "import_fd",
                status: EBADF,
            })
    }

    // ── OpenCL ──

    pub fn create_cl_buffer(
        self: &Arc<Self>,
        storage: ClStorage,
        len: usize,
    ) -> Result<Arc<ClBuffer>> {
        self.call(MemoryType::OpenCl, "clCreateBuffer")?;
        let (ptr, owner) = match storage {
            ClStorage::Device { memory, offset } => {
                let ptr = memory.ptr_at(offset, len)?;
                (ptr, memory as Arc<dyn Any + Send + Sync>)
            }
            ClStorage::Host { ptr, owner } => (ptr, owner),
        };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            PrismError::InvalidArgument("null host pointer for OpenCL buffer".into())
        })?;
        Ok(self.register_cl_buffer(ptr, len, owner, None))
    }

    /// OpenCL view of a VA surface's memory, acquired for media sharing
    /// until the buffer drops.
    pub fn share_va_surface(
        self: &Arc<Self>,
        surface: &Surface,
        offset: usize,
        len: usize,
    ) -> Result<Arc<ClBuffer>> {
        self.call(MemoryType::OpenCl, "clCreateFromVA_APIMediaSurfaceINTEL")?;
        let ptr = surface.memory.ptr_at(offset, len)?;
        self.call(MemoryType::OpenCl, "clEnqueueAcquireVA_APIMediaSurfacesINTEL")?;
        *self.acquired.lock().entry(surface.id).or_default() += 1;
        // SAFETY: `ptr_at` returned an in-bounds pointer of a live allocation.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };
        let owner = Arc::clone(&surface.memory) as Arc<dyn Any + Send + Sync>;
        Ok(self.register_cl_buffer(ptr, len, owner, Some(surface.id)))
    }

    fn register_cl_buffer(
        self: &Arc<Self>,
        ptr: NonNull<u8>,
        len: usize,
        owner: Arc<dyn Any + Send + Sync>,
        acquired_surface: Option<Handle>,
    ) -> Arc<ClBuffer> {
        let buffer = Arc::new(ClBuffer {
            id: self.next_handle(),
            ptr,
            len,
            _owner: owner,
            acquired_surface,
            device: Arc::clone(self),
        });
        self.counters.cl_buffers.fetch_add(1, Ordering::Relaxed);
        let mut buffers = self.cl_buffers.lock();
        buffers.retain(|_, weak| weak.strong_count() > 0);
        buffers.insert(buffer.id, Arc::downgrade(&buffer));
        buffer
    }

    pub fn cl_buffer(&self, id: Handle) -> Result<Arc<ClBuffer>> {
        self.cl_buffers
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(PrismError::BackendFailure {
                backend: MemoryType::OpenCl,
                call: "clGetMemObjectInfo",
                status: CL_INVALID_MEM_OBJECT,
            })
    }

    fn release_va_surface(&self, surface: Handle) {
        let mut acquired = self.acquired.lock();
        if let Some(count) = acquired.get_mut(&surface) {
            *count -= 1;
            if *count == 0 {
                acquired.remove(&surface);
            }
        }
    }

    // ── Accounting ──

    pub fn live_allocations(&self) -> usize {
        self.counters.allocations.load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.counters.bytes.load(Ordering::Relaxed)
    }

    pub fn live_surfaces(&self) -> usize {
        self.counters.surfaces.load(Ordering::Relaxed)
    }

    pub fn open_fds(&self) -> usize {
        self.fds.lock().len()
    }

    pub fn live_cl_buffers(&self) -> usize {
        self.counters.cl_buffers.load(Ordering::Relaxed)
    }

    /// Surfaces currently acquired by OpenCL media sharing.
    pub fn acquired_surfaces(&self) -> usize {
        self.acquired.lock().len()
    }

    pub fn report(&self) {
        info!(
            device = %self.config.name,
            allocations = self.live_allocations(),
            allocated_kb = self.allocated_bytes() / 1024,
            surfaces = self.live_surfaces(),
            open_fds = self.open_fds(),
            cl_buffers = self.live_cl_buffers(),
            "Soft device report"
        );
        self.host.report();
        self.copies.report(&self.config.name);
    }

    /// Host copies made by mappers running on this device.
    pub fn copies(&self) -> &CopyLedger {
        &self.copies
    }
}

impl fmt::Debug for SoftDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDevice")
            .field("name", &self.config.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Arc<SoftDevice> {
        SoftDevice::new(SoftDeviceConfig::default()).unwrap()
    }

    #[test]
    fn nv12_surface_layout_is_pitch_aligned() {
        let device = device();
        let surface = device.create_surface(ImageFormat::Nv12, 100, 50).unwrap();
        let planes = surface.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].pitch, 128);
        assert_eq!(planes[0].shape, [50, 100, 1]);
        assert_eq!(planes[1].offset, 128 * 50);
        assert_eq!(planes[1].shape, [25, 50, 2]);
        assert_eq!(device.live_surfaces(), 1);
        drop(surface);
        assert_eq!(device.live_surfaces(), 0);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn odd_nv12_geometry_is_rejected() {
        let err = device()
            .create_surface(ImageFormat::Nv12, 63, 32)
            .expect_err("odd width");
        match err {
            PrismError::BackendFailure { call, status, .. } => {
                assert_eq!(call, "vaCreateSurfaces");
                assert_eq!(status, VA_STATUS_ERROR_INVALID_PARAMETER);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn injected_fault_fires_once() {
        let device = device();
        device.inject_fault("vaCreateSurfaces", 1);
        assert!(device.create_surface(ImageFormat::Bgrx, 8, 8).is_err());
        assert!(device.create_surface(ImageFormat::Bgrx, 8, 8).is_ok());
    }

    #[test]
    fn descriptors_close_on_drop() {
        let device = device();
        let memory = device.allocate(MemoryType::Dma, 64).unwrap();
        let buf = device.export_fd(&memory);
        assert_eq!(device.open_fds(), 1);
        let imported = device.import_fd(MemoryType::Dma, buf.fd()).unwrap();
        assert!(Arc::ptr_eq(&imported, &memory));
        let fd = buf.fd();
        drop(buf);
        assert_eq!(device.open_fds(), 0);
        assert!(device.import_fd(MemoryType::Dma, fd).is_err());
    }

    #[test]
    fn memory_limit_is_enforced() {
        let config = SoftDeviceConfig {
            memory_limit_bytes: 8192,
            ..SoftDeviceConfig::default()
        };
        let device = SoftDevice::new(config).unwrap();
        let _first = device.allocate(MemoryType::Vaapi, 4096).unwrap();
        let _second = device.allocate(MemoryType::Vaapi, 4096).unwrap();
        let err = device
            .allocate(MemoryType::Vaapi, 1)
            .expect_err("over the limit");
        assert!(matches!(err, PrismError::BackendFailure { status: ENOMEM, .. }));
    }

    #[test]
    fn shared_surfaces_are_released_with_their_buffers() {
        let device = device();
        let surface = device.create_surface(ImageFormat::Nv12, 16, 16).unwrap();
        let a = device.share_va_surface(&surface, 0, 256).unwrap();
        let b = device.share_va_surface(&surface, 0, 256).unwrap();
        assert_eq!(device.acquired_surfaces(), 1);
        assert!(Arc::ptr_eq(&device.cl_buffer(a.id()).unwrap(), &a));
        drop(a);
        assert_eq!(device.acquired_surfaces(), 1);
        drop(b);
        assert_eq!(device.acquired_surfaces(), 0);
        assert_eq!(device.live_cl_buffers(), 0);
    }

    #[test]
    fn out_of_bounds_views_are_rejected() {
        let device = device();
        let memory = device.allocate(MemoryType::Dma, 64).unwrap();
        assert!(memory.ptr_at(32, 32).is_ok());
        assert!(memory.ptr_at(32, 33).is_err());
        assert!(matches!(
            device.create_cl_buffer(ClStorage::Device { memory, offset: 60 }, 8),
            Err(PrismError::InvalidArgument(_))
        ));
    }

    #[test]
    fn bad_pitch_alignment_is_a_config_error() {
        let config = SoftDeviceConfig {
            pitch_alignment: 48,
            ..SoftDeviceConfig::default()
        };
        assert!(matches!(SoftDevice::new(config), Err(PrismError::Config(_))));
    }
}
