//! CUDA device memory via `cudarc` (feature `cuda`).
//!
//! Unlike the other backends this talks to a real driver.  There is no
//! zero-copy path between CUDA and the soft device, so both mappers copy
//! and count it in the context's [`CopyLedger`].

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DriverError};
use tracing::info;

use prism_core::copy_audit::CopyLedger;
use prism_core::mapper::MapperEndpoints;
use prism_core::{
    AccessMode, Context, ContextBackend, Handle, MemoryMapper, MemoryType, PrismError, Result,
    Tensor, keys,
};

use crate::common::contiguous;
use crate::cpu::allocator_of;

fn driver_error(call: &'static str) -> impl Fn(DriverError) -> PrismError {
    move |err| PrismError::backend(MemoryType::Cuda, call, err.0 as i32)
}

pub struct CudaContext {
    device: Arc<CudaDevice>,
    ordinal: usize,
    copies: Arc<CopyLedger>,
}

impl CudaContext {
    pub fn create(ordinal: usize) -> Result<Arc<Context>> {
        let device = CudaDevice::new(ordinal).map_err(driver_error("cuDeviceGet"))?;
        let ctx = Context::new(Self {
            device,
            ordinal,
            copies: Arc::new(CopyLedger::new()),
        });
        info!(id = ctx.id(), ordinal, "CUDA context created");
        Ok(ctx)
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Host copies made by mappers to and from this context.
    pub fn copies(&self) -> &CopyLedger {
        &self.copies
    }
}

impl ContextBackend for CudaContext {
    fn memory_type(&self) -> MemoryType {
        MemoryType::Cuda
    }

    fn primary_key(&self) -> &'static str {
        keys::CU_DEVICE
    }

    fn handle(&self, key: &str) -> Option<Handle> {
        (key == keys::CU_DEVICE).then_some(self.ordinal as Handle)
    }

    fn keys(&self) -> Vec<&'static str> {
        vec![keys::CU_DEVICE]
    }

    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let mapper: Arc<dyn MemoryMapper> = match (input.memory_type(), output.memory_type()) {
            (MemoryType::Cpu, MemoryType::Cuda) => {
                Arc::new(CpuToCuda::new(input, output, self)?)
            }
            (MemoryType::Cuda, MemoryType::Cpu) => {
                Arc::new(CudaToCpu::new(input, output, self)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(mapper))
    }
}

/// Device allocation owned by a CUDA tensor.
pub struct CudaBuffer {
    slice: CudaSlice<u8>,
}

impl CudaBuffer {
    pub fn slice(&self) -> &CudaSlice<u8> {
        &self.slice
    }

    pub fn device_ptr(&self) -> Handle {
        *self.slice.device_ptr() as Handle
    }
}

// ─── CPU → CUDA ─────────────────────────────────────────────────────────────

pub struct CpuToCuda {
    endpoints: MapperEndpoints,
    device: Arc<CudaDevice>,
    copies: Arc<CopyLedger>,
}

impl CpuToCuda {
    fn new(input: &Arc<Context>, output: &Arc<Context>, cuda: &CudaContext) -> Result<Self> {
        let endpoints = MapperEndpoints::new(
            Arc::clone(input),
            Arc::clone(output),
            MemoryType::Cpu,
            MemoryType::Cuda,
        )?;
        Ok(Self {
            endpoints,
            device: Arc::clone(&cuda.device),
            copies: Arc::clone(&cuda.copies),
        })
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let bytes = src.read_bytes()?;
        let slice = self
            .device
            .htod_sync_copy(&bytes)
            .map_err(driver_error("cuMemcpyHtoD"))?;
        prism_core::host_copy!(
            self.copies,
            "cpu_to_cuda",
            MemoryType::Cpu => MemoryType::Cuda,
            bytes.len()
        );

        let buffer = CudaBuffer { slice };
        Tensor::builder(contiguous(src.info())?, MemoryType::Cuda)
            .handle(keys::CU_DEVICE_PTR, buffer.device_ptr())
            .owning(buffer)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(CpuToCuda, "cpu_to_cuda");

// ─── CUDA → CPU ─────────────────────────────────────────────────────────────

/// Downloads into a buffer from the output context's host allocator.
pub struct CudaToCpu {
    endpoints: MapperEndpoints,
    device: Arc<CudaDevice>,
    copies: Arc<CopyLedger>,
}

impl CudaToCpu {
    fn new(input: &Arc<Context>, output: &Arc<Context>, cuda: &CudaContext) -> Result<Self> {
        let endpoints = MapperEndpoints::new(
            Arc::clone(input),
            Arc::clone(output),
            MemoryType::Cuda,
            MemoryType::Cpu,
        )?;
        allocator_of(output)?;
        Ok(Self {
            endpoints,
            device: Arc::clone(&cuda.device),
            copies: Arc::clone(&cuda.copies),
        })
    }

    /// The tensor owning the allocation `src` views: `src` or the first
    /// ancestor holding a [`CudaBuffer`].
    fn owner(src: &Arc<Tensor>) -> Result<Arc<Tensor>> {
        let mut cursor = Some(Arc::clone(src));
        while let Some(tensor) = cursor {
            if tensor.resource::<CudaBuffer>().is_some() {
                return Ok(tensor);
            }
            cursor = tensor.parent();
        }
        Err(PrismError::InvalidArgument(
            "CUDA tensor is not backed by an allocation of this context".into(),
        ))
    }

    fn map(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        let owner = Self::owner(src)?;
        let Some(buffer) = owner.resource::<CudaBuffer>() else {
            return Err(PrismError::InvalidArgument("CUDA allocation vanished".into()));
        };
        let len = buffer.slice.len();
        if src.offset().checked_add(src.span()).is_none_or(|end| end > len) {
            return Err(PrismError::InvalidArgument(format!(
                "view of {} bytes at offset {} exceeds CUDA allocation of {len} bytes",
                src.span(),
                src.offset()
            )));
        }

        let mut host = allocator_of(&self.endpoints.output)?.alloc(len)?;
        self.device
            .dtoh_sync_copy_into(&buffer.slice, host.as_mut_slice())
            .map_err(driver_error("cuMemcpyDtoH"))?;
        prism_core::host_copy!(
            self.copies,
            "cuda_to_cpu",
            MemoryType::Cuda => MemoryType::Cpu,
            len
        );

        // SAFETY: `offset + span <= len`, checked above.
        let ptr = unsafe { host.as_ptr().add(src.offset()) };
        // SAFETY: `ptr` addresses `span()` bytes of `host`, which the tensor
        // owns; moving `host` does not move its allocation.
        unsafe { Tensor::builder(src.info().clone(), MemoryType::Cpu).host_ptr(ptr) }
            .owning(host)
            .context(&self.endpoints.output)
            .parent(src)
            .build()
    }
}

memory_mapper!(CudaToCpu, "cuda_to_cpu");
