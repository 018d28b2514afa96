#![doc = include_str!("../README.md")]

/// Implements [`MemoryMapper`](prism_core::MemoryMapper) for a mapper struct
/// with an `endpoints: MapperEndpoints` field and an inherent
/// `map(&self, &Arc<Tensor>, AccessMode)`.  The `frames` form also forwards
/// `map_frame` to an inherent `map_frame_impl`.
macro_rules! memory_mapper {
    ($ty:ty, $name:literal) => {
        impl prism_core::MemoryMapper for $ty {
            fn map_tensor(
                &self,
                src: &std::sync::Arc<prism_core::Tensor>,
                mode: prism_core::AccessMode,
            ) -> prism_core::Result<std::sync::Arc<prism_core::Tensor>> {
                self.endpoints.check(src)?;
                self.map(src, mode)
            }

            fn input_context(&self) -> &std::sync::Arc<prism_core::Context> {
                &self.endpoints.input
            }

            fn output_context(&self) -> &std::sync::Arc<prism_core::Context> {
                &self.endpoints.output
            }

            fn name(&self) -> &str {
                $name
            }
        }
    };
    ($ty:ty, $name:literal, frames) => {
        impl prism_core::MemoryMapper for $ty {
            fn map_tensor(
                &self,
                src: &std::sync::Arc<prism_core::Tensor>,
                mode: prism_core::AccessMode,
            ) -> prism_core::Result<std::sync::Arc<prism_core::Tensor>> {
                self.endpoints.check(src)?;
                self.map(src, mode)
            }

            fn map_frame(
                &self,
                src: &std::sync::Arc<prism_core::Frame>,
                mode: prism_core::AccessMode,
            ) -> prism_core::Result<std::sync::Arc<prism_core::Frame>> {
                prism_core::mapper::ensure_memory_type(
                    self.endpoints.input.memory_type(),
                    src.memory_type(),
                )?;
                self.map_frame_impl(src, mode)
            }

            fn input_context(&self) -> &std::sync::Arc<prism_core::Context> {
                &self.endpoints.input
            }

            fn output_context(&self) -> &std::sync::Arc<prism_core::Context> {
                &self.endpoints.output
            }

            fn name(&self) -> &str {
                $name
            }
        }
    };
}

pub mod common;
pub mod config;
pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod derive;
pub mod device;
pub mod dma;
pub mod level_zero;
pub mod opencl;
pub mod openvino;
pub mod vaapi;

pub use config::SoftDeviceConfig;
pub use cpu::CpuContext;
#[cfg(feature = "cuda")]
pub use cuda::CudaContext;
pub use derive::derive_context;
pub use device::SoftDevice;
pub use dma::DmaContext;
pub use level_zero::LevelZeroContext;
pub use opencl::OpenClContext;
pub use openvino::OpenVinoContext;
pub use vaapi::VaapiContext;
