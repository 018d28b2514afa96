#![doc = include_str!("../README.md")]

pub mod cache;
pub mod chain;
pub mod config;
pub mod context;
pub mod copy_audit;
pub mod dictionary;
pub mod error;
pub mod factory;
pub mod frame;
pub mod frame_info;
pub mod host_alloc;
pub mod image;
pub mod mapper;
pub mod metadata;
pub mod pool;
pub mod sync;
pub mod tensor;
pub mod tensor_info;
pub mod types;

pub use cache::MemoryMapperCache;
pub use chain::MemoryMapperChain;
pub use config::{MapperOptions, PoolPolicy};
pub use context::{Context, ContextBackend};
pub use error::{PrismError, Result};
pub use factory::{FrameExt, TensorExt, create_mapper};
pub use frame::Frame;
pub use mapper::MemoryMapper;
pub use tensor::Tensor;
pub use tensor_info::TensorInfo;
pub use types::{AccessMode, DataType, Handle, ImageFormat, MediaType, MemoryType, keys};

/// Record a host copy of `$bytes` by `$mapper` in a
/// [`CopyLedger`](crate::copy_audit::CopyLedger).
///
/// Gated on the *calling* crate's `audit-zero-copy` feature, so backends that
/// forward the feature get the audit and everyone else pays nothing.
#[macro_export]
macro_rules! host_copy {
    ($ledger:expr, $mapper:expr, $input:expr => $output:expr, $bytes:expr) => {{
        #[cfg(feature = "audit-zero-copy")]
        {
            $ledger.record(
                $crate::copy_audit::CopyPath {
                    mapper: $mapper,
                    input: $input,
                    output: $output,
                },
                $bytes,
            );
        }
        #[cfg(not(feature = "audit-zero-copy"))]
        {
            let _ = (&$ledger, &$mapper, &$input, &$output, &$bytes);
        }
    }};
}
