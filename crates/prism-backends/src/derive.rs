//! Building a context of one memory type from a context of another.
//!
//! The derived context keeps its source as parent and reuses whatever native
//! session the source exposes (device, VA display, OpenCL context).

use std::sync::Arc;

use tracing::info;

use prism_core::{Context, MemoryType, PrismError, Result, keys};

use crate::cpu::CpuContext;
use crate::device::SoftDevice;
use crate::dma::DmaContext;
use crate::level_zero::LevelZeroContext;
use crate::opencl::OpenClContext;
use crate::openvino::OpenVinoContext;
use crate::vaapi::{VaDisplay, VaapiContext};

fn incompatible(src: &Context, target: MemoryType, reason: impl Into<String>) -> PrismError {
    PrismError::IncompatibleContext {
        source_type: src.memory_type(),
        target,
        reason: reason.into(),
    }
}

/// The soft device behind `src`, validating the handle it advertises.
fn require_device(src: &Context, target: MemoryType) -> Result<Arc<SoftDevice>> {
    let Ok(handle) = src.handle(keys::DEVICE) else {
        return Err(incompatible(src, target, "source exposes no device handle"));
    };
    if handle == 0 {
        return Err(PrismError::InvalidArgument(format!(
            "null device handle on {} context",
            src.memory_type()
        )));
    }
    match src.session::<SoftDevice>(keys::DEVICE) {
        Ok(device) if device.id() == handle => Ok(device),
        _ => Err(PrismError::InvalidContext {
            memory_type: target,
            reason: format!("device handle {handle:#x} does not name a soft device"),
        }),
    }
}

/// Context of memory type `target` derived from `src`.
///
/// Returns `src` itself when it already has that memory type.  Fails with
/// `IncompatibleContext` when `src` cannot provide the native handle the
/// target needs.
pub fn derive_context(src: &Arc<Context>, target: MemoryType) -> Result<Arc<Context>> {
    if src.memory_type() == target {
        return Ok(Arc::clone(src));
    }
    let parent = Some(Arc::clone(src));

    let ctx = match target {
        MemoryType::Cpu => {
            let device = src.handle(keys::DEVICE).is_ok().then(|| require_device(src, target));
            CpuContext::build(device.transpose()?, parent)
        }
        MemoryType::Dma => DmaContext::build(require_device(src, target)?, parent),
        MemoryType::LevelZero => LevelZeroContext::build(require_device(src, target)?, parent),
        MemoryType::Vaapi => {
            let device = require_device(src, target)?;
            let display = match src.session::<VaDisplay>(keys::VA_DISPLAY) {
                Ok(display) => display,
                Err(_) => VaDisplay::open(&device),
            };
            VaapiContext::build(device, display, parent)
        }
        MemoryType::OpenCl => {
            let device = require_device(src, target)?;
            let display = match src.memory_type() {
                MemoryType::Vaapi => Some(src.session::<VaDisplay>(keys::VA_DISPLAY)?),
                _ => None,
            };
            OpenClContext::build(device, display, parent)
        }
        MemoryType::OpenVino => {
            let device = require_device(src, target)?;
            if let Ok(cl_context) = src.handle(keys::CL_CONTEXT) {
                OpenVinoContext::build_remote_cl(device, cl_context, Arc::clone(src))
            } else if let Ok(display) = src.session::<VaDisplay>(keys::VA_DISPLAY) {
                OpenVinoContext::build_remote_va(device, display, Arc::clone(src))
            } else {
                return Err(incompatible(
                    src,
                    target,
                    "remote context needs a cl_context or va_display",
                ));
            }
        }
        MemoryType::Cuda | MemoryType::Any | MemoryType::Other(_) => {
            return Err(incompatible(src, target, "not derivable"));
        }
    };

    info!(
        from = %src.memory_type(),
        to = %target,
        source = src.id(),
        derived = ctx.id(),
        "Derived context"
    );
    Ok(ctx)
}
