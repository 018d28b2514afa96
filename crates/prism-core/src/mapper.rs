//! The mapper contract and the helpers every concrete mapper shares.
//!
//! A mapper converts tensors and frames from the memory of its input context
//! into the memory of its output context.  The produced object always links
//! back to its source through `parent()`, so native handles borrowed from the
//! source stay valid for as long as the mapped object exists.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::tensor::Tensor;
use crate::types::{AccessMode, MemoryType};

pub trait MemoryMapper: Send + Sync {
    /// Map one tensor.  The result's parent is `src`.
    fn map_tensor(&self, src: &Arc<Tensor>, mode: AccessMode) -> Result<Arc<Tensor>>;

    /// Map a whole frame.  Mapping each tensor on its own is correct for
    /// most backend pairs; pairs whose frames have a different shape in the
    /// target memory (several planes in one surface) override this.
    fn map_frame(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        map_frame_per_tensor(self, src, mode)
    }

    fn input_context(&self) -> &Arc<Context>;

    fn output_context(&self) -> &Arc<Context>;

    fn name(&self) -> &str;
}

/// Fail fast when `actual` is not the memory type a mapper consumes.
pub fn ensure_memory_type(expected: MemoryType, actual: MemoryType) -> Result<()> {
    if expected != actual {
        return Err(PrismError::TypeMismatch { expected, actual });
    }
    Ok(())
}

/// Default frame mapping: map every tensor and rebuild a frame with the same
/// media type and format whose parent is `src`.  Metadata is not copied.
pub fn map_frame_per_tensor<M: MemoryMapper + ?Sized>(
    mapper: &M,
    src: &Arc<Frame>,
    mode: AccessMode,
) -> Result<Arc<Frame>> {
    ensure_memory_type(mapper.input_context().memory_type(), src.memory_type())?;
    let tensors = src
        .tensors()
        .map(|tensor| mapper.map_tensor(tensor, mode))
        .collect::<Result<Vec<_>>>()?;
    let frame = Frame::new(src.media_type(), src.format(), tensors)?;
    frame.set_parent(Some(Arc::clone(src)))?;
    Ok(frame)
}

/// Input and output contexts of a concrete mapper.
#[derive(Clone, Debug)]
pub struct MapperEndpoints {
    pub input: Arc<Context>,
    pub output: Arc<Context>,
}

impl MapperEndpoints {
    /// Checks both contexts carry the memory types the mapper bridges.
    pub fn new(
        input: Arc<Context>,
        output: Arc<Context>,
        from: MemoryType,
        to: MemoryType,
    ) -> Result<Self> {
        ensure_memory_type(from, input.memory_type())?;
        ensure_memory_type(to, output.memory_type())?;
        Ok(Self { input, output })
    }

    /// Checks `src` lives in the input memory type.
    #[inline]
    pub fn check(&self, src: &Tensor) -> Result<()> {
        ensure_memory_type(self.input.memory_type(), src.memory_type())
    }
}

/// Mapper between a context and itself: returns its input unchanged.
pub struct IdentityMapper {
    context: Arc<Context>,
}

impl IdentityMapper {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context }
    }
}

impl MemoryMapper for IdentityMapper {
    fn map_tensor(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
        Ok(Arc::clone(src))
    }

    fn map_frame(&self, src: &Arc<Frame>, _mode: AccessMode) -> Result<Arc<Frame>> {
        Ok(Arc::clone(src))
    }

    fn input_context(&self) -> &Arc<Context> {
        &self.context
    }

    fn output_context(&self) -> &Arc<Context> {
        &self.context
    }

    fn name(&self) -> &str {
        "identity"
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync + ?Sized>() {}
    fn check() {
        assert_send_sync::<dyn MemoryMapper>();
        assert_send_sync::<Context>();
        assert_send_sync::<Tensor>();
        assert_send_sync::<Frame>();
    }
    let _ = check;
};
