//! Mapper resolution across an ordered list of contexts.

use std::sync::Arc;

use tracing::debug;

use crate::cache::MemoryMapperCache;
use crate::chain::MemoryMapperChain;
use crate::config::MapperOptions;
use crate::context::Context;
use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::mapper::MemoryMapper;
use crate::tensor::Tensor;
use crate::types::AccessMode;

/// Build (or reuse) the mapper bridging `contexts[0]` to the last context.
///
/// Each hop `(Ci, Ci+1)` is resolved by asking `Ci` first and `Ci+1` second
/// for a direct mapper.  Hops are chained, optionally wrapped in a cache, and
/// the result is registered in both endpoint contexts so a later request for
/// the same endpoints returns the same instance while it is alive.
pub fn create_mapper(
    contexts: &[Arc<Context>],
    options: &MapperOptions,
) -> Result<Arc<dyn MemoryMapper>> {
    let (first, last) = match contexts {
        [first, .., last] => (first, last),
        _ => {
            return Err(PrismError::invalid(format!(
                "mapper resolution needs at least two contexts, got {}",
                contexts.len()
            )));
        }
    };

    if contexts.len() == 2 && first.id() == last.id() {
        return first
            .get_mapper(first, last)?
            .ok_or_else(|| PrismError::NoMapperAvailable {
                from: first.memory_type(),
                to: last.memory_type(),
            });
    }

    let cache = options.cache_policy();
    if let Some(mapper) = first.registered_mapper(first, last, cache) {
        debug!(
            from = %first.memory_type(),
            to = %last.memory_type(),
            mapper = mapper.name(),
            "Reusing registered mapper"
        );
        return Ok(mapper);
    }

    let mut hops = Vec::with_capacity(contexts.len() - 1);
    for pair in contexts.windows(2) {
        let (input, output) = (&pair[0], &pair[1]);
        let mapper = match input.get_mapper(input, output)? {
            Some(mapper) => mapper,
            None => output
                .get_mapper(input, output)?
                .ok_or_else(|| PrismError::NoMapperAvailable {
                    from: input.memory_type(),
                    to: output.memory_type(),
                })?,
        };
        hops.push(mapper);
    }

    let mut mapper: Arc<dyn MemoryMapper> = if hops.len() == 1 {
        hops.remove(0)
    } else {
        Arc::new(MemoryMapperChain::new(hops)?)
    };
    if let Some(policy) = cache {
        mapper = Arc::new(MemoryMapperCache::new(mapper, policy));
    }

    debug!(
        from = %first.memory_type(),
        to = %last.memory_type(),
        hops = contexts.len() - 1,
        mapper = mapper.name(),
        "Created mapper"
    );

    let mapper = first.register(first, last, cache, mapper);
    last.register(first, last, cache, Arc::clone(&mapper));
    Ok(mapper)
}

/// Direct mapper between two contexts.
///
/// Asks the output context first and the input context second, the reverse
/// of the per-hop order in [`create_mapper`].
fn direct_mapper(input: &Arc<Context>, output: &Arc<Context>) -> Result<Arc<dyn MemoryMapper>> {
    if let Some(mapper) = output.get_mapper(input, output)? {
        return Ok(mapper);
    }
    input
        .get_mapper(input, output)?
        .ok_or_else(|| PrismError::NoMapperAvailable {
            from: input.memory_type(),
            to: output.memory_type(),
        })
}

/// Convenience mapping of a tensor into another context.
pub trait TensorExt {
    fn map_to(&self, output: &Arc<Context>, mode: AccessMode) -> Result<Arc<Tensor>>;
}

impl TensorExt for Arc<Tensor> {
    fn map_to(&self, output: &Arc<Context>, mode: AccessMode) -> Result<Arc<Tensor>> {
        let input = self
            .context()
            .ok_or_else(|| PrismError::invalid("tensor has no live context to map from"))?;
        if input.id() == output.id() {
            return Ok(Arc::clone(self));
        }
        direct_mapper(&input, output)?.map_tensor(self, mode)
    }
}

/// Convenience mapping of a frame into another context.
pub trait FrameExt {
    fn map_to(&self, output: &Arc<Context>, mode: AccessMode) -> Result<Arc<Frame>>;
}

impl FrameExt for Arc<Frame> {
    fn map_to(&self, output: &Arc<Context>, mode: AccessMode) -> Result<Arc<Frame>> {
        let input = self
            .tensor(0)?
            .context()
            .ok_or_else(|| PrismError::invalid("frame has no live context to map from"))?;
        if input.id() == output.id() {
            return Ok(Arc::clone(self));
        }
        direct_mapper(&input, output)?.map_frame(self, mode)
    }
}
