//! Composition of mappers across backends with no direct bridge.

use std::sync::Arc;

use crate::context::Context;
use crate::error::{PrismError, Result};
use crate::frame::Frame;
use crate::mapper::MemoryMapper;
use crate::tensor::Tensor;
use crate::types::AccessMode;

/// Ordered, non-empty list of mappers where each output context is the next
/// mapper's input context.
pub struct MemoryMapperChain {
    mappers: Vec<Arc<dyn MemoryMapper>>,
    name: String,
}

impl MemoryMapperChain {
    pub fn new(mappers: Vec<Arc<dyn MemoryMapper>>) -> Result<Self> {
        let first = mappers
            .first()
            .ok_or_else(|| PrismError::MapperChainBroken {
                index: 0,
                detail: "chain has no mappers".into(),
            })?;

        for (index, pair) in mappers.windows(2).enumerate() {
            let out = pair[0].output_context();
            let next = pair[1].input_context();
            if out.id() != next.id() {
                return Err(PrismError::MapperChainBroken {
                    index: index + 1,
                    detail: format!(
                        "{} outputs to {} context #{} but {} reads from {} context #{}",
                        pair[0].name(),
                        out.memory_type(),
                        out.id(),
                        pair[1].name(),
                        next.memory_type(),
                        next.id()
                    ),
                });
            }
        }

        let mut name = format!("chain({}", first.input_context().memory_type());
        for mapper in &mappers {
            name.push_str(" -> ");
            name.push_str(mapper.output_context().memory_type().as_str());
        }
        name.push(')');

        Ok(Self { mappers, name })
    }

    pub fn mappers(&self) -> &[Arc<dyn MemoryMapper>] {
        &self.mappers
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl MemoryMapper for MemoryMapperChain {
    fn map_tensor(&self, src: &Arc<Tensor>, mode: AccessMode) -> Result<Arc<Tensor>> {
        self.mappers
            .iter()
            .try_fold(Arc::clone(src), |tensor, mapper| mapper.map_tensor(&tensor, mode))
    }

    fn map_frame(&self, src: &Arc<Frame>, mode: AccessMode) -> Result<Arc<Frame>> {
        self.mappers
            .iter()
            .try_fold(Arc::clone(src), |frame, mapper| mapper.map_frame(&frame, mode))
    }

    fn input_context(&self) -> &Arc<Context> {
        self.mappers[0].input_context()
    }

    fn output_context(&self) -> &Arc<Context> {
        self.mappers[self.mappers.len() - 1].output_context()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlainBackend;
    use crate::mapper::{MapperEndpoints, ensure_memory_type};
    use crate::tensor_info::TensorInfo;
    use crate::types::{DataType, MemoryType, keys};

    /// Relabels a tensor into the output memory type, keeping handles.
    struct Relabel {
        endpoints: MapperEndpoints,
    }

    impl Relabel {
        fn new(input: &Arc<Context>, output: &Arc<Context>) -> Arc<dyn MemoryMapper> {
            Arc::new(Self {
                endpoints: MapperEndpoints {
                    input: Arc::clone(input),
                    output: Arc::clone(output),
                },
            })
        }
    }

    impl MemoryMapper for Relabel {
        fn map_tensor(&self, src: &Arc<Tensor>, _mode: AccessMode) -> Result<Arc<Tensor>> {
            ensure_memory_type(self.endpoints.input.memory_type(), src.memory_type())?;
            Tensor::builder(src.info().clone(), self.endpoints.output.memory_type())
                .handle(keys::DMA_FD, src.handle("")?)
                .context(&self.endpoints.output)
                .parent(src)
                .build()
        }

        fn input_context(&self) -> &Arc<Context> {
            &self.endpoints.input
        }

        fn output_context(&self) -> &Arc<Context> {
            &self.endpoints.output
        }

        fn name(&self) -> &str {
            "relabel"
        }
    }

    fn ctx(memory_type: MemoryType) -> Arc<Context> {
        Context::new(PlainBackend::new(memory_type))
    }

    #[test]
    fn folds_through_every_link() {
        let (a, b, c) = (ctx(MemoryType::Vaapi), ctx(MemoryType::Dma), ctx(MemoryType::LevelZero));
        let chain =
            MemoryMapperChain::new(vec![Relabel::new(&a, &b), Relabel::new(&b, &c)]).unwrap();
        assert_eq!(chain.name(), "chain(VAAPI -> DMA -> USM)");
        assert_eq!(chain.input_context().id(), a.id());
        assert_eq!(chain.output_context().id(), c.id());

        let src = Tensor::builder(TensorInfo::new([4, 4], DataType::UInt8), MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, 42)
            .build()
            .unwrap();
        let out = chain.map_tensor(&src, AccessMode::Read).unwrap();
        assert_eq!(out.memory_type(), MemoryType::LevelZero);
        let mid = out.parent().unwrap();
        assert_eq!(mid.memory_type(), MemoryType::Dma);
        assert!(Arc::ptr_eq(&mid.parent().unwrap(), &src));
    }

    #[test]
    fn mismatched_boundary_is_broken() {
        let (a, b, c) = (ctx(MemoryType::Vaapi), ctx(MemoryType::Dma), ctx(MemoryType::Dma));
        let err = MemoryMapperChain::new(vec![Relabel::new(&a, &b), Relabel::new(&c, &a)])
            .err()
            .expect("contexts b and c differ");
        match err {
            PrismError::MapperChainBroken { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(
            MemoryMapperChain::new(Vec::new()),
            Err(PrismError::MapperChainBroken { .. })
        ));
    }

    #[test]
    fn wrong_input_type_fails_fast() {
        let (a, b) = (ctx(MemoryType::Vaapi), ctx(MemoryType::Dma));
        let chain = MemoryMapperChain::new(vec![Relabel::new(&a, &b)]).unwrap();
        let mut backing = [0u8; 4];
        let info = TensorInfo::new([4], DataType::UInt8);
        // SAFETY: `backing` outlives `cpu` in this test.
        let cpu = unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(backing.as_mut_ptr()) }
            .build()
            .unwrap();
        assert!(matches!(
            chain.map_tensor(&cpu, AccessMode::Read),
            Err(PrismError::TypeMismatch { .. })
        ));
    }
}
