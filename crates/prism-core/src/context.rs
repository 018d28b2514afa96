//! Backend contexts and their mapper registries.
//!
//! A [`Context`] is the live session of one backend (a display, a compute
//! context, a device).  It is created once per device and shared by `Arc`
//! across every tensor that lives in its memory.  The backend-specific part
//! sits behind the [`ContextBackend`] trait; the registry of mappers the
//! context has already built is common to all backends.
//!
//! # Registry
//!
//! Mappers hold their input and output contexts strongly, so the registry
//! only keeps `Weak` references.  A lookup returns the registered instance
//! while any pipeline stage still owns it and rebuilds it otherwise.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolPolicy;
use crate::error::{PrismError, Result};
use crate::mapper::{IdentityMapper, MemoryMapper};
use crate::types::{Handle, MemoryType};

/// Process-unique context identifier.
pub type ContextId = u64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared session object exposed through [`Context::session`].
pub type Session = Arc<dyn Any + Send + Sync>;

/// Backend half of a [`Context`].
pub trait ContextBackend: Any + Send + Sync {
    fn memory_type(&self) -> MemoryType;

    /// Key of the handle returned for an empty key.
    fn primary_key(&self) -> &'static str;

    /// Native handle by key, `None` when this backend has no such handle.
    fn handle(&self, key: &str) -> Option<Handle>;

    fn keys(&self) -> Vec<&'static str>;

    /// Typed session object behind a handle key.
    fn session(&self, key: &str) -> Option<Session> {
        let _ = key;
        None
    }

    /// Build the direct mapper for `input -> output`.
    ///
    /// Only called when one of the two contexts has this backend's memory
    /// type.  `Ok(None)` means this backend does not bridge the pair.
    fn create_mapper(
        &self,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        let _ = (input, output);
        Ok(None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct MapperKey {
    input: ContextId,
    output: ContextId,
    /// Pool policy of the wrapping cache; `None` for uncached mappers.
    cache: Option<PoolPolicy>,
}

pub struct Context {
    id: ContextId,
    parent: Option<Arc<Context>>,
    backend: Box<dyn ContextBackend>,
    registry: Mutex<HashMap<MapperKey, Weak<dyn MemoryMapper>>>,
}

impl Context {
    pub fn new(backend: impl ContextBackend) -> Arc<Self> {
        Self::build(Box::new(backend), None)
    }

    /// Context derived from `parent`; keeps the parent's session alive.
    pub fn with_parent(backend: impl ContextBackend, parent: Arc<Context>) -> Arc<Self> {
        Self::build(Box::new(backend), Some(parent))
    }

    fn build(backend: Box<dyn ContextBackend>, parent: Option<Arc<Context>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            backend,
            registry: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.backend.memory_type()
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    /// Native handle by key.  An empty key returns the primary handle.
    pub fn handle(&self, key: &str) -> Result<Handle> {
        let key = if key.is_empty() {
            self.backend.primary_key()
        } else {
            key
        };
        self.backend
            .handle(key)
            .ok_or_else(|| PrismError::handle_not_found(key))
    }

    pub fn handle_or(&self, key: &str, default: Handle) -> Handle {
        self.handle(key).unwrap_or(default)
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.backend.keys()
    }

    /// Typed access to the session object behind `key`.
    pub fn session<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        let session = self
            .backend
            .session(key)
            .ok_or_else(|| PrismError::handle_not_found(key))?;
        session.downcast::<T>().map_err(|_| {
            PrismError::invalid(format!(
                "session behind '{key}' of {} context is not a {}",
                self.memory_type(),
                type_name::<T>()
            ))
        })
    }

    /// The backend implementation, if it is a `T`.
    pub fn backend<T: ContextBackend>(&self) -> Option<&T> {
        let backend: &dyn ContextBackend = &*self.backend;
        let backend: &dyn Any = backend;
        backend.downcast_ref::<T>()
    }

    /// Direct mapper for `input -> output`, from the registry or built by
    /// this context's backend.
    ///
    /// Returns `Ok(None)` when this context does not bridge the pair; callers
    /// then ask the other endpoint or fall back to a chain.
    pub fn get_mapper(
        self: &Arc<Self>,
        input: &Arc<Context>,
        output: &Arc<Context>,
    ) -> Result<Option<Arc<dyn MemoryMapper>>> {
        if let Some(mapper) = self.registered_mapper(input, output, None) {
            debug!(
                context = self.id,
                from = %input.memory_type(),
                to = %output.memory_type(),
                mapper = mapper.name(),
                "Mapper registry hit"
            );
            return Ok(Some(mapper));
        }

        let mapper: Arc<dyn MemoryMapper> = if input.id == output.id {
            Arc::new(IdentityMapper::new(Arc::clone(input)))
        } else {
            let own = self.memory_type();
            if input.memory_type() != own && output.memory_type() != own {
                return Ok(None);
            }
            match self.backend.create_mapper(input, output)? {
                Some(mapper) => mapper,
                None => return Ok(None),
            }
        };

        debug!(
            context = self.id,
            from = %input.memory_type(),
            to = %output.memory_type(),
            mapper = mapper.name(),
            "Built direct mapper"
        );
        Ok(Some(self.register(input, output, None, mapper)))
    }

    /// Register an externally built mapper for its own endpoints.
    pub fn attach_mapper(&self, mapper: &Arc<dyn MemoryMapper>) {
        let key = MapperKey {
            input: mapper.input_context().id,
            output: mapper.output_context().id,
            cache: None,
        };
        self.insert(key, mapper);
    }

    /// Live registered mapper for `input -> output`, wrapped in a cache of
    /// policy `cache` or uncached when `None`.
    pub fn registered_mapper(
        &self,
        input: &Context,
        output: &Context,
        cache: Option<PoolPolicy>,
    ) -> Option<Arc<dyn MemoryMapper>> {
        let key = MapperKey {
            input: input.id,
            output: output.id,
            cache,
        };
        self.registry.lock().get(&key).and_then(Weak::upgrade)
    }

    /// Register `mapper` unless another live instance won the race, in which
    /// case that instance is returned.
    pub(crate) fn register(
        &self,
        input: &Context,
        output: &Context,
        cache: Option<PoolPolicy>,
        mapper: Arc<dyn MemoryMapper>,
    ) -> Arc<dyn MemoryMapper> {
        let key = MapperKey {
            input: input.id,
            output: output.id,
            cache,
        };
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(key, Arc::downgrade(&mapper));
        mapper
    }

    fn insert(&self, key: MapperKey, mapper: &Arc<dyn MemoryMapper>) {
        let mut registry = self.registry.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(key, Arc::downgrade(mapper));
    }

    /// Number of live registry entries.
    pub fn registered_count(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("memory_type", &self.memory_type())
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("keys", &self.keys())
            .finish()
    }
}

/// Minimal backend for tests and out-of-tree memory types with no mappers.
#[derive(Debug, Clone, Copy)]
pub struct PlainBackend {
    memory_type: MemoryType,
}

impl PlainBackend {
    pub fn new(memory_type: MemoryType) -> Self {
        Self { memory_type }
    }
}

impl ContextBackend for PlainBackend {
    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn primary_key(&self) -> &'static str {
        ""
    }

    fn handle(&self, _key: &str) -> Option<Handle> {
        None
    }

    fn keys(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Display {
        magic: u32,
    }

    struct DisplayBackend {
        display: Arc<Display>,
    }

    impl ContextBackend for DisplayBackend {
        fn memory_type(&self) -> MemoryType {
            MemoryType::Vaapi
        }

        fn primary_key(&self) -> &'static str {
            "va_display"
        }

        fn handle(&self, key: &str) -> Option<Handle> {
            (key == "va_display").then(|| Arc::as_ptr(&self.display) as Handle)
        }

        fn keys(&self) -> Vec<&'static str> {
            vec!["va_display"]
        }

        fn session(&self, key: &str) -> Option<Session> {
            (key == "va_display").then(|| Arc::clone(&self.display) as Session)
        }
    }

    fn display_context() -> Arc<Context> {
        Context::new(DisplayBackend {
            display: Arc::new(Display { magic: 0x56414150 }),
        })
    }

    #[test]
    fn handles_and_sessions() {
        let ctx = display_context();
        assert_eq!(ctx.memory_type(), MemoryType::Vaapi);
        assert_eq!(ctx.handle("").unwrap(), ctx.handle("va_display").unwrap());
        assert!(matches!(
            ctx.handle("cl_context"),
            Err(PrismError::HandleNotFound { .. })
        ));

        let display = ctx.session::<Display>("va_display").unwrap();
        assert_eq!(display.magic, 0x56414150);
        assert!(ctx.session::<String>("va_display").is_err());
        assert!(ctx.backend::<DisplayBackend>().is_some());
        assert!(ctx.backend::<PlainBackend>().is_none());
    }

    #[test]
    fn ids_are_unique_and_parent_is_kept_alive() {
        let parent = display_context();
        let weak_parent = Arc::downgrade(&parent);
        let child = Context::with_parent(PlainBackend::new(MemoryType::OpenCl), parent);
        assert_ne!(child.id(), child.parent().unwrap().id());
        assert!(weak_parent.upgrade().is_some());
        drop(child);
        assert!(weak_parent.upgrade().is_none());
    }

    #[test]
    fn identical_contexts_get_identity_mapper() {
        let ctx = display_context();
        let mapper = ctx.get_mapper(&ctx, &ctx).unwrap().unwrap();
        assert_eq!(mapper.name(), "identity");
        let again = ctx.get_mapper(&ctx, &ctx).unwrap().unwrap();
        assert!(Arc::ptr_eq(&mapper, &again));
        assert_eq!(ctx.registered_count(), 1);
    }

    #[test]
    fn unrelated_pair_has_no_direct_mapper() {
        let a = Context::new(PlainBackend::new(MemoryType::Cpu));
        let b = Context::new(PlainBackend::new(MemoryType::Other("Fictitious")));
        let c = display_context();
        assert!(c.get_mapper(&a, &b).unwrap().is_none());
        assert!(a.get_mapper(&a, &b).unwrap().is_none());
    }

    #[test]
    fn registry_entries_do_not_keep_mappers_alive() {
        let ctx = display_context();
        let mapper = ctx.get_mapper(&ctx, &ctx).unwrap().unwrap();
        let weak = Arc::downgrade(&mapper);
        drop(mapper);
        assert!(weak.upgrade().is_none());
        assert_eq!(ctx.registered_count(), 0);
    }
}
