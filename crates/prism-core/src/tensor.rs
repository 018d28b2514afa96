//! Tensors: one memory region, its layout, its backend tag and native handles.
//!
//! # Ownership
//!
//! A tensor produced by a mapper or by slicing keeps its source alive through
//! [`Tensor::parent`].  The native resource a tensor allocated itself (a host
//! allocation, a surface, an fd) is held in an owned guard that is dropped
//! together with the tensor, so every error path that drops a half-built
//! tensor also releases what it allocated.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::context::Context;
use crate::error::{PrismError, Result};
use crate::image::ImageInfo;
use crate::tensor_info::TensorInfo;
use crate::types::{Handle, MemoryType, keys};

/// How a tensor refers to its context.
///
/// Mapped tensors hold their context strongly.  Tensors stored inside a
/// context-owned pool hold it weakly so the pool does not keep its own
/// context alive.
#[derive(Clone, Default)]
pub enum ContextRef {
    #[default]
    None,
    Strong(Arc<Context>),
    Weak(Weak<Context>),
}

impl ContextRef {
    pub fn get(&self) -> Option<Arc<Context>> {
        match self {
            Self::None => None,
            Self::Strong(ctx) => Some(Arc::clone(ctx)),
            Self::Weak(ctx) => ctx.upgrade(),
        }
    }
}

/// Native resource released when the owning tensor drops.
pub type OwnedResource = Box<dyn Any + Send + Sync>;

pub struct Tensor {
    memory_type: MemoryType,
    info: TensorInfo,
    context: ContextRef,
    parent: RwLock<Option<Arc<Tensor>>>,
    handles: BTreeMap<String, Handle>,
    primary: String,
    host_ptr: Option<NonNull<u8>>,
    offset: usize,
    resource: Option<OwnedResource>,
}

// SAFETY: `host_ptr` points into memory kept alive by `resource` or by the
// parent chain; the tensor never hands out `&mut` aliases to it, and every
// other field is Send + Sync.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl Tensor {
    pub fn builder(info: TensorInfo, memory_type: MemoryType) -> TensorBuilder {
        TensorBuilder {
            info,
            memory_type,
            context: ContextRef::None,
            handles: BTreeMap::new(),
            first_key: None,
            primary: None,
            host_ptr: None,
            offset: 0,
            resource: None,
            parent: None,
        }
    }

    #[inline]
    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Owning context, if any and still alive.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.get()
    }

    pub(crate) fn context_ref(&self) -> &ContextRef {
        &self.context
    }

    pub fn parent(&self) -> Option<Arc<Tensor>> {
        self.parent.read().clone()
    }

    /// Link `parent` as the object this tensor extends the lifetime of.
    ///
    /// Fails when `parent` already descends from `self`.
    pub fn set_parent(self: &Arc<Self>, parent: Option<Arc<Tensor>>) -> Result<()> {
        if let Some(candidate) = &parent {
            let mut cursor = Some(Arc::clone(candidate));
            while let Some(node) = cursor {
                if Arc::ptr_eq(&node, self) {
                    return Err(PrismError::invalid("tensor parent link would form a cycle"));
                }
                cursor = node.parent();
            }
        }
        *self.parent.write() = parent;
        Ok(())
    }

    /// Drop the parent link.
    pub fn clear_parent(&self) {
        *self.parent.write() = None;
    }

    /// Native handle by key.  An empty key returns the primary handle.
    pub fn handle(&self, key: &str) -> Result<Handle> {
        let key = if key.is_empty() { &self.primary } else { key };
        self.handles
            .get(key)
            .copied()
            .ok_or_else(|| PrismError::handle_not_found(key))
    }

    pub fn handle_or(&self, key: &str, default: Handle) -> Handle {
        self.handle(key).unwrap_or(default)
    }

    #[inline]
    pub fn primary_key(&self) -> &str {
        &self.primary
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// The native resource this tensor owns, if it is a `T`.  Views created
    /// by slicing own nothing; look at the parent instead.
    pub fn resource<T: Any>(&self) -> Option<&T> {
        self.resource.as_deref()?.downcast_ref::<T>()
    }

    /// Host pointer to the first element, with any slice offset applied.
    pub fn data(&self) -> Result<*mut u8> {
        self.host_ptr
            .map(NonNull::as_ptr)
            .ok_or(PrismError::NotHostAddressable(self.memory_type))
    }

    /// Byte offset of this view from the start of the underlying allocation.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn nbytes(&self) -> usize {
        self.info.nbytes()
    }

    /// Bytes a mapping must cover from [`offset`](Self::offset) for every
    /// element of this view to be addressable.
    #[inline]
    pub fn span(&self) -> usize {
        self.info.span()
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.info.is_contiguous()
    }

    /// Zero-copy view over `ranges`, one per leading dimension.  Missing
    /// trailing dimensions are taken whole.
    pub fn slice(self: &Arc<Self>, ranges: &[Range<usize>]) -> Result<Arc<Tensor>> {
        let shape = self.info.shape();
        if ranges.len() > shape.len() {
            return Err(PrismError::invalid(format!(
                "{} slice ranges for a rank-{} tensor",
                ranges.len(),
                shape.len()
            )));
        }

        let mut new_shape = shape.to_vec();
        let mut delta = 0usize;
        for (dim, range) in ranges.iter().enumerate() {
            if range.start >= range.end || range.end > shape[dim] {
                return Err(PrismError::invalid(format!(
                    "slice {range:?} out of bounds for dimension {dim} of size {}",
                    shape[dim]
                )));
            }
            new_shape[dim] = range.end - range.start;
            delta = range
                .start
                .checked_mul(self.info.stride()[dim])
                .and_then(|step| delta.checked_add(step))
                .ok_or_else(|| PrismError::invalid("slice offset overflows usize"))?;
        }
        let offset = self
            .offset
            .checked_add(delta)
            .ok_or_else(|| PrismError::invalid("slice offset overflows usize"))?;

        let mut handles = self.handles.clone();
        let host_ptr = match self.host_ptr {
            Some(ptr) => {
                if let Some(primary) = handles.get_mut(&self.primary) {
                    *primary += delta as Handle;
                }
                // SAFETY: `delta` is the byte offset of an in-bounds element,
                // so the result stays inside the parent's allocation.
                Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(delta)) })
            }
            None => {
                handles.insert(keys::OFFSET.to_string(), offset as Handle);
                None
            }
        };

        Ok(Arc::new(Tensor {
            memory_type: self.memory_type,
            info: self.info.reshaped(new_shape),
            context: self.context.clone(),
            parent: RwLock::new(Some(Arc::clone(self))),
            handles,
            primary: self.primary.clone(),
            host_ptr,
            offset,
            resource: None,
        }))
    }

    /// Zero-copy view over rows `y` and columns `x` of an image tensor.
    pub fn slice_region(self: &Arc<Self>, y: Range<usize>, x: Range<usize>) -> Result<Arc<Tensor>> {
        let image = ImageInfo::new(&self.info)?;
        let (h, w) = image.spatial_dims();
        let mut ranges: Vec<Range<usize>> = self.info.shape().iter().map(|&d| 0..d).collect();
        ranges[h] = y;
        ranges[w] = x;
        self.slice(&ranges)
    }

    /// Copy the tensor's bytes out in row-major order, padding excluded.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let base = self.data()?;
        let mut out = Vec::with_capacity(self.info.size() * self.info.dtype().size());
        self.info.for_each_run(|offset, len| {
            // SAFETY: every run lies inside `span()` bytes from `base`, which
            // the `host_ptr` contract keeps valid while `self` is alive.
            let run = unsafe { std::slice::from_raw_parts(base.add(offset), len) };
            out.extend_from_slice(run);
        });
        Ok(out)
    }

    /// Overwrite the tensor's elements from row-major `bytes`.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let expected = self.info.size() * self.info.dtype().size();
        if bytes.len() != expected {
            return Err(PrismError::invalid(format!(
                "write of {} bytes into a tensor of {expected} bytes",
                bytes.len()
            )));
        }
        let base = self.data()?;
        let mut cursor = 0usize;
        self.info.for_each_run(|offset, len| {
            // SAFETY: as in `read_bytes`; callers own write access to the
            // mapping by contract of the access mode they mapped with.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(cursor), base.add(offset), len);
            }
            cursor += len;
        });
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("memory_type", &self.memory_type)
            .field("info", &self.info.to_string())
            .field("primary", &self.primary)
            .field("handles", &self.handles)
            .field("offset", &self.offset)
            .field("has_parent", &self.parent.read().is_some())
            .finish()
    }
}

/// Builder returned by [`Tensor::builder`].
pub struct TensorBuilder {
    info: TensorInfo,
    memory_type: MemoryType,
    context: ContextRef,
    handles: BTreeMap<String, Handle>,
    first_key: Option<String>,
    primary: Option<String>,
    host_ptr: Option<*mut u8>,
    offset: usize,
    resource: Option<OwnedResource>,
    parent: Option<Arc<Tensor>>,
}

impl TensorBuilder {
    pub fn context(mut self, context: &Arc<Context>) -> Self {
        self.context = ContextRef::Strong(Arc::clone(context));
        self
    }

    pub fn weak_context(mut self, context: &Arc<Context>) -> Self {
        self.context = ContextRef::Weak(Arc::downgrade(context));
        self
    }

    pub fn context_ref(mut self, context: ContextRef) -> Self {
        self.context = context;
        self
    }

    pub fn handle(mut self, key: impl Into<String>, handle: Handle) -> Self {
        let key = key.into();
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.handles.insert(key, handle);
        self
    }

    /// Make `key` the primary handle instead of the first one added.
    pub fn primary(mut self, key: impl Into<String>) -> Self {
        self.primary = Some(key.into());
        self
    }

    /// Host pointer for CPU-addressable memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `info.span()` bytes for as
    /// long as the built tensor, or any view sliced from it, is alive.  In
    /// practice the memory is owned by the resource handed to
    /// [`owning`](Self::owning) or by the parent tensor.
    pub unsafe fn host_ptr(mut self, ptr: *mut u8) -> Self {
        self.host_ptr = Some(ptr);
        self
    }

    /// Hand ownership of the native resource backing this tensor to it.
    pub fn owning(mut self, resource: impl Any + Send + Sync) -> Self {
        self.resource = Some(Box::new(resource));
        self
    }

    pub fn parent(mut self, parent: &Arc<Tensor>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self) -> Result<Arc<Tensor>> {
        let Self {
            info,
            memory_type,
            context,
            mut handles,
            first_key,
            primary,
            host_ptr,
            offset,
            resource,
            parent,
        } = self;

        if memory_type == MemoryType::Any {
            return Err(PrismError::invalid("tensor memory type must be concrete"));
        }

        let host_ptr = match host_ptr {
            Some(ptr) => Some(
                NonNull::new(ptr)
                    .ok_or_else(|| PrismError::invalid("null host pointer for tensor"))?,
            ),
            None => None,
        };

        let primary = match (primary, first_key, host_ptr) {
            (Some(key), _, _) => key,
            (None, Some(key), _) => key,
            (None, None, Some(ptr)) => {
                handles.insert(keys::DATA.to_string(), ptr.as_ptr() as Handle);
                keys::DATA.to_string()
            }
            (None, None, None) => {
                return Err(PrismError::invalid(format!(
                    "{memory_type} tensor needs at least one native handle"
                )));
            }
        };
        if !handles.contains_key(&primary) {
            return Err(PrismError::handle_not_found(&primary));
        }

        Ok(Arc::new(Tensor {
            memory_type,
            info,
            context,
            parent: RwLock::new(parent),
            handles,
            primary,
            host_ptr,
            offset,
            resource,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn host_tensor(shape: &[usize]) -> (Arc<Tensor>, Vec<u8>) {
        let info = TensorInfo::new(shape.to_vec(), DataType::UInt8);
        let mut backing: Vec<u8> = (0..info.nbytes()).map(|i| i as u8).collect();
        let ptr = backing.as_mut_ptr();
        // SAFETY: the caller keeps `backing` alive alongside the tensor, and
        // moving the Vec does not move its heap buffer.
        let tensor = unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(ptr) }
            .build()
            .unwrap();
        (tensor, backing)
    }

    #[test]
    fn host_pointer_becomes_primary_data_handle() {
        let (tensor, backing) = host_tensor(&[4, 4]);
        assert_eq!(tensor.primary_key(), keys::DATA);
        assert_eq!(tensor.handle("").unwrap(), backing.as_ptr() as Handle);
        assert_eq!(tensor.handle(keys::DATA).unwrap(), tensor.handle("").unwrap());
        assert_eq!(tensor.data().unwrap() as *const u8, backing.as_ptr());
    }

    #[test]
    fn unknown_handle_key_is_not_found() {
        let (tensor, _backing) = host_tensor(&[2, 2]);
        let err = tensor.handle("dma_fd").expect_err("key was never set");
        match err {
            PrismError::HandleNotFound { key } => assert_eq!(key, "dma_fd"),
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert_eq!(tensor.handle_or("dma_fd", -1), -1);
    }

    #[test]
    fn device_memory_has_no_data_pointer() {
        let info = TensorInfo::new([8, 8], DataType::UInt8);
        let tensor = Tensor::builder(info, MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, 7)
            .build()
            .unwrap();
        assert_eq!(tensor.handle("").unwrap(), 7);
        match tensor.data().expect_err("surfaces are not host addressable") {
            PrismError::NotHostAddressable(MemoryType::Vaapi) => {}
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn builder_rejects_missing_handles() {
        let info = TensorInfo::new([2], DataType::UInt8);
        assert!(Tensor::builder(info.clone(), MemoryType::Dma).build().is_err());
        // SAFETY: a null pointer is rejected by `build` and never read.
        let null = unsafe {
            Tensor::builder(info.clone(), MemoryType::Cpu).host_ptr(std::ptr::null_mut())
        };
        assert!(null.build().is_err());
        let err = Tensor::builder(info, MemoryType::Dma)
            .handle(keys::DMA_FD, 3)
            .primary("nope")
            .build()
            .expect_err("primary must name a handle");
        assert!(matches!(err, PrismError::HandleNotFound { .. }));
    }

    #[test]
    fn region_slice_offsets_primary_handle_without_copying() {
        let (tensor, _backing) = host_tensor(&[100, 100]);
        let region = tensor.slice_region(10..40, 20..60).unwrap();

        assert_eq!(region.info().shape(), &[30, 40]);
        assert_eq!(region.info().stride(), &[100, 1]);
        assert!(!region.is_contiguous());

        let expected = 10 * 100 + 20;
        assert_eq!(
            region.handle("").unwrap() - tensor.handle("").unwrap(),
            expected as Handle
        );
        assert_eq!(region.offset() - tensor.offset(), expected);
        assert_eq!(
            region.data().unwrap() as usize - tensor.data().unwrap() as usize,
            expected
        );
        assert!(Arc::ptr_eq(&region.parent().unwrap(), &tensor));
    }

    #[test]
    fn slicing_device_memory_tracks_offset_handle() {
        let info = TensorInfo::new([64, 64, 3], DataType::UInt8);
        let tensor = Tensor::builder(info, MemoryType::Dma)
            .handle(keys::DMA_FD, 11)
            .build()
            .unwrap();
        let region = tensor.slice_region(2..4, 1..3).unwrap();
        assert_eq!(region.info().shape(), &[2, 2, 3]);
        assert_eq!(region.handle("").unwrap(), 11);
        assert_eq!(region.handle(keys::OFFSET).unwrap(), (2 * 192 + 3) as Handle);
    }

    #[test]
    fn slice_offset_past_usize_is_rejected() {
        let info = TensorInfo::new([4], DataType::UInt8);
        let tensor = Tensor::builder(info, MemoryType::Dma)
            .handle(keys::DMA_FD, 7)
            .offset(usize::MAX - 1)
            .build()
            .unwrap();
        assert!(tensor.slice(&[1..2]).is_ok());
        let err = tensor.slice(&[2..4]).expect_err("offset overflows");
        match err {
            PrismError::InvalidArgument(msg) => assert!(msg.contains("overflows")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_slices_fail() {
        let (tensor, _backing) = host_tensor(&[10, 10]);
        assert!(tensor.slice(&[5..11]).is_err());
        assert!(tensor.slice(&[4..4]).is_err());
        assert!(tensor.slice(&[0..1, 0..1, 0..1]).is_err());
    }

    #[test]
    fn strided_read_skips_padding() {
        let (tensor, _backing) = host_tensor(&[4, 4]);
        let region = tensor.slice(&[1..3, 1..3]).unwrap();
        assert_eq!(region.read_bytes().unwrap(), vec![5, 6, 9, 10]);

        region.write_bytes(&[0xA, 0xB, 0xC, 0xD]).unwrap();
        let full = tensor.read_bytes().unwrap();
        assert_eq!(&full[4..8], &[4, 0xA, 0xB, 7]);
        assert_eq!(&full[8..12], &[8, 0xC, 0xD, 11]);
    }

    #[test]
    fn parent_cycles_are_rejected() {
        let (a, _backing) = host_tensor(&[4, 4]);
        let b = a.slice(&[0..2]).unwrap();
        let err = a.set_parent(Some(Arc::clone(&b))).expect_err("a -> b -> a");
        assert!(matches!(err, PrismError::InvalidArgument(_)));
        b.clear_parent();
        assert!(b.parent().is_none());
    }

    #[test]
    fn owned_resource_drops_with_tensor() {
        let marker = Arc::new(());
        let info = TensorInfo::new([1], DataType::UInt8);
        let tensor = Tensor::builder(info, MemoryType::Dma)
            .handle(keys::DMA_FD, 5)
            .owning(Arc::clone(&marker))
            .build()
            .unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);
        assert!(tensor.resource::<Arc<()>>().is_some());
        assert!(tensor.resource::<String>().is_none());
        drop(tensor);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
