//! Frames: ordered tensors plus media tags, metadata and region children.
//!
//! A region frame holds its parent strongly; the parent only keeps `Weak`
//! back references to its regions, so ownership always points from child to
//! parent and never forms a cycle.  The stage that carves regions out of a
//! frame owns them.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::dictionary::Dictionary;
use crate::error::{PrismError, Result};
use crate::image::ImageInfo;
use crate::tensor::Tensor;
use crate::types::{Format, MediaType, MemoryType};

/// Selects a tensor of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorIndex {
    /// The only tensor; fails when the frame has several.
    Sole,
    At(usize),
}

/// Pixel rectangle in the coordinates of a frame's first tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Rect {
    pub const fn new(x: usize, y: usize, w: usize, h: usize) -> Self {
        Self { x, y, w, h }
    }
}

pub struct Frame {
    media_type: MediaType,
    format: Format,
    memory_type: MemoryType,
    tensors: Vec<Arc<Tensor>>,
    metadata: Mutex<Vec<Dictionary>>,
    parent: RwLock<Option<Arc<Frame>>>,
    regions: Mutex<Vec<Weak<Frame>>>,
}

impl Frame {
    /// Frame over `tensors`, which must be non-empty, distinct and share one
    /// memory type.
    pub fn new(media_type: MediaType, format: Format, tensors: Vec<Arc<Tensor>>) -> Result<Arc<Self>> {
        let first = tensors
            .first()
            .ok_or_else(|| PrismError::invalid("frame needs at least one tensor"))?;
        let memory_type = first.memory_type();

        for (i, tensor) in tensors.iter().enumerate() {
            if tensor.memory_type() != memory_type {
                return Err(PrismError::TypeMismatch {
                    expected: memory_type,
                    actual: tensor.memory_type(),
                });
            }
            if tensors[..i].iter().any(|t| Arc::ptr_eq(t, tensor)) {
                return Err(PrismError::invalid(format!(
                    "tensor {i} appears more than once in the frame"
                )));
            }
        }

        Ok(Arc::new(Self {
            media_type,
            format,
            memory_type,
            tensors,
            metadata: Mutex::new(Vec::new()),
            parent: RwLock::new(None),
            regions: Mutex::new(Vec::new()),
        }))
    }

    /// Single-tensor frame of generic tensors.
    pub fn from_tensor(tensor: Arc<Tensor>) -> Result<Arc<Self>> {
        Self::new(MediaType::Tensors, 0, vec![tensor])
    }

    #[inline]
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Tensor by position.
    pub fn tensor(&self, index: usize) -> Result<&Arc<Tensor>> {
        self.select(TensorIndex::At(index))
    }

    /// The only tensor of the frame.
    pub fn sole_tensor(&self) -> Result<&Arc<Tensor>> {
        self.select(TensorIndex::Sole)
    }

    pub fn select(&self, index: TensorIndex) -> Result<&Arc<Tensor>> {
        match index {
            TensorIndex::Sole => {
                if self.tensors.len() != 1 {
                    return Err(PrismError::invalid(format!(
                        "frame has {} tensors; an explicit index is required",
                        self.tensors.len()
                    )));
                }
                Ok(&self.tensors[0])
            }
            TensorIndex::At(i) => self.tensors.get(i).ok_or_else(|| {
                PrismError::invalid(format!(
                    "tensor index {i} out of range for {} tensors",
                    self.tensors.len()
                ))
            }),
        }
    }

    /// Tensors in plane order.  Each call starts from the first tensor.
    pub fn tensors(&self) -> std::slice::Iter<'_, Arc<Tensor>> {
        self.tensors.iter()
    }

    // ── Metadata ─────────────────────────────────────────────────────

    /// Ensure an (empty) record named `name` exists.
    pub fn add_metadata(&self, name: &str) {
        let mut metadata = self.metadata.lock();
        if !metadata.iter().any(|d| d.name() == name) {
            metadata.push(Dictionary::new(name));
        }
    }

    /// Insert `dict`, replacing any record with the same name.
    pub fn set_metadata(&self, dict: Dictionary) {
        let mut metadata = self.metadata.lock();
        match metadata.iter_mut().find(|d| d.name() == dict.name()) {
            Some(slot) => *slot = dict,
            None => metadata.push(dict),
        }
    }

    pub fn find_metadata(&self, name: &str) -> Option<Dictionary> {
        self.metadata.lock().iter().find(|d| d.name() == name).cloned()
    }

    /// Mutate the record named `name` in place.
    pub fn with_metadata<R>(&self, name: &str, f: impl FnOnce(&mut Dictionary) -> R) -> Option<R> {
        let mut metadata = self.metadata.lock();
        metadata.iter_mut().find(|d| d.name() == name).map(f)
    }

    pub fn remove_metadata(&self, name: &str) -> Option<Dictionary> {
        let mut metadata = self.metadata.lock();
        let pos = metadata.iter().position(|d| d.name() == name)?;
        Some(metadata.remove(pos))
    }

    pub fn clear_metadata(&self) {
        self.metadata.lock().clear();
    }

    pub fn metadata_names(&self) -> Vec<String> {
        self.metadata
            .lock()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Snapshot of all records.
    pub fn metadata(&self) -> Vec<Dictionary> {
        self.metadata.lock().clone()
    }

    /// Copy every record of `src` onto this frame.
    pub fn copy_metadata_from(&self, src: &Frame) {
        if std::ptr::eq(self, src) {
            return;
        }
        for dict in src.metadata() {
            self.set_metadata(dict);
        }
    }

    // ── Lineage ──────────────────────────────────────────────────────

    pub fn parent(&self) -> Option<Arc<Frame>> {
        self.parent.read().clone()
    }

    /// Fails when `parent` already descends from `self`.
    pub fn set_parent(self: &Arc<Self>, parent: Option<Arc<Frame>>) -> Result<()> {
        if let Some(candidate) = &parent {
            let mut cursor = Some(Arc::clone(candidate));
            while let Some(node) = cursor {
                if Arc::ptr_eq(&node, self) {
                    return Err(PrismError::invalid("frame parent link would form a cycle"));
                }
                cursor = node.parent();
            }
        }
        *self.parent.write() = parent;
        Ok(())
    }

    pub fn clear_parent(&self) {
        *self.parent.write() = None;
    }

    /// Live regions, in the order they were added.
    pub fn regions(&self) -> Vec<Arc<Frame>> {
        let mut regions = self.regions.lock();
        regions.retain(|weak| weak.strong_count() > 0);
        regions.iter().filter_map(Weak::upgrade).collect()
    }

    /// Record `region` as carved out of this frame and link its parent.
    pub fn add_region(self: &Arc<Self>, region: &Arc<Frame>) -> Result<()> {
        region.set_parent(Some(Arc::clone(self)))?;
        let mut regions = self.regions.lock();
        regions.retain(|weak| weak.strong_count() > 0);
        regions.push(Arc::downgrade(region));
        Ok(())
    }

    pub fn clear_regions(&self) {
        self.regions.lock().clear();
    }

    /// Region frame over `rect` of every tensor of `parent`, without copying.
    ///
    /// Planes with a lower resolution than the first tensor (chroma planes)
    /// are sliced with the rectangle scaled to their size.  Each sliced tensor
    /// keeps the matching parent tensor alive.
    pub fn region(parent: &Arc<Frame>, rect: Rect) -> Result<Arc<Frame>> {
        if rect.w == 0 || rect.h == 0 {
            return Err(PrismError::invalid(format!("empty region {rect:?}")));
        }
        let base = ImageInfo::new(parent.tensor(0)?.info())?;
        let (base_w, base_h) = (base.width(), base.height());
        if rect.x + rect.w > base_w || rect.y + rect.h > base_h {
            return Err(PrismError::invalid(format!(
                "region {rect:?} exceeds {base_w}x{base_h} frame"
            )));
        }

        let tensors = parent
            .tensors()
            .map(|tensor| {
                let image = ImageInfo::new(tensor.info())?;
                let (w, h) = (image.width(), image.height());
                let x0 = rect.x * w / base_w;
                let y0 = rect.y * h / base_h;
                let x1 = ((rect.x + rect.w) * w).div_ceil(base_w);
                let y1 = ((rect.y + rect.h) * h).div_ceil(base_h);
                tensor.slice_region(y0..y1, x0..x1)
            })
            .collect::<Result<Vec<_>>>()?;

        let region = Frame::new(parent.media_type(), parent.format(), tensors)?;
        parent.add_region(&region)?;
        Ok(region)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("media_type", &self.media_type)
            .field("format", &self.format)
            .field("memory_type", &self.memory_type)
            .field("tensors", &self.tensors)
            .field("metadata", &self.metadata_names())
            .field("has_parent", &self.parent.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_info::TensorInfo;
    use crate::types::{DataType, ImageFormat, keys};

    fn surface(id: isize, shape: &[usize]) -> Arc<Tensor> {
        Tensor::builder(TensorInfo::new(shape.to_vec(), DataType::UInt8), MemoryType::Vaapi)
            .handle(keys::VA_SURFACE_ID, id)
            .build()
            .unwrap()
    }

    fn nv12(id: isize) -> Arc<Frame> {
        Frame::new(
            MediaType::Image,
            ImageFormat::Nv12.code(),
            vec![surface(id, &[64, 64, 1]), surface(id, &[32, 32, 2])],
        )
        .unwrap()
    }

    #[test]
    fn sole_tensor_requires_single_tensor() {
        let single = Frame::from_tensor(surface(1, &[8, 8])).unwrap();
        assert!(single.sole_tensor().is_ok());

        let frame = nv12(2);
        assert!(frame.sole_tensor().is_err());
        assert!(frame.select(TensorIndex::At(0)).is_ok());
        assert_eq!(frame.tensor(1).unwrap().info().shape(), &[32, 32, 2]);
        assert!(frame.tensor(2).is_err());
    }

    #[test]
    fn tensors_iteration_is_restartable() {
        let frame = nv12(3);
        assert_eq!(frame.tensors().count(), 2);
        assert_eq!(frame.tensors().count(), 2);
        assert_eq!(frame.num_tensors(), 2);
    }

    #[test]
    fn mixed_memory_types_are_rejected() {
        let mut backing = vec![0u8; 4];
        let info = TensorInfo::new([4], DataType::UInt8);
        // SAFETY: `backing` outlives `cpu` in this test.
        let cpu = unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(backing.as_mut_ptr()) }
            .build()
            .unwrap();
        let err = Frame::new(MediaType::Tensors, 0, vec![surface(1, &[4]), cpu])
            .expect_err("mixed memory");
        assert!(matches!(err, PrismError::TypeMismatch { .. }));
    }

    #[test]
    fn duplicate_tensors_are_rejected() {
        let t = surface(1, &[4]);
        assert!(Frame::new(MediaType::Tensors, 0, vec![t.clone(), t]).is_err());
        assert!(Frame::new(MediaType::Tensors, 0, Vec::new()).is_err());
    }

    #[test]
    fn metadata_records() {
        let frame = nv12(4);
        frame.add_metadata("object_id");
        frame.with_metadata("object_id", |d| {
            d.set("id", 7);
        });
        let mut ts = Dictionary::new("timestamp");
        ts.set("pts", 1_000i64);
        frame.set_metadata(ts);

        assert_eq!(frame.metadata_names(), ["object_id", "timestamp"]);
        assert_eq!(
            frame.find_metadata("object_id").unwrap().get::<i32>("id").unwrap(),
            7
        );
        assert!(frame.remove_metadata("object_id").is_some());
        assert!(frame.find_metadata("object_id").is_none());
        frame.clear_metadata();
        assert!(frame.metadata().is_empty());
    }

    #[test]
    fn region_slices_every_plane_and_links_parent() {
        let frame = nv12(5);
        let region = Frame::region(&frame, Rect::new(8, 16, 32, 16)).unwrap();

        assert!(Arc::ptr_eq(&region.parent().unwrap(), &frame));
        assert_eq!(region.tensor(0).unwrap().info().shape(), &[16, 32, 1]);
        assert_eq!(region.tensor(1).unwrap().info().shape(), &[8, 16, 2]);
        for (plane, source) in region.tensors().zip(frame.tensors()) {
            assert!(Arc::ptr_eq(&plane.parent().unwrap(), source));
        }
        assert_eq!(frame.regions().len(), 1);

        drop(region);
        assert!(frame.regions().is_empty());
    }

    #[test]
    fn region_out_of_bounds() {
        let frame = nv12(6);
        assert!(Frame::region(&frame, Rect::new(60, 0, 8, 8)).is_err());
        assert!(Frame::region(&frame, Rect::new(0, 0, 0, 8)).is_err());
    }

    #[test]
    fn frame_parent_cycle_rejected() {
        let a = nv12(7);
        let b = Frame::region(&a, Rect::new(0, 0, 8, 8)).unwrap();
        assert!(a.set_parent(Some(b.clone())).is_err());
    }
}
