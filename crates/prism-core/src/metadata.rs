//! Well-known metadata records attached to frames.
//!
//! Each record is a typed view over a [`Dictionary`] with a fixed name.
//! Readers tolerate unknown keys and fall back to defaults for optional ones.

use std::sync::Arc;

use crate::dictionary::Dictionary;
use crate::error::{PrismError, Result};
use crate::frame::{Frame, Rect};
use crate::tensor::Tensor;
use crate::tensor_info::TensorInfo;
use crate::types::DataType;

/// Typed record stored as a named dictionary.
pub trait MetadataRecord: Sized {
    const NAME: &'static str;

    fn to_dict(&self) -> Dictionary;

    fn from_dict(dict: &Dictionary) -> Result<Self>;
}

impl Frame {
    /// Attach `record`, replacing a previous record of the same kind.
    pub fn attach<T: MetadataRecord>(&self, record: &T) {
        self.set_metadata(record.to_dict());
    }

    /// Read the record of kind `T`, if attached.
    pub fn record<T: MetadataRecord>(&self) -> Result<Option<T>> {
        self.find_metadata(T::NAME)
            .map(|dict| T::from_dict(&dict))
            .transpose()
    }
}

fn check_name(dict: &Dictionary, name: &str) -> Result<()> {
    if dict.name() != name {
        return Err(PrismError::invalid(format!(
            "expected '{name}' metadata, got '{}'",
            dict.name()
        )));
    }
    Ok(())
}

// ─── Timestamp ───────────────────────────────────────────────────────────────

/// Presentation/decode timestamps in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampMetadata {
    pub pts: i64,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
}

impl MetadataRecord for TimestampMetadata {
    const NAME: &'static str = "timestamp";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("pts", self.pts);
        if let Some(dts) = self.dts {
            dict.set("dts", dts);
        }
        if let Some(duration) = self.duration {
            dict.set("duration", duration);
        }
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        Ok(Self {
            pts: dict.get("pts")?,
            dts: dict.try_get("dts"),
            duration: dict.try_get("duration"),
        })
    }
}

// ─── Detection ───────────────────────────────────────────────────────────────

/// Detected object with a normalized bounding box.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionMetadata {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    pub confidence: Option<f64>,
    /// `-1` when absent.
    pub id: i32,
    /// `-1` when absent.
    pub parent_id: i32,
    /// `-1` when absent.
    pub label_id: i32,
    pub label: String,
}

impl DetectionMetadata {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence: None,
            id: -1,
            parent_id: -1,
            label_id: -1,
            label: String::new(),
        }
    }

    /// Bounding box in pixels of a `width x height` frame, clamped to it.
    pub fn pixel_rect(&self, width: usize, height: usize) -> Rect {
        let clamp = |v: f64, max: usize| (v.clamp(0.0, 1.0) * max as f64).round() as usize;
        let x0 = clamp(self.x_min, width);
        let y0 = clamp(self.y_min, height);
        let x1 = clamp(self.x_max, width).max(x0);
        let y1 = clamp(self.y_max, height).max(y0);
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

impl MetadataRecord for DetectionMetadata {
    const NAME: &'static str = "detection";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("x_min", self.x_min)
            .set("y_min", self.y_min)
            .set("x_max", self.x_max)
            .set("y_max", self.y_max);
        if let Some(confidence) = self.confidence {
            dict.set("confidence", confidence);
        }
        if self.id >= 0 {
            dict.set("id", self.id);
        }
        if self.parent_id >= 0 {
            dict.set("parent_id", self.parent_id);
        }
        if self.label_id >= 0 {
            dict.set("label_id", self.label_id);
        }
        if !self.label.is_empty() {
            dict.set("label", self.label.as_str());
        }
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        Ok(Self {
            x_min: dict.get("x_min")?,
            y_min: dict.get("y_min")?,
            x_max: dict.get("x_max")?,
            y_max: dict.get("y_max")?,
            confidence: dict.try_get("confidence"),
            id: dict.get_or("id", -1),
            parent_id: dict.get_or("parent_id", -1),
            label_id: dict.get_or("label_id", -1),
            label: dict.get_or("label", String::new()),
        })
    }
}

// ─── Classification ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassificationMetadata {
    pub label: String,
    pub label_id: i32,
    pub confidence: f64,
}

impl MetadataRecord for ClassificationMetadata {
    const NAME: &'static str = "classification";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("label", self.label.as_str())
            .set("label_id", self.label_id)
            .set("confidence", self.confidence);
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        Ok(Self {
            label: dict.get("label")?,
            label_id: dict.get("label_id")?,
            confidence: dict.get("confidence")?,
        })
    }
}

// ─── Object id ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectIdMetadata {
    pub id: i32,
}

impl MetadataRecord for ObjectIdMetadata {
    const NAME: &'static str = "object_id";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("id", self.id);
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        Ok(Self {
            id: dict.get("id")?,
        })
    }
}

// ─── Source identifier ───────────────────────────────────────────────────────

/// Identifies which input stream, batch slot and region a frame came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceIdentifierMetadata {
    pub batch_index: i32,
    pub pts: i64,
    pub stream_id: i64,
    pub roi_id: i32,
    pub object_id: i32,
}

impl MetadataRecord for SourceIdentifierMetadata {
    const NAME: &'static str = "SourceIdentifierMetadata";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("batch_index", self.batch_index)
            .set("pts", self.pts)
            .set("stream_id", self.stream_id)
            .set("roi_id", self.roi_id)
            .set("object_id", self.object_id);
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        Ok(Self {
            batch_index: dict.get("batch_index")?,
            pts: dict.get("pts")?,
            stream_id: dict.get("stream_id")?,
            roi_id: dict.get_or("roi_id", 0),
            object_id: dict.get_or("object_id", 0),
        })
    }
}

// ─── Affine transform ────────────────────────────────────────────────────────

/// Row-major 2x3 matrix mapping normalized destination coordinates back to
/// normalized source coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransformMetadata {
    pub matrix: [f64; 6],
}

impl Default for AffineTransformMetadata {
    fn default() -> Self {
        Self {
            matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    }
}

impl AffineTransformMetadata {
    /// Transform for a crop of `src_rect` (in a `src_w x src_h` source)
    /// resized into `dst_rect` of a `dst_w x dst_h` destination.
    pub fn from_rect(
        (src_w, src_h): (f64, f64),
        (dst_w, dst_h): (f64, f64),
        src_rect: Rect,
        dst_rect: Rect,
    ) -> Result<Self> {
        if src_w == 0.0 || src_h == 0.0 || dst_rect.w == 0 || dst_rect.h == 0 {
            return Err(PrismError::invalid("affine transform over an empty rectangle"));
        }
        let (sx, sy, sw, sh) = (
            src_rect.x as f64,
            src_rect.y as f64,
            src_rect.w as f64,
            src_rect.h as f64,
        );
        let (dx, dy, dw, dh) = (
            dst_rect.x as f64,
            dst_rect.y as f64,
            dst_rect.w as f64,
            dst_rect.h as f64,
        );
        Ok(Self {
            matrix: [
                (dst_w * sw) / (src_w * dw),
                0.0,
                sx / src_w - (dx * sw) / (dw * src_w),
                0.0,
                (dst_h * sh) / (src_h * dh),
                sy / src_h - (dy * sh) / (dh * src_h),
            ],
        })
    }

    /// Map a normalized destination point to normalized source coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.matrix;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }
}

impl MetadataRecord for AffineTransformMetadata {
    const NAME: &'static str = "AffineTransformMetadata";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("matrix", self.matrix.to_vec());
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        let values: Vec<f64> = dict.get("matrix")?;
        let matrix: [f64; 6] = values.try_into().map_err(|v: Vec<f64>| {
            PrismError::invalid(format!("affine matrix has {} values, expected 6", v.len()))
        })?;
        Ok(Self { matrix })
    }
}

// ─── Inference result ────────────────────────────────────────────────────────

/// Raw output layer of an inference model.
#[derive(Clone, Debug)]
pub struct InferenceResultMetadata {
    pub model_name: String,
    pub layer_name: String,
    pub format: String,
    pub dims: Vec<usize>,
    pub precision: DataType,
    /// Output tensor; exported as its info string.
    pub data: Option<Arc<Tensor>>,
}

impl InferenceResultMetadata {
    pub fn from_tensor(
        model_name: impl Into<String>,
        layer_name: impl Into<String>,
        tensor: Arc<Tensor>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            layer_name: layer_name.into(),
            format: String::new(),
            dims: tensor.info().shape().to_vec(),
            precision: tensor.info().dtype(),
            data: Some(tensor),
        }
    }

    pub fn info(&self) -> TensorInfo {
        TensorInfo::new(self.dims.clone(), self.precision)
    }
}

impl MetadataRecord for InferenceResultMetadata {
    const NAME: &'static str = "tensor";

    fn to_dict(&self) -> Dictionary {
        let mut dict = Dictionary::new(Self::NAME);
        dict.set("model_name", self.model_name.as_str())
            .set("layer_name", self.layer_name.as_str())
            .set("dims", self.dims.clone())
            .set("precision", self.precision.as_str());
        if !self.format.is_empty() {
            dict.set("format", self.format.as_str());
        }
        if let Some(tensor) = &self.data {
            dict.set("data", Arc::clone(tensor));
        }
        dict
    }

    fn from_dict(dict: &Dictionary) -> Result<Self> {
        check_name(dict, Self::NAME)?;
        let precision: String = dict.get("precision")?;
        Ok(Self {
            model_name: dict.get_or("model_name", String::new()),
            layer_name: dict.get("layer_name")?,
            format: dict.get_or("format", String::new()),
            dims: dict.get("dims")?,
            precision: precision.parse()?,
            data: dict.try_get("data"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaType, MemoryType, keys};

    fn frame() -> Arc<Frame> {
        let tensor = Tensor::builder(TensorInfo::new([8, 8], DataType::UInt8), MemoryType::Dma)
            .handle(keys::DMA_FD, 3)
            .build()
            .unwrap();
        Frame::new(MediaType::Image, 0, vec![tensor]).unwrap()
    }

    #[test]
    fn detection_optional_fields_default() {
        let mut dict = Dictionary::new("detection");
        dict.set("x_min", 0.1)
            .set("y_min", 0.2)
            .set("x_max", 0.5)
            .set("y_max", 0.6)
            .set("tracker_state", "new");
        let det = DetectionMetadata::from_dict(&dict).unwrap();
        assert_eq!(det.id, -1);
        assert_eq!(det.label_id, -1);
        assert_eq!(det.confidence, None);
        assert!(det.label.is_empty());
    }

    #[test]
    fn records_round_trip_through_frames() {
        let frame = frame();
        let mut det = DetectionMetadata::new(0.25, 0.25, 0.75, 1.5);
        det.label = "person".into();
        det.confidence = Some(0.9);
        frame.attach(&det);
        frame.attach(&TimestampMetadata {
            pts: 40_000_000,
            dts: None,
            duration: Some(40_000_000),
        });

        let back: DetectionMetadata = frame.record().unwrap().unwrap();
        assert_eq!(back, det);
        assert_eq!(back.pixel_rect(100, 100), Rect::new(25, 25, 50, 75));

        let ts: TimestampMetadata = frame.record().unwrap().unwrap();
        assert_eq!(ts.duration, Some(40_000_000));
        assert!(frame.record::<ObjectIdMetadata>().unwrap().is_none());
    }

    #[test]
    fn affine_transform_maps_crop_corners() {
        let transform = AffineTransformMetadata::from_rect(
            (200.0, 100.0),
            (50.0, 50.0),
            Rect::new(100, 50, 100, 50),
            Rect::new(0, 0, 50, 50),
        )
        .unwrap();
        let (x, y) = transform.apply(0.0, 0.0);
        assert!((x - 0.5).abs() < 1e-9 && (y - 0.5).abs() < 1e-9);
        let (x, y) = transform.apply(1.0, 1.0);
        assert!((x - 1.0).abs() < 1e-9 && (y - 1.0).abs() < 1e-9);

        let back = AffineTransformMetadata::from_dict(&transform.to_dict()).unwrap();
        assert_eq!(back, transform);
    }

    #[test]
    fn inference_result_exports_tensor_info() {
        let tensor = Tensor::builder(TensorInfo::new([1, 1000], DataType::Float32), MemoryType::Dma)
            .handle(keys::DMA_FD, 4)
            .build()
            .unwrap();
        let result = InferenceResultMetadata::from_tensor("resnet", "prob", tensor);
        let dict = result.to_dict();
        assert_eq!(dict.to_json()["data"], "float32, 1:1000");

        let back = InferenceResultMetadata::from_dict(&dict).unwrap();
        assert_eq!(back.info(), TensorInfo::new([1, 1000], DataType::Float32));
        assert!(back.data.is_some());
    }

    #[test]
    fn wrong_record_name_is_rejected() {
        let dict = Dictionary::new("classification");
        assert!(ObjectIdMetadata::from_dict(&dict).is_err());
    }
}
