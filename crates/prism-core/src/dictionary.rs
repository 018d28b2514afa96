//! Named metadata records of typed values.

use std::sync::Arc;

use serde_json::{Map, Value as Json, json};

use crate::error::{PrismError, Result};
use crate::tensor::Tensor;

/// One typed metadata value.
#[derive(Clone, Debug)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
    SizeVec(Vec<usize>),
    StringVec(Vec<String>),
    /// Raw byte array owned by the record.
    Bytes(Vec<u8>),
    /// Reference to a tensor (e.g. a raw inference output).
    Tensor(Arc<Tensor>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::IntVec(_) => "int vector",
            Self::FloatVec(_) => "float vector",
            Self::SizeVec(_) => "size vector",
            Self::StringVec(_) => "string vector",
            Self::Bytes(_) => "bytes",
            Self::Tensor(_) => "tensor",
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Self::Int(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::Bool(v) => json!(v),
            Self::String(v) => json!(v),
            Self::IntVec(v) => json!(v),
            Self::FloatVec(v) => json!(v),
            Self::SizeVec(v) => json!(v),
            Self::StringVec(v) => json!(v),
            Self::Bytes(v) => json!(v.len()),
            Self::Tensor(t) => json!(t.info().to_string()),
        }
    }
}

/// Conversion out of a [`Value`] for typed getters.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    )*};
}

value_conversions! {
    i64 => Int,
    f64 => Float,
    bool => Bool,
    String => String,
    Vec<i64> => IntVec,
    Vec<f64> => FloatVec,
    Vec<usize> => SizeVec,
    Vec<String> => StringVec,
    Vec<u8> => Bytes,
    Arc<Tensor> => Tensor,
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Named, insertion-ordered set of typed key/value entries.
#[derive(Clone, Debug, Default)]
pub struct Dictionary {
    name: String,
    entries: Vec<(String, Value)>,
}

impl Dictionary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Insert or replace `key`, keeping its original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    /// `None` when the key is absent or holds a different kind.
    pub fn try_get<T: FromValue>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(T::from_value)
    }

    pub fn get<T: FromValue>(&self, key: &str) -> Result<T> {
        let value = self.value(key).ok_or_else(|| {
            PrismError::invalid(format!("metadata '{}' has no field '{key}'", self.name))
        })?;
        T::from_value(value).ok_or_else(|| {
            PrismError::invalid(format!(
                "metadata '{}' field '{key}' holds a {} of unexpected type",
                self.name,
                value.kind()
            ))
        })
    }

    pub fn get_or<T: FromValue>(&self, key: &str, default: T) -> T {
        self.try_get(key).unwrap_or(default)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object of this record's fields.  Tensors are rendered as their
    /// info string and byte arrays as their length.
    pub fn to_json(&self) -> Json {
        let fields: Map<String, Json> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Json::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access() {
        let mut dict = Dictionary::new("detection");
        dict.set("x_min", 0.25).set("label_id", 3).set("label", "car");

        assert_eq!(dict.get::<f64>("x_min").unwrap(), 0.25);
        assert_eq!(dict.get::<i32>("label_id").unwrap(), 3);
        assert_eq!(dict.get::<String>("label").unwrap(), "car");
        assert_eq!(dict.try_get::<String>("x_min"), None);
        assert_eq!(dict.get_or::<i64>("parent_id", -1), -1);

        let err = dict.get::<bool>("label").expect_err("wrong kind must fail");
        match err {
            PrismError::InvalidArgument(msg) => assert!(msg.contains("string")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn replace_keeps_position() {
        let mut dict = Dictionary::new("r");
        dict.set("a", 1).set("b", 2).set("a", 10);
        assert_eq!(dict.keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(dict.get::<i64>("a").unwrap(), 10);
        assert!(dict.remove("a").is_some());
        assert!(!dict.contains("a"));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn json_export() {
        let mut dict = Dictionary::new("tensor");
        dict.set("layer_name", "prob")
            .set("dims", vec![1usize, 1000])
            .set("data_buffer", vec![0u8; 16]);
        let json = dict.to_json();
        assert_eq!(json["layer_name"], "prob");
        assert_eq!(json["dims"], json!([1, 1000]));
        assert_eq!(json["data_buffer"], 16);
    }
}
