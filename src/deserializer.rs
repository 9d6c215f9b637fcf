//! Record deserializers turning raw log bytes into tuple values.

use std::fmt;

use serde_json::Value;

/// Converts a raw record into an ordered field sequence.
///
/// Returning `None` marks the record unparseable; the consumer commits the
/// offset and moves on.
pub trait Deserializer: Send + fmt::Debug {
    fn deserialize(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Option<Vec<Value>>;

    /// Field names, aligned with the value sequence, for the host runtime's
    /// output declaration.
    fn output_fields(&self) -> Vec<String>;
}

/// Emits `(key, value)` as UTF-8 strings.
#[derive(Debug, Default)]
pub struct Utf8StringDeserializer;

impl Deserializer for Utf8StringDeserializer {
    fn deserialize(
        &self,
        _topic: &str,
        _partition: i32,
        _offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Option<Vec<Value>> {
        let value = value?;
        let value = std::str::from_utf8(value).ok()?;
        let key = key
            .map(|key| std::str::from_utf8(key).map(Value::from))
            .transpose()
            .ok()?
            .unwrap_or(Value::Null);
        Some(vec![key, Value::from(value)])
    }

    fn output_fields(&self) -> Vec<String> {
        vec!["key".to_string(), "value".to_string()]
    }
}

/// Parses the record value as a JSON document, emitted as a single field.
#[derive(Debug, Default)]
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn deserialize(
        &self,
        _topic: &str,
        _partition: i32,
        _offset: i64,
        _key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Option<Vec<Value>> {
        let value = value?;
        let document: Value = serde_json::from_slice(value).ok()?;
        Some(vec![document])
    }

    fn output_fields(&self) -> Vec<String> {
        vec!["document".to_string()]
    }
}
