//! Payload codecs
//!
//! Command payloads and result values are carried as `serde_json::Value`
//! inside the process and turned into bytes only at the transport boundary.

use std::any::Any;

use serde::Serialize;
use serde_json::Value;

use crate::command::{Command, ShapeDescriptor};
use crate::error::CommandError;

/// Turns values into envelope bytes and back
pub trait PayloadCodec: Send + Sync {
    /// Human-readable name for this codec
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CommandError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CommandError>;
}

/// JSON payloads via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CommandError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a typed command for the wire
pub fn encode_command<C: Command>(
    codec: &dyn PayloadCodec,
    command: &C,
) -> Result<Vec<u8>, CommandError> {
    encode_value(codec, command)
}

/// Encode any serializable value for the wire
pub fn encode_value<T: Serialize + ?Sized>(
    codec: &dyn PayloadCodec,
    value: &T,
) -> Result<Vec<u8>, CommandError> {
    let value = serde_json::to_value(value)?;
    codec.encode(&value)
}

/// Decode wire bytes into the concrete command described by `shape`
pub fn decode_command(
    codec: &dyn PayloadCodec,
    bytes: &[u8],
    shape: &ShapeDescriptor,
) -> Result<Box<dyn Any + Send>, CommandError> {
    let value = codec.decode(bytes)?;
    shape.decode(value).map_err(|e| {
        CommandError::Codec(format!("payload does not match `{}`: {e}", shape.tag()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddElement {
        element: String,
    }

    impl Command for AddElement {
        const TYPE: &'static str = "add_new_element";
    }

    #[test]
    fn test_decode_command_uses_shape() {
        let bytes = encode_command(&JsonCodec, &AddElement { element: "test-elem".into() })
            .expect("encode");

        let shape = ShapeDescriptor::of::<AddElement>();
        let decoded = decode_command(&JsonCodec, &bytes, &shape).expect("decode");
        let decoded = decoded.downcast::<AddElement>().expect("concrete type");
        assert_eq!(decoded.element, "test-elem");
    }

    #[test]
    fn test_mismatched_payload_is_codec_error() {
        let shape = ShapeDescriptor::of::<AddElement>();
        let err = decode_command(&JsonCodec, br#"{"other": 1}"#, &shape).expect_err("mismatch");
        assert!(matches!(err, CommandError::Codec(ref m) if m.contains("add_new_element")));
    }

    #[test]
    fn test_empty_bytes_decode_to_null() {
        assert_eq!(JsonCodec.decode(&[]).expect("decode"), Value::Null);
    }

    #[test]
    fn test_invalid_json_is_codec_error() {
        assert!(matches!(JsonCodec.decode(b"{not json"), Err(CommandError::Codec(_))));
    }
}
