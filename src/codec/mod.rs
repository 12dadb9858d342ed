//! Message encoders for the wire boundary between sources, sinks, and the
//! engine.
use serde_json::{Map, Value};

use crate::{Error, Message};

/// Encoder/decoder pair turning messages into bytes and back.
pub trait MessageEncoder: Send + Sync {
    /// MIME type of the encoded representation.
    fn mime_type(&self) -> &str;

    /// Encodes a message's payload into bytes.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error>;

    /// Decodes bytes into a message; `type_name` supplies the type tag for
    /// formats that do not carry one.
    fn decode(&self, bytes: &[u8], type_name: Option<&str>) -> Result<Message, Error>;
}

/// JSON encoder: the payload is the JSON body; the type tag is set by the
/// caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    /// Embeds a message payload directly as a JSON value, for transports that
    /// carry JSON natively rather than bytes.
    pub fn to_json_embedding(&self, message: &Message) -> Value {
        message.payload.clone()
    }

    /// Builds a message from an embedded JSON value.
    pub fn from_json_embedding(&self, value: Value, type_name: Option<&str>) -> Message {
        Message::new(type_name.unwrap_or_default(), value)
    }
}

impl MessageEncoder for JsonEncoder {
    fn mime_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&message.payload)?)
    }

    fn decode(&self, bytes: &[u8], type_name: Option<&str>) -> Result<Message, Error> {
        let payload: Value = serde_json::from_slice(bytes)?;
        Ok(Message::new(type_name.unwrap_or_default(), payload))
    }
}

/// CSV encoder mapping payload fields to positional columns by configured
/// headers. An empty header skips its column in both directions.
#[derive(Clone, Debug, Default)]
pub struct CsvEncoder {
    headers: Vec<String>,
}

impl CsvEncoder {
    /// Builds an encoder over the given column headers.
    pub fn new(headers: Vec<String>) -> Self {
        CsvEncoder { headers }
    }

    fn render_field(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn parse_field(field: &str) -> Value {
        if field.is_empty() {
            return Value::Null;
        }
        // numbers and booleans survive the round trip; everything else is a string
        serde_json::from_str::<Value>(field)
            .ok()
            .filter(|v| v.is_number() || v.is_boolean())
            .unwrap_or_else(|| Value::String(field.to_string()))
    }
}

impl MessageEncoder for CsvEncoder {
    fn mime_type(&self) -> &str {
        "text/csv"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error> {
        let object = message.payload.as_object().ok_or_else(|| {
            Error::EncodingError("csv encoding requires an object payload".into())
        })?;
        let row: Vec<String> = self
            .headers
            .iter()
            .filter(|header| !header.is_empty())
            .map(|header| Self::render_field(object.get(header)))
            .collect();
        Ok(row.join(",").into_bytes())
    }

    fn decode(&self, bytes: &[u8], type_name: Option<&str>) -> Result<Message, Error> {
        let row = std::str::from_utf8(bytes)
            .map_err(|e| Error::EncodingError(format!("csv row is not utf-8: {e}")))?;
        let columns: Vec<&str> = if row.is_empty() {
            Vec::new()
        } else {
            row.split(',').collect()
        };
        if columns.len() > self.headers.len() {
            return Err(Error::EncodingError(format!(
                "csv row has {} columns but only {} headers are configured",
                columns.len(),
                self.headers.len()
            )));
        }
        let mut payload = Map::new();
        for (header, column) in self.headers.iter().zip(columns) {
            if header.is_empty() {
                continue;
            }
            let _ = payload.insert(header.clone(), Self::parse_field(column));
        }
        Ok(Message::new(
            type_name.unwrap_or_default(),
            Value::Object(payload),
        ))
    }
}

/// Pass-through encoder for payloads that are already raw bytes, carried as a
/// string payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEncoder;

impl MessageEncoder for NullEncoder {
    fn mime_type(&self) -> &str {
        "application/octet-stream"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error> {
        match &message.payload {
            Value::String(s) => Ok(s.clone().into_bytes()),
            other => Err(Error::EncodingError(format!(
                "pass-through encoding requires a string payload, got {other}"
            ))),
        }
    }

    fn decode(&self, bytes: &[u8], type_name: Option<&str>) -> Result<Message, Error> {
        let body = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::EncodingError(format!("payload is not utf-8: {e}")))?;
        Ok(Message::new(type_name.unwrap_or_default(), Value::String(body)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let encoder = JsonEncoder;
        let message = Message::new("orders.Created", json!({ "id": 7, "total": 12.5 }));
        let bytes = encoder.encode(&message).expect("encode");
        let decoded = encoder.decode(&bytes, Some("orders.Created")).expect("decode");
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.mtype, "orders.Created");
    }

    #[test]
    fn json_embedding_round_trip() {
        let encoder = JsonEncoder;
        let message = Message::new("orders.Created", json!({ "id": 7 }));
        let embedded = encoder.to_json_embedding(&message);
        let rebuilt = encoder.from_json_embedding(embedded, Some("orders.Created"));
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn csv_round_trip() {
        let encoder = CsvEncoder::new(vec!["id".into(), "name".into(), "active".into()]);
        let message = Message::new(
            "users.Created",
            json!({ "id": 3, "name": "ada", "active": true }),
        );
        let bytes = encoder.encode(&message).expect("encode");
        assert_eq!(bytes, b"3,ada,true");
        let decoded = encoder.decode(&bytes, Some("users.Created")).expect("decode");
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn csv_empty_header_skips_column() {
        let encoder = CsvEncoder::new(vec!["id".into(), String::new(), "name".into()]);
        let decoded = encoder.decode(b"3,ignored,ada", None).expect("decode");
        assert_eq!(decoded.payload, json!({ "id": 3, "name": "ada" }));
    }

    #[test]
    fn csv_too_many_columns_fails() {
        let encoder = CsvEncoder::new(vec!["id".into(), "name".into()]);
        let result = encoder.decode(b"3,ada,extra", None);
        assert!(matches!(result, Err(Error::EncodingError(_))));
    }

    #[test]
    fn csv_short_row_fills_known_columns() {
        let encoder = CsvEncoder::new(vec!["id".into(), "name".into(), "active".into()]);
        let decoded = encoder.decode(b"3,ada", None).expect("decode");
        assert_eq!(decoded.payload, json!({ "id": 3, "name": "ada" }));
    }

    #[test]
    fn null_encoder_passes_bytes_through() {
        let encoder = NullEncoder;
        let message = Message::new("raw.Blob", json!("payload-bytes"));
        let bytes = encoder.encode(&message).expect("encode");
        assert_eq!(bytes, b"payload-bytes");
        let decoded = encoder.decode(&bytes, Some("raw.Blob")).expect("decode");
        assert_eq!(decoded.payload, json!("payload-bytes"));
    }

    #[test]
    fn null_encoder_rejects_structured_payloads() {
        let encoder = NullEncoder;
        let message = Message::new("raw.Blob", json!({ "not": "bytes" }));
        assert!(matches!(
            encoder.encode(&message),
            Err(Error::EncodingError(_))
        ));
    }
}
