// Response payload classification.
// Decodes a response body according to its declared content type.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, SyncError};

use super::connector::HttpResponse;

/// How a response body should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Binary,
    Text,
}

impl ContentKind {
    /// Classify a `Content-Type` header value. Unknown kinds decode as binary.
    pub fn classify(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return ContentKind::Binary;
        };
        // Drop parameters such as `; charset=utf-8`.
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime == "application/json" || mime.ends_with("+json") {
            ContentKind::Json
        } else if mime.starts_with("text/") {
            ContentKind::Text
        } else {
            // audio/*, video/*, image/*, application/octet-stream and anything unrecognized
            ContentKind::Binary
        }
    }
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn decode(response: HttpResponse) -> Result<Self> {
        // No Content
        if response.status == 204 {
            return Ok(Payload::Json(Value::Null));
        }

        match ContentKind::classify(response.content_type.as_deref()) {
            ContentKind::Json if response.body.is_empty() => Ok(Payload::Json(Value::Null)),
            ContentKind::Json => Ok(Payload::Json(serde_json::from_slice(&response.body)?)),
            ContentKind::Text => Ok(Payload::Text(match String::from_utf8(response.body) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            })),
            ContentKind::Binary => Ok(Payload::Binary(response.body)),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Payload::Json(_) => ContentKind::Json,
            Payload::Binary(_) => ContentKind::Binary,
            Payload::Text(_) => ContentKind::Text,
        }
    }

    /// Structured data, or `Value::Null` for non-JSON payloads.
    pub fn into_value(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
            Payload::Binary(_) => Value::Null,
        }
    }

    /// Deserialize a JSON payload into a typed value.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            other => Err(SyncError::RequestFailed(format!(
                "expected JSON response, got {:?}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content_type: Option<&str>, body: &[u8]) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: content_type.map(str::to_string),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(ContentKind::classify(Some("application/json")), ContentKind::Json);
        assert_eq!(
            ContentKind::classify(Some("application/json; charset=utf-8")),
            ContentKind::Json
        );
        assert_eq!(
            ContentKind::classify(Some("application/problem+json")),
            ContentKind::Json
        );
        assert_eq!(ContentKind::classify(Some("text/csv")), ContentKind::Text);
        assert_eq!(ContentKind::classify(Some("audio/mpeg")), ContentKind::Binary);
        assert_eq!(ContentKind::classify(Some("image/png")), ContentKind::Binary);
        assert_eq!(
            ContentKind::classify(Some("application/octet-stream")),
            ContentKind::Binary
        );
        assert_eq!(ContentKind::classify(Some("application/pdf")), ContentKind::Binary);
        assert_eq!(ContentKind::classify(None), ContentKind::Binary);
    }

    #[test]
    fn test_decode_json() {
        let payload = Payload::decode(response(Some("application/json"), br#"{"id":"42"}"#)).unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"id": "42"})));
    }

    #[test]
    fn test_decode_no_content() {
        let mut resp = response(None, b"");
        resp.status = 204;
        assert_eq!(Payload::decode(resp).unwrap(), Payload::Json(Value::Null));
    }

    #[test]
    fn test_decode_text_and_binary() {
        let text = Payload::decode(response(Some("text/plain"), b"hello")).unwrap();
        assert_eq!(text, Payload::Text("hello".into()));

        let audio = Payload::decode(response(Some("audio/wav"), &[1, 2, 3])).unwrap();
        assert_eq!(audio, Payload::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn test_malformed_json_is_error() {
        let err = Payload::decode(response(Some("application/json"), b"{oops")).unwrap_err();
        assert!(matches!(err, SyncError::Json(_)));
    }
}
