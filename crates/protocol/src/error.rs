//! Wire format errors.

use thiserror::Error;

/// A room event or record that could not cross the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The value could not be turned into JSON.
    #[error("cannot encode message: {0}")]
    Encode(String),

    /// The bytes are not a valid message.
    #[error("cannot decode message: {0}")]
    Decode(String),

    /// The `data` field is not valid base64.
    #[error("message body is not base64: {0}")]
    InvalidBody(String),
}

/// Result of wire conversions.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;

        match err.classify() {
            Category::Io => ProtocolError::Encode(err.to_string()),
            Category::Syntax | Category::Data | Category::Eof => {
                ProtocolError::Decode(err.to_string())
            }
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidBody(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_json_is_a_decode_error() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>(r#"{"event":"Da"#)
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(err.to_string().starts_with("cannot decode message"));
    }

    #[test]
    fn test_wrong_field_type_is_a_decode_error() {
        let err: ProtocolError = serde_json::from_str::<crate::RoomMessage>(r#"{"event":7}"#)
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_bad_base64_body() {
        use base64::Engine;

        let err: ProtocolError = base64::engine::general_purpose::STANDARD
            .decode("not base64!")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::InvalidBody(_)));
    }

    #[test]
    fn test_error_crosses_threads() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<ProtocolError>();
    }
}
