//! Validation helpers for DTOs.

use serde_json::Value;
use validator::ValidationError;

/// Largest serialized action payload accepted, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024;

/// Validates that an action payload is present and reasonably small.
///
/// # Examples
///
/// ```ignore
/// validate_action_payload(&json!({"target": "…"})) // Ok
/// validate_action_payload(&Value::Null)           // Err - empty
/// ```
pub fn validate_action_payload(payload: &Value) -> Result<(), ValidationError> {
    if payload.is_null() {
        let mut err = ValidationError::new("payload_missing");
        err.message = Some("Action payload must not be null".into());
        return Err(err);
    }

    let size = payload.to_string().len();
    if size > MAX_PAYLOAD_BYTES {
        let mut err = ValidationError::new("payload_size");
        err.message = Some(
            format!("Action payload must not exceed {MAX_PAYLOAD_BYTES} bytes (got {size})").into(),
        );
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_validate_action_payload_valid() {
        assert!(validate_action_payload(&json!({"target": "abc"})).is_ok());
        assert!(validate_action_payload(&json!("free text")).is_ok());
        assert!(validate_action_payload(&json!(false)).is_ok());
    }

    #[test]
    fn test_validate_action_payload_null() {
        assert!(validate_action_payload(&Value::Null).is_err());
    }

    #[test]
    fn test_validate_action_payload_too_large() {
        let text = "x".repeat(MAX_PAYLOAD_BYTES);
        assert!(validate_action_payload(&json!({ "answer": text })).is_err());
    }
}
