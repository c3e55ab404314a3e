//! Session identifier generation.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of generated session ids, and the maximum accepted by the
/// bundled providers.
pub const SESSION_ID_LEN: usize = 36;

/// Generate a fresh session id: 128 random bits as hyphenated hex.
///
/// Uniqueness is probabilistic. Nothing checks the id against sessions
/// that already exist.
pub fn generate_session_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Reject ids longer than `max` characters.
pub fn validate_session_id(id: &str, max: usize) -> Result<()> {
    if id.len() > max {
        return Err(Error::IdTooLong { len: id.len(), max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_layout() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);

        let groups: Vec<usize> = id.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
        assert!(id.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn test_validate_length() {
        assert!(validate_session_id("abc", SESSION_ID_LEN).is_ok());
        assert!(validate_session_id(&"x".repeat(SESSION_ID_LEN), SESSION_ID_LEN).is_ok());

        let err = validate_session_id(&"x".repeat(37), SESSION_ID_LEN).unwrap_err();
        assert!(matches!(err, Error::IdTooLong { len: 37, max: 36 }));
    }
}
