//! Input validation for tags, pools and conversation fields.

use std::fmt;

/// Validation error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Empty value where one is required.
    Empty(String),
    /// Value too long.
    TooLong { field: String, max: usize, actual: usize },
    /// Character not allowed in this field.
    InvalidCharacter { field: String, character: char },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Empty(field) => write!(f, "{} cannot be empty", field),
            ValidationError::TooLong { field, max, actual } => {
                write!(f, "{} is too long ({} chars, max {})", field, actual, max)
            }
            ValidationError::InvalidCharacter { field, character } => {
                write!(f, "{} may not contain {:?}", field, character)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Maximum allowed length for pool and tag names.
pub const MAX_TAG_LENGTH: usize = 255;

/// Maximum allowed length for a conversation subject.
pub const MAX_SUBJECT_LENGTH: usize = 255;

/// Maximum allowed length for a conversation type.
pub const MAX_CONVERSATION_TYPE_LENGTH: usize = 64;

fn check_length(field: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
            actual,
        });
    }
    Ok(())
}

/// Validate a pool name.
///
/// Pool names may not contain `:` because tags are displayed as `pool:tag`.
pub fn validate_pool_name(pool: &str) -> Result<(), ValidationError> {
    if pool.trim().is_empty() {
        return Err(ValidationError::Empty("pool name".to_string()));
    }
    check_length("pool name", pool, MAX_TAG_LENGTH)?;
    if pool.contains(':') {
        return Err(ValidationError::InvalidCharacter {
            field: "pool name".to_string(),
            character: ':',
        });
    }
    Ok(())
}

/// Validate a tag name.
pub fn validate_tag_name(tag: &str) -> Result<(), ValidationError> {
    if tag.trim().is_empty() {
        return Err(ValidationError::Empty("tag name".to_string()));
    }
    check_length("tag name", tag, MAX_TAG_LENGTH)
}

/// Validate a conversation subject.
pub fn validate_subject(subject: &str) -> Result<(), ValidationError> {
    check_length("subject", subject, MAX_SUBJECT_LENGTH)
}

/// Validate a conversation type.
///
/// Types name the worker that runs the conversation (`<type>_application`),
/// so only lowercase ASCII letters, digits and `_` are allowed.
pub fn validate_conversation_type(conversation_type: &str) -> Result<(), ValidationError> {
    if conversation_type.is_empty() {
        return Err(ValidationError::Empty("conversation type".to_string()));
    }
    check_length(
        "conversation type",
        conversation_type,
        MAX_CONVERSATION_TYPE_LENGTH,
    )?;
    if let Some(character) = conversation_type
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(ValidationError::InvalidCharacter {
            field: "conversation type".to_string(),
            character,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_name() {
        assert!(validate_pool_name("longcode").is_ok());
        assert_eq!(
            validate_pool_name(""),
            Err(ValidationError::Empty("pool name".to_string()))
        );
        assert!(matches!(
            validate_pool_name("a:b"),
            Err(ValidationError::InvalidCharacter { character: ':', .. })
        ));
    }

    #[test]
    fn test_tag_name() {
        assert!(validate_tag_name("+27831234567").is_ok());
        assert!(validate_tag_name("*120*1#").is_ok());
        assert!(validate_tag_name("  ").is_err());
        let long = "x".repeat(MAX_TAG_LENGTH + 1);
        assert!(matches!(
            validate_tag_name(&long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_conversation_type() {
        assert!(validate_conversation_type("bulk_message").is_ok());
        assert!(validate_conversation_type("multi_survey").is_ok());
        assert!(validate_conversation_type("Bulk").is_err());
        assert!(validate_conversation_type("bulk-message").is_err());
        assert!(validate_conversation_type("").is_err());
    }

    #[test]
    fn test_subject() {
        assert!(validate_subject("").is_ok());
        assert!(validate_subject(&"s".repeat(MAX_SUBJECT_LENGTH)).is_ok());
        assert!(validate_subject(&"s".repeat(MAX_SUBJECT_LENGTH + 1)).is_err());
    }
}
