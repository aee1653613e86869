//! Validation of caller supplied names, identifiers and topics.
//!
//! Everything here runs before any network action. A failure is final and is
//! never retried: the caller has to fix the input.
//!
//! Names are restricted to ASCII letters, digits and spaces. Slugs, object ids and
//! unique ids are derived from a name and are therefore never re-derived from an
//! already derived id (`object_id("lamp_1")` fails, `object_id("lamp")` is stable).

use thiserror::Error;

/// Errors for malformed caller input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid discovery prefix: {0:?}")]
    InvalidDiscoveryPrefix(String),

    #[error("Invalid component type: {0:?}")]
    InvalidComponentType(String),

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Invalid URL: {0:?}")]
    InvalidUrl(String),

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Validates a device or entity name (`[a-zA-Z0-9 ]+`).
pub fn name(name: &str) -> Result<String, ValidationError> {
    let valid = !name.is_empty()
        && !name.trim().is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ');
    if valid {
        Ok(name.to_string())
    } else {
        Err(ValidationError::InvalidName(name.to_string()))
    }
}

/// Like [`name`], but an empty string is accepted (optional metadata).
pub fn optional_name(value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        Ok(String::new())
    } else {
        name(value)
    }
}

/// Lowercase, hyphen separated form of a valid name.
pub fn slug(value: &str) -> Result<String, ValidationError> {
    let value = name(value)?;
    let words: Vec<String> = value
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_lowercase())
        .collect();
    Ok(words.join("-"))
}

/// Home Assistant object id: the slug with `_` separators.
pub fn object_id(value: &str) -> Result<String, ValidationError> {
    Ok(slug(value)?.replace('-', "_"))
}

/// Unique ids are derived exactly like object ids.
pub fn unique_id(value: &str) -> Result<String, ValidationError> {
    object_id(value)
}

/// Like [`object_id`], but an empty string is accepted.
pub fn optional_object_id(value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        Ok(String::new())
    } else if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        // already derived ids (e.g. a parent device's object id) pass through
        Ok(value.to_string())
    } else {
        object_id(value)
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn discovery_prefix(value: &str) -> Result<String, ValidationError> {
    if is_identifier(value) {
        Ok(value.to_string())
    } else {
        Err(ValidationError::InvalidDiscoveryPrefix(value.to_string()))
    }
}

pub fn component_type(value: &str) -> Result<String, ValidationError> {
    if is_identifier(value) {
        Ok(value.to_string())
    } else {
        Err(ValidationError::InvalidComponentType(value.to_string()))
    }
}

/// A publishable topic: at least two `/` separated levels of `[a-zA-Z0-9_-]`.
/// Wildcards are rejected.
pub fn topic(value: &str) -> Result<String, ValidationError> {
    let levels: Vec<&str> = value.split('/').collect();
    let valid = levels.len() >= 2
        && levels.iter().all(|level| {
            !level.is_empty()
                && level
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(value.to_string())
    } else {
        Err(ValidationError::InvalidTopic(value.to_string()))
    }
}

/// Empty, or an absolute `http`/`https` URL without whitespace.
pub fn url(value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Ok(String::new());
    }
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    match rest {
        Some(rest)
            if !rest.is_empty()
                && !rest.starts_with('/')
                && !value.chars().any(char::is_whitespace) =>
        {
            Ok(value.to_string())
        }
        _ => Err(ValidationError::InvalidUrl(value.to_string())),
    }
}

/// Empty, or a version like `1.2.3`, `2024.1-beta+7`.
pub fn version_string(value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Ok(String::new());
    }
    let starts_alphanumeric = value
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let valid = starts_alphanumeric
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if valid {
        Ok(value.to_string())
    } else {
        Err(ValidationError::InvalidVersion(value.to_string()))
    }
}
