//! Side-effect free request checks shared by every service.
//!
//! Each helper returns a [`ClientError`] naming the field and the allowed
//! range or set, so endpoints can hand the message back unchanged.

use std::fmt::Display;

use crate::{ClientError, ClientErrorKind};

pub type Validation = std::result::Result<(), ClientError>;

pub const MIB: usize = 1024 * 1024;

pub fn ensure_range<T>(field: &'static str, value: T, min: T, max: T) -> Validation
where
    T: PartialOrd + Display,
{
    if value >= min && value <= max {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::OutOfRange,
        field,
        format!("{field} must be between {min} and {max}"),
    ))
}

pub fn ensure_max_bytes(field: &'static str, len: usize, max_mb: usize) -> Validation {
    if len <= max_mb * MIB {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::PayloadTooLarge,
        field,
        format!(
            "File size ({:.1}MB) exceeds maximum allowed size ({max_mb}MB)",
            len as f64 / MIB as f64
        ),
    ))
}

pub fn ensure_not_blank(field: &'static str, label: &str, value: &str) -> Validation {
    if !value.trim().is_empty() {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::Empty,
        field,
        format!("{label} cannot be empty"),
    ))
}

/// Length is counted in characters, not bytes.
pub fn ensure_max_chars(field: &'static str, label: &str, value: &str, max: usize) -> Validation {
    if value.chars().count() <= max {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::TooLong,
        field,
        format!("{label} too long. Maximum length is {max} characters"),
    ))
}

pub fn ensure_one_of(field: &'static str, value: &str, allowed: &[&str]) -> Validation {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::InvalidChoice,
        field,
        format!("Invalid {field} '{value}'. Choose from: {}", allowed.join(", ")),
    ))
}

pub fn ensure_multiple_of(field: &'static str, value: u32, stride: u32) -> Validation {
    if stride == 0 || value % stride == 0 {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::OutOfRange,
        field,
        format!("{field} must be a multiple of {stride}"),
    ))
}

/// Case-insensitive check of a filename's extension.
///
/// `allowed` entries may be written with or without the leading dot.
pub fn ensure_extension(field: &'static str, filename: &str, allowed: &[&str]) -> Validation {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    let matches = extension.as_deref().is_some_and(|ext| {
        allowed
            .iter()
            .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext))
    });
    if matches {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::UnsupportedFormat,
        field,
        format!("Unsupported file format. Supported formats: {}", allowed.join(", ")),
    ))
}

pub fn require_filename<'a>(field: &'static str, filename: Option<&'a str>) -> Result<&'a str, ClientError> {
    match filename.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ClientError::new(
            ClientErrorKind::Missing,
            field,
            "No file uploaded",
        )),
    }
}
