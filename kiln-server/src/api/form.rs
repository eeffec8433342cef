//! Multipart form collection shared by the upload endpoints.

use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::Multipart;

use crate::error::ApiError;

#[derive(Debug)]
pub struct Upload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Default)]
pub struct Form {
    files: HashMap<String, Upload>,
    fields: HashMap<String, String>,
}

impl Form {
    /// Reads every part. Parts named in `file_fields` are kept as raw uploads,
    /// all others are read as text.
    pub async fn read(mut multipart: Multipart, file_fields: &[&str]) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if file_fields.contains(&name.as_str()) {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await?;
                form.files.insert(
                    name,
                    Upload {
                        filename,
                        content_type,
                        bytes,
                    },
                );
            } else {
                let text = field.text().await?;
                form.fields.insert(name, text);
            }
        }
        Ok(form)
    }

    pub fn take_file(&mut self, name: &str) -> Option<Upload> {
        self.files.remove(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Parses an optional field. Blank values fall back to `default`.
    pub fn parse_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, ApiError> {
        match self.text(name).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("{name} must be a valid number, got '{raw}'"))),
        }
    }

    /// Like [`Form::parse_or`] for booleans in the usual form spellings.
    pub fn flag_or(&self, name: &str, default: bool) -> Result<bool, ApiError> {
        match self.text(name).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(raw) => Err(ApiError::bad_request(format!(
                "{name} must be a boolean, got '{raw}'"
            ))),
        }
    }
}
