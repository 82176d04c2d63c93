use reqwest::multipart::{Form, Part};
use std::sync::Arc;

use crate::error::{Result, TryOnError};

/// One value of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Arc<Vec<u8>>,
        file_name: String,
        mime: String,
    },
}

/// Inspectable description of a multipart request body.
///
/// `reqwest` forms are single-use, so submissions keep this description
/// around and rebuild the body for each retry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormSpec {
    parts: Vec<(String, FormValue)>,
}

impl FormSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text field.
    pub fn text(mut self, name: &str, value: impl ToString) -> Self {
        self.parts.push((name.to_string(), FormValue::Text(value.to_string())));
        self
    }

    /// Append a file field.
    pub fn file(mut self, name: &str, bytes: Arc<Vec<u8>>, file_name: &str, mime: &str) -> Self {
        self.parts.push((
            name.to_string(),
            FormValue::File {
                bytes,
                file_name: file_name.to_string(),
                mime: mime.to_string(),
            },
        ));
        self
    }

    /// Replace every field called `name` with a single text value.
    pub fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.parts.retain(|(n, _)| n != name);
        self.text(name, value)
    }

    pub fn has(&self, name: &str) -> bool {
        self.parts.iter().any(|(n, _)| n == name)
    }

    /// First text value of `name`.
    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|(n, v)| match v {
            FormValue::Text(t) if n == name => Some(t.as_str()),
            _ => None,
        })
    }

    /// File names of every file field called `name`, in order.
    pub fn file_names(&self, name: &str) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|(n, v)| match v {
                FormValue::File { file_name, .. } if n == name => Some(file_name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.parts.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Build a fresh `reqwest` multipart body.
    pub fn to_multipart(&self) -> Result<Form> {
        let mut form = Form::new();
        for (name, value) in &self.parts {
            form = match value {
                FormValue::Text(t) => form.text(name.clone(), t.clone()),
                FormValue::File {
                    bytes,
                    file_name,
                    mime,
                } => {
                    let part = Part::bytes(bytes.as_ref().clone())
                        .file_name(file_name.clone())
                        .mime_str(mime)
                        .map_err(|e| {
                            TryOnError::Validation(format!("Invalid MIME type '{}': {}", mime, e))
                        })?;
                    form.part(name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}
