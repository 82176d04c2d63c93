use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Result, TryOnError};

/// A user-selected image file: its bytes plus the identifying metadata the
/// file picker exposes.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    pub modified: Option<SystemTime>,
}

impl InputImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::new(bytes),
            modified: None,
        }
    }

    /// Set the modification time used by metadata signatures.
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Read a file from disk, keeping its name and mtime.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        Ok(Self {
            name,
            bytes: Arc::new(bytes),
            modified,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Modification time in milliseconds since the epoch, 0 when unknown.
    pub fn modified_millis(&self) -> u128 {
        self.modified
            .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

/// Displayable/uploadable image content.
///
/// Local bytes, base64 data URIs and remote URLs are interchangeable from the
/// flow's point of view; only the transport differs.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageArtifact {
    Bytes { data: Arc<Vec<u8>>, mime: String },
    DataUri(String),
    Url(String),
}

impl ImageArtifact {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime = sniff_mime(&data).unwrap_or("image/png").to_string();
        ImageArtifact::Bytes {
            data: Arc::new(data),
            mime,
        }
    }

    /// Classify a string payload from the backend: `data:` URIs stay inline,
    /// `http(s)` URLs are remote, and a bare base64 body is wrapped as a data
    /// URI of the sniffed type. A leading `/` is a relative URL only when the
    /// text does not decode to an image header (bare JPEG base64 starts with
    /// `/9j/`).
    pub fn from_payload(payload: &str) -> Self {
        let trimmed = payload.trim();
        if trimmed.starts_with("data:") {
            return ImageArtifact::DataUri(trimmed.to_string());
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return ImageArtifact::Url(trimmed.to_string());
        }
        match sniff_base64_mime(trimmed) {
            Some(mime) => ImageArtifact::DataUri(format!("data:{};base64,{}", mime, trimmed)),
            None if trimmed.starts_with('/') => ImageArtifact::Url(trimmed.to_string()),
            None => ImageArtifact::DataUri(format!("data:image/png;base64,{}", trimmed)),
        }
    }

    pub fn is_remote_url(&self) -> bool {
        matches!(self, ImageArtifact::Url(_))
    }

    /// Bytes available without touching the network; `None` for URLs.
    pub fn local_bytes(&self) -> Result<Option<Vec<u8>>> {
        match self {
            ImageArtifact::Bytes { data, .. } => Ok(Some(data.as_ref().clone())),
            ImageArtifact::DataUri(uri) => decode_data_uri(uri).map(Some),
            ImageArtifact::Url(_) => Ok(None),
        }
    }

    /// Approximate payload size in bytes, used to reject thumbnails.
    pub fn approx_len(&self) -> usize {
        match self {
            ImageArtifact::Bytes { data, .. } => data.len(),
            ImageArtifact::DataUri(uri) => {
                let body = uri.split_once(',').map(|(_, b)| b).unwrap_or(uri);
                body.len() / 4 * 3
            }
            ImageArtifact::Url(_) => usize::MAX,
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            ImageArtifact::Bytes { mime, .. } => mime,
            ImageArtifact::DataUri(uri) => uri
                .strip_prefix("data:")
                .and_then(|rest| rest.split([';', ',']).next())
                .filter(|m| !m.is_empty())
                .unwrap_or("image/png"),
            ImageArtifact::Url(_) => "image/png",
        }
    }
}

/// Image type of a bare base64 body, judged from its first 12 decoded bytes.
fn sniff_base64_mime(body: &str) -> Option<&'static str> {
    let head: String = body.chars().filter(|c| !c.is_whitespace()).take(16).collect();
    let decoded = STANDARD.decode(head).ok()?;
    sniff_mime(&decoded)
}

/// Decode the body of a base64 `data:` URI.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let (header, body) = uri
        .split_once(',')
        .ok_or_else(|| TryOnError::InvalidResponse("Malformed data URI".into()))?;
    if !header.ends_with(";base64") {
        return Err(TryOnError::InvalidResponse(
            "Only base64 data URIs are supported".into(),
        ));
    }
    STANDARD
        .decode(body.trim())
        .map_err(|e| TryOnError::InvalidResponse(format!("Invalid base64 image: {}", e)))
}

/// Encode bytes as a base64 `data:` URI.
pub fn encode_data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Detect PNG, JPEG and WebP by their magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// A download bound to a full-resolution result, independent of whatever
/// preview the render layer displays.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub file_name: String,
    pub artifact: ImageArtifact,
}

impl DownloadHandle {
    /// Name the download `<prefix>-<utc timestamp>.png`.
    pub fn new(prefix: &str, artifact: ImageArtifact) -> Self {
        let ts = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        Self {
            file_name: format!("{}-{}.png", prefix, ts),
            artifact,
        }
    }

    /// Write the payload into `dir`. URL artifacts must be materialised by
    /// the caller first (see `TryOnClient::fetch_image`).
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        let bytes = self.artifact.local_bytes()?.ok_or_else(|| {
            TryOnError::Validation("Remote result must be fetched before saving".into())
        })?;
        let path = dir.join(&self.file_name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_classification() {
        assert!(ImageArtifact::from_payload("https://x/y.png").is_remote_url());
        assert!(ImageArtifact::from_payload("/files/y.png").is_remote_url());
        assert!(ImageArtifact::from_payload("/files/result_0001.png").is_remote_url());
        assert!(matches!(
            ImageArtifact::from_payload("data:image/jpeg;base64,AAAA"),
            ImageArtifact::DataUri(_)
        ));
        match ImageArtifact::from_payload("iVBORw0KGgo=") {
            ImageArtifact::DataUri(uri) => assert!(uri.starts_with("data:image/png;base64,")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_jpeg_base64_is_inline() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00];
        let body = STANDARD.encode(jpeg);
        assert!(body.starts_with("/9j/"));

        let artifact = ImageArtifact::from_payload(&body);
        assert!(!artifact.is_remote_url());
        assert_eq!(artifact.mime(), "image/jpeg");
        assert_eq!(artifact.local_bytes().unwrap().unwrap(), jpeg.to_vec());
    }

    #[test]
    fn test_bare_webp_base64_gets_webp_mime() {
        let body = STANDARD.encode(b"RIFF\x24\0\0\0WEBPVP8 ");
        assert_eq!(ImageArtifact::from_payload(&body).mime(), "image/webp");
    }

    #[test]
    fn test_data_uri_roundtrip_and_mime() {
        let uri = encode_data_uri(b"hello", "image/jpeg");
        assert_eq!(decode_data_uri(&uri).unwrap(), b"hello");
        assert_eq!(ImageArtifact::DataUri(uri).mime(), "image/jpeg");
    }

    #[test]
    fn test_malformed_data_uri() {
        assert!(decode_data_uri("data:image/png;base64").is_err());
        assert!(decode_data_uri("data:text/plain,hello").is_err());
    }

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0D]), Some("image/png"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"GIF89a"), None);
    }

    #[test]
    fn test_url_has_no_local_bytes() {
        let a = ImageArtifact::Url("https://x/y.png".into());
        assert!(a.local_bytes().unwrap().is_none());
        assert_eq!(a.approx_len(), usize::MAX);
    }

    #[test]
    fn test_download_handle_saves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DownloadHandle::new("final", ImageArtifact::from_bytes(vec![1, 2, 3]));
        assert!(handle.file_name.starts_with("final-"));
        assert!(handle.file_name.ends_with(".png"));
        let path = handle.save_to(dir.path()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_input_image_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("person.png");
        std::fs::write(&path, [7u8; 16]).unwrap();
        let img = InputImage::from_path(&path).unwrap();
        assert_eq!(img.name, "person.png");
        assert_eq!(img.size(), 16);
        assert!(img.modified_millis() > 0);
    }
}
