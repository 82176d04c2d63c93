use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::artifact::InputImage;

/// How input files are identified for caching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// `name|size|mtime`, what a browser file picker can report cheaply.
    /// Two distinct files sharing all three collide.
    Metadata,
    /// SHA-256 of the file bytes.
    #[default]
    ContentDigest,
}

/// Cache key identifying one input file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    pub fn of(image: &InputImage, mode: SignatureMode) -> Self {
        match mode {
            SignatureMode::Metadata => Signature(format!(
                "{}|{}|{}",
                image.name,
                image.size(),
                image.modified_millis()
            )),
            SignatureMode::ContentDigest => {
                let digest = Sha256::digest(image.bytes.as_slice());
                Signature(format!("sha256:{}", hex::encode(digest)))
            }
        }
    }

    /// Wrap an externally computed key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Signature(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the padded-garment cache: both inputs must match for a hit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairSignature {
    pub subject: Signature,
    pub garment: Signature,
}

impl PairSignature {
    pub fn new(subject: Signature, garment: Signature) -> Self {
        Self { subject, garment }
    }
}
