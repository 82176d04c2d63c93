use std::collections::HashMap;

use crate::artifact::ImageArtifact;
use crate::signature::{PairSignature, Signature};

/// Intermediate artifacts that survive between flow runs.
///
/// Entries are only returned for an exact signature match, so a changed
/// subject or garment always misses. There is no eviction; the owner calls
/// [`clear`](Self::clear) to drop everything.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    half_images: HashMap<Signature, ImageArtifact>,
    padded_garments: HashMap<PairSignature, ImageArtifact>,
    last_result: Option<ImageArtifact>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage-1 output for this subject, if it was produced before.
    pub fn half_image(&self, subject: &Signature) -> Option<ImageArtifact> {
        self.half_images.get(subject).cloned()
    }

    pub fn put_half_image(&mut self, subject: Signature, artifact: ImageArtifact) {
        self.half_images.insert(subject, artifact);
    }

    /// Garment padded to this subject's dimensions.
    pub fn padded_garment(&self, pair: &PairSignature) -> Option<ImageArtifact> {
        self.padded_garments.get(pair).cloned()
    }

    pub fn put_padded_garment(&mut self, pair: PairSignature, artifact: ImageArtifact) {
        self.padded_garments.insert(pair, artifact);
    }

    /// Full-resolution output of the most recent successful run.
    pub fn last_result(&self) -> Option<ImageArtifact> {
        self.last_result.clone()
    }

    pub fn set_last_result(&mut self, artifact: ImageArtifact) {
        self.last_result = Some(artifact);
    }

    pub fn len(&self) -> usize {
        self.half_images.len() + self.padded_garments.len() + usize::from(self.last_result.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.half_images.clear();
        self.padded_garments.clear();
        self.last_result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::from_raw(s)
    }

    #[test]
    fn test_half_image_keyed_by_subject() {
        let mut cache = ArtifactCache::new();
        cache.put_half_image(sig("a"), ImageArtifact::Url("http://x/half.png".into()));
        assert!(cache.half_image(&sig("a")).is_some());
        assert!(cache.half_image(&sig("b")).is_none());
    }

    #[test]
    fn test_padded_garment_needs_both_signatures() {
        let mut cache = ArtifactCache::new();
        cache.put_padded_garment(
            PairSignature::new(sig("a"), sig("g")),
            ImageArtifact::from_bytes(vec![1, 2, 3]),
        );
        assert!(cache.padded_garment(&PairSignature::new(sig("a"), sig("g"))).is_some());
        assert!(cache.padded_garment(&PairSignature::new(sig("a"), sig("h"))).is_none());
        assert!(cache.padded_garment(&PairSignature::new(sig("b"), sig("g"))).is_none());
    }

    #[test]
    fn test_clear() {
        let mut cache = ArtifactCache::new();
        cache.put_half_image(sig("a"), ImageArtifact::from_bytes(vec![1]));
        cache.set_last_result(ImageArtifact::DataUri("data:image/png;base64,AA==".into()));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.last_result().is_none());
    }
}
