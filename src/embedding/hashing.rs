use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{normalize, EmbeddingProvider};
use crate::error::Result;

/// Deterministic, fast embedding for offline use.
///
/// Each lower-cased alphanumeric token is hashed into one of `dims` buckets
/// and the bucket counts are L2-normalized. Identical texts always produce
/// identical vectors, on every platform and release, so vectors stored by
/// one process can be queried by another.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokens(text) {
            vec[self.bucket(&token)] += 1.0;
        }
        normalize(&mut vec);
        vec
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dims as u64) as usize
    }
}

/// Lower-cased runs of alphanumeric characters.
pub(crate) fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_deterministic() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_sync("The refund window is 30 days.");
        let b = HashingEmbedder::new(64).embed_sync("The refund window is 30 days.");
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let e = HashingEmbedder::new(128);
        let a = e.embed_sync("Refund window!");
        let b = e.embed_sync("refund   WINDOW");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let e = HashingEmbedder::new(384);
        let doc = e.embed_sync("The refund window is 30 days.");
        let related = e.embed_sync("What is the refund window?");
        let unrelated = e.embed_sync("Parking permits renew every January");
        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(16).embed_sync("  ... ");
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_unicode_tokens() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_sync("வணக்கம் உலகம்");
        assert!((a.iter().map(|x| x * x).sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
