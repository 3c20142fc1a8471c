use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps text to a fixed-length vector. Indexing and querying must go through
/// the same model, so collections record `model_name` and `dimensions`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Hashed character trigrams, L2-normalized. Deterministic and offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

/// Embeddings from an Ollama server (`POST /api/embeddings`).
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub const DEFAULT_MODEL: &'static str = "all-minilm";
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbeddingsRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Status(response.status().as_u16()));
        }

        let parsed: EmbeddingsResponse = response.json().await?;
        if parsed.embedding.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if parsed.embedding.len() != self.dimensions {
            return Err(EmbeddingError::Dimension {
                expected: self.dimensions,
                actual: parsed.embedding.len(),
            });
        }

        Ok(parsed.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::{CharacterNgramEmbedder, Embedder, OllamaEmbedder};

    #[tokio::test]
    async fn embedder_is_deterministic() -> Result<(), crate::error::EmbeddingError> {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Collecte des déchets ménagers").await?;
        let second = embedder.embed("Collecte des déchets ménagers").await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_sync("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn non_empty_text_is_unit_length() {
        let vector = CharacterNgramEmbedder::default().embed_sync("permis d'environnement");
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn ollama_base_url_is_normalized() -> Result<(), crate::error::EmbeddingError> {
        let embedder = OllamaEmbedder::new("http://localhost:11434/", "all-minilm", 384)?;
        assert_eq!(embedder.base_url, "http://localhost:11434");
        assert_eq!(embedder.model_name(), "all-minilm");
        Ok(())
    }
}
