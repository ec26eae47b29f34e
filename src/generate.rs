//! Grounded answer generation.
//!
//! Builds a prompt from the retrieved context and the question and hands it
//! to the configured [`LlmClient`]. With no context the fixed
//! [`NO_INFORMATION_ANSWER`] is returned and the model is never called.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::Result;
use crate::llm::LlmClient;
use crate::models::{SearchResult, Usage};

/// Returned whenever the uploaded documents cannot answer the question.
pub const NO_INFORMATION_ANSWER: &str =
    "I'm sorry, I don't have information about that in the uploaded documents.";

const INSTRUCTIONS: &str = "You are an assistant that answers questions using only the \
context below, which was taken from documents uploaded by the operator. \
Answer in concise, natural prose and avoid bullet lists unless the question asks for one. \
Do not use any knowledge that is not in the context. \
If the context does not answer the question, reply exactly with:";

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub confidence: f32,
    pub usage: Option<Usage>,
    pub model: Option<String>,
    pub latency_ms: u64,
}

pub struct Generator {
    llm: Arc<dyn LlmClient>,
    max_chunks: usize,
    max_tokens: u32,
    temperature: f32,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmClient>, max_chunks: usize, max_tokens: u32, temperature: f32) -> Self {
        Self {
            llm,
            max_chunks: max_chunks.max(1),
            max_tokens,
            temperature,
        }
    }

    pub async fn generate(&self, query: &str, results: &[SearchResult]) -> Result<Generation> {
        let started = Instant::now();
        if results.is_empty() {
            return Ok(Generation {
                text: NO_INFORMATION_ANSWER.to_string(),
                confidence: 0.0,
                usage: None,
                model: None,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        let prompt = build_prompt(query, results);
        let completion = self
            .llm
            .complete(&prompt, self.max_tokens, self.temperature)
            .await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            model = %completion.model,
            tokens = completion.usage.total_tokens(),
            latency_ms,
            "generated answer"
        );

        Ok(Generation {
            text: completion.text,
            confidence: confidence(results, self.max_chunks),
            usage: Some(completion.usage),
            model: Some(completion.model),
            latency_ms,
        })
    }
}

pub fn build_prompt(query: &str, results: &[SearchResult]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "{} \"{}\"", INSTRUCTIONS, NO_INFORMATION_ANSWER);
    prompt.push_str("\nContext:\n");
    for result in results {
        let _ = write!(prompt, "\n[Source: {}", result.document.name);
        if let Some(section) = &result.chunk.section_label {
            let _ = write!(prompt, " / {}", section);
        }
        let _ = writeln!(prompt, "]\n{}", result.context_snippet.trim());
    }
    let _ = write!(prompt, "\nQuestion: {}\n\nAnswer:", query.trim());
    prompt
}

/// `avg_similarity * 0.7 + coverage * 0.3`, where coverage is the share of
/// the context slots that were filled.
pub fn confidence(results: &[SearchResult], max_chunks: usize) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let avg = results.iter().map(|r| r.similarity).sum::<f32>() / results.len() as f32;
    let coverage = (results.len() as f32 / max_chunks.max(1) as f32).min(1.0);
    (avg * 0.7 + coverage * 0.3).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use crate::llm::Completion;
    use crate::models::{Chunk, Document, DocumentMetadata, DocumentStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLlm {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LlmClient for CountingLlm {
        fn model_name(&self) -> &str {
            "counting"
        }
        async fn complete(&self, prompt: &str, _max: u32, _t: f32) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RagError::llm("503"));
            }
            Ok(Completion {
                text: format!("{} chars", prompt.len()),
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                },
                model: "counting".into(),
            })
        }
    }

    fn result(name: &str, text: &str, similarity: f32) -> SearchResult {
        SearchResult {
            chunk: Chunk {
                id: format!("{}:0", name),
                document_id: name.into(),
                chunk_index: 0,
                text: text.into(),
                start_offset: 0,
                end_offset: text.len(),
                section_label: Some("Refunds".into()),
                hash: String::new(),
                estimated_tokens: 1,
                embedding: Vec::new(),
            },
            document: Document {
                id: name.into(),
                name: name.into(),
                source_type: "text/plain".into(),
                size_bytes: 0,
                uploaded_at: chrono::Utc::now(),
                metadata: DocumentMetadata::default(),
                status: DocumentStatus::Ready,
                error_detail: None,
            },
            similarity,
            relevance_score: similarity,
            context_snippet: text.into(),
        }
    }

    #[tokio::test]
    async fn test_empty_results_skip_llm() {
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let generator = Generator::new(llm.clone(), 5, 100, 0.0);
        let generation = generator.generate("anything?", &[]).await.unwrap();
        assert_eq!(generation.text, NO_INFORMATION_ANSWER);
        assert_eq!(generation.confidence, 0.0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let generator = Generator::new(llm, 5, 100, 0.0);
        let err = generator
            .generate("q", &[result("policy.md", "text", 0.9)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
    }

    #[tokio::test]
    async fn test_usage_recorded() {
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let generator = Generator::new(llm, 5, 100, 0.0);
        let generation = generator
            .generate("q", &[result("policy.md", "text", 0.9)])
            .await
            .unwrap();
        assert_eq!(generation.usage.unwrap().total_tokens(), 12);
        assert_eq!(generation.model.as_deref(), Some("counting"));
    }

    #[test]
    fn test_prompt_labels_sources() {
        let prompt = build_prompt(
            " What is the refund window? ",
            &[result("policy.md", "The refund window is 30 days.", 0.8)],
        );
        assert!(prompt.contains("[Source: policy.md / Refunds]\nThe refund window is 30 days."));
        assert!(prompt.contains(NO_INFORMATION_ANSWER));
        assert!(prompt.ends_with("Question: What is the refund window?\n\nAnswer:"));
    }

    #[test]
    fn test_confidence_formula() {
        let results = vec![result("a", "x", 0.8), result("b", "y", 0.6)];
        // avg 0.7 * 0.7 + (2/4) * 0.3
        assert!((confidence(&results, 4) - 0.64).abs() < 1e-6);
        assert_eq!(confidence(&[], 4), 0.0);
    }
}
