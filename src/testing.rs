//! Deterministic stand-ins for the embedding and completion providers.

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::llm::{ChatRequest, CompletionProvider, DeltaStream, LlmError};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Embeds text as the sum of the vectors of every rule whose key occurs in
/// it. Text matching no rule maps onto the last axis.
pub struct FakeEmbedder {
    dims: usize,
    reported: usize,
    rules: Vec<(String, Vec<f32>)>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            reported: dims,
            rules: Vec::new(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_rule(mut self, key: &str, vector: impl Into<Vec<f32>>) -> Self {
        self.rules.push((key.to_lowercase(), vector.into()));
        self
    }

    /// Claims `dims` in `dimensions()` while still producing the real size.
    pub fn reporting_dimensions(mut self, dims: usize) -> Self {
        self.reported = dims;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        let mut vector = vec![0.0; self.dims];
        let mut matched = false;
        for (key, rule) in &self.rules {
            if text.contains(key.as_str()) {
                matched = true;
                for (v, r) in vector.iter_mut().zip(rule) {
                    *v += r;
                }
            }
        }
        if !matched {
            if let Some(last) = vector.last_mut() {
                *last = 1.0;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn dimensions(&self) -> usize {
        self.reported
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EmbeddingError::Api {
                status: 503,
                message: "embedding service unavailable".into(),
            });
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Replays scripted deltas and records every request it receives.
#[derive(Clone, Default)]
pub struct FakeCompletion {
    deltas: Vec<String>,
    fail_after: Option<usize>,
    refuse: bool,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    pulled: Arc<AtomicUsize>,
}

impl FakeCompletion {
    pub fn new<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Yields `n` deltas, then an error.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Fails the call itself, before any delta.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of items consumers have pulled from the delta streams.
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for FakeCompletion {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.refuse {
            return Err(LlmError::Api {
                status: 500,
                message: "upstream refused".into(),
            });
        }

        let mut items: Vec<Result<String, LlmError>> = match self.fail_after {
            Some(n) => self.deltas.iter().take(n).cloned().map(Ok).collect(),
            None => self.deltas.iter().cloned().map(Ok).collect(),
        };
        if self.fail_after.is_some() {
            items.push(Err(LlmError::Parse("connection reset".into())));
        }

        let pulled = self.pulled.clone();
        let stream = futures::stream::iter(items).inspect(move |_| {
            pulled.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Box::pin(stream))
    }
}
