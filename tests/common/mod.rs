// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ragdex::embedding::{EmbeddingProvider, GeneratorConfig, HashEmbedder, ProviderRegistry, RetryPolicy};
use ragdex::{EmbeddingError, EngineOptions, ModelDescriptor};

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const SLOW: u8 = 2;
const SHORT: u8 = 3;

pub const SLOW_CALL: Duration = Duration::from_millis(300);

/// Word groups mapped onto fixed axes. Texts sharing a topic land close
/// together regardless of exact wording.
const TOPICS: &[&[&str]] = &[
    &["aquarium", "biology", "fish", "genetics", "zebrafish", "species", "embryo"],
    &["simmer", "broth", "garlic", "onions", "recipe", "stew", "kitchen"],
    &["telescope", "galaxy", "orbit", "planet", "stars", "nebula"],
    &["compiler", "parser", "syntax", "tokens", "grammar"],
];

fn topic_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
    {
        for (axis, words) in TOPICS.iter().enumerate() {
            if words.contains(&word.as_str()) {
                vector[axis % dimension] += 1.0;
            }
        }
    }
    // Keeps off-topic text from producing a zero vector.
    vector[dimension - 1] += 0.01;
    vector
}

#[derive(Clone, Copy)]
pub enum Embedding {
    Hash,
    Topics,
}

/// Provider whose behavior can be switched while the engine is live.
pub struct ScriptedProvider {
    model_id: String,
    dimension: usize,
    embedding: Embedding,
    hash: HashEmbedder,
    mode: AtomicU8,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(model_id: &str, dimension: usize, embedding: Embedding) -> Arc<Self> {
        Arc::new(Self {
            model_id: model_id.to_string(),
            dimension,
            embedding,
            hash: HashEmbedder::new(model_id, dimension),
            mode: AtomicU8::new(HEALTHY),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn hash(model_id: &str, dimension: usize) -> Arc<Self> {
        Self::new(model_id, dimension, Embedding::Hash)
    }

    pub fn topics(model_id: &str) -> Arc<Self> {
        Self::new(model_id, 8, Embedding::Topics)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn healthy(&self) {
        self.mode.store(HEALTHY, Ordering::SeqCst);
    }

    /// Every call fails with a transient error.
    pub fn fail(&self) {
        self.mode.store(FAILING, Ordering::SeqCst);
    }

    /// Every call sleeps for [`SLOW_CALL`] before answering.
    pub fn slow(&self) {
        self.mode.store(SLOW, Ordering::SeqCst);
    }

    /// Returns vectors one element shorter than advertised.
    pub fn short(&self) {
        self.mode.store(SHORT, Ordering::SeqCst);
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        match self.embedding {
            Embedding::Hash => self.hash.embed_one(text),
            Embedding::Topics => Ok(topic_vector(text, self.dimension)),
        }
    }
}

impl EmbeddingProvider for ScriptedProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode.load(Ordering::SeqCst) {
            FAILING => return Err(EmbeddingError::transient("503 service unavailable")),
            SLOW => std::thread::sleep(SLOW_CALL),
            _ => {}
        }
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = self.embed(text)?;
            if self.mode.load(Ordering::SeqCst) == SHORT {
                vector.pop();
            }
            out.push(vector);
        }
        Ok(out)
    }
}

/// Registry holding `providers` in priority order (first is primary).
pub fn registry(providers: &[(Arc<ScriptedProvider>, usize)]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for (priority, (provider, max_tokens)) in providers.iter().enumerate() {
        let descriptor = ModelDescriptor::new(
            provider.model_id(),
            provider.dimension(),
            *max_tokens,
            priority as u32 + 1,
        );
        let shared: Arc<dyn EmbeddingProvider> = Arc::clone(provider) as Arc<dyn EmbeddingProvider>;
        let registered = registry
            .register_provider(descriptor, shared)
            .expect("register provider");
        assert!(registered, "health check failed for {}", provider.model_id());
    }
    registry
}

/// Options with fast retries and no request throttling.
pub fn options() -> EngineOptions {
    EngineOptions {
        generator: GeneratorConfig {
            max_concurrency: 4,
            requests_per_second: 0.0,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        },
        ..EngineOptions::default()
    }
}
