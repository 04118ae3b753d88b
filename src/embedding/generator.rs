// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding generator.
//!
//! Turns chunks into vectors. Each item walks its modality's model list in
//! priority order: cache lookup, then up to `max_retries` retried provider
//! calls, then the next model. A model that answers with the wrong shape, or
//! has no provider, is skipped at once. Provider calls share one semaphore
//! (bounded in-flight requests) and one token bucket. A batch never fails as
//! a whole; every item gets its own result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::cache::EmbeddingCache;
use crate::embedding::registry::ProviderRegistry;
use crate::embedding::retry::{RateLimiter, RetryPolicy};
use crate::errors::EmbeddingError;
use crate::types::{Chunk, ChunkId, Modality, ModelDescriptor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorConfig {
    /// Concurrent in-flight provider requests.
    pub max_concurrency: usize,
    /// Token-bucket rate; non-positive disables limiting.
    pub requests_per_second: f64,
    pub retry: RetryPolicy,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            requests_per_second: 10.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Concurrency suited to a host with `mem_gb` of memory: half a request
/// per GB, between 2 and 8.
pub fn concurrency_for_memory(mem_gb: usize) -> usize {
    (mem_gb / 2).clamp(2, 8)
}

/// A vector and the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedded {
    pub model_id: String,
    pub vector: Arc<Vec<f32>>,
    pub cached: bool,
}

/// Per-item results of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub items: Vec<(ChunkId, Result<Embedded, EmbeddingError>)>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> impl Iterator<Item = (&ChunkId, &Embedded)> {
        self.items
            .iter()
            .filter_map(|(id, result)| result.as_ref().ok().map(|e| (id, e)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&ChunkId, &EmbeddingError)> {
        self.items
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (id, e)))
    }

    pub fn failed_ids(&self) -> Vec<ChunkId> {
        self.failed().map(|(id, _)| id.clone()).collect()
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GeneratorStats {
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub fallbacks: u64,
    pub failed_items: u64,
}

pub struct EmbeddingGenerator {
    registry: Arc<ProviderRegistry>,
    cache: Arc<EmbeddingCache>,
    limiter: Option<RateLimiter>,
    permits: Semaphore,
    retry: RetryPolicy,
    provider_calls: AtomicU64,
    provider_failures: AtomicU64,
    fallbacks: AtomicU64,
    failed_items: AtomicU64,
}

impl EmbeddingGenerator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<EmbeddingCache>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            limiter: RateLimiter::new(config.requests_per_second),
            permits: Semaphore::new(config.max_concurrency.max(1)),
            retry: config.retry,
            provider_calls: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            failed_items: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failed_items: self.failed_items.load(Ordering::Relaxed),
        }
    }

    /// Embed every chunk, falling back through `modality`'s models per item.
    pub async fn embed_batch(&self, chunks: &[Chunk], modality: Modality) -> BatchOutcome {
        let items = join_all(chunks.iter().map(|chunk| async move {
            (chunk.id.clone(), self.embed_text(&chunk.text, modality).await)
        }))
        .await;

        let outcome = BatchOutcome { items };
        for (id, err) in outcome.failed() {
            tracing::warn!("failed to embed {}: {}", id, err);
        }
        outcome
    }

    /// Embed one text for `modality`: primary model first, then fallbacks.
    /// A fatal error ends the walk since no model will accept the input;
    /// transient and model errors move on to the next model.
    pub async fn embed_text(&self, text: &str, modality: Modality) -> Result<Embedded, EmbeddingError> {
        let models = self.registry.resolve(modality);
        let mut last_err = EmbeddingError::fatal(format!("no embedding model for modality '{}'", modality));

        for (idx, descriptor) in models.iter().enumerate() {
            if idx > 0 {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "falling back to '{}' after: {}",
                    descriptor.model_id,
                    last_err
                );
            }
            let result = match self.cached(text, &descriptor.model_id) {
                Some(hit) => Ok(hit),
                None => {
                    self.retry
                        .run(|_| self.call_provider(text, descriptor, true))
                        .await
                }
            };
            match result {
                Ok(embedded) => return Ok(embedded),
                Err(err @ EmbeddingError::Fatal(_)) => {
                    self.failed_items.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Err(err) => last_err = err,
            }
        }

        self.failed_items.fetch_add(1, Ordering::Relaxed);
        Err(last_err)
    }

    /// Embed `text` with one specific model, one attempt, no rate limiting.
    /// Used on the query path, where latency matters more than throughput.
    pub async fn embed_query(&self, text: &str, model_id: &str) -> Result<Embedded, EmbeddingError> {
        let descriptor = self
            .registry
            .descriptor(model_id)
            .ok_or_else(|| EmbeddingError::fatal(format!("unknown model '{}'", model_id)))?;
        if let Some(hit) = self.cached(text, model_id) {
            return Ok(hit);
        }
        self.call_provider(text, descriptor, false).await
    }

    fn cached(&self, text: &str, model_id: &str) -> Option<Embedded> {
        self.cache.get(model_id, text).map(|vector| Embedded {
            model_id: model_id.to_string(),
            vector,
            cached: true,
        })
    }

    async fn call_provider(
        &self,
        text: &str,
        descriptor: &ModelDescriptor,
        throttled: bool,
    ) -> Result<Embedded, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::fatal("cannot embed empty text"));
        }
        let provider = self.registry.provider(&descriptor.model_id).ok_or_else(|| {
            EmbeddingError::model(format!("no provider for '{}'", descriptor.model_id))
        })?;

        let _permit = if throttled {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| EmbeddingError::transient("embedding pool closed"))?;
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            Some(permit)
        } else {
            None
        };

        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        let owned = text.to_string();
        let result = tokio::task::spawn_blocking(move || provider.embed_one(&owned))
            .await
            .map_err(|e| EmbeddingError::transient(format!("embedding task failed: {}", e)))
            .and_then(|inner| inner);

        let vector = match result {
            Ok(vector) => vector,
            Err(err) => {
                self.provider_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        if vector.len() != descriptor.dimension {
            self.provider_failures.fetch_add(1, Ordering::Relaxed);
            return Err(EmbeddingError::model(format!(
                "model '{}' returned {} dimensions, expected {}",
                descriptor.model_id,
                vector.len(),
                descriptor.dimension
            )));
        }

        let vector = Arc::new(vector);
        self.cache.put(&descriptor.model_id, text, Arc::clone(&vector));
        Ok(Embedded {
            model_id: descriptor.model_id.clone(),
            vector,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::{EmbeddingProvider, HashEmbedder};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Flaky {
        id: String,
        dimension: usize,
        fail_first: usize,
        calls: AtomicUsize,
        fatal_on: Option<String>,
    }

    impl Flaky {
        fn new(id: &str, dimension: usize, fail_first: usize) -> Self {
            Self {
                id: id.to_string(),
                dimension,
                fail_first,
                calls: AtomicUsize::new(0),
                fatal_on: None,
            }
        }
    }

    impl EmbeddingProvider for Flaky {
        fn model_id(&self) -> &str {
            &self.id
        }
        fn dimension(&self) -> usize {
            self.dimension
        }
        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal_on.as_deref() == texts.first().map(String::as_str) {
                return Err(EmbeddingError::fatal("rejected"));
            }
            if n < self.fail_first {
                return Err(EmbeddingError::transient("unavailable"));
            }
            Ok(texts.iter().map(|_| vec![1.0; self.dimension]).collect())
        }
    }

    fn fast_config() -> GeneratorConfig {
        GeneratorConfig {
            max_concurrency: 4,
            requests_per_second: 0.0,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        }
    }

    fn chunk(id: usize, text: &str) -> Chunk {
        Chunk {
            id: ChunkId::new("doc", id),
            content_id: "doc".into(),
            ordinal: id,
            text: text.into(),
            start_offset: 0,
            end_offset: text.len(),
            overlap_len: 0,
            start_line: 1,
            end_line: 1,
            modality: Modality::Prose,
            token_estimate: 1,
            language: None,
        }
    }

    fn shared<P: EmbeddingProvider + 'static>(provider: &Arc<P>) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(provider) as Arc<dyn EmbeddingProvider>
    }

    fn generator(providers: Vec<(u32, Arc<dyn EmbeddingProvider>)>, cache: usize) -> EmbeddingGenerator {
        let mut registry = ProviderRegistry::new();
        for (priority, provider) in providers {
            let descriptor = ModelDescriptor::new(provider.model_id(), provider.dimension(), 256, priority);
            registry.register_provider(descriptor, provider).unwrap();
        }
        EmbeddingGenerator::new(Arc::new(registry), EmbeddingCache::shared(cache), fast_config())
    }

    #[tokio::test]
    async fn test_second_embed_hits_cache() {
        let generator = generator(vec![(1, shared(&Arc::new(HashEmbedder::new("hash", 32))))], 16);
        let first = generator.embed_text("same text", Modality::Prose).await.unwrap();
        let second = generator.embed_text("same text", Modality::Prose).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.vector, second.vector);
        assert_eq!(generator.cache().stats().hits, 1);
        assert_eq!(generator.stats().provider_calls, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(Flaky::new("flaky", 4, 2));
        let generator = generator(vec![(1, shared(&flaky))], 0);
        let result = generator.embed_text("hello", Modality::Prose).await.unwrap();
        assert_eq!(result.model_id, "flaky");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(generator.stats().fallbacks, 0);
    }

    #[tokio::test]
    async fn test_falls_back_after_retries() {
        let primary = Arc::new(Flaky::new("primary", 4, usize::MAX));
        let fallback = Arc::new(Flaky::new("fallback", 8, 0));
        let generator = generator(vec![(1, shared(&primary)), (2, shared(&fallback))], 0);

        let chunks: Vec<_> = (0..5).map(|i| chunk(i, &format!("text {}", i))).collect();
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;

        assert_eq!(outcome.success_count(), 5);
        assert!(outcome.failed_ids().is_empty());
        assert!(outcome.succeeded().all(|(_, e)| e.model_id == "fallback" && e.vector.len() == 8));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 5 * 4);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 5);
        assert_eq!(generator.stats().fallbacks, 5);
    }

    #[tokio::test]
    async fn test_fatal_item_is_reported_and_batch_continues() {
        let mut provider = Flaky::new("strict", 4, 0);
        provider.fatal_on = Some("poison".to_string());
        let provider = Arc::new(provider);
        let backup = Arc::new(Flaky::new("backup", 4, 0));
        let generator = generator(vec![(1, shared(&provider)), (2, shared(&backup))], 0);

        let chunks = vec![chunk(0, "fine"), chunk(1, "poison"), chunk(2, "also fine")];
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;

        assert_eq!(outcome.success_count(), 2);
        assert_eq!(outcome.failed_ids(), vec![ChunkId::new("doc", 1)]);
        assert!(matches!(outcome.items[1].1, Err(EmbeddingError::Fatal(_))));
        // fatal errors are neither retried nor handed to the fallback
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_models_down_yields_per_item_failures() {
        let down = Arc::new(Flaky::new("down", 4, usize::MAX));
        let generator = generator(vec![(1, shared(&down))], 0);
        let chunks = vec![chunk(0, "a"), chunk(1, "b")];
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;
        assert_eq!(outcome.failed_ids().len(), 2);
        assert!(outcome
            .failed()
            .all(|(_, e)| matches!(e, EmbeddingError::Transient(_))));
    }

    struct Liar {
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for Liar {
        fn model_id(&self) -> &str {
            "liar"
        }
        fn dimension(&self) -> usize {
            4
        }
        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.5; 3]).collect())
        }
    }

    fn liar() -> Arc<Liar> {
        Arc::new(Liar {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_a_model_failure() {
        let liar = liar();
        let generator = generator(vec![(1, shared(&liar))], 16);
        let err = generator.embed_text("x", Modality::Prose).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Model(_)));
        assert_eq!(liar.calls.load(Ordering::SeqCst), 1);
        assert!(generator.cache().is_empty());
        assert_eq!(generator.stats().failed_items, 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_falls_back_without_retrying() {
        let liar = liar();
        let fallback = Arc::new(Flaky::new("fallback", 8, 0));
        let generator = generator(vec![(1, shared(&liar)), (2, shared(&fallback))], 16);

        let chunks: Vec<_> = (0..3).map(|i| chunk(i, &format!("text {}", i))).collect();
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;

        assert_eq!(outcome.success_count(), 3);
        assert!(outcome.succeeded().all(|(_, e)| e.model_id == "fallback" && e.vector.len() == 8));
        assert_eq!(liar.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
        assert_eq!(generator.stats().fallbacks, 3);
        assert_eq!(generator.stats().failed_items, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_without_provider_is_skipped_without_backoff() {
        let mut registry = ProviderRegistry::new();
        registry.register(ModelDescriptor::new("config-only", 16, 256, 1)).unwrap();
        registry
            .register_provider(
                ModelDescriptor::new("hash", 16, 256, 2),
                Arc::new(HashEmbedder::new("hash", 16)),
            )
            .unwrap();
        let config = GeneratorConfig {
            requests_per_second: 0.0,
            ..GeneratorConfig::default()
        };
        let generator = EmbeddingGenerator::new(Arc::new(registry), EmbeddingCache::shared(0), config);

        let start = tokio::time::Instant::now();
        let embedded = generator.embed_text("hello", Modality::Prose).await.unwrap();
        assert_eq!(embedded.model_id, "hash");
        // default policy would sleep a second or more before each retry
        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(generator.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_in_flight_calls_never_exceed_max_concurrency() {
        struct Counting {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }
        impl EmbeddingProvider for Counting {
            fn model_id(&self) -> &str {
                "counting"
            }
            fn dimension(&self) -> usize {
                2
            }
            fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
            }
        }

        let provider = Arc::new(Counting {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = ProviderRegistry::new();
        registry
            .register_provider(ModelDescriptor::new("counting", 2, 256, 1), shared(&provider))
            .unwrap();
        let config = GeneratorConfig {
            max_concurrency: 2,
            ..fast_config()
        };
        let generator = EmbeddingGenerator::new(Arc::new(registry), EmbeddingCache::shared(0), config);

        let chunks: Vec<_> = (0..12).map(|i| chunk(i, &format!("text {}", i))).collect();
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;

        assert_eq!(outcome.success_count(), 12);
        let peak = provider.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak in-flight calls was {}", peak);
        assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_models() {
        let generator = generator(Vec::new(), 0);
        let err = generator.embed_text("x", Modality::Code).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_embed_query_uses_named_model() {
        let generator = generator(
            vec![
                (1, shared(&Arc::new(HashEmbedder::new("a", 8)))),
                (2, shared(&Arc::new(HashEmbedder::new("b", 16)))),
            ],
            0,
        );
        let embedded = generator.embed_query("query", "b").await.unwrap();
        assert_eq!(embedded.vector.len(), 16);
        assert!(generator.embed_query("query", "missing").await.is_err());
    }

    #[test]
    fn test_concurrency_for_memory() {
        assert_eq!(concurrency_for_memory(1), 2);
        assert_eq!(concurrency_for_memory(8), 4);
        assert_eq!(concurrency_for_memory(64), 8);
    }
}
