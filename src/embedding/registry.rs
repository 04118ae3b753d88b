// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider registry.
//!
//! Maps each modality to its models in priority order. Providers are checked
//! once when registered; a provider that fails the check is left out. A
//! descriptor registered without a provider still resolves, and the
//! generator skips it without retrying.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::provider::{build_provider, EmbeddingProvider};
use crate::embedding::tokens::{SharedEstimator, TokenizerEstimator};
use crate::errors::{RagError, Result};
use crate::types::{Modality, ModelDescriptor};

#[derive(Default)]
pub struct ProviderRegistry {
    descriptors: HashMap<String, ModelDescriptor>,
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
    estimators: HashMap<String, SharedEstimator>,
    by_modality: HashMap<Modality, Vec<ModelDescriptor>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[[models]]` entries of a config file. Models whose
    /// provider cannot be constructed or fails its health check are skipped with a
    /// warning.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for model in config.models() {
            let descriptor = model.descriptor();
            descriptor.validate()?;

            let provider = match build_provider(&model) {
                Ok(provider) => provider,
                Err(err) => {
                    tracing::warn!("embedding model '{}' unavailable: {}", model.model_id, err);
                    continue;
                }
            };
            if !registry.register_provider(descriptor, provider)? {
                continue;
            }
            if let Some(path) = &model.tokenizer {
                let estimator = TokenizerEstimator::from_file(path)?;
                registry.set_estimator(&model.model_id, Arc::new(estimator));
            }
        }
        Ok(registry)
    }

    /// Insert or replace a descriptor by `model_id`.
    ///
    /// Two different models serving the same modality may not share a
    /// priority, so the primary and the fallback order stay unambiguous.
    pub fn register(&mut self, descriptor: ModelDescriptor) -> Result<()> {
        descriptor.validate()?;
        for other in self.descriptors.values() {
            if other.model_id == descriptor.model_id || other.priority != descriptor.priority {
                continue;
            }
            if let Some(shared) = descriptor.modalities.iter().find(|m| other.serves(**m)) {
                return Err(RagError::invalid_config(format!(
                    "models '{}' and '{}' both have priority {} for modality '{}'",
                    other.model_id, descriptor.model_id, descriptor.priority, shared
                )));
            }
        }

        if let Some(provider) = self.providers.get(&descriptor.model_id) {
            if provider.dimension() != descriptor.dimension {
                return Err(RagError::DimensionMismatch {
                    model_id: descriptor.model_id,
                    expected: descriptor.dimension,
                    actual: provider.dimension(),
                });
            }
        }

        self.descriptors
            .insert(descriptor.model_id.clone(), descriptor);
        self.rebuild();
        Ok(())
    }

    /// Health-check `provider` and register it with its descriptor. Returns false
    /// (and registers nothing) when the check fails.
    pub fn register_provider(
        &mut self,
        descriptor: ModelDescriptor,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<bool> {
        if provider.dimension() != descriptor.dimension {
            return Err(RagError::DimensionMismatch {
                model_id: descriptor.model_id,
                expected: descriptor.dimension,
                actual: provider.dimension(),
            });
        }
        if !provider.health_check() {
            tracing::warn!(
                "embedding model '{}' failed its health check and will not be used",
                descriptor.model_id
            );
            return Ok(false);
        }
        let model_id = descriptor.model_id.clone();
        self.providers.insert(model_id.clone(), provider);
        if let Err(err) = self.register(descriptor) {
            self.providers.remove(&model_id);
            return Err(err);
        }
        Ok(true)
    }

    pub fn set_estimator(&mut self, model_id: &str, estimator: SharedEstimator) {
        self.estimators.insert(model_id.to_string(), estimator);
    }

    /// Models serving `modality`, most preferred first.
    pub fn resolve(&self, modality: Modality) -> &[ModelDescriptor] {
        self.by_modality
            .get(&modality)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary(&self, modality: Modality) -> Option<&ModelDescriptor> {
        self.resolve(modality).first()
    }

    pub fn descriptor(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.descriptors.get(model_id)
    }

    pub fn provider(&self, model_id: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        self.providers.get(model_id).cloned()
    }

    /// Exact token estimator for `model_id`, when a tokenizer was configured.
    pub fn estimator(&self, model_id: &str) -> Option<SharedEstimator> {
        self.estimators.get(model_id).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.descriptors.values()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Re-run every provider's health check.
    pub fn health(&self) -> Vec<(String, bool)> {
        let mut report: Vec<(String, bool)> = self
            .descriptors
            .keys()
            .map(|id| {
                let healthy = self.providers.get(id).is_some_and(|p| p.health_check());
                (id.clone(), healthy)
            })
            .collect();
        report.sort();
        report
    }

    fn rebuild(&mut self) {
        self.by_modality.clear();
        for descriptor in self.descriptors.values() {
            for modality in &descriptor.modalities {
                self.by_modality
                    .entry(*modality)
                    .or_default()
                    .push(descriptor.clone());
            }
        }
        for list in self.by_modality.values_mut() {
            list.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.model_id.cmp(&b.model_id))
            });
        }
    }
}
