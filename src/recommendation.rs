//! Cached module recommendations
//!
//! Domain wrapper over [`CachingDecorator`]: a [`RecommendationRequest`] is
//! turned into call arguments, and the provider is only consulted on a miss.

use crate::decorator::CachingDecorator;
use crate::error::CacheResult;
use crate::key_codec::{CallArgs, STREAM_FLAG};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Decorator namespace for recommendation calls
pub const RECOMMEND_NAMESPACE: &str = "recommend";

/// What the user asked for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    /// Free-text business requirements
    pub requirements: String,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    /// Streamed responses are never cached
    pub stream: bool,
}

impl RecommendationRequest {
    #[must_use]
    pub fn new(requirements: impl Into<String>) -> Self {
        Self {
            requirements: requirements.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    #[must_use]
    pub fn company_size(mut self, size: impl Into<String>) -> Self {
        self.company_size = Some(size.into());
        self
    }

    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Arguments identifying this request in the cache
    #[must_use]
    pub fn call_args(&self) -> CallArgs {
        let mut args = CallArgs::new().arg(self.requirements.trim());
        let optional = [("industry", &self.industry), ("company_size", &self.company_size)];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                args = args.kwarg(name, value);
            }
        }
        if self.stream {
            args = args.kwarg(STREAM_FLAG, true);
        }
        args
    }
}

/// One suggested module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleRecommendation {
    pub name: String,
    pub description: String,
    pub key_features: Vec<String>,
    pub category: String,
}

/// Provider answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recommendations {
    pub modules: Vec<ModuleRecommendation>,
    /// Why these modules were chosen
    pub summary: String,
}

impl Recommendations {
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Upstream that produces recommendations (typically an LLM API client)
#[async_trait]
pub trait RecommendationProvider: Send + Sync {
    /// # Errors
    ///
    /// Any failure reaching or parsing the upstream; it counts against the
    /// circuit breaker.
    async fn recommend(&self, request: &RecommendationRequest) -> anyhow::Result<Recommendations>;
}

/// Recommendation provider behind the layered cache
pub struct CachedRecommender<P> {
    provider: Arc<P>,
    decorator: Arc<CachingDecorator>,
}

impl<P: RecommendationProvider> CachedRecommender<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, decorator: Arc<CachingDecorator>) -> Self {
        Self { provider, decorator }
    }

    /// Recommendations for `request`, from cache when possible
    ///
    /// # Errors
    ///
    /// Returns the decorator's errors: circuit open, upstream failure or
    /// timeout, or a serialization failure.
    pub async fn recommend(&self, request: &RecommendationRequest) -> CacheResult<Recommendations> {
        let args = request.call_args();
        let provider = Arc::clone(&self.provider);
        let recommendations = self
            .decorator
            .execute_typed(RECOMMEND_NAMESPACE, &args, || async move {
                provider.recommend(request).await
            })
            .await?;

        debug!(modules = recommendations.modules.len(), "Recommendations ready");
        Ok(recommendations)
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }
}
