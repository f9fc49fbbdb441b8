use crate::error::{PipelineError, Result};
use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of a discovered entity (customer segment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an id from a display name: lowercase ASCII alphanumerics
    /// joined by single dashes. Returns `None` when nothing usable remains.
    pub fn slug(name: &str) -> Option<Self> {
        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
            } else if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        (!out.is_empty()).then_some(Self(out))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A customer segment produced by the fan-out stage.
///
/// Immutable once created; the scheduler never merges or splits entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    /// Position among the accepted entities (0-based).
    pub index: usize,
    /// The segment's full profile as generated.
    pub profile: serde_json::Value,
}

/// Bounds on how many entities a run fans out over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityBounds {
    pub min: usize,
    /// Count asked of the segment generation stage.
    pub requested: usize,
    pub max: usize,
}

impl EntityBounds {
    pub fn new(min: usize, requested: usize, max: usize) -> Self {
        Self { min, requested, max }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min == 0 || self.min > self.requested || self.requested > self.max {
            return Err(PipelineError::InvalidRequest(format!(
                "entity bounds must satisfy 1 <= min <= requested <= max, got {}/{}/{}",
                self.min, self.requested, self.max
            )));
        }
        Ok(())
    }
}

impl Default for EntityBounds {
    fn default() -> Self {
        Self::new(2, 3, 5)
    }
}

/// Per-stage model overrides. Stages without an override use their
/// configured default binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelSelection(BTreeMap<StageId, String>);

impl ModelSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: StageId, model: impl Into<String>) -> Self {
        self.0.insert(stage, model.into());
        self
    }

    pub fn get(&self, stage: StageId) -> Option<&str> {
        self.0.get(&stage).map(|s| s.as_str())
    }

    /// Resolve the model for `stage`, falling back to `default`.
    pub fn resolve<'a>(&'a self, stage: StageId, default: &'a str) -> &'a str {
        self.get(stage).unwrap_or(default)
    }
}

/// Immutable input to one research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub business_name: String,
    pub website_url: Option<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
    pub industry: Option<String>,
    pub business_model: Option<String>,
    pub target_market: Option<String>,
    #[serde(default)]
    pub known_competitors: Vec<String>,
    pub additional_context: Option<String>,
    #[serde(default)]
    pub models: ModelSelection,
    #[serde(default)]
    pub bounds: EntityBounds,
}

impl PipelineRequest {
    pub fn builder(business_name: impl Into<String>) -> PipelineRequestBuilder {
        PipelineRequestBuilder {
            request: PipelineRequest {
                business_name: business_name.into(),
                website_url: None,
                source_urls: Vec::new(),
                industry: None,
                business_model: None,
                target_market: None,
                known_competitors: Vec::new(),
                additional_context: None,
                models: ModelSelection::default(),
                bounds: EntityBounds::default(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.business_name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "business_name must not be empty".to_string(),
            ));
        }
        self.bounds.validate()
    }
}

/// Builder for [`PipelineRequest`].
#[derive(Debug, Clone)]
pub struct PipelineRequestBuilder {
    request: PipelineRequest,
}

impl PipelineRequestBuilder {
    pub fn website(mut self, url: impl Into<String>) -> Self {
        self.request.website_url = Some(url.into());
        self
    }

    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.request.source_urls.push(url.into());
        self
    }

    pub fn industry(mut self, industry: impl Into<String>) -> Self {
        self.request.industry = Some(industry.into());
        self
    }

    pub fn business_model(mut self, model: impl Into<String>) -> Self {
        self.request.business_model = Some(model.into());
        self
    }

    pub fn target_market(mut self, market: impl Into<String>) -> Self {
        self.request.target_market = Some(market.into());
        self
    }

    pub fn competitor(mut self, name: impl Into<String>) -> Self {
        self.request.known_competitors.push(name.into());
        self
    }

    pub fn context(mut self, text: impl Into<String>) -> Self {
        self.request.additional_context = Some(text.into());
        self
    }

    pub fn model(mut self, stage: StageId, model: impl Into<String>) -> Self {
        self.request.models = self.request.models.with(stage, model);
        self
    }

    pub fn bounds(mut self, bounds: EntityBounds) -> Self {
        self.request.bounds = bounds;
        self
    }

    /// Shorthand for bounds of `min.min(count)..=max.max(count)` requesting `count`.
    pub fn segments(mut self, count: usize) -> Self {
        let b = self.request.bounds;
        self.request.bounds = EntityBounds::new(b.min.min(count), count, b.max.max(count));
        self
    }

    pub fn build(self) -> Result<PipelineRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}
