//! Stage definitions and the static stage graph.
//!
//! A [`StageConfig`] is loaded once at startup and never mutated. Stages
//! are listed in topological order: every declared input must name an
//! earlier stage. Exactly one run-scoped stage is the fan-out stage; its
//! output yields the entities, and every per-entity stage runs once per
//! entity, in declaration order, after it.

use crate::error::{PipelineError, Result};
use crate::gateway::ModelParams;
use crate::schema::Shape;
use crate::types::{Entity, EntityBounds, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Identity of a research stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingestion,
    SegmentGeneration,
    ValueMapping,
    PainTaxonomy,
    JourneyMapping,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::Ingestion,
        StageId::SegmentGeneration,
        StageId::ValueMapping,
        StageId::PainTaxonomy,
        StageId::JourneyMapping,
    ];

    /// The snake_case key used in configuration and prompt variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Ingestion => "ingestion",
            StageId::SegmentGeneration => "segment_generation",
            StageId::ValueMapping => "value_mapping",
            StageId::PainTaxonomy => "pain_taxonomy",
            StageId::JourneyMapping => "journey_mapping",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage runs once per run or once per entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    #[default]
    Run,
    PerEntity,
}

/// How to read entities out of the fan-out stage's artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOut {
    /// Top-level array field holding one object per entity.
    pub items_field: String,
    /// Field holding the display name. Default: `"name"`.
    #[serde(default = "default_name_field")]
    pub name_field: String,
    /// Field holding a stable id; when absent or empty the id is derived
    /// from the name.
    #[serde(default)]
    pub id_field: Option<String>,
}

fn default_name_field() -> String {
    "name".to_string()
}

/// Entities read from a fan-out artifact plus anything worth reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityExtraction {
    pub entities: Vec<Entity>,
    pub warnings: Vec<String>,
}

impl FanOut {
    pub fn new(items_field: impl Into<String>) -> Self {
        Self {
            items_field: items_field.into(),
            name_field: default_name_field(),
            id_field: None,
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Read entities from `artifact`, applying `bounds`.
    ///
    /// Items without a usable name are skipped. Duplicate ids keep the
    /// first occurrence. More than `bounds.max` entities are truncated;
    /// fewer than `bounds.min` are accepted with a warning. Zero entities
    /// is returned as an empty list for the caller to treat as fatal.
    pub fn extract(&self, artifact: &Value, bounds: &EntityBounds) -> EntityExtraction {
        let mut out = EntityExtraction::default();
        let Some(items) = artifact.get(&self.items_field).and_then(Value::as_array) else {
            out.warnings
                .push(format!("fan-out field `{}` is missing or not an array", self.items_field));
            return out;
        };

        let mut seen: HashSet<EntityId> = HashSet::new();
        for (index, item) in items.iter().enumerate() {
            let name = item
                .get(&self.name_field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty());
            let Some(name) = name else {
                out.warnings
                    .push(format!("skipped item {}: no `{}`", index, self.name_field));
                continue;
            };

            let id = self
                .id_field
                .as_ref()
                .and_then(|f| item.get(f))
                .and_then(|v| match v {
                    Value::String(s) => EntityId::slug(s),
                    Value::Number(n) => Some(EntityId::new(n.to_string())),
                    _ => None,
                })
                .or_else(|| EntityId::slug(name))
                .unwrap_or_else(|| EntityId::new(format!("entity-{}", index + 1)));

            if !seen.insert(id.clone()) {
                out.warnings
                    .push(format!("skipped item {}: duplicate entity id `{}`", index, id));
                continue;
            }

            out.entities.push(Entity {
                id,
                name: name.to_string(),
                index: out.entities.len(),
                profile: item.clone(),
            });
        }

        if out.entities.len() > bounds.max {
            out.warnings.push(format!(
                "{} entities generated; keeping the first {}",
                out.entities.len(),
                bounds.max
            ));
            out.entities.truncate(bounds.max);
        } else if !out.entities.is_empty() && out.entities.len() < bounds.min {
            out.warnings.push(format!(
                "only {} entities generated; expected at least {}",
                out.entities.len(),
                bounds.min
            ));
        }
        out
    }
}

/// One unit of model work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: StageId,
    /// Human-readable name for logs and reports.
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Template rendered with [`prompt::render`](crate::prompt::render).
    pub prompt_template: String,
    /// Expected shape of the stage's JSON output.
    pub schema: Shape,
    /// Model used unless the request overrides it.
    pub default_model: String,
    /// Stages whose artifacts this stage reads.
    #[serde(default)]
    pub inputs: Vec<StageId>,
    #[serde(default)]
    pub scope: StageScope,
    #[serde(default)]
    pub fan_out: Option<FanOut>,
    #[serde(default)]
    pub params: ModelParams,
}

impl StageDefinition {
    pub fn new(
        id: StageId,
        name: impl Into<String>,
        prompt_template: impl Into<String>,
        schema: Shape,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            system_prompt: None,
            prompt_template: prompt_template.into(),
            schema,
            default_model: default_model.into(),
            inputs: Vec::new(),
            scope: StageScope::Run,
            fan_out: None,
            params: ModelParams::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = StageId>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn per_entity(mut self) -> Self {
        self.scope = StageScope::PerEntity;
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = Some(fan_out);
        self
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    pub fn is_per_entity(&self) -> bool {
        self.scope == StageScope::PerEntity
    }
}

/// The static stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub stages: Vec<StageDefinition>,
}

impl StageConfig {
    /// Build and validate a configuration.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self> {
        let config = Self { stages };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or `.yaml`/`.yml` with the `yaml` feature.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            #[cfg(feature = "yaml")]
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    /// Check that the stage list is a valid fan-out DAG.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));
        let mut declared: Vec<&StageDefinition> = Vec::new();
        let mut fan_out_seen = false;

        for stage in &self.stages {
            if declared.iter().any(|s| s.id == stage.id) {
                return invalid(format!("stage `{}` is declared twice", stage.id));
            }
            if stage.default_model.trim().is_empty() {
                return invalid(format!("stage `{}` has no default model", stage.id));
            }

            for input in &stage.inputs {
                let Some(upstream) = declared.iter().find(|s| s.id == *input) else {
                    return invalid(format!(
                        "stage `{}` reads `{}`, which is not declared before it",
                        stage.id, input
                    ));
                };
                if upstream.is_per_entity() && !stage.is_per_entity() {
                    return invalid(format!(
                        "run-level stage `{}` cannot read per-entity stage `{}`",
                        stage.id, input
                    ));
                }
            }

            match (stage.scope, stage.fan_out.is_some()) {
                (StageScope::PerEntity, true) => {
                    return invalid(format!("fan-out stage `{}` must be run-level", stage.id))
                }
                (StageScope::Run, true) if fan_out_seen => {
                    return invalid("more than one fan-out stage".to_string())
                }
                (StageScope::Run, true) => fan_out_seen = true,
                (StageScope::PerEntity, false) if !fan_out_seen => {
                    return invalid(format!(
                        "per-entity stage `{}` is declared before the fan-out stage",
                        stage.id
                    ))
                }
                (StageScope::Run, false) if fan_out_seen => {
                    return invalid(format!(
                        "run-level stage `{}` is declared after the fan-out stage",
                        stage.id
                    ))
                }
                _ => {}
            }

            declared.push(stage);
        }

        if !fan_out_seen {
            return invalid("no fan-out stage declared".to_string());
        }
        Ok(())
    }

    pub fn get(&self, id: StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Run-level stages in execution order, ending with the fan-out stage.
    pub fn run_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter().filter(|s| !s.is_per_entity())
    }

    /// The stage whose artifact defines the entities, with its extraction rule.
    pub fn fan_out_stage(&self) -> Option<(&StageDefinition, &FanOut)> {
        self.stages
            .iter()
            .find_map(|s| s.fan_out.as_ref().map(|f| (s, f)))
    }

    /// The per-entity chain in execution order.
    pub fn entity_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter().filter(|s| s.is_per_entity())
    }
}
