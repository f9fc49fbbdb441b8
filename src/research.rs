//! The built-in five-stage research graph.
//!
//! Ingestion builds a company profile, segment generation proposes ideal
//! customer profiles (the fan-out), and each segment then gets a value
//! proposition canvas, a pain taxonomy, and a five-stage journey map.
//!
//! Prompt wording here is deliberately plain; deployments are expected to
//! load their own [`StageConfig`] when the copy matters.

use crate::gateway::ModelParams;
use crate::schema::{Field, Shape};
use crate::stage::{FanOut, StageConfig, StageDefinition, StageId};

pub const RESEARCH_MODEL: &str = "perplexity/sonar-deep-research";
pub const ANALYSIS_MODEL: &str = "anthropic/claude-sonnet-4.5";

/// The journey stages every map must cover, in order.
pub const JOURNEY_STAGES: [&str; 5] = ["awareness", "consideration", "decision", "onboarding", "expansion"];

const SYSTEM_PROMPT: &str = "You are a senior B2B market researcher. \
Answer with a single JSON object and nothing else.";

const INGESTION_PROMPT: &str = "Research the business below using public sources.

## Business
{request}

Produce a factual company profile: what it sells, to whom, how it positions \
itself, and who it competes with. Cite the sources you relied on.

Return JSON with exactly this structure:
{schema}";

const SEGMENT_PROMPT: &str = "Using the company profile below, identify the {segment_count} \
most valuable ideal customer profiles (ICPs) for {business_name}.

## Company profile
{ingestion}

Segments must be distinct from one another. Give each a short stable id \
(lowercase, dashes) and a fit score from 0 to 100.

Return JSON with exactly this structure:
{schema}";

const VALUE_MAPPING_PROMPT: &str = "Build a Value Proposition Canvas for one customer segment.

## Company profile
{ingestion}

## Segment: {entity_name}
{entity}

Map the segment's jobs, pains, and gains, then show how the company's \
offering relieves those pains and creates those gains. Rate each pain \
reliever's significance from 1 to 10 and the overall fit from 0 to 100.

Return JSON with exactly this structure:
{schema}";

const PAIN_TAXONOMY_PROMPT: &str = "Classify the pains of one customer segment.

## Company profile
{ingestion}

## Segment: {entity_name}
{entity}

## Value proposition canvas
{value_mapping}

Group pains into functional, financial, and emotional categories with at \
least one pain in each, scoring severity from 1 to 10. Analyse the four \
forces of progress (push, pull, habit, anxiety) with intensities from 1 to \
10, rank pains by priority (0-100), and list messaging implications.

Return JSON with exactly this structure:
{schema}";

const JOURNEY_PROMPT: &str = "Map the buying journey of one customer segment across \
awareness, consideration, decision, onboarding, and expansion.

## Segment: {entity_name}
{entity}

## Value proposition canvas
{value_mapping}

## Pain taxonomy
{pain_taxonomy}

For each stage give the objective, the questions the customer is asking, \
content ideas, preferred channels, and KPIs. Finish with cross-stage \
recommendations and a prioritised content calendar.

Return JSON with exactly this structure:
{schema}";

fn texts(min: usize) -> Shape {
    Shape::list(Shape::text(), min)
}

pub fn company_profile_shape() -> Shape {
    Shape::object(vec![
        Field::required("company_name", Shape::text()),
        Field::required("description", Shape::text()),
        Field::optional("industry", Shape::text()),
        Field::required("products_services", texts(1)),
        Field::required("value_propositions", texts(1)),
        Field::optional("target_customers", texts(0)),
        Field::optional(
            "competitors",
            Shape::list(
                Shape::object(vec![
                    Field::required("name", Shape::text()),
                    Field::optional("positioning", Shape::text()),
                ]),
                0,
            ),
        ),
        Field::optional("market_position", Shape::text()),
        Field::optional("sources", texts(0)),
    ])
}

/// Zero segments is accepted here so an empty answer surfaces as a run
/// failure ("nothing to fan out over") rather than a repair loop.
pub fn segment_list_shape() -> Shape {
    let segment = Shape::object(vec![
        Field::optional("id", Shape::text()),
        Field::required("name", Shape::text()),
        Field::required("description", Shape::text()),
        Field::optional("demographics", Shape::Any),
        Field::optional("psychographics", Shape::Any),
        Field::required("goals", texts(1)),
        Field::required("challenges", texts(1)),
        Field::optional("buying_triggers", texts(0)),
        Field::required("fit_score", Shape::number(0.0, 100.0)),
    ]);
    Shape::object(vec![Field::required("segments", Shape::list(segment, 0))])
}

pub fn value_canvas_shape() -> Shape {
    let rated = |label: &str, rating: &str| {
        Shape::list(
            Shape::object(vec![
                Field::required(label, Shape::text()),
                Field::required(rating, Shape::integer(1, 10)),
            ]),
            1,
        )
    };
    Shape::object(vec![
        Field::required("customer_jobs", rated("job", "importance")),
        Field::required("pains", rated("pain", "severity")),
        Field::required("gains", rated("gain", "relevance")),
        Field::required(
            "pain_relievers",
            Shape::list(
                Shape::object(vec![
                    Field::required("reliever", Shape::text()),
                    Field::required("addresses_pain", Shape::text()),
                    Field::required("relief_significance", Shape::integer(1, 10)),
                ]),
                1,
            ),
        ),
        Field::required(
            "gain_creators",
            Shape::list(
                Shape::object(vec![
                    Field::required("creator", Shape::text()),
                    Field::required("addresses_gain", Shape::text()),
                ]),
                1,
            ),
        ),
        Field::required("fit_score", Shape::number(0.0, 100.0)),
        Field::required("value_proposition_statement", Shape::text()),
    ])
}

pub fn pain_taxonomy_shape() -> Shape {
    let pains = Shape::list(
        Shape::object(vec![
            Field::required("pain", Shape::text()),
            Field::required("severity", Shape::integer(1, 10)),
            Field::optional("frequency", Shape::text()),
            Field::optional("evidence", Shape::text()),
        ]),
        1,
    );
    let forces = Shape::list(
        Shape::object(vec![
            Field::required("force", Shape::text()),
            Field::required("intensity", Shape::integer(1, 10)),
        ]),
        1,
    );
    Shape::object(vec![
        Field::required("functional_pains", pains.clone()),
        Field::required("financial_pains", pains.clone()),
        Field::required("emotional_pains", pains),
        Field::required(
            "forces_analysis",
            Shape::object(vec![
                Field::required("push", forces.clone()),
                Field::required("pull", forces.clone()),
                Field::required("habit", forces.clone()),
                Field::required("anxiety", forces),
            ]),
        ),
        Field::required(
            "pain_priority_ranking",
            Shape::list(
                Shape::object(vec![
                    Field::required("pain", Shape::text()),
                    Field::required("priority_score", Shape::number(0.0, 100.0)),
                ]),
                1,
            ),
        ),
        Field::required("messaging_implications", texts(1)),
    ])
}

pub fn journey_map_shape() -> Shape {
    let stage = Shape::object(vec![
        Field::required("objective", Shape::text()),
        Field::required("key_questions", texts(1)),
        Field::required(
            "content_ideas",
            Shape::list(
                Shape::object(vec![
                    Field::required("title", Shape::text()),
                    Field::optional("format", Shape::text()),
                    Field::optional("cta", Shape::text()),
                ]),
                1,
            ),
        ),
        Field::required("preferred_channels", texts(1)),
        Field::required("kpis", texts(1)),
    ]);
    let mut fields: Vec<Field> = JOURNEY_STAGES
        .iter()
        .map(|name| Field::required(format!("{}_stage", name), stage.clone()))
        .collect();
    fields.push(Field::required("cross_stage_recommendations", texts(1)));
    fields.push(Field::optional(
        "content_calendar_priorities",
        Shape::list(
            Shape::object(vec![
                Field::required("priority", Shape::integer(1, 50)),
                Field::required("stage", Shape::one_of(JOURNEY_STAGES)),
                Field::required("content_type", Shape::text()),
                Field::optional("rationale", Shape::text()),
            ]),
            0,
        ),
    ));
    Shape::object(fields)
}

/// The default stage list, in execution order.
pub fn research_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new(
            StageId::Ingestion,
            "Company research",
            INGESTION_PROMPT,
            company_profile_shape(),
            RESEARCH_MODEL,
        )
        .with_system_prompt(SYSTEM_PROMPT)
        .with_params(ModelParams {
            temperature: 0.3,
            json_mode: false,
            ..ModelParams::default()
        }),
        StageDefinition::new(
            StageId::SegmentGeneration,
            "Ideal customer profiles",
            SEGMENT_PROMPT,
            segment_list_shape(),
            ANALYSIS_MODEL,
        )
        .with_system_prompt(SYSTEM_PROMPT)
        .with_inputs([StageId::Ingestion])
        .with_fan_out(FanOut::new("segments").with_id_field("id")),
        StageDefinition::new(
            StageId::ValueMapping,
            "Value proposition canvas",
            VALUE_MAPPING_PROMPT,
            value_canvas_shape(),
            ANALYSIS_MODEL,
        )
        .with_system_prompt(SYSTEM_PROMPT)
        .per_entity()
        .with_inputs([StageId::Ingestion]),
        StageDefinition::new(
            StageId::PainTaxonomy,
            "Pain taxonomy",
            PAIN_TAXONOMY_PROMPT,
            pain_taxonomy_shape(),
            ANALYSIS_MODEL,
        )
        .with_system_prompt(SYSTEM_PROMPT)
        .per_entity()
        .with_inputs([StageId::Ingestion, StageId::ValueMapping]),
        StageDefinition::new(
            StageId::JourneyMapping,
            "Customer journey map",
            JOURNEY_PROMPT,
            journey_map_shape(),
            ANALYSIS_MODEL,
        )
        .with_system_prompt(SYSTEM_PROMPT)
        .per_entity()
        .with_inputs([StageId::ValueMapping, StageId::PainTaxonomy])
        .with_params(ModelParams {
            max_tokens: 8192,
            ..ModelParams::default()
        }),
    ]
}

impl StageConfig {
    /// The built-in research graph:
    /// `Ingestion -> SegmentGeneration -> [ValueMapping -> PainTaxonomy -> JourneyMapping]`
    /// with the bracketed chain run per segment.
    pub fn research_default() -> Self {
        Self {
            stages: research_stages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate;
    use serde_json::json;

    #[test]
    fn test_default_graph_is_valid() {
        let config = StageConfig::research_default();
        config.validate().unwrap();
        let chain: Vec<StageId> = config.entity_stages().map(|s| s.id).collect();
        assert_eq!(
            chain,
            vec![StageId::ValueMapping, StageId::PainTaxonomy, StageId::JourneyMapping]
        );
    }

    #[test]
    fn test_default_graph_survives_json_round_trip() {
        let config = StageConfig::research_default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(StageConfig::from_json_str(&text).unwrap(), config);
    }

    #[test]
    fn test_empty_segment_list_validates() {
        assert!(validate(r#"{"segments": []}"#, &segment_list_shape()).is_ok());
    }

    #[test]
    fn test_journey_requires_every_stage() {
        let shape = journey_map_shape();
        let stage = json!({
            "objective": "o", "key_questions": ["q"], "content_ideas": [{"title": "t"}],
            "preferred_channels": ["c"], "kpis": ["k"]
        });
        let mut doc = json!({"cross_stage_recommendations": ["r"]});
        for name in JOURNEY_STAGES.iter().take(4) {
            doc[format!("{}_stage", name)] = stage.clone();
        }
        let err = validate(&doc.to_string(), &shape).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].path, "$.expansion_stage");

        doc["expansion_stage"] = stage;
        assert!(validate(&doc.to_string(), &shape).is_ok());
    }

    #[test]
    fn test_skeleton_is_embedded_in_prompts() {
        for stage in research_stages() {
            assert!(stage.prompt_template.contains("{schema}"), "{}", stage.id);
        }
    }
}
