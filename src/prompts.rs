use std::{
    fs,
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

use crate::{eval::scenario::ScenarioSpec, functions::FunctionDefinition};

const BASELINE: &str = include_str!("../prompts/baseline.hbs");
const IMPROVED: &str = include_str!("../prompts/improved.hbs");

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template render error: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Which system prompt a run receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Replays the scenario's reference solution instead of asking a model.
    GroundTruth,
    Baseline,
    Improved,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::GroundTruth => "ground-truth",
            Variant::Baseline => "baseline",
            Variant::Improved => "improved",
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Variant::GroundTruth)
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    baseline: String,
    improved: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            baseline: BASELINE.to_string(),
            improved: IMPROVED.to_string(),
        }
    }
}

#[derive(Serialize)]
struct MetricContext<'a> {
    name: &'a str,
    has_thresholds: bool,
    good: Option<f64>,
    concerning: Option<f64>,
}

#[derive(Serialize)]
struct PromptContext<'a> {
    id: &'a str,
    service: &'a str,
    namespace: &'a str,
    primary_metric: &'a str,
    initial_replicas: u32,
    max_replicas: u32,
    max_steps: usize,
    metrics: Vec<MetricContext<'a>>,
}

impl PromptSet {
    pub fn new(baseline: impl Into<String>, improved: impl Into<String>) -> Self {
        Self {
            baseline: baseline.into(),
            improved: improved.into(),
        }
    }

    /// Reads `baseline.hbs` and `improved.hbs` from `dir`; a missing file
    /// keeps the built-in template.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, PromptError> {
        let dir = dir.as_ref();
        let mut set = Self::default();
        for (file, slot) in [
            ("baseline.hbs", &mut set.baseline),
            ("improved.hbs", &mut set.improved),
        ] {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            *slot = fs::read_to_string(&path).map_err(|source| PromptError::Io { path, source })?;
        }
        Ok(set)
    }

    fn template(&self, variant: Variant) -> &str {
        match variant {
            Variant::Improved => &self.improved,
            Variant::Baseline | Variant::GroundTruth => &self.baseline,
        }
    }

    pub fn render(&self, variant: Variant, spec: &ScenarioSpec) -> Result<String, PromptError> {
        let context = PromptContext {
            id: &spec.id,
            service: &spec.service,
            namespace: &spec.namespace,
            primary_metric: &spec.primary_metric,
            initial_replicas: spec.initial_replicas,
            max_replicas: spec.max_replicas,
            max_steps: spec.max_steps,
            metrics: spec
                .metrics
                .iter()
                .map(|(name, metric)| MetricContext {
                    name,
                    has_thresholds: metric.thresholds.is_some(),
                    good: metric.thresholds.map(|t| t.good),
                    concerning: metric.thresholds.map(|t| t.concerning),
                })
                .collect(),
        };
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        Ok(hb.render_template(self.template(variant), &context)?.trim().to_string())
    }
}

/// System preamble listing the tools and the text response format.
pub fn tool_preamble(definitions: &[FunctionDefinition]) -> String {
    let mut lines = vec!["TOOLS AVAILABLE (invoke one at a time):".to_string()];
    for def in definitions {
        lines.push(format!("- {}", def.signature()));
        if let Some(description) = &def.description {
            lines.push(format!("  {description}"));
        }
    }
    lines.push(String::new());
    lines.push("RESPONSE FORMAT (strict JSON, no extra text):".to_string());
    lines.push(r#"{"tool_call": {"name": "<tool_name>", "arguments": { ... }}}"#.to_string());
    lines.push(r#"OR {"final_answer": "<concise result/summary>"}"#.to_string());
    lines.join("\n")
}
