use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ScenarioError,
    scoring::AcceptanceCriteria,
    sim::{state::TicketStatus, tools::render_guidance, Status, ToolCall, ToolKind},
};

/// Declarative description of one synthetic incident. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub user_prompt: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Metric reported back by `k8s_scale`.
    pub primary_metric: String,
    pub initial_replicas: u32,
    pub max_replicas: u32,
    /// Tool-call step budget.
    pub max_steps: usize,
    pub metrics: BTreeMap<String, MetricSpec>,
    #[serde(default)]
    pub initial_ticket: TicketStatus,
    #[serde(default)]
    pub guidance: Guidance,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    /// Reference solution replayed by the ground-truth variant.
    #[serde(default)]
    pub ground_truth: Vec<ToolCall>,
}

fn default_service() -> String {
    "api".to_string()
}

fn default_namespace() -> String {
    "prod".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub initial: f64,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    #[serde(default)]
    pub curve: ScalingCurve,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    LowerIsBetter,
    HigherIsBetter,
}

/// `good` bounds the target band, `concerning` the warning band; anything
/// beyond is critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub good: f64,
    pub concerning: f64,
}

impl MetricSpec {
    pub fn is_tracked(&self) -> bool {
        self.thresholds.is_some()
    }

    pub fn classify(&self, value: f64) -> Status {
        let Some(thresholds) = self.thresholds else {
            return Status::Info;
        };
        let within = |bound: f64| match self.direction {
            Direction::LowerIsBetter => value <= bound,
            Direction::HigherIsBetter => value >= bound,
        };
        if within(thresholds.good) {
            Status::Good
        } else if within(thresholds.concerning) {
            Status::Concerning
        } else {
            Status::Critical
        }
    }
}

/// How a metric responds to the replica count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingCurve {
    #[default]
    Constant,
    /// `floor + (initial - floor) * (initial_replicas / replicas)^exponent`
    InversePower { floor: f64, exponent: f64 },
    /// `initial * replicas / initial_replicas`
    Proportional,
    /// Arithmetic over `{initial}`, `{replicas}` and `{initial_replicas}`.
    Expression { expr: String },
}

impl ScalingCurve {
    pub fn evaluate(&self, initial: f64, initial_replicas: u32, replicas: u32) -> Result<f64, String> {
        let base = f64::from(initial_replicas);
        let current = f64::from(replicas);
        match self {
            ScalingCurve::Constant => Ok(initial),
            ScalingCurve::InversePower { floor, exponent } => {
                Ok(floor + (initial - floor) * (base / current).powf(*exponent))
            }
            ScalingCurve::Proportional => Ok(initial * current / base),
            ScalingCurve::Expression { expr } => {
                let rendered = expr
                    .replace("{initial_replicas}", &float_literal(base))
                    .replace("{initial}", &float_literal(initial))
                    .replace("{replicas}", &float_literal(current));
                match evalexpr::eval(&rendered).map_err(|err| err.to_string())? {
                    evalexpr::Value::Int(v) => Ok(v as f64),
                    evalexpr::Value::Float(v) => Ok(v),
                    other => Err(format!("expression did not evaluate to a number: {other:?}")),
                }
            }
        }
    }
}

// evalexpr treats `6` as an integer; keep the decimal point so division stays float.
fn float_literal(value: f64) -> String {
    format!("{value:?}")
}

/// Metric values for every valid replica count, computed once per runtime.
#[derive(Debug, Clone, Default)]
pub struct CurveTable {
    values: BTreeMap<String, Vec<f64>>,
}

impl CurveTable {
    /// `replicas` is 1-based; out-of-range counts yield `None`.
    pub fn value(&self, metric: &str, replicas: u32) -> Option<f64> {
        let index = usize::try_from(replicas).ok()?.checked_sub(1)?;
        self.values.get(metric)?.get(index).copied()
    }
}

const CURVE_TOLERANCE: f64 = 1e-9;

impl ScenarioSpec {
    pub fn tracked_metrics(&self) -> impl Iterator<Item = (&String, &MetricSpec)> {
        self.metrics.iter().filter(|(_, spec)| spec.is_tracked())
    }

    /// Thresholded metrics whose value is not `good`, with their tier.
    pub fn unhealthy_metrics(&self, values: &BTreeMap<String, f64>) -> Vec<(String, Status)> {
        self.tracked_metrics()
            .filter_map(|(name, spec)| {
                let value = values.get(name).copied().unwrap_or(spec.initial);
                let status = spec.classify(value);
                (status != Status::Good).then(|| (name.clone(), status))
            })
            .collect()
    }

    pub fn initial_metrics(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(name, spec)| (name.clone(), spec.initial))
            .collect()
    }

    pub fn tabulate_curves(&self) -> Result<CurveTable, ScenarioError> {
        let mut values = BTreeMap::new();
        for (name, metric) in &self.metrics {
            let mut row = Vec::with_capacity(self.max_replicas as usize);
            for replicas in 1..=self.max_replicas {
                let value = metric
                    .curve
                    .evaluate(metric.initial, self.initial_replicas, replicas)
                    .map_err(|err| ScenarioError::invalid(&self.id, format!("metric {name}: {err}")))?;
                if !value.is_finite() {
                    return Err(ScenarioError::invalid(
                        &self.id,
                        format!("metric {name} is not finite at {replicas} replicas"),
                    ));
                }
                row.push(value);
            }

            let at_initial = row
                .get((self.initial_replicas as usize).wrapping_sub(1))
                .copied()
                .ok_or_else(|| {
                    ScenarioError::invalid(&self.id, "initial_replicas is outside 1..=max_replicas")
                })?;
            if (at_initial - metric.initial).abs() > CURVE_TOLERANCE * metric.initial.abs().max(1.0) {
                return Err(ScenarioError::invalid(
                    &self.id,
                    format!(
                        "curve for {name} gives {at_initial} at {} replicas, expected {}",
                        self.initial_replicas, metric.initial
                    ),
                ));
            }

            if metric.is_tracked() {
                let worsens = row.windows(2).any(|pair| match metric.direction {
                    Direction::LowerIsBetter => pair[1] > pair[0] + CURVE_TOLERANCE,
                    Direction::HigherIsBetter => pair[1] + CURVE_TOLERANCE < pair[0],
                });
                if worsens {
                    return Err(ScenarioError::invalid(
                        &self.id,
                        format!("curve for {name} gets worse as replicas increase"),
                    ));
                }
            }

            values.insert(name.clone(), row);
        }
        Ok(CurveTable { values })
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.id.trim().is_empty() {
            return Err(ScenarioError::invalid(&self.id, "id must not be empty"));
        }
        if self.max_replicas == 0 || self.initial_replicas == 0 || self.initial_replicas > self.max_replicas {
            return Err(ScenarioError::invalid(
                &self.id,
                format!(
                    "initial_replicas {} must be within 1..={}",
                    self.initial_replicas, self.max_replicas
                ),
            ));
        }
        if self.max_steps == 0 {
            return Err(ScenarioError::invalid(&self.id, "max_steps must be positive"));
        }
        if !self.metrics.contains_key(&self.primary_metric) {
            return Err(ScenarioError::invalid(
                &self.id,
                format!("primary_metric {} is not defined", self.primary_metric),
            ));
        }
        for (name, metric) in &self.metrics {
            if let Some(thresholds) = metric.thresholds {
                let ordered = match metric.direction {
                    Direction::LowerIsBetter => thresholds.good <= thresholds.concerning,
                    Direction::HigherIsBetter => thresholds.good >= thresholds.concerning,
                };
                if !ordered {
                    return Err(ScenarioError::invalid(
                        &self.id,
                        format!("thresholds for {name} are out of order"),
                    ));
                }
            }
        }
        for call in &self.ground_truth {
            call.name
                .parse::<ToolKind>()
                .map_err(|err| ScenarioError::invalid(&self.id, format!("ground truth: {err}")))?;
        }
        self.guidance
            .check_templates()
            .map_err(|err| ScenarioError::invalid(&self.id, format!("guidance: {err}")))?;
        self.tabulate_curves()?;
        Ok(())
    }
}

/// Per-tier recommendation overrides; unset entries use built-in text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierText {
    pub good: Option<String>,
    pub concerning: Option<String>,
    pub critical: Option<String>,
    pub info: Option<String>,
}

impl TierText {
    fn get(&self, status: Status) -> Option<&str> {
        match status {
            Status::Good => self.good.as_deref(),
            Status::Concerning => self.concerning.as_deref(),
            Status::Critical => self.critical.as_deref(),
            Status::Info => self.info.as_deref(),
            Status::Acknowledged | Status::Rejected => None,
        }
    }

    fn texts(&self) -> impl Iterator<Item = &String> {
        [&self.good, &self.concerning, &self.critical, &self.info]
            .into_iter()
            .flatten()
    }
}

/// Recommendation table keyed by (tool, status). Text is a Handlebars
/// template over `metric`, `value`, `replicas`, `status`, `tier` and `ordinal`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Guidance {
    pub metrics_query: TierText,
    pub k8s_scale: TierText,
    pub incident_log: Option<String>,
    pub ticket_update: Option<String>,
    pub premature_resolution: Option<String>,
}

impl Guidance {
    pub fn recommendation(&self, tool: ToolKind, status: Status) -> &str {
        let custom = match tool {
            ToolKind::MetricsQuery => self.metrics_query.get(status),
            ToolKind::K8sScale => self.k8s_scale.get(status),
            ToolKind::IncidentLog => self.incident_log.as_deref(),
            ToolKind::TicketUpdate => self.ticket_update.as_deref(),
        };
        custom.unwrap_or_else(|| default_recommendation(tool, status))
    }

    pub fn premature_resolution(&self) -> &str {
        self.premature_resolution.as_deref().unwrap_or(
            "The ticket was marked resolved while {{metric}} is still {{tier}}. \
             Fix the underlying issue and confirm the metrics are good before closing.",
        )
    }

    fn check_templates(&self) -> Result<(), String> {
        let custom = self
            .metrics_query
            .texts()
            .chain(self.k8s_scale.texts())
            .chain(self.incident_log.iter())
            .chain(self.ticket_update.iter())
            .chain(self.premature_resolution.iter());
        for text in custom {
            render_guidance(text, &serde_json::json!({})).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

fn default_recommendation(tool: ToolKind, status: Status) -> &'static str {
    match (tool, status) {
        (ToolKind::MetricsQuery, Status::Good) => {
            "{{metric}} is within target. Verify related signals, then record the incident and close the ticket."
        }
        (ToolKind::MetricsQuery, Status::Concerning) => {
            "{{metric}} is above target but below the critical band. Consider further scaling before closing anything."
        }
        (ToolKind::MetricsQuery, Status::Critical) => {
            "{{metric}} is critical. Mitigate first, for example by scaling out, and re-check afterwards."
        }
        (ToolKind::MetricsQuery, _) => "Current {{metric}} with {{replicas}} replicas.",
        (ToolKind::K8sScale, Status::Good) => {
            "Scaled to {{replicas}} replicas and {{metric}} is back within target. Log the mitigation and resolve the ticket."
        }
        (ToolKind::K8sScale, Status::Concerning) => {
            "Scaled to {{replicas}} replicas. {{metric}} improved but is still above target; scale further and verify."
        }
        (ToolKind::K8sScale, Status::Critical) => {
            "Scaled to {{replicas}} replicas but {{metric}} is still critical. Scale further and re-check."
        }
        (ToolKind::K8sScale, _) => "Scaled to {{replicas}} replicas.",
        (ToolKind::IncidentLog, _) => "Incident log entry #{{ordinal}} recorded.",
        (ToolKind::TicketUpdate, _) => "Ticket status set to {{status}}.",
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioFile {
    Many(Vec<ScenarioSpec>),
    One(Box<ScenarioSpec>),
}

/// Loads scenarios from a YAML/JSON file (one scenario or a list) or from
/// every such file in a directory, in file-name order.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<ScenarioSpec>, ScenarioError> {
    let path = path.as_ref();
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                files.push(p);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }

    let mut scenarios = Vec::new();
    for file in files {
        let bytes = fs::read(&file)?;
        let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
        let parsed: ScenarioFile = if ext == "json" {
            serde_json::from_slice(&bytes).map_err(|e| parse_error(&file, e))?
        } else {
            serde_yaml::from_slice(&bytes).map_err(|e| parse_error(&file, e))?
        };
        match parsed {
            ScenarioFile::Many(many) => scenarios.extend(many),
            ScenarioFile::One(one) => scenarios.push(*one),
        }
    }

    let mut seen = HashSet::new();
    for scenario in &scenarios {
        scenario.validate()?;
        if !seen.insert(scenario.id.clone()) {
            return Err(ScenarioError::invalid(&scenario.id, "duplicate scenario id"));
        }
    }
    Ok(scenarios)
}

fn parse_error(path: &Path, err: impl std::fmt::Display) -> ScenarioError {
    ScenarioError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
