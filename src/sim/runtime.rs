use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::{RuntimeError, ScenarioError, ToolError},
    eval::scenario::{CurveTable, ScenarioSpec},
    sim::{
        state::{ScenarioState, Ticket},
        tools::{self, ToolCall, ToolContext, ToolKind, ToolResult},
    },
};

/// One dispatched call and the state it left behind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub step: usize,
    pub call: ToolCall,
    pub result: ToolResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub replicas_after: u32,
    pub metrics_after: BTreeMap<String, f64>,
    pub ticket_after: Ticket,
}

impl ActionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn tool(&self) -> Option<ToolKind> {
        self.call.name.parse().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ActionHistory {
    records: Vec<ActionRecord>,
}

impl ActionHistory {
    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.iter()
    }

    pub(crate) fn push(&mut self, record: ActionRecord) {
        self.records.push(record);
    }
}

/// Compiled argument schemas for every tool.
struct ArgumentValidators {
    schemas: HashMap<ToolKind, JSONSchema>,
}

impl ArgumentValidators {
    fn compile() -> Result<Self, ScenarioError> {
        let mut schemas = HashMap::new();
        for kind in ToolKind::ALL {
            let schema = kind
                .definition()
                .parameters
                .to_value()
                .map_err(|e| ScenarioError::ToolSchema {
                    tool: kind.name().to_string(),
                    message: e.to_string(),
                })?;
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
                .map_err(|e| ScenarioError::ToolSchema {
                    tool: kind.name().to_string(),
                    message: e.to_string(),
                })?;
            schemas.insert(kind, compiled);
        }
        Ok(Self { schemas })
    }

    fn check(&self, kind: ToolKind, arguments: &Value) -> Result<(), ToolError> {
        let Some(schema) = self.schemas.get(&kind) else {
            return Ok(());
        };
        schema.validate(arguments).map_err(|errors| {
            let message = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            ToolError::InvalidArguments {
                tool: kind.name().to_string(),
                message,
            }
        })
    }
}

impl fmt::Debug for ArgumentValidators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentValidators")
            .field("tools", &self.schemas.len())
            .finish()
    }
}

/// Owns the state of a single scenario run. `apply` is the only way to
/// change it.
#[derive(Debug)]
pub struct ScenarioRuntime {
    spec: Arc<ScenarioSpec>,
    curves: CurveTable,
    validators: ArgumentValidators,
    state: ScenarioState,
    history: ActionHistory,
}

impl ScenarioRuntime {
    pub fn new(spec: Arc<ScenarioSpec>) -> Result<Self, ScenarioError> {
        spec.validate()?;
        let curves = spec.tabulate_curves()?;
        let validators = ArgumentValidators::compile()?;
        let state = ScenarioState::from_spec(&spec);
        Ok(Self {
            spec,
            curves,
            validators,
            state,
            history: ActionHistory::default(),
        })
    }

    pub fn spec(&self) -> &ScenarioSpec {
        &self.spec
    }

    pub fn state(&self) -> &ScenarioState {
        &self.state
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn remaining_steps(&self) -> usize {
        self.spec.max_steps.saturating_sub(self.state.steps())
    }

    /// Dispatches one call. Tool failures come back as a `rejected` result
    /// and still consume a step; only an exhausted budget is an `Err`.
    pub fn apply(&mut self, call: ToolCall) -> Result<ToolResult, RuntimeError> {
        let budget = self.spec.max_steps;
        if self.state.steps() >= budget {
            return Err(RuntimeError::StepBudgetExceeded { budget });
        }
        let step = self.state.begin_step();

        let outcome = call.name.parse::<ToolKind>().and_then(|kind| {
            self.validators.check(kind, &call.arguments)?;
            let ctx = ToolContext {
                spec: &self.spec,
                curves: &self.curves,
            };
            tools::execute(kind, &ctx, &mut self.state, call.arguments.clone())
        });

        let (result, error) = match outcome {
            Ok(result) => {
                info!(
                    scenario = %self.spec.id,
                    step,
                    tool = %call.name,
                    status = %result.status,
                    "tool call applied"
                );
                (result, None)
            }
            Err(err) => {
                debug!(scenario = %self.spec.id, step, tool = %call.name, error = %err, "tool call rejected");
                (tools::rejection(&call.name, &err), Some(err))
            }
        };

        self.history.push(ActionRecord {
            step,
            call,
            result: result.clone(),
            error,
            replicas_after: self.state.replicas(),
            metrics_after: self.state.metrics().clone(),
            ticket_after: self.state.ticket().clone(),
        });
        Ok(result)
    }

    pub fn into_parts(self) -> (ScenarioState, ActionHistory) {
        (self.state, self.history)
    }
}
