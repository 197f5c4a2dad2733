use std::{collections::BTreeMap, fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{error::ToolError, eval::scenario::ScenarioSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Open,
    Investigating,
    InProgress,
    Mitigated,
    Resolved,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 5] = [
        TicketStatus::Open,
        TicketStatus::Investigating,
        TicketStatus::InProgress,
        TicketStatus::Mitigated,
        TicketStatus::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Investigating => "investigating",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Mitigated => "mitigated",
            TicketStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(|c: char| c == ' ' || c == '-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| ToolError::InvalidStatus { status: s.to_string() })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Ticket {
    pub status: TicketStatus,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub ordinal: u64,
    pub severity: Severity,
    pub message: String,
}

/// Mutable state of one scenario run. Only the runtime's dispatch path writes
/// to it; everything else gets a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioState {
    metrics: BTreeMap<String, f64>,
    replicas: u32,
    ticket: Ticket,
    incident_log: Vec<LogEntry>,
    steps: usize,
}

impl ScenarioState {
    pub fn from_spec(spec: &ScenarioSpec) -> Self {
        Self {
            metrics: spec.initial_metrics(),
            replicas: spec.initial_replicas,
            ticket: Ticket {
                status: spec.initial_ticket,
                notes: String::new(),
            },
            incident_log: Vec::new(),
            steps: 0,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    pub fn incident_log(&self) -> &[LogEntry] {
        &self.incident_log
    }

    /// Tool calls consumed so far, rejected ones included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub(crate) fn begin_step(&mut self) -> usize {
        self.steps += 1;
        self.steps
    }

    pub(crate) fn set_replicas(&mut self, replicas: u32) {
        self.replicas = replicas;
    }

    pub(crate) fn set_metric(&mut self, name: &str, value: f64) {
        if let Some(slot) = self.metrics.get_mut(name) {
            *slot = value;
        }
    }

    pub(crate) fn set_ticket(&mut self, status: TicketStatus, notes: Option<String>) {
        self.ticket.status = status;
        if let Some(notes) = notes {
            self.ticket.notes = notes;
        }
    }

    pub(crate) fn append_log(&mut self, severity: Severity, message: String) -> &LogEntry {
        let ordinal = self.incident_log.len() as u64 + 1;
        self.incident_log.push(LogEntry {
            ordinal,
            severity,
            message,
        });
        &self.incident_log[self.incident_log.len() - 1]
    }
}
