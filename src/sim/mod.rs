//! Deterministic incident simulation: per-run state, the four tools and the
//! runtime that dispatches model calls onto them.

pub mod runtime;
pub mod state;
pub mod tools;

pub use runtime::{ActionHistory, ActionRecord, ScenarioRuntime};
pub use state::{LogEntry, ScenarioState, Severity, Ticket, TicketStatus};
pub use tools::{Status, ToolCall, ToolKind, ToolResult};
