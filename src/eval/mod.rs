pub mod report;
pub mod runner;
pub mod scenario;

pub use report::{CaseReport, EvalReport, VariantSummary};
pub use runner::{EvalConfig, EvalRunner, ProviderFactory};
pub use scenario::{load_scenarios, ScenarioSpec};
