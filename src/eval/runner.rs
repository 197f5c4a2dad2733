use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tracing::{error, info};

use crate::{
    driver::{DriverOptions, ModelDriver},
    error::LLMError,
    eval::{
        report::{CaseReport, EvalReport},
        scenario::ScenarioSpec,
    },
    prompts::{PromptSet, Variant},
    providers::{scripted::ScriptedProvider, LLMProvider},
    scoring::{score, ScoreWeights},
};

pub const GROUND_TRUTH_MODEL: &str = "ground-truth";

/// Builds the provider for live variants. Called once per cell, so missing
/// credentials surface as case errors instead of aborting the batch.
pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn LLMProvider>, LLMError> + Send + Sync>;

/// Immutable description of a batch.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub scenarios: Vec<Arc<ScenarioSpec>>,
    pub variants: Vec<Variant>,
    pub models: Vec<String>,
    pub prompts: Arc<PromptSet>,
    pub driver: DriverOptions,
    pub weights: ScoreWeights,
    pub concurrency: usize,
}

impl EvalConfig {
    pub fn new(scenarios: Vec<ScenarioSpec>) -> Self {
        Self {
            scenarios: scenarios.into_iter().map(Arc::new).collect(),
            variants: vec![Variant::GroundTruth],
            models: vec![DriverOptions::default().model],
            prompts: Arc::new(PromptSet::default()),
            driver: DriverOptions::default(),
            weights: ScoreWeights::default(),
            concurrency: 1,
        }
    }

    pub fn with_variants(mut self, variants: impl IntoIterator<Item = Variant>) -> Self {
        self.variants = variants.into_iter().collect();
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models: Vec<String> = models.into_iter().map(Into::into).collect();
        if !models.is_empty() {
            self.models = models;
        }
        self
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    pub fn with_driver_options(mut self, options: DriverOptions) -> Self {
        self.driver = options;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Keeps the first `limit` scenarios.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.scenarios.truncate(limit);
        self
    }

    fn cells(&self) -> Vec<Cell> {
        let mut cells = Vec::new();
        for variant in &self.variants {
            for scenario in &self.scenarios {
                if variant.is_live() {
                    for model in &self.models {
                        cells.push(Cell {
                            scenario: scenario.clone(),
                            variant: *variant,
                            model: model.clone(),
                        });
                    }
                } else {
                    cells.push(Cell {
                        scenario: scenario.clone(),
                        variant: *variant,
                        model: GROUND_TRUTH_MODEL.to_string(),
                    });
                }
            }
        }
        cells
    }
}

#[derive(Debug, Clone)]
struct Cell {
    scenario: Arc<ScenarioSpec>,
    variant: Variant,
    model: String,
}

pub struct EvalRunner {
    config: EvalConfig,
    live_provider: Option<ProviderFactory>,
}

impl EvalRunner {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            live_provider: None,
        }
    }

    pub fn with_live_provider(mut self, factory: ProviderFactory) -> Self {
        self.live_provider = Some(factory);
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Runs every (scenario, variant, model) cell. Results keep cell order
    /// regardless of concurrency.
    pub async fn run(&self) -> EvalReport {
        let cells = self.config.cells();
        info!(cells = cells.len(), concurrency = self.config.concurrency, "evaluation started");
        let cases: Vec<CaseReport> = stream::iter(cells)
            .map(|cell| self.run_cell(cell))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;
        EvalReport::from_cases(cases)
    }

    async fn run_cell(&self, cell: Cell) -> CaseReport {
        let Cell {
            scenario,
            variant,
            model,
        } = cell;

        let provider: Arc<dyn LLMProvider> = if variant.is_live() {
            let built = match &self.live_provider {
                Some(factory) => factory().map_err(|err| format!("provider unavailable: {err}")),
                None => Err("no live model provider configured".to_string()),
            };
            match built {
                Ok(provider) => provider,
                Err(message) => {
                    error!(scenario = %scenario.id, %variant, %model, %message, "cell skipped");
                    return CaseReport::harness_error(&scenario.id, variant, &model, message);
                }
            }
        } else {
            Arc::new(ScriptedProvider::from_ground_truth(&scenario.ground_truth))
        };

        let options = self.config.driver.clone().with_model(model.clone());
        let driver = ModelDriver::new(provider, self.config.prompts.clone(), options);
        match driver.run(scenario.clone(), variant).await {
            Ok(run) => {
                let result = score(&scenario, &run.state, &run.history, &run.termination, self.config.weights);
                info!(
                    scenario = %scenario.id,
                    %variant,
                    %model,
                    technical = result.technical_success,
                    administrative = result.administrative_success,
                    score = result.weighted.total,
                    "case scored"
                );
                CaseReport::from_run(run, result)
            }
            Err(err) => {
                error!(scenario = %scenario.id, %variant, %model, error = %err, "harness error");
                CaseReport::harness_error(&scenario.id, variant, &model, err.to_string())
            }
        }
    }
}
