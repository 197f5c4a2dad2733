use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use opsbench::{
    driver::DriverOptions,
    eval::{load_scenarios, EvalConfig, EvalRunner, ProviderFactory},
    prompts::{PromptSet, Variant},
    providers::{openrouter::OpenRouter, LLMProvider},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    GroundTruth,
    Baseline,
    Improved,
    Both,
}

impl VariantArg {
    fn variants(self) -> Vec<Variant> {
        match self {
            VariantArg::GroundTruth => vec![Variant::GroundTruth],
            VariantArg::Baseline => vec![Variant::Baseline],
            VariantArg::Improved => vec![Variant::Improved],
            VariantArg::Both => vec![Variant::Baseline, Variant::Improved],
        }
    }
}

#[derive(Parser)]
#[command(name = "opsbench-eval")]
#[command(about = "Evaluate LLM tool orchestration on simulated SRE incidents")]
struct Args {
    /// Which prompting strategy to run
    #[arg(long, value_enum, default_value = "ground-truth")]
    variant: VariantArg,

    /// Number of scenarios to run, in file order
    #[arg(long, default_value_t = 1)]
    limit: usize,

    /// Model identifier for live variants (repeatable)
    #[arg(long = "model")]
    models: Vec<String>,

    /// Scenario file or directory (YAML/JSON)
    #[arg(long, default_value = "data/scenarios")]
    scenarios: PathBuf,

    /// Directory with baseline.hbs / improved.hbs overriding the built-in prompts
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// Output directory for results.json and results.md
    #[arg(long, default_value = "results")]
    out: PathBuf,

    /// Runs evaluated at the same time
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Log each run and tool call
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,opsbench=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn write_outputs(out: &Path, json: &str, markdown: &str) -> std::io::Result<()> {
    fs::create_dir_all(out)?;
    fs::write(out.join("results.json"), json)?;
    fs::write(out.join("results.md"), markdown)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.verbose);

    let scenarios = load_scenarios(&args.scenarios)?;
    if scenarios.is_empty() {
        eprintln!("No scenarios found in {}.", args.scenarios.display());
        std::process::exit(2);
    }

    let prompts = match &args.prompts {
        Some(dir) => PromptSet::from_dir(dir)?,
        None => PromptSet::default(),
    };

    let config = EvalConfig::new(scenarios)
        .with_limit(args.limit)
        .with_variants(args.variant.variants())
        .with_models(args.models.clone())
        .with_prompts(prompts)
        .with_driver_options(DriverOptions::default())
        .with_concurrency(args.concurrency);

    let factory: ProviderFactory = Arc::new(|| {
        let provider: Arc<dyn LLMProvider> = Arc::new(OpenRouter::from_env()?);
        Ok(provider)
    });
    let report = EvalRunner::new(config).with_live_provider(factory).run().await;

    let json = serde_json::to_string_pretty(&report)?;
    let markdown = report.render_markdown();
    write_outputs(&args.out, &json, &markdown)?;

    for summary in &report.summaries {
        println!(
            "{} / {}: technical {}/{}, administrative {}/{}, both {}/{}, model errors {}, avg score {:.1}%",
            summary.variant,
            summary.model,
            summary.technical_passed,
            summary.total,
            summary.administrative_passed,
            summary.total,
            summary.full_passed,
            summary.total,
            summary.model_errors,
            summary.average_score
        );
    }
    println!("Results written to {}", args.out.display());

    if report.has_errors() {
        eprintln!(
            "{} model error(s), {} harness error(s)",
            report.model_error_count(),
            report.harness_error_count()
        );
        std::process::exit(1);
    }
    Ok(())
}
