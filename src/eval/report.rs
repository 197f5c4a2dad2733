use std::fmt::Write as _;

use serde::Serialize;

use crate::{
    driver::DriverRun,
    prompts::Variant,
    scoring::{ScoreResult, Termination, WeightedScore},
    sim::ActionHistory,
    types::TokenUsage,
};

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub scenario_id: String,
    pub variant: Variant,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreResult>,
    pub model_turns: usize,
    pub usage: TokenUsage,
    pub actions: ActionHistory,
    /// Harness failure that kept the case from running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaseReport {
    pub fn from_run(run: DriverRun, score: ScoreResult) -> Self {
        Self {
            scenario_id: run.scenario_id,
            variant: run.variant,
            model: run.model,
            termination: Some(run.termination),
            score: Some(score),
            model_turns: run.model_turns,
            usage: run.usage,
            actions: run.history,
            error: None,
        }
    }

    pub fn harness_error(scenario_id: &str, variant: Variant, model: &str, message: String) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            variant,
            model: model.to_string(),
            termination: None,
            score: None,
            model_turns: 0,
            usage: TokenUsage::default(),
            actions: ActionHistory::default(),
            error: Some(message),
        }
    }

    pub fn is_model_error(&self) -> bool {
        self.termination.as_ref().is_some_and(Termination::is_model_error)
    }

    fn outcome(&self) -> &str {
        match (&self.error, &self.termination) {
            (Some(_), _) => "harness_error",
            (None, Some(termination)) => termination.label(),
            (None, None) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PartialCounts {
    pub tool_syntax_ok: usize,
    pub verification_performed: usize,
    pub incident_logged: usize,
    pub ticket_updated: usize,
}

/// Aggregate for one (variant, model) pair.
#[derive(Debug, Clone, Serialize)]
pub struct VariantSummary {
    pub variant: Variant,
    pub model: String,
    pub total: usize,
    pub technical_passed: usize,
    pub administrative_passed: usize,
    pub full_passed: usize,
    pub model_errors: usize,
    pub budget_exceeded: usize,
    pub harness_errors: usize,
    pub average_score: f64,
    /// Per-component weighted score averaged over scored runs.
    pub average_breakdown: WeightedScore,
    pub partial: PartialCounts,
}

impl VariantSummary {
    fn new(variant: Variant, model: &str) -> Self {
        Self {
            variant,
            model: model.to_string(),
            total: 0,
            technical_passed: 0,
            administrative_passed: 0,
            full_passed: 0,
            model_errors: 0,
            budget_exceeded: 0,
            harness_errors: 0,
            average_score: 0.0,
            average_breakdown: WeightedScore::default(),
            partial: PartialCounts::default(),
        }
    }

    fn add(&mut self, case: &CaseReport) {
        self.total += 1;
        if case.error.is_some() {
            self.harness_errors += 1;
        }
        match case.termination {
            Some(Termination::ModelError { .. }) => self.model_errors += 1,
            Some(Termination::BudgetExceeded { .. }) => self.budget_exceeded += 1,
            _ => {}
        }
        if let Some(score) = &case.score {
            self.technical_passed += usize::from(score.technical_success);
            self.administrative_passed += usize::from(score.administrative_success);
            self.full_passed += usize::from(score.full_success());
            self.partial.tool_syntax_ok += usize::from(score.partial.tool_syntax_ok);
            self.partial.verification_performed += usize::from(score.partial.verification_performed);
            self.partial.incident_logged += usize::from(score.partial.incident_logged);
            self.partial.ticket_updated += usize::from(score.partial.ticket_updated);
            // Running sums; divided in `finish`.
            let sum = &mut self.average_breakdown;
            let w = &score.weighted;
            sum.total += w.total;
            sum.technical += w.technical;
            sum.ticket += w.ticket;
            sum.incident_log += w.incident_log;
            sum.verification += w.verification;
            sum.syntax += w.syntax;
        }
    }

    fn finish(&mut self) {
        let scored = self.total.saturating_sub(self.harness_errors).max(1) as f64;
        let mean = |sum: f64| (sum / scored * 10.0).round() / 10.0;
        let sum = self.average_breakdown;
        self.average_breakdown = WeightedScore {
            total: mean(sum.total),
            technical: mean(sum.technical),
            ticket: mean(sum.ticket),
            incident_log: mean(sum.incident_log),
            verification: mean(sum.verification),
            syntax: mean(sum.syntax),
        };
        self.average_score = self.average_breakdown.total;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub generated_at: String,
    pub summaries: Vec<VariantSummary>,
    pub cases: Vec<CaseReport>,
}

impl EvalReport {
    pub fn from_cases(cases: Vec<CaseReport>) -> Self {
        let mut summaries: Vec<VariantSummary> = Vec::new();
        for case in &cases {
            let position = summaries
                .iter()
                .position(|s| s.variant == case.variant && s.model == case.model);
            let summary = match position {
                Some(index) => &mut summaries[index],
                None => {
                    summaries.push(VariantSummary::new(case.variant, &case.model));
                    let last = summaries.len() - 1;
                    &mut summaries[last]
                }
            };
            summary.add(case);
        }
        summaries.iter_mut().for_each(VariantSummary::finish);

        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            summaries,
            cases,
        }
    }

    pub fn model_error_count(&self) -> usize {
        self.cases.iter().filter(|c| c.is_model_error()).count()
    }

    pub fn harness_error_count(&self) -> usize {
        self.cases.iter().filter(|c| c.error.is_some()).count()
    }

    /// True when any run ended in a model or harness error.
    pub fn has_errors(&self) -> bool {
        self.model_error_count() + self.harness_error_count() > 0
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Incident tool-orchestration evaluation\n");
        let _ = writeln!(out, "Generated {}\n", self.generated_at);

        let _ = writeln!(out, "## Summary\n");
        let _ = writeln!(
            out,
            "| Variant | Model | Runs | Technical | Administrative | Both | Model errors | Budget exceeded | Avg score |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|---|");
        for s in &self.summaries {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {}/{} | {}/{} | {}/{} | {} | {} | {:.1}% |",
                s.variant,
                escape_cell(&s.model),
                s.total,
                s.technical_passed,
                s.total,
                s.administrative_passed,
                s.total,
                s.full_passed,
                s.total,
                s.model_errors,
                s.budget_exceeded,
                s.average_score
            );
        }

        let _ = writeln!(out, "\n## Average score breakdown\n");
        let _ = writeln!(out, "| Variant | Model | Technical | Ticket | Incident log | Verification | Syntax | Total |");
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
        for s in &self.summaries {
            let b = &s.average_breakdown;
            let _ = writeln!(
                out,
                "| {} | {} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} |",
                s.variant,
                escape_cell(&s.model),
                b.technical,
                b.ticket,
                b.incident_log,
                b.verification,
                b.syntax,
                b.total
            );
        }

        let _ = writeln!(out, "\n## Partial credit\n");
        let _ = writeln!(out, "| Variant | Model | Syntax ok | Verified | Incident logged | Ticket updated |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for s in &self.summaries {
            let p = &s.partial;
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                s.variant, escape_cell(&s.model), p.tool_syntax_ok, p.verification_performed, p.incident_logged, p.ticket_updated
            );
        }

        let _ = writeln!(out, "\n## Cases\n");
        let _ = writeln!(out, "| Scenario | Variant | Model | Outcome | Steps | Technical | Administrative | Score | Notes |");
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|---|");
        for case in &self.cases {
            let (technical, administrative, score, mut notes) = match &case.score {
                Some(score) => (
                    pass_mark(score.technical_success),
                    pass_mark(score.administrative_success),
                    format!("{:.1}", score.weighted.total),
                    score
                        .technical_failures
                        .iter()
                        .chain(score.administrative_failures.iter())
                        .cloned()
                        .collect::<Vec<_>>(),
                ),
                None => ("-", "-", "-".to_string(), Vec::new()),
            };
            if let Some(err) = &case.error {
                notes.push(err.clone());
            }
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
                escape_cell(&case.scenario_id),
                case.variant,
                escape_cell(&case.model),
                case.outcome(),
                case.actions.len(),
                technical,
                administrative,
                score,
                escape_cell(&notes.join("; "))
            );
        }
        out
    }
}

fn pass_mark(ok: bool) -> &'static str {
    if ok {
        "pass"
    } else {
        "fail"
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{PartialCredit, WeightedScore};

    fn scored(variant: Variant, model: &str, technical: bool, total: f64) -> CaseReport {
        CaseReport {
            scenario_id: "error-spike".into(),
            variant,
            model: model.into(),
            termination: Some(Termination::Completed {
                final_answer: "ok".into(),
            }),
            score: Some(ScoreResult {
                scenario_id: "error-spike".into(),
                technical_success: technical,
                administrative_success: true,
                step_count: 3,
                technical_failures: if technical { vec![] } else { vec!["error_rate is critical (0.12)".into()] },
                administrative_failures: vec![],
                partial: PartialCredit {
                    tool_syntax_ok: true,
                    ..PartialCredit::default()
                },
                weighted: WeightedScore {
                    total,
                    ..WeightedScore::default()
                },
            }),
            model_turns: 4,
            usage: TokenUsage::default(),
            actions: ActionHistory::default(),
            error: None,
        }
    }

    #[test]
    fn summarizes_per_variant_and_model() {
        let mut model_error = scored(Variant::Baseline, "m", false, 0.0);
        model_error.termination = Some(Termination::ModelError {
            message: "502".into(),
        });
        let report = EvalReport::from_cases(vec![
            scored(Variant::Baseline, "m", true, 100.0),
            scored(Variant::Baseline, "m", false, 40.0),
            model_error,
            scored(Variant::Improved, "m", true, 90.0),
            CaseReport::harness_error("error-spike", Variant::Improved, "m", "bad template".into()),
        ]);

        assert_eq!(report.summaries.len(), 2);
        let baseline = &report.summaries[0];
        assert_eq!(baseline.total, 3);
        assert_eq!(baseline.technical_passed, 1);
        assert_eq!(baseline.model_errors, 1);
        assert!((baseline.average_score - 46.7).abs() < 1e-9);
        assert_eq!(baseline.partial.tool_syntax_ok, 3);

        let improved = &report.summaries[1];
        assert_eq!(improved.harness_errors, 1);
        assert!((improved.average_score - 90.0).abs() < 1e-9);

        assert_eq!(report.model_error_count(), 1);
        assert_eq!(report.harness_error_count(), 1);
        assert!(report.has_errors());
    }

    #[test]
    fn markdown_lists_cases_and_notes() {
        let report = EvalReport::from_cases(vec![scored(Variant::Improved, "openai/gpt-4o", false, 40.0)]);
        let md = report.render_markdown();
        assert!(md.contains("| improved | openai/gpt-4o | 1 | 0/1 | 1/1 | 0/1 | 0 | 0 | 40.0% |"));
        assert!(md.contains("| error-spike | improved | openai/gpt-4o | completed | 0 | fail | pass | 40.0 | error_rate is critical (0.12) |"));
        assert!(!report.has_errors());
    }

    #[test]
    fn pipes_in_notes_do_not_split_cells() {
        let mut case = scored(Variant::Baseline, "m", false, 0.0);
        case.error = Some("template error: {{a | b}}\nline 2".into());
        let md = EvalReport::from_cases(vec![case]).render_markdown();
        let row = md
            .lines()
            .find(|line| line.starts_with("| error-spike |"))
            .unwrap();
        assert!(row.contains("template error: {{a \\| b}} line 2"), "{row}");
        assert_eq!(row.matches(" | ").count(), 8, "{row}");
    }

    #[test]
    fn averages_each_weighted_component() {
        let mut first = scored(Variant::Improved, "m", true, 100.0);
        let mut second = scored(Variant::Improved, "m", false, 35.0);
        if let Some(score) = first.score.as_mut() {
            score.weighted = WeightedScore {
                total: 100.0,
                technical: 60.0,
                ticket: 15.0,
                incident_log: 15.0,
                verification: 5.0,
                syntax: 5.0,
            };
        }
        if let Some(score) = second.score.as_mut() {
            score.weighted = WeightedScore {
                total: 35.0,
                technical: 0.0,
                ticket: 15.0,
                incident_log: 15.0,
                verification: 0.0,
                syntax: 5.0,
            };
        }
        let report = EvalReport::from_cases(vec![first, second]);
        let breakdown = report.summaries[0].average_breakdown;
        assert!((breakdown.technical - 30.0).abs() < 1e-9);
        assert!((breakdown.ticket - 15.0).abs() < 1e-9);
        assert!((breakdown.verification - 2.5).abs() < 1e-9);
        assert!((breakdown.total - 67.5).abs() < 1e-9);
        assert!((report.summaries[0].average_score - 67.5).abs() < 1e-9);

        let md = report.render_markdown();
        assert!(md.contains("## Average score breakdown"));
        assert!(md.contains("| improved | m | 30.0 | 15.0 | 15.0 | 2.5 | 5.0 | 67.5 |"), "{md}");
    }

    #[test]
    fn serializes_variant_names() {
        let report = EvalReport::from_cases(vec![scored(Variant::GroundTruth, "ground-truth", true, 100.0)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cases"][0]["variant"], "ground-truth");
        assert_eq!(json["summaries"][0]["full_passed"], 1);
    }
}
