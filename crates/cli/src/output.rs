//! Output formatting for CLI

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use pagewright_core::report::{RunReport, StepStatus};
use pagewright_core::{Scenario, ScenarioStatus, SuiteReport};

fn table(headers: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers);
    table
}

fn status_cell(status: ScenarioStatus) -> String {
    let text = status.to_string();
    match status {
        ScenarioStatus::Completed => text.green().to_string(),
        ScenarioStatus::SoftFailed => text.yellow().to_string(),
        ScenarioStatus::HardFailed => text.red().to_string(),
        ScenarioStatus::Pending | ScenarioStatus::Running => text,
    }
}

fn passed_steps(report: &RunReport) -> usize {
    report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Passed)
        .count()
}

/// Print the scenario table
pub fn print_scenarios<'a>(scenarios: impl Iterator<Item = &'a Scenario>) {
    let mut table = table(vec!["Name", "Tags", "Steps", "Routes", "Kind"]);
    let mut count = 0;
    for scenario in scenarios {
        count += 1;
        table.add_row(vec![
            scenario.name.clone(),
            scenario.tags.join(", "),
            scenario.steps.len().to_string(),
            scenario.routes.len().to_string(),
            if scenario.fragment { "fragment" } else { "scenario" }.to_string(),
        ]);
    }

    if count == 0 {
        println!("No scenarios found.");
        return;
    }
    println!("{table}");
}

/// Print per-scenario results, then a failure table when anything failed
pub fn print_suite(suite: &SuiteReport) {
    let mut results = table(vec!["Scenario", "Status", "Steps", "Duration", "Injected"]);
    for report in &suite.results {
        results.add_row(vec![
            report.scenario.clone(),
            status_cell(report.status),
            format!("{}/{}", passed_steps(report), report.steps.len()),
            format!("{} ms", report.duration_ms),
            if report.state_injected { "yes" } else { "" }.to_string(),
        ]);
    }
    println!("{results}");

    let failures: Vec<_> = suite
        .results
        .iter()
        .flat_map(|r| {
            r.failures().map(move |s| {
                let failure = s.failure.as_ref();
                vec![
                    r.scenario.clone(),
                    format!("{} {}", s.index, s.label),
                    failure.map_or(String::new(), |f| format!("{:?}", f.kind)),
                    failure.map_or(String::new(), |f| f.message.clone()),
                    s.artifacts
                        .first()
                        .map_or(String::new(), |p| p.display().to_string()),
                ]
            })
        })
        .collect();

    if !failures.is_empty() {
        let mut table = table(vec!["Scenario", "Step", "Kind", "Message", "Evidence"]);
        for row in failures {
            table.add_row(row);
        }
        println!("{table}");
    }

    let summary = format!(
        "{} scenario(s): {} completed, {} with warnings, {} failed ({} ms)",
        suite.total, suite.completed, suite.warnings, suite.failed, suite.duration_ms
    );
    if suite.failed > 0 {
        print_error(&summary);
    } else if suite.warnings > 0 {
        print_warning(&summary);
    } else {
        print_success(&summary);
    }
}

/// Print a simple message
pub fn print_message(message: &str) {
    println!("{}", message);
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}
