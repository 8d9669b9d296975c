//! Usage and effectiveness report over a trailing window.

use anyhow::Result;
use chrono::{Duration, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use mitigate_core::report::build_report;
use mitigate_core::repository::MitigationRepository;
use mitigate_types::report::UsageReport;

use super::print_json;
use crate::state::AppState;

pub async fn handle_report(state: &AppState, hours: u32, json: bool) -> Result<()> {
    let to = Utc::now();
    let from = to - Duration::hours(i64::from(hours));
    let executions = state.repo.list_executions_started_between(from, to).await?;
    let report = build_report(from, to, &executions);

    if json {
        return print_json(&report);
    }
    print_report(&report, hours);
    Ok(())
}

fn print_report(report: &UsageReport, hours: u32) {
    println!();
    println!(
        "  {} last {}h ({} to {})",
        style("Mitigation report").bold(),
        hours,
        report.from.format("%Y-%m-%d %H:%M"),
        report.to.format("%Y-%m-%d %H:%M")
    );

    if report.total_executions == 0 {
        println!();
        println!("  No executions in this window.");
        println!();
        return;
    }

    println!("  Executions:    {}", report.total_executions);
    let statuses: Vec<String> = report
        .by_status
        .iter()
        .map(|(status, count)| format!("{status} {count}"))
        .collect();
    println!("  By status:     {}", statuses.join(", "));
    println!("  Effectiveness: {}", fmt_ratio(report.average_effectiveness));
    println!(
        "  Escalations:   {} ({} unresolved)",
        report.escalations, report.unresolved_escalations
    );

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Playbook").fg(Color::Cyan),
            Cell::new("Runs"),
            Cell::new("Completed"),
            Cell::new("Failed"),
            Cell::new("Effectiveness"),
            Cell::new("Avg duration"),
        ]);
    for usage in &report.definitions {
        table.add_row(vec![
            Cell::new(&usage.definition_name),
            Cell::new(usage.executions),
            Cell::new(usage.completed).fg(Color::Green),
            Cell::new(usage.failed).fg(if usage.failed > 0 {
                Color::Red
            } else {
                Color::Reset
            }),
            Cell::new(fmt_ratio(usage.average_effectiveness)),
            Cell::new(
                usage
                    .average_duration_secs
                    .map(|s| format!("{s:.1}s"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}

fn fmt_ratio(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.0}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}
