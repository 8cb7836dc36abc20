use crate::merge::MergedRecord;
use crate::reconcile::AccountResult;
use crate::record::metric;
use crate::session::{AccountOutcome, RunReport};

fn cell(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{:.2}", v),
        None => "·".to_string(),
    }
}

fn render_rows(header: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .map(|r| r.get(i).map(|c| c.chars().count()).unwrap_or(0))
                .max()
                .unwrap_or(0)
                .max(h.chars().count())
        })
        .collect();

    let line = |cells: Vec<String>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join(" │ ")
    };

    let mut out = Vec::with_capacity(rows.len() + 2);
    out.push(line(header.iter().map(|h| h.to_string()).collect()));
    out.push(
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─"),
    );
    out.extend(rows.iter().map(|r| line(r.clone())));
    out
}

fn merged_row(record: &MergedRecord) -> Vec<String> {
    let resolved = record
        .resolutions
        .iter()
        .map(|r| r.metric.as_str())
        .collect::<Vec<_>>()
        .join(",");
    vec![
        record.anchor_position.to_string(),
        record.item_id.clone(),
        cell(record.value(metric::LIKES)),
        cell(record.value(metric::VIEWS)),
        cell(record.value(metric::COMMENTS)),
        cell(record.value(metric::ENGAGEMENT)),
        record.quality.to_string(),
        resolved,
    ]
}

/// Table of one account's merged records, orphans listed underneath.
pub fn account_table(result: &AccountResult) -> Vec<String> {
    let rows: Vec<Vec<String>> = result.merged.iter().map(merged_row).collect();
    let mut out = vec![format!(
        "{}: {} items, {} matched via {} @ {:.0}%",
        result.account,
        result.merged.len(),
        result.matched(),
        result.strategy,
        result.tolerance * 100.0
    )];
    out.extend(
        render_rows(
            &["#", "item", "likes", "views", "comments", "eng%", "match", "resolved"],
            &rows,
        )
        .into_iter()
        .map(|l| format!("  {}", l)),
    );
    for orphan in &result.orphans {
        out.push(format!(
            "  orphan: {} (companion #{}): {}",
            orphan.record.item_id, orphan.companion_position, orphan.reason
        ));
    }
    for anomaly in &result.anomalies {
        out.push(format!("  anomaly: {}: {}", anomaly.item_id, anomaly.reasons.join("; ")));
    }
    out
}

pub fn print_account_table(result: &AccountResult) {
    for line in account_table(result) {
        println!("{}", line);
    }
}

/// Per-account outcome table for the whole run.
pub fn run_table(report: &RunReport) -> Vec<String> {
    let rows: Vec<Vec<String>> = report
        .accounts
        .iter()
        .map(|a| {
            let (status, detail) = match &a.outcome {
                AccountOutcome::Reconciled {
                    items,
                    matched,
                    orphans,
                    strategy,
                    tolerance,
                    resolved,
                    anomalies,
                } => (
                    "ok".to_string(),
                    format!(
                        "{} items, {} matched, {} orphans, {} resolved, {} anomalies ({} @ {:.0}%)",
                        items,
                        matched,
                        orphans,
                        resolved,
                        anomalies,
                        strategy,
                        tolerance * 100.0
                    ),
                ),
                AccountOutcome::Failed { kind, reason } => (kind.to_string(), reason.clone()),
                AccountOutcome::InFlight { stage } => ("in flight".to_string(), format!("stopped in {}", stage)),
                AccountOutcome::Pending => ("pending".to_string(), String::new()),
            };
            vec![a.account.clone(), status, a.extraction_failures.to_string(), detail]
        })
        .collect();

    let mut out = vec![format!("run {}: {}", report.run_id, report.outcome)];
    out.extend(render_rows(&["account", "status", "failures", "detail"], &rows));
    if report.context_switches > 0 {
        out.push(format!("context switches: {}", report.context_switches));
    }
    for t in &report.early_terminations {
        out.push(format!(
            "early termination: {} ({} of {} expected items)",
            t.account, t.scraped, t.expected
        ));
    }
    if let Some(path) = &report.snapshot {
        out.push(format!("snapshot: {}", path.display()));
    }
    if let Some(path) = &report.manifest {
        out.push(format!("manifest: {}", path.display()));
    }
    out
}

pub fn print_run_report(report: &RunReport) {
    for line in run_table(report) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::FailureKind;
    use crate::session::{AccountReport, RunOutcome};

    #[test]
    fn test_columns_are_padded_to_widest_cell() {
        let lines = render_rows(&["a", "bb"], &[vec!["long".to_string(), "x".to_string()]]);
        assert_eq!(lines[0], "a    │ bb");
        assert_eq!(lines[1], "─────┼───");
        assert_eq!(lines[2], "long │ x ");
    }

    #[test]
    fn test_cell_formatting() {
        assert_eq!(cell(Some(1200.0)), "1200");
        assert_eq!(cell(Some(1.756)), "1.76");
        assert_eq!(cell(None), "·");
    }

    #[test]
    fn test_run_table_lists_every_account() {
        let report = RunReport {
            run_id: "20250101_000000".to_string(),
            outcome: RunOutcome::Partial,
            accounts: vec![
                AccountReport {
                    account: "a".to_string(),
                    outcome: AccountOutcome::Failed {
                        kind: FailureKind::AlignmentInfeasible,
                        reason: "anchor has no observed values".to_string(),
                    },
                    extraction_failures: 0,
                },
                AccountReport {
                    account: "b".to_string(),
                    outcome: AccountOutcome::Pending,
                    extraction_failures: 3,
                },
            ],
            context_switches: 1,
            early_terminations: Vec::new(),
            snapshot: None,
            store_files: Vec::new(),
            manifest: None,
        };
        let lines = run_table(&report);
        assert_eq!(lines[0], "run 20250101_000000: partial");
        assert!(lines[3].contains("alignment_infeasible"));
        assert!(lines[4].starts_with("b "));
        assert_eq!(lines.last().map(String::as_str), Some("context switches: 1"));
    }
}
