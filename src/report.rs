// src/report.rs

//! Human-readable rendering of a finished session.
//!
//! Failed tasks get their exit status and captured output; everything else is
//! a single status line.

use std::fmt::Write as _;
use std::time::Duration;

use crate::dag::TaskStatus;
use crate::engine::{SessionOutcome, TaskReport};

/// Render every task report followed by a one-line summary.
pub fn render_session(outcome: &SessionOutcome) -> String {
    let mut out = String::new();
    for report in &outcome.reports {
        render_task(&mut out, report);
    }
    out.push('\n');
    out.push_str(&summary_line(outcome));
    out.push('\n');
    out
}

fn render_task(out: &mut String, report: &TaskReport) {
    let fingerprint = report
        .fingerprint
        .map(|fp| format!(" [{}]", fp.short()))
        .unwrap_or_default();

    match report.status {
        TaskStatus::Succeeded => {
            let _ = writeln!(
                out,
                "ok       {} ({}){fingerprint}",
                report.name,
                format_duration(report.duration)
            );
        }
        TaskStatus::CachedSucceeded => {
            let _ = writeln!(out, "cached   {}{fingerprint}", report.name);
        }
        TaskStatus::Skipped => {
            let _ = writeln!(out, "skipped  {}", report.name);
        }
        TaskStatus::Failed => {
            let reason = report.failure.map(|k| k.label()).unwrap_or("failed");
            let exit = report
                .exit_code
                .map(|c| format!(", exit status {c}"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "FAILED   {} ({reason}{exit}){fingerprint}",
                report.name
            );
            if let Some(message) = &report.message {
                let _ = writeln!(out, "  {message}");
            }
            write_stream(out, "stdout", &report.stdout);
            write_stream(out, "stderr", &report.stderr);
        }
        other => {
            let _ = writeln!(out, "{:<8} {}", other.label(), report.name);
        }
    }
}

fn write_stream(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "  --- {label} ---");
    for line in text.lines() {
        let _ = writeln!(out, "  {line}");
    }
}

/// `"3 tasks: 1 succeeded, 1 cached, 1 failed, 0 skipped"` plus the verdict.
pub fn summary_line(outcome: &SessionOutcome) -> String {
    let count = |status: TaskStatus| {
        outcome
            .reports
            .iter()
            .filter(|r| r.status == status)
            .count()
    };
    let verdict = if outcome.success {
        "success"
    } else if outcome.cancelled {
        "cancelled"
    } else {
        "failure"
    };

    format!(
        "{verdict}: {} tasks: {} succeeded, {} cached, {} failed, {} skipped",
        outcome.reports.len(),
        count(TaskStatus::Succeeded),
        count(TaskStatus::CachedSucceeded),
        count(TaskStatus::Failed),
        count(TaskStatus::Skipped),
    )
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 60 {
        format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureKind;

    fn outcome(reports: Vec<TaskReport>, success: bool) -> SessionOutcome {
        SessionOutcome {
            success,
            cancelled: false,
            failed: reports
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .map(|r| r.name.clone())
                .collect(),
            skipped: reports
                .iter()
                .filter(|r| r.status == TaskStatus::Skipped)
                .map(|r| r.name.clone())
                .collect(),
            reports,
        }
    }

    #[test]
    fn failed_task_shows_exit_status_and_output() {
        let mut failed = TaskReport::new("build", TaskStatus::Failed);
        failed.exit_code = Some(2);
        failed.failure = Some(FailureKind::NonZeroExit);
        failed.stdout = "compiling\n".into();
        failed.stderr = "error: boom\n".into();

        let text = render_session(&outcome(
            vec![failed, TaskReport::new("test", TaskStatus::Skipped)],
            false,
        ));

        assert!(text.contains("FAILED   build (non-zero exit, exit status 2)"));
        assert!(text.contains("  --- stdout ---\n  compiling"));
        assert!(text.contains("  error: boom"));
        assert!(text.contains("skipped  test"));
        assert!(text.contains("failure: 2 tasks: 0 succeeded, 0 cached, 1 failed, 1 skipped"));
    }

    #[test]
    fn cached_tasks_are_reported_as_cached() {
        let text = render_session(&outcome(
            vec![TaskReport::new("fetch", TaskStatus::CachedSucceeded)],
            true,
        ));
        assert!(text.starts_with("cached   fetch"));
        assert!(text.contains("success: 1 tasks"));
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }
}
