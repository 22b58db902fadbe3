use std::io::Write;

use chrono::{DateTime, Local, Utc};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::Value;

use ta_task_engine::{TaskStatus, TaskSummary, TaskView};

pub(crate) struct Ui {
    mp: MultiProgress,
    task_pb: ProgressBar,
    stop_pb: ProgressBar,
    last_percent: u8,
}

impl Ui {
    pub(crate) fn new(task_id: &str, symbol: &str) -> anyhow::Result<Self> {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stdout());
        mp.set_move_cursor(true);

        let task_pb = mp.add(ProgressBar::new(100));
        task_pb.set_style(
            ProgressStyle::with_template("{prefix} {bar:30.cyan/blue} {pos:>3}% {msg}\u{1b}[0K")?
                .progress_chars("#--"),
        );
        task_pb.set_prefix(symbol.to_string());
        task_pb.set_message(format!("starting {task_id}"));

        let stop_pb = mp.add(ProgressBar::new(0));
        stop_pb.set_style(ProgressStyle::with_template("{msg}\u{1b}[0K")?);
        stop_pb.set_message(" ");

        Ok(Self {
            mp,
            task_pb,
            stop_pb,
            last_percent: 0,
        })
    }

    pub(crate) fn println(&self, msg: &str) {
        let _ = self.mp.println(msg);
    }

    pub(crate) fn set_progress(&mut self, view: &TaskView) {
        let percent = calc_bar_position(self.last_percent, view.progress_percent);
        if percent != self.last_percent {
            self.last_percent = percent;
            self.task_pb.set_position(u64::from(percent));
        }
        self.task_pb.set_message(view.message.clone());
    }

    pub(crate) fn set_stop_message(&mut self, msg: &str) {
        self.stop_pb.set_message(msg.to_string());
    }

    pub(crate) fn freeze(&self) {
        self.mp.set_move_cursor(false);
        self.task_pb.abandon();
        self.stop_pb.abandon();
        let _ = std::io::stdout().write_all(b"\n");
    }
}

/// Bar position for a newly observed percent; the bar never moves backwards.
fn calc_bar_position(current: u8, observed: u8) -> u8 {
    current.max(observed.min(100))
}

pub(crate) fn format_progress_line(view: &TaskView) -> String {
    match &view.current_stage {
        Some(stage) => format!(
            "[{:>3}%] {} ({stage})",
            view.progress_percent, view.message
        ),
        None => format!("[{:>3}%] {}", view.progress_percent, view.message),
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_elapsed(view: &TaskView) -> Option<String> {
    let start = view.started_at.unwrap_or(view.created_at);
    let end = view.ended_at?;
    let secs = (end - start).num_seconds().max(0);
    Some(format!("{}m{:02}s", secs / 60, secs % 60))
}

fn decision_field<'a>(decision: &'a Value, key: &str) -> Option<&'a Value> {
    decision.get(key).filter(|v| !v.is_null())
}

/// Human-readable summary of a finished task.
pub(crate) fn format_outcome(view: &TaskView) -> Vec<String> {
    let mut lines = Vec::new();
    let elapsed = format_elapsed(view)
        .map(|e| format!(" in {e}"))
        .unwrap_or_default();
    match view.status {
        TaskStatus::Running => lines.push(format_progress_line(view)),
        TaskStatus::Failed => {
            lines.push(format!("{} failed{elapsed}", view.task_id));
            lines.push(format!(
                "  error: {}",
                view.error.as_deref().unwrap_or("unknown error")
            ));
        }
        TaskStatus::Completed => {
            lines.push(format!("{} completed{elapsed}", view.task_id));
            let Some(decision) = &view.result else {
                return lines;
            };
            if let Some(action) = decision_field(decision, "action") {
                lines.push(format!("  action: {}", value_text(action)));
            }
            if let Some(confidence) = decision_field(decision, "confidence").and_then(Value::as_f64) {
                lines.push(format!("  confidence: {:.0}%", confidence * 100.0));
            }
            if let Some(price) = decision_field(decision, "target_price") {
                lines.push(format!("  target price: {}", value_text(price)));
            }
            if let Some(reasoning) = decision_field(decision, "reasoning") {
                lines.push(format!("  reasoning: {}", value_text(reasoning)));
            }
        }
    }
    lines
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn format_history_line(summary: &TaskSummary) -> String {
    format!(
        "{}  {:<34} {:<8} {:<10} {:<9} {:>3}%  {}",
        format_timestamp(summary.created_at),
        summary.task_id,
        summary.symbol,
        summary.analysis_date,
        summary.status,
        summary.progress_percent,
        summary.action.as_deref().unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(status: TaskStatus) -> TaskView {
        let created = Utc::now();
        TaskView {
            task_id: "analysis_1234abcd_20240115_093000".into(),
            status,
            progress_percent: 44,
            message: "reading filings".into(),
            current_stage: Some("analyst:fundamentals".into()),
            result: None,
            error: None,
            created_at: created,
            started_at: Some(created),
            ended_at: Some(created + chrono::Duration::seconds(125)),
        }
    }

    #[test]
    fn bar_position_clamps_and_never_regresses() {
        assert_eq!(calc_bar_position(0, 9), 9);
        assert_eq!(calc_bar_position(27, 9), 27);
        assert_eq!(calc_bar_position(27, 250), 100);
    }

    #[test]
    fn progress_line_names_stage() {
        let line = format_progress_line(&view(TaskStatus::Running));
        assert_eq!(line, "[ 44%] reading filings (analyst:fundamentals)");
    }

    #[test]
    fn completed_outcome_lists_decision() {
        let mut v = view(TaskStatus::Completed);
        v.result = Some(json!({
            "action": "BUY",
            "confidence": 0.82,
            "target_price": null,
            "reasoning": "strong earnings"
        }));
        let lines = format_outcome(&v);
        assert_eq!(lines[0], "analysis_1234abcd_20240115_093000 completed in 2m05s");
        assert_eq!(lines[1], "  action: BUY");
        assert_eq!(lines[2], "  confidence: 82%");
        assert_eq!(lines[3], "  reasoning: strong earnings");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn failed_outcome_shows_error() {
        let mut v = view(TaskStatus::Failed);
        v.error = Some("rate limited".into());
        let lines = format_outcome(&v);
        assert!(lines[0].ends_with("failed in 2m05s"));
        assert_eq!(lines[1], "  error: rate limited");
    }
}
