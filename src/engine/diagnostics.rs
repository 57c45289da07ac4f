use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

/// One finished task.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub producer: &'static str,
    pub hardpoint: &'static str,
    /// Size of the batch.
    pub refs: usize,
    /// Offset from the moment the engine was built.
    pub start: Duration,
    pub duration: Duration,
    pub failed: bool,
}

/// Execution metrics collected by the engine.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Finished tasks, in completion order.
    pub executions: Vec<TaskExecution>,
    /// Number of operations submitted by producers.
    pub operations: usize,
}

// Width of the waterfall bar area, in characters.
const CHART_WIDTH: usize = 40;

impl Diagnostics {
    pub fn tasks(&self) -> usize {
        self.executions.len()
    }

    pub fn failures(&self) -> usize {
        self.executions.iter().filter(|exec| exec.failed).count()
    }

    /// Wall time between the start of the first task and the end of the last.
    pub fn span(&self) -> Duration {
        let start = self.executions.iter().map(|exec| exec.start).min();
        let end = self.executions.iter().map(|exec| exec.start + exec.duration).max();
        match (start, end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        }
    }

    /// Renders a plain text waterfall chart of task execution, one row per
    /// task, ordered by start time.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<&TaskExecution> = self.executions.iter().collect();
        if rows.is_empty() {
            return "No tasks ran\n".to_string();
        }
        rows.sort_by_key(|exec| exec.start);

        let origin = rows[0].start;
        let total = self.span().as_micros().max(1) as f64;

        let labels: Vec<String> = rows
            .iter()
            .map(|exec| format!("{} [{}] x{}", exec.producer, exec.hardpoint, exec.refs))
            .collect();
        let width = labels.iter().map(String::len).max().unwrap_or(0);

        let mut buf = String::new();
        for (exec, label) in rows.iter().zip(&labels) {
            let offset = exec.start.saturating_sub(origin).as_micros() as f64;
            let lead = ((offset / total) * CHART_WIDTH as f64).round() as usize;
            let len = ((exec.duration.as_micros() as f64 / total) * CHART_WIDTH as f64)
                .round()
                .max(1.0) as usize;
            let lead = lead.min(CHART_WIDTH - 1);
            let len = len.min(CHART_WIDTH - lead);
            let mark = if exec.failed { '!' } else { '=' };

            let _ = writeln!(
                buf,
                "{label:<width$} |{}{}{}| {}",
                " ".repeat(lead),
                mark.to_string().repeat(len),
                " ".repeat(CHART_WIDTH - lead - len),
                format_duration(exec.duration),
            );
        }
        buf
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} task(s), {} failed, {} operation(s) in {}",
            self.tasks(),
            self.failures(),
            self.operations,
            format_duration(self.span())
        )
    }
}

fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros < 1000 {
        format!("{micros}µs")
    } else {
        format!("{:.2}ms", micros as f64 / 1000.0)
    }
}
