//! Output formatting for eid-cli (colored text or JSON lines)

use std::time::Duration;

use clap::ValueEnum;
use colored::Colorize;
use eid_flow::{FlowNotification, FlowSnapshot};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable, colored lines (default)
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

#[derive(Serialize)]
struct JsonLine<'a, T: Serialize> {
    elapsed_ms: u128,
    #[serde(flatten)]
    body: &'a T,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet && self.format == OutputFormat::Text {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet && self.format == OutputFormat::Text {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print one coordinator notification
    pub fn notification(&self, elapsed: Duration, notification: &FlowNotification) {
        match self.format {
            OutputFormat::Json => print_json_line(elapsed, notification),
            OutputFormat::Text => {
                if self.quiet {
                    return;
                }
                let stamp = format!("[{:>6}ms]", elapsed.as_millis()).dimmed();
                match notification {
                    FlowNotification::StateChanged { snapshot } => {
                        println!("{} {}", stamp, describe_snapshot(snapshot).bold().cyan());
                    }
                    FlowNotification::ConfirmationFailed => {
                        println!("{} {}", stamp, "PIN confirmation does not match".yellow());
                    }
                    FlowNotification::Navigation { request } => {
                        println!("{} navigate {:?}", stamp, request);
                    }
                    FlowNotification::EventIgnored { event, reason } => {
                        println!("{} {}", stamp, format!("ignored {} ({})", event, reason).dimmed());
                    }
                    FlowNotification::IllegalTransition { state, event } => {
                        println!(
                            "{} {}",
                            stamp,
                            format!("illegal {} in {}", event, state).yellow()
                        );
                    }
                    FlowNotification::Rejected { event, message } => {
                        println!("{} {}", stamp, format!("{} rejected: {}", event, message).yellow());
                    }
                    FlowNotification::CallbackFailed { message } => {
                        println!("{} {}", stamp, format!("card callback failed: {}", message).red());
                    }
                }
            }
        }
    }

    /// Print the input the driver feeds into the flow
    pub fn action(&self, elapsed: Duration, action: &str) {
        match self.format {
            OutputFormat::Json => {
                #[derive(Serialize)]
                struct Action<'a> {
                    action: &'a str,
                }
                print_json_line(elapsed, &Action { action });
            }
            OutputFormat::Text => {
                if !self.quiet {
                    println!("{:>10} {} {}", "", ">".green(), action);
                }
            }
        }
    }

    /// Print the transcript of a finished flow
    pub fn transcript<T: Tabled + Serialize>(&self, rows: &[T]) {
        match self.format {
            OutputFormat::Text => {
                if !rows.is_empty() {
                    println!("{}", Table::new(rows));
                }
            }
            OutputFormat::Json => {
                #[derive(Serialize)]
                struct Transcript<'a, T> {
                    transcript: &'a [T],
                }
                println!(
                    "{}",
                    serde_json::to_string(&Transcript { transcript: rows })
                        .unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }
}

fn print_json_line<T: Serialize>(elapsed: Duration, body: &T) {
    let line = JsonLine {
        elapsed_ms: elapsed.as_millis(),
        body,
    };
    println!(
        "{}",
        serde_json::to_string(&line).unwrap_or_else(|_| "{}".to_string())
    );
}

/// One-line rendering of a snapshot
pub fn describe_snapshot(snapshot: &FlowSnapshot) -> String {
    let mut line = snapshot.state.to_string();
    if let Some(can_flow) = &snapshot.can_flow {
        line.push_str(&format!(" can={:?}", can_flow));
    }
    if let Some(attempts) = snapshot.attempts_remaining {
        line.push_str(&format!(" attempts={}", attempts));
    }
    if let Some(pending) = snapshot.pending_request {
        line.push_str(&format!(" pending={}", pending));
    }
    if snapshot.confirmation_failed {
        line.push_str(" confirmation_failed");
    }
    line
}

// =============================================================================
// Display types
// =============================================================================

/// One step of a flow transcript
#[derive(Debug, Clone, Tabled, Serialize)]
pub struct TranscriptRow {
    #[tabled(rename = "#")]
    pub step: usize,
    #[tabled(rename = "Time (ms)")]
    pub elapsed_ms: u128,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "CAN")]
    pub can_flow: String,
    #[tabled(rename = "Attempts")]
    pub attempts: String,
    #[tabled(rename = "Pending")]
    pub pending: String,
    #[tabled(rename = "Input")]
    pub input: String,
}

impl TranscriptRow {
    pub fn new(step: usize, elapsed: Duration, snapshot: &FlowSnapshot, input: Option<&str>) -> Self {
        Self {
            step,
            elapsed_ms: elapsed.as_millis(),
            state: snapshot.state.to_string(),
            can_flow: snapshot
                .can_flow
                .map(|state| format!("{:?}", state))
                .unwrap_or_else(|| "-".to_string()),
            attempts: snapshot
                .attempts_remaining
                .map(|attempts| attempts.to_string())
                .unwrap_or_else(|| "-".to_string()),
            pending: snapshot
                .pending_request
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "-".to_string()),
            input: input.unwrap_or("-").to_string(),
        }
    }
}
