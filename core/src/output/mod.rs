//! Output formatting module
//!
//! Renders session events, completions and workflow listings for the CLI
//! using colored output.

use std::collections::BTreeMap;

use console::Style;

use crate::client::{Completion, SessionEvent, SessionState};
use crate::http::WorkflowSummary;
use crate::value::Value;

const PREVIEW_CHARS: usize = 80;

/// Output formatter for CLI results
pub struct OutputFormatter {
    blue: Style,
    green: Style,
    yellow: Style,
    red: Style,
    dim: Style,
    bold: Style,
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self {
            blue: Style::new().blue(),
            green: Style::new().green(),
            yellow: Style::new().yellow(),
            red: Style::new().red(),
            dim: Style::new().dim(),
            bold: Style::new().bold(),
        }
    }
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formatter that emits no ANSI codes
    pub fn plain() -> Self {
        let plain = || Style::new().force_styling(false);
        Self {
            blue: plain(),
            green: plain(),
            yellow: plain(),
            red: plain(),
            dim: plain(),
            bold: plain(),
        }
    }

    /// One line per event
    pub fn format_event(&self, event: &SessionEvent) -> String {
        match event {
            SessionEvent::Accepted { job_id } => {
                format!("{} job {}", self.dim.apply_to("accepted"), job_id)
            }
            SessionEvent::Progress { fraction } => format!(
                "{} {:>3.0}%",
                self.blue.apply_to("progress"),
                fraction * 100.0
            ),
            SessionEvent::NodeUpdated {
                node_name,
                node_id,
                status,
                error,
            } => {
                let name = if node_name.is_empty() { node_id } else { node_name };
                match error {
                    Some(error) => format!(
                        "{} {} {}: {}",
                        self.dim.apply_to("node"),
                        name,
                        self.red.apply_to(status),
                        error
                    ),
                    None => format!("{} {} {}", self.dim.apply_to("node"), name, status),
                }
            }
            SessionEvent::Output {
                node_name,
                output_name,
                value,
            } => format!(
                "{} {}:{} = {}",
                self.green.apply_to("output"),
                node_name,
                output_name,
                summarize(value)
            ),
            SessionEvent::Preview { node_id, value } => format!(
                "{} {} {}",
                self.dim.apply_to("preview"),
                node_id,
                summarize(value)
            ),
            SessionEvent::Completed { success, error } => match (success, error) {
                (true, _) => self.bold.apply_to("completed").to_string(),
                (false, Some(error)) => {
                    format!("{}: {}", self.red.apply_to("failed"), error)
                }
                (false, None) => self.red.apply_to("failed").to_string(),
            },
        }
    }

    pub fn print_event(&self, event: &SessionEvent) {
        println!("{}", self.format_event(event));
    }

    pub fn format_completion(&self, completion: &Completion) -> String {
        let mut out = String::new();
        let status = match completion.state {
            SessionState::Completed => self.green.apply_to("Completed").to_string(),
            SessionState::Cancelled => self.yellow.apply_to("Cancelled").to_string(),
            state => self.red.apply_to(format!("{:?}", state)).to_string(),
        };
        out.push_str(&format!("{} {}\n", self.bold.apply_to("Result:"), status));
        if let Some(error) = &completion.error {
            out.push_str(&format!("  error: {}\n", error));
        }
        out.push_str(&self.format_outputs(&completion.outputs));
        out
    }

    pub fn print_completion(&self, completion: &Completion) {
        println!();
        print!("{}", self.format_completion(completion));
    }

    fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        if outputs.is_empty() {
            return format!("  {}\n", self.dim.apply_to("(no outputs)"));
        }
        let mut out = String::new();
        for (key, value) in outputs {
            let rendered = value.to_json_string().replace('\n', "\n    ");
            out.push_str(&format!("  {} {}\n", self.green.apply_to(key), rendered));
        }
        out
    }

    pub fn print_workflows(&self, workflows: &[WorkflowSummary]) {
        println!("{}", self.bold.apply_to("Workflows:"));
        if workflows.is_empty() {
            println!("  {}", self.dim.apply_to("(none)"));
        }
        for workflow in workflows {
            println!(
                "  {}  {}",
                self.yellow.apply_to(&workflow.id),
                workflow.name
            );
            if !workflow.description.is_empty() {
                println!("      {}", self.dim.apply_to(truncate(&workflow.description)));
            }
        }
    }
}

/// Short single-line rendering of a streamed value
pub fn summarize(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", truncate(s)),
        Value::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        Value::List(items) => format!("[{} items]", items.len()),
        Value::Map(_) => {
            let kind = value.discriminator().unwrap_or("map");
            match value.get_any(&["uri", "asset_id"]).and_then(Value::as_str) {
                Some(location) => format!("{}({})", kind, location),
                None => kind.to_string(),
            }
        }
        other => truncate(&other.to_plain().to_string()),
    }
}

fn truncate(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(uri: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("image"));
        map.insert("uri".to_string(), Value::from(uri));
        Value::Map(map)
    }

    #[test]
    fn test_summarize_values() {
        assert_eq!(summarize(&image("/assets/1.png")), "image(/assets/1.png)");
        assert_eq!(summarize(&Value::Bytes(vec![0; 4])), "<4 bytes>");
        assert_eq!(summarize(&Value::from(3)), "3");
        assert_eq!(summarize(&Value::from("hi")), "\"hi\"");
        assert_eq!(summarize(&Value::List(vec![Value::Null; 2])), "[2 items]");
        assert_eq!(summarize(&Value::Map(BTreeMap::new())), "map");
    }

    #[test]
    fn test_truncate_long_text() {
        let long = "x".repeat(200);
        let short = truncate(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_format_events() {
        let fmt = OutputFormatter::plain();
        assert_eq!(
            fmt.format_event(&SessionEvent::Progress { fraction: 0.5 }),
            "progress  50%"
        );
        assert_eq!(
            fmt.format_event(&SessionEvent::Output {
                node_name: "out".into(),
                output_name: "image".into(),
                value: image("/a.png"),
            }),
            "output out:image = image(/a.png)"
        );
        assert_eq!(
            fmt.format_event(&SessionEvent::Completed {
                success: false,
                error: Some("boom".into()),
            }),
            "failed: boom"
        );
    }

    #[test]
    fn test_format_completion() {
        let fmt = OutputFormatter::plain();
        let mut outputs = BTreeMap::new();
        outputs.insert("out:text".to_string(), Value::from("hello"));
        let text = fmt.format_completion(&Completion {
            state: SessionState::Completed,
            success: true,
            error: None,
            outputs,
        });
        assert!(text.starts_with("Result: Completed\n"));
        assert!(text.contains("out:text \"hello\""));

        let empty = fmt.format_completion(&Completion {
            state: SessionState::Cancelled,
            success: false,
            error: Some("job cancelled".into()),
            outputs: BTreeMap::new(),
        });
        assert!(empty.contains("Cancelled"));
        assert!(empty.contains("(no outputs)"));
    }
}
