//! Human-readable rendering of a running or finished operation.

use crate::machine::OpStatus;
use crate::operation::Operation;

/// What [`report_operation`] includes beyond the state line.
#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    /// Render the sequence's step list with done/current markers.
    pub show_steps: bool,
    /// Render the current env bindings.
    pub show_env: bool,
    /// Render the recorded history.
    pub show_history: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            show_steps: true,
            show_env: false,
            show_history: false,
        }
    }
}

/// Pretty-print an operation's current status.
///
/// History entries are sanitized by construction: only the state name,
/// result, fail reason, and env appear — never the completion slot,
/// armed timers, or frame bookkeeping.
pub fn report_operation(op: &Operation, options: &ReportOptions) -> String {
    render_status(&op.status(), options)
}

fn render_status(status: &OpStatus, options: &ReportOptions) -> String {
    let mut out = String::new();
    out.push_str("operation ");
    out.push_str(status.name.as_deref().unwrap_or("(anonymous)"));
    out.push_str(": ");
    out.push_str(&status.state.to_string());
    out.push('\n');

    if !status.result.is_null() {
        out.push_str(&format!("  result: {}\n", status.result));
    }
    if let Some(reason) = &status.fail_reason {
        out.push_str(&format!("  fail-reason: {reason}\n"));
    }

    if options.show_steps && !status.steps.is_empty() {
        out.push_str("  steps:\n");
        for step in &status.steps {
            let marker = if step.current {
                '>'
            } else if step.done {
                'x'
            } else {
                ' '
            };
            out.push_str(&format!("    [{marker}] {}", step.op_sym));
            if !step.syms.is_empty() {
                out.push_str(&format!("  -> {}", step.syms.join(", ")));
            }
            out.push('\n');
        }
    }

    if !status.children.is_empty() {
        out.push_str("  children:\n");
        for child in &status.children {
            out.push_str(&format!("    #{}: {}\n", child.index, child.state));
        }
    }

    if options.show_env {
        if let Some(env) = &status.env {
            if !env.is_empty() {
                out.push_str("  env:\n");
                for (name, value) in env.iter() {
                    out.push_str(&format!("    {name} = {value}\n"));
                }
            }
        }
    }

    if options.show_history && !status.history.is_empty() {
        out.push_str("  history:\n");
        for entry in &status.history {
            out.push_str(&format!("    {}", entry.state));
            if let Some(reason) = &entry.fail_reason {
                out.push_str(&format!("  ({reason})"));
            }
            out.push('\n');
        }
    }

    out
}
