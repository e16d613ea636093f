// =============================================================================
// Decision Records — immutable per-cycle artifacts + model output parsing
// =============================================================================
//
// Every cycle produces exactly one DecisionRecord: the prompt that went out,
// the raw text that came back, the parsed action plan, the pre-cycle account
// snapshot, and what actually happened during execution. Records are
// append-only; once written they are never mutated.
// =============================================================================

mod logger;

pub use logger::DecisionLogger;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::AccountState;
use crate::signal_source::normalize_symbol;
use crate::types::ActionKind;

// =============================================================================
// Record types
// =============================================================================

/// One executed (or attempted) action within a cycle.
///
/// Invariant: `success == false` implies a non-empty `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAction {
    pub symbol: String,
    pub action: ActionKind,
    /// 0 when leverage does not apply (close/hold/wait).
    #[serde(default)]
    pub leverage: u32,
    /// Reference price; 0 means market.
    #[serde(default)]
    pub price: f64,
    pub success: bool,
    #[serde(default)]
    pub error: String,
}

/// Immutable artifact describing one scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Monotonically increasing per trader, starting at 1, no gaps.
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    /// Full prompt text sent to the model.
    pub prompt: String,
    /// Raw model output before parsing.
    pub raw_response: String,
    /// Free-text reasoning the model emitted around the action plan.
    #[serde(default)]
    pub cot_trace: String,
    pub actions: Vec<DecisionAction>,
    /// Account snapshot taken before the decision.
    pub account_state: AccountState,
    #[serde(default)]
    pub execution_log: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
}

// =============================================================================
// Model-output parsing
// =============================================================================

/// One action as planned by the model, before execution.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlannedAction {
    pub symbol: String,
    pub action: ActionKind,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Deserialize)]
struct ActionsObject {
    actions: Vec<PlannedAction>,
}

/// Parse the model's raw output into an ordered action plan plus the
/// reasoning text around it.
///
/// Accepts a bare JSON array, an object with an `actions` key, or either of
/// those wrapped in markdown code fences and surrounded by free text. Any
/// other shape is a decision-parse error.
pub fn parse_decision(raw: &str) -> Result<(Vec<PlannedAction>, String)> {
    let stripped = strip_code_fences(raw);

    // Whole-text parses first: the strict cases.
    if let Ok(actions) = serde_json::from_str::<Vec<PlannedAction>>(stripped.trim()) {
        return Ok((normalize_actions(actions), String::new()));
    }
    if let Ok(obj) = serde_json::from_str::<ActionsObject>(stripped.trim()) {
        return Ok((normalize_actions(obj.actions), String::new()));
    }

    // Embedded JSON: take the outermost array and treat surrounding prose as
    // the reasoning trace.
    if let Some((json, trace)) = extract_array(&stripped) {
        let actions: Vec<PlannedAction> = serde_json::from_str(json)
            .context("embedded action array does not match the decision schema")?;
        return Ok((normalize_actions(actions), trace));
    }
    if let Some((json, trace)) = extract_object(&stripped) {
        let obj: ActionsObject = serde_json::from_str(json)
            .context("embedded object does not match the decision schema")?;
        return Ok((normalize_actions(obj.actions), trace));
    }

    anyhow::bail!("model output contains no decision JSON")
}

fn normalize_actions(mut actions: Vec<PlannedAction>) -> Vec<PlannedAction> {
    for a in &mut actions {
        a.symbol = normalize_symbol(&a.symbol);
    }
    actions
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }
    // Drop fence lines, keep everything else in order.
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Find the outermost balanced `[...]` and return it with the surrounding
/// prose (the reasoning trace).
fn extract_array(text: &str) -> Option<(&str, String)> {
    extract_balanced(text, '[', ']')
}

fn extract_object(text: &str) -> Option<(&str, String)> {
    extract_balanced(text, '{', '}')
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<(&str, String)> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + i + c.len_utf8();
                    let trace = format!(
                        "{} {}",
                        text[..start].trim(),
                        text[end..].trim()
                    )
                    .trim()
                    .to_string();
                    return Some((&text[start..end], trace));
                }
            }
            _ => {}
        }
    }
    None
}
