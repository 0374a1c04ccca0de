//! Result formatting: execution output → human-readable answer.
//!
//! Handles every [`ExecutionResult`] variant, including `Error`, and never
//! fails the request itself: when the optional model-backed summarization
//! errors, the deterministic plain rendering is used, and an empty
//! rendering degrades to a generic "could not summarize" message.

use crate::model::ChatModel;
use crate::models::{ExecutionResult, FormattedAnswer};

const SUMMARIZE_SYSTEM: &str = "You summarize computed results of personal spending queries. \
Answer the user's question in one or two plain sentences using only the \
computed result given to you. Do not invent numbers.";

/// Rows beyond this are elided from the plain rendering.
const MAX_RENDERED_ROWS: usize = 20;

/// Produce the final answer for a query.
///
/// `model` is optional polish: when present and working it rewrites the
/// plain rendering into prose; when absent or failing, the plain rendering
/// stands. Either way this function returns a presentable answer.
pub async fn format_answer(
    model: Option<&dyn ChatModel>,
    query: &str,
    code: &str,
    result: &ExecutionResult,
) -> FormattedAnswer {
    let plain = render_plain(result);

    let answer = match model {
        // Error results are already sentences; only data results benefit
        // from prose.
        Some(m) if !matches!(result, ExecutionResult::Error { .. }) => {
            let user = format!("Question: {query}\nComputed result:\n{plain}");
            match m.complete(SUMMARIZE_SYSTEM, &user).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                Ok(_) => plain,
                Err(e) => {
                    tracing::warn!(error = %e, "answer summarization failed; using plain rendering");
                    plain
                }
            }
        }
        _ => plain,
    };

    let answer = if answer.trim().is_empty() {
        "Could not summarize the result.".to_string()
    } else {
        answer
    };

    FormattedAnswer {
        query: query.to_string(),
        code: code.to_string(),
        answer,
    }
}

/// Deterministic rendering of each result variant.
fn render_plain(result: &ExecutionResult) -> String {
    match result {
        ExecutionResult::Scalar(value) => match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        ExecutionResult::Tabular(rows) => {
            if rows.is_empty() {
                return "No matching records.".to_string();
            }
            let mut lines = Vec::new();
            for row in rows.iter().take(MAX_RENDERED_ROWS) {
                lines.push(render_row(row));
            }
            if rows.len() > MAX_RENDERED_ROWS {
                lines.push(format!("... and {} more rows", rows.len() - MAX_RENDERED_ROWS));
            }
            lines.join("\n")
        }
        ExecutionResult::File { filename, bytes } => {
            format!(
                "Generated file '{}' ({} bytes), ready to download.",
                filename,
                bytes.len()
            )
        }
        ExecutionResult::Error { kind, message } => match kind {
            crate::models::ExecErrorKind::ResourceLimit => format!(
                "The computation took too many resources and was stopped ({message})."
            ),
            _ => format!("The computation failed: {message}"),
        },
    }
}

/// One tabular row as `key: value` pairs, keys sorted for stable output.
fn render_row(row: &serde_json::Value) -> String {
    match row {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let v = &map[k];
                    match v {
                        serde_json::Value::String(s) => format!("{k}: {s}"),
                        other => format!("{k}: {other}"),
                    }
                })
                .collect();
            format!("- {}", fields.join(", "))
        }
        other => format!("- {other}"),
    }
}
