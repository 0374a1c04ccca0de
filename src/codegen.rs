//! Code generation feedback loop.
//!
//! Drives a bounded attempt/validate/retry cycle against the chat model,
//! producing either one statically valid Lua artifact or an explicit
//! `Exhausted` outcome. States: Drafting → Validating → {Accepted,
//! Retrying, Exhausted}. The attempt count never exceeds `max_attempts`,
//! and each retry prompt carries the full failure history of the attempts
//! before it, so no two attempts are made with identical information.
//!
//! # Static validation
//!
//! A candidate is valid when it (a) contains none of the identifiers the
//! sandbox strips anyway and (b) compiles as a Lua 5.4 chunk. Compilation
//! loads the chunk into a throwaway VM without calling it, which is
//! strictly cheaper and safer than execution; anything that slips through
//! still runs inside the allowlisted sandbox.

use anyhow::{Context, Result};
use mlua::Lua;

use crate::model::ChatModel;
use crate::models::{CodeAttempt, GenerationOutcome, SearchResult};

/// Identifiers a candidate may not reference. The sandbox removes these
/// globals before execution; referencing one is a validation failure so the
/// model gets feedback instead of a runtime nil error.
const FORBIDDEN_IDENTIFIERS: &[&str] = &[
    "os",
    "io",
    "require",
    "dofile",
    "loadfile",
    "loadstring",
    "load",
    "debug",
    "collectgarbage",
    "package",
];

/// Contract handed to the model on every attempt. Describes the sandbox
/// environment and the result protocol the artifact must return.
const ARTIFACT_CONTRACT: &str = r#"Write a Lua 5.4 chunk that answers the user's question from their receipt data.

Environment:
- A global array `records` holds the user's receipts, newest first. Each record is a table:
  { id, merchant, category, spent_at, total, subtotal, tax, tip, currency, item_count }
  `spent_at` is "YYYY-MM-DD"; amounts are numbers; `category` is a lowercase label
  such as "groceries", "dining out", "utilities", "transportation".
- Helpers: `json.encode(value)` and `json.parse(text)`.
- No other libraries are available. Do not use os, io, require, load, dofile,
  loadfile, debug, collectgarbage, or package.

The chunk must end with a `return` of exactly one of:
- { kind = "scalar", value = <number|string|boolean> }
- { kind = "rows", rows = { {col = val, ...}, ... } }
- { kind = "file", filename = "<name>", content = "<file body as a string>" }

Return only the Lua code, no prose and no markdown fences."#;

/// Run the feedback loop. Terminal by construction: returns after at most
/// `max_attempts` model calls, with exhaustion as a value rather than an
/// error. Only a model/service failure surfaces as `Err`.
pub async fn generate(
    model: &dyn ChatModel,
    query: &str,
    context: &[SearchResult],
    max_attempts: u32,
) -> Result<GenerationOutcome> {
    let mut attempts: Vec<CodeAttempt> = Vec::new();

    for attempt_number in 1..=max_attempts {
        let prompt = build_prompt(query, context, &attempts);

        let raw = model
            .complete(ARTIFACT_CONTRACT, &prompt)
            .await
            .with_context(|| format!("Model call failed on attempt {attempt_number}"))?;

        let artifact = extract_code(&raw);

        match validate_artifact(&artifact) {
            Ok(()) => {
                tracing::debug!(attempt = attempt_number, "artifact accepted");
                attempts.push(CodeAttempt {
                    attempt_number,
                    artifact: artifact.clone(),
                    validation_failure: None,
                });
                return Ok(GenerationOutcome::Accepted { artifact, attempts });
            }
            Err(failure) => {
                tracing::debug!(attempt = attempt_number, %failure, "artifact rejected");
                attempts.push(CodeAttempt {
                    attempt_number,
                    artifact,
                    validation_failure: Some(failure),
                });
            }
        }
    }

    let last_feedback = attempts
        .last()
        .and_then(|a| a.validation_failure.clone())
        .unwrap_or_else(|| "no attempts were made".to_string());

    Ok(GenerationOutcome::Exhausted {
        attempts,
        last_feedback,
    })
}

/// Assemble the user prompt: the question, the retrieved context, and the
/// accumulated failure history (attempt 2 onward).
fn build_prompt(query: &str, context: &[SearchResult], attempts: &[CodeAttempt]) -> String {
    let mut prompt = format!("Question: {query}\n");

    if context.is_empty() {
        prompt.push_str("\nNo similar records were retrieved; rely on the records array alone.\n");
    } else {
        prompt.push_str("\nMost similar records:\n");
        for result in context {
            prompt.push_str(&format!(
                "- [record {} | score {:.3}] {}\n",
                result.source_id, result.score, result.snippet
            ));
        }
    }

    for attempt in attempts {
        if let Some(ref failure) = attempt.validation_failure {
            prompt.push_str(&format!(
                "\nYour attempt {} was rejected: {}\nRejected code:\n{}\nFix the problem and return the corrected chunk.\n",
                attempt.attempt_number, failure, attempt.artifact
            ));
        }
    }

    prompt
}

/// Strip markdown fences the model may wrap around the chunk.
fn extract_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the info string ("lua") up to the first newline.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        let body = body.rsplit_once("```").map(|(b, _)| b).unwrap_or(body);
        return body.trim().to_string();
    }
    trimmed.to_string()
}

/// Statically validate a candidate artifact without executing it.
///
/// Returns the failure message fed back to the model on rejection.
pub fn validate_artifact(artifact: &str) -> std::result::Result<(), String> {
    if artifact.trim().is_empty() {
        return Err("the response contained no code".to_string());
    }

    // Identifier-level scan; substring matching would trip on names like
    // `ratios` or `math.cos`.
    for token in artifact.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if FORBIDDEN_IDENTIFIERS.contains(&token) {
            return Err(format!(
                "the chunk references '{token}' which is not available in the execution environment"
            ));
        }
    }

    if !artifact.contains("return") {
        return Err("the chunk never returns a result table".to_string());
    }

    // Syntax check: compile into a throwaway VM, do not call.
    let lua = Lua::new();
    match lua.load(artifact).set_name("candidate").into_function() {
        Ok(_) => Ok(()),
        Err(e) => Err(format!("the chunk does not compile: {e}")),
    }
}
