//! Sandboxed execution of generated artifacts.
//!
//! Runs one Lua 5.4 chunk under resource limits and classifies the outcome.
//! The artifact is untrusted input at all times:
//!
//! - Dangerous standard libraries are removed from the globals (`os`, `io`,
//!   `debug`, `package`, `require`, `load`, `loadfile`, `dofile`,
//!   `loadstring`, `collectgarbage`) before the chunk is loaded.
//! - The only host data is a `records` array (the caller's receipt rows,
//!   passed in as plain values) plus `json` encode/parse helpers.
//! - An allocator quota bounds memory; an instruction-count hook enforces a
//!   wall-clock deadline from inside the VM, with an outer tokio timeout as
//!   a backstop.
//! - Every fault is converted into [`ExecutionResult::Error`]; nothing the
//!   chunk does can propagate a fault to the caller.
//!
//! File output never touches the filesystem: a `file` result carries its
//! content in memory and the caller decides what to do with the bytes.
//!
//! The VM runs on a blocking thread via [`tokio::task::spawn_blocking`],
//! matching how all Lua work is scheduled in this codebase.

use std::time::{Duration, Instant};

use mlua::prelude::*;
use mlua::{HookTriggers, VmState};

use crate::models::{ExecErrorKind, ExecutionResult};

/// Resource bounds for one artifact run.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2_000),
            memory_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Execute an artifact against the given rows.
///
/// Infallible by contract: every failure mode is an
/// [`ExecutionResult::Error`] value.
pub async fn execute(
    artifact: String,
    rows: Vec<serde_json::Value>,
    limits: SandboxLimits,
) -> ExecutionResult {
    let backstop = limits.timeout * 2 + Duration::from_millis(250);

    let handle = tokio::task::spawn_blocking(move || run_chunk(&artifact, &rows, limits));

    match tokio::time::timeout(backstop, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => ExecutionResult::Error {
            kind: ExecErrorKind::Runtime,
            message: format!("execution thread failed: {join_err}"),
        },
        // The in-VM hook should have fired long before this; if the chunk
        // managed to wedge the VM anyway, abandon the thread.
        Err(_) => ExecutionResult::Error {
            kind: ExecErrorKind::ResourceLimit,
            message: format!(
                "execution exceeded the {}ms time limit",
                limits.timeout.as_millis()
            ),
        },
    }
}

/// Blocking body: build the VM, run the chunk, map the returned value.
fn run_chunk(artifact: &str, rows: &[serde_json::Value], limits: SandboxLimits) -> ExecutionResult {
    let lua = Lua::new();

    if let Err(e) = lua.set_memory_limit(limits.memory_bytes) {
        tracing::warn!(error = %e, "could not set sandbox memory limit");
    }

    if let Err(e) = prepare_vm(&lua, rows) {
        return ExecutionResult::Error {
            kind: ExecErrorKind::Runtime,
            message: format!("failed to prepare sandbox: {e}"),
        };
    }

    let deadline = Instant::now() + limits.timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(2048),
        move |_, _| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(
                    "execution deadline exceeded".to_string(),
                ))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let value: LuaValue = match lua.load(artifact).set_name("artifact").eval() {
        Ok(v) => v,
        Err(e) => return classify_lua_error(&e, limits),
    };

    map_result(value)
}

/// Strip dangerous globals and install the host API.
fn prepare_vm(lua: &Lua, rows: &[serde_json::Value]) -> LuaResult<()> {
    let globals = lua.globals();
    for name in [
        "os",
        "io",
        "debug",
        "package",
        "require",
        "load",
        "loadfile",
        "dofile",
        "loadstring",
        "collectgarbage",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }

    // records: the caller's rows as a plain Lua array.
    let records = lua.create_table()?;
    for (i, row) in rows.iter().enumerate() {
        records.set(i as i64 + 1, json_value_to_lua(lua, row)?)?;
    }
    globals.set("records", records)?;

    // json.encode / json.parse
    let json_table = lua.create_table()?;
    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;
    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;
    globals.set("json", json_table)?;

    Ok(())
}

/// Map a Lua fault onto the error taxonomy.
fn classify_lua_error(e: &mlua::Error, limits: SandboxLimits) -> ExecutionResult {
    let message = e.to_string();
    if message.contains("deadline exceeded") {
        ExecutionResult::Error {
            kind: ExecErrorKind::ResourceLimit,
            message: format!(
                "execution exceeded the {}ms time limit",
                limits.timeout.as_millis()
            ),
        }
    } else if matches!(e, mlua::Error::MemoryError(_)) {
        ExecutionResult::Error {
            kind: ExecErrorKind::ResourceLimit,
            message: "execution exceeded the memory limit".to_string(),
        }
    } else {
        ExecutionResult::Error {
            kind: ExecErrorKind::Runtime,
            message,
        }
    }
}

/// Map the chunk's returned value onto the result protocol.
///
/// Exactly one variant comes out; anything off-protocol is a `bad_shape`
/// error with a message precise enough to feed back to a human.
fn map_result(value: LuaValue) -> ExecutionResult {
    let table = match value {
        LuaValue::Table(t) => t,
        other => {
            return bad_shape(format!(
                "artifact returned {} instead of a result table",
                type_label(&other)
            ))
        }
    };

    let kind: String = match table.get("kind") {
        Ok(k) => k,
        Err(_) => return bad_shape("result table has no string 'kind' field".to_string()),
    };

    match kind.as_str() {
        "scalar" => {
            let value: LuaValue = table.get("value").unwrap_or(LuaValue::Nil);
            if value.is_nil() {
                return bad_shape("scalar result has no 'value' field".to_string());
            }
            match lua_value_to_json(value) {
                Ok(v) => ExecutionResult::Scalar(v),
                Err(e) => bad_shape(format!("scalar value not representable: {e}")),
            }
        }
        "rows" => {
            let rows_table: LuaTable = match table.get("rows") {
                Ok(t) => t,
                Err(_) => return bad_shape("rows result has no 'rows' table".to_string()),
            };
            let mut rows = Vec::new();
            for i in 1..=rows_table.raw_len() {
                let row: LuaValue = match rows_table.raw_get(i) {
                    Ok(v) => v,
                    Err(e) => return bad_shape(format!("row {i} unreadable: {e}")),
                };
                if !matches!(row, LuaValue::Table(_)) {
                    return bad_shape(format!("row {i} is not a table"));
                }
                match lua_value_to_json(row) {
                    Ok(v) => rows.push(v),
                    Err(e) => return bad_shape(format!("row {i} not representable: {e}")),
                }
            }
            ExecutionResult::Tabular(rows)
        }
        "file" => {
            let filename: String = match table.get("filename") {
                Ok(f) => f,
                Err(_) => return bad_shape("file result has no 'filename' field".to_string()),
            };
            if filename.trim().is_empty() {
                return bad_shape("file result has an empty filename".to_string());
            }
            let content: String = match table.get("content") {
                Ok(c) => c,
                Err(_) => return bad_shape("file result has no 'content' field".to_string()),
            };
            ExecutionResult::File {
                // Keep only the terminal path component; the artifact does
                // not get to choose directories.
                filename: filename
                    .rsplit(['/', '\\'])
                    .next()
                    .unwrap_or("output")
                    .to_string(),
                bytes: content.into_bytes(),
            }
        }
        other => bad_shape(format!("unknown result kind '{other}'")),
    }
}

fn bad_shape(message: String) -> ExecutionResult {
    ExecutionResult::Error {
        kind: ExecErrorKind::BadShape,
        message,
    }
}

fn type_label(v: &LuaValue) -> &'static str {
    match v {
        LuaValue::Nil => "nil",
        LuaValue::Boolean(_) => "a boolean",
        LuaValue::Integer(_) | LuaValue::Number(_) => "a number",
        LuaValue::String(_) => "a string",
        LuaValue::Function(_) => "a function",
        _ => "an unsupported value",
    }
}

// ============ JSON ↔ Lua conversions ============

/// Convert a JSON value to a Lua value.
fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Heuristic: positive raw length means array, otherwise object.
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({
                "id": 1, "merchant": "Green Grocer", "category": "groceries",
                "spent_at": "2025-03-02", "total": 42.50, "currency": "USD",
                "item_count": 7
            }),
            serde_json::json!({
                "id": 2, "merchant": "City Power", "category": "utilities",
                "spent_at": "2025-03-05", "total": 120.00, "currency": "USD",
                "item_count": 1
            }),
        ]
    }

    #[tokio::test]
    async fn scalar_result() {
        let code = r#"
local total = 0
for _, r in ipairs(records) do total = total + r.total end
return { kind = "scalar", value = total }
"#;
        match execute(code.to_string(), rows(), SandboxLimits::default()).await {
            ExecutionResult::Scalar(v) => {
                assert!((v.as_f64().unwrap() - 162.5).abs() < 1e-9);
            }
            other => panic!("expected Scalar, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tabular_result() {
        let code = r#"
local out = {}
for _, r in ipairs(records) do
  out[#out + 1] = { merchant = r.merchant, total = r.total }
end
return { kind = "rows", rows = out }
"#;
        match execute(code.to_string(), rows(), SandboxLimits::default()).await {
            ExecutionResult::Tabular(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0]["merchant"], "Green Grocer");
            }
            other => panic!("expected Tabular, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_result_captured_in_memory() {
        let code = r#"
local lines = { "merchant,total" }
for _, r in ipairs(records) do
  lines[#lines + 1] = r.merchant .. "," .. tostring(r.total)
end
return { kind = "file", filename = "spend.csv", content = table.concat(lines, "\n") }
"#;
        match execute(code.to_string(), rows(), SandboxLimits::default()).await {
            ExecutionResult::File { filename, bytes } => {
                assert_eq!(filename, "spend.csv");
                assert!(!bytes.is_empty());
                let text = String::from_utf8(bytes).unwrap();
                assert!(text.starts_with("merchant,total"));
            }
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_paths_are_flattened_to_basename() {
        let code = r#"return { kind = "file", filename = "../../etc/cron.d/evil", content = "x" }"#;
        match execute(code.to_string(), vec![], SandboxLimits::default()).await {
            ExecutionResult::File { filename, .. } => assert_eq!(filename, "evil"),
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn infinite_loop_hits_deadline() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        };
        let started = Instant::now();
        match execute("while true do end".to_string(), vec![], limits).await {
            ExecutionResult::Error { kind, message } => {
                assert_eq!(kind, ExecErrorKind::ResourceLimit);
                assert!(message.contains("time limit"), "{message}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        // Bounded: well under the 2x backstop plus slack.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn runtime_fault_becomes_error_value() {
        let code = "return records[1].total + nil";
        match execute(code.to_string(), rows(), SandboxLimits::default()).await {
            ExecutionResult::Error { kind, .. } => assert_eq!(kind, ExecErrorKind::Runtime),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dangerous_globals_are_absent() {
        let code = r#"return { kind = "scalar", value = tostring(os == nil and io == nil) }"#;
        // `os` in source fails codegen validation, but the sandbox must hold
        // on its own for artifacts that bypass it.
        match execute(code.to_string(), vec![], SandboxLimits::default()).await {
            ExecutionResult::Scalar(v) => assert_eq!(v, "true"),
            other => panic!("expected Scalar, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn off_protocol_return_is_bad_shape() {
        match execute("return 42".to_string(), vec![], SandboxLimits::default()).await {
            ExecutionResult::Error { kind, .. } => assert_eq!(kind, ExecErrorKind::BadShape),
            other => panic!("expected Error, got {other:?}"),
        }

        match execute(
            "return { kind = \"mystery\" }".to_string(),
            vec![],
            SandboxLimits::default(),
        )
        .await
        {
            ExecutionResult::Error { kind, message } => {
                assert_eq!(kind, ExecErrorKind::BadShape);
                assert!(message.contains("mystery"), "{message}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_helpers_available() {
        let code = r#"
local parsed = json.parse('{"a": 2}')
return { kind = "scalar", value = json.encode({ doubled = parsed.a * 2 }) }
"#;
        match execute(code.to_string(), vec![], SandboxLimits::default()).await {
            ExecutionResult::Scalar(v) => {
                assert_eq!(v.as_str().unwrap(), "{\"doubled\":4}");
            }
            other => panic!("expected Scalar, got {other:?}"),
        }
    }
}
