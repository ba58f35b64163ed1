/// Expression evaluation for flow conditions and task assignees
///
/// Expressions use the `${...}` notation of BPMN modelers ("${approved == true}",
/// "${amount > 1000 && !urgent}", "${startUserId}"). They are translated to Lua
/// and evaluated in a fresh sandboxed `mlua::Lua` with the instance variables
/// bound as globals. Every evaluation is synchronous and drops its Lua state
/// before returning, so no Lua value ever crosses an await point. Each sandbox
/// has an instruction budget and a memory cap (`ExpressionLimits`).

use crate::error::{EngineError, EngineResult};
use crate::process::parser::strip_expression;
use crate::process::types::Variables;
use mlua::{HookTriggers, LuaSerdeExt, VmState};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Globals removed from every sandbox
const BLOCKED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadfile",
    "dofile",
    "collectgarbage",
];

/// Instructions between two budget checks
const HOOK_INTERVAL: u32 = 1_000;

/// Resource caps applied to every expression sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionLimits {
    /// Lua VM instructions per evaluation (checked every `HOOK_INTERVAL`)
    pub max_instructions: u64,
    /// Bytes the Lua allocator may hold
    pub max_memory_bytes: usize,
}

impl Default for ExpressionLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Evaluate a flow condition; `nil` counts as false, non-booleans are errors
pub fn evaluate_condition(
    expression: &str,
    variables: &Variables,
    limits: &ExpressionLimits,
) -> EngineResult<bool> {
    match evaluate(expression, variables, limits)? {
        Value::Bool(result) => Ok(result),
        Value::Null => Ok(false),
        other => Err(EngineError::expression(
            expression,
            format!("expected a boolean, got {}", other),
        )),
    }
}

/// Resolve a task assignee
///
/// Plain strings are literal user ids; `${...}` expressions are evaluated and
/// stringified. Empty results mean "unassigned".
pub fn resolve_assignee(
    expression: &str,
    variables: &Variables,
    limits: &ExpressionLimits,
) -> EngineResult<Option<String>> {
    let trimmed = expression.trim();
    if !is_expression(trimmed) {
        return Ok((!trimmed.is_empty()).then(|| trimmed.to_string()));
    }

    let assignee = match evaluate(trimmed, variables, limits)? {
        Value::Null => None,
        Value::String(user) => Some(user),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => {
            return Err(EngineError::expression(
                expression,
                format!("assignee must be a scalar, got {}", other),
            ))
        }
    };
    Ok(assignee.filter(|user| !user.trim().is_empty()))
}

fn is_expression(raw: &str) -> bool {
    (raw.starts_with("${") || raw.starts_with("#{")) && raw.ends_with('}')
}

/// Evaluate an expression against the variables and convert the result to JSON
pub fn evaluate(
    expression: &str,
    variables: &Variables,
    limits: &ExpressionLimits,
) -> EngineResult<Value> {
    let source = to_lua_source(strip_expression(expression));
    tracing::debug!("🧮 Evaluating expression '{}' as Lua '{}'", expression, source);

    let lua = sandbox(variables, limits).map_err(|e| EngineError::expression(expression, e))?;

    let result = lua
        .load(source.as_str())
        .eval::<mlua::Value>()
        .map_err(|e| EngineError::expression(expression, e))?;

    match result {
        mlua::Value::Nil => Ok(Value::Null),
        other => lua
            .from_value::<Value>(other)
            .map_err(|e| EngineError::expression(expression, e)),
    }
}

/// Fresh Lua state with variables as globals and dangerous globals removed
fn sandbox(variables: &Variables, limits: &ExpressionLimits) -> mlua::Result<mlua::Lua> {
    let lua = mlua::Lua::new();
    lua.set_memory_limit(limits.max_memory_bytes)?;

    let max_instructions = limits.max_instructions;
    let executed = AtomicU64::new(0);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_, _| {
            let total = executed.fetch_add(u64::from(HOOK_INTERVAL), Ordering::Relaxed)
                + u64::from(HOOK_INTERVAL);
            if total > max_instructions {
                return Err(mlua::Error::runtime(format!(
                    "instruction limit of {} exceeded",
                    max_instructions
                )));
            }
            Ok(VmState::Continue)
        },
    )?;

    let globals = lua.globals();

    for name in BLOCKED_GLOBALS {
        globals.set(*name, mlua::Nil)?;
    }

    for (name, value) in variables {
        // JSON null stays nil so comparisons behave like missing variables
        if value.is_null() {
            continue;
        }
        globals.set(name.as_str(), lua.to_value(value)?)?;
    }

    drop(globals);
    Ok(lua)
}

/// Translate the `${...}` body into Lua source
///
/// `&&`/`||`/`!` become `and`/`or`/`not`, `!=` becomes `~=`, and the JUEL word
/// operators (eq, ne, lt, gt, le, ge, null) map to their Lua forms. String
/// literals are copied verbatim.
fn to_lua_source(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 8);
    let mut chars = body.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                out.push_str(" and ");
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                out.push_str(" or ");
            }
            '!' if chars.peek() == Some(&'=') => {
                chars.next();
                out.push_str("~=");
            }
            '!' => out.push_str(" not "),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "eq" => "==",
                    "ne" => "~=",
                    "lt" => "<",
                    "gt" => ">",
                    "le" => "<=",
                    "ge" => ">=",
                    "null" => "nil",
                    _ => word.as_str(),
                });
            }
            _ => out.push(c),
        }
    }

    out
}
