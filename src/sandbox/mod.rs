//! Sandboxed JavaScript evaluation.
//!
//! A fresh Boa context per evaluation, primed with a minimal browser shim and
//! nothing else: no network, no filesystem, no host objects beyond what the
//! prelude defines. Wall time is enforced from outside via `tokio::time::
//! timeout`; inside the engine, loop-iteration and recursion limits make sure
//! a hostile script terminates instead of pinning the blocking thread.
//!
//! Evaluations are deterministic: the shim's `performance.now` is a counter,
//! not a clock, so the same script over the same shim state always produces
//! the same output.

use std::time::Duration;

use boa_engine::{Context, JsValue, Source};
use thiserror::Error;

/// In-engine ceiling on loop iterations. Generous enough for real challenge
/// scripts, small enough that a `while(true)` exits in well under a second.
const LOOP_ITERATION_LIMIT: u64 = 5_000_000;
const RECURSION_LIMIT: usize = 512;

/// Default memory ceiling (50 MiB) and wall-time ceiling (10 s).
pub const DEFAULT_MEMORY_LIMIT: usize = 50 * 1024 * 1024;
pub const DEFAULT_WALL_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_bytes: usize,
    pub wall_time: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_LIMIT,
            wall_time: DEFAULT_WALL_TIME,
        }
    }
}

/// Host state the shim exposes to the script. Discarded after evaluation.
#[derive(Debug, Clone)]
pub struct ShimState {
    pub host: String,
    pub user_agent: String,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("script exceeded the wall-time ceiling")]
    Timeout,
    #[error("script exceeded the memory ceiling")]
    Memory,
    #[error("script evaluation failed: {0}")]
    Execution(String),
    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

/// One-shot evaluator. Construct per challenge; never share.
#[derive(Debug, Clone, Copy)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Evaluate `script` under the shim. Returns the value the script left
    /// in the answer slot, or its completion value when the slot stays empty.
    /// On limit breach no partial result escapes.
    pub async fn evaluate(
        &self,
        script: String,
        shim: ShimState,
    ) -> Result<serde_json::Value, SandboxError> {
        let limits = self.limits;
        let task = tokio::task::spawn_blocking(move || run_script(&script, &shim, &limits));

        match tokio::time::timeout(limits.wall_time, task).await {
            Err(_) => Err(SandboxError::Timeout),
            Ok(Err(join_error)) => Err(SandboxError::Setup(join_error.to_string())),
            Ok(Ok(outcome)) => outcome,
        }
    }
}

fn run_script(
    script: &str,
    shim: &ShimState,
    limits: &SandboxLimits,
) -> Result<serde_json::Value, SandboxError> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    context
        .runtime_limits_mut()
        .set_recursion_limit(RECURSION_LIMIT);
    context
        .runtime_limits_mut()
        .set_stack_size_limit((limits.memory_bytes / 64).max(1024));

    let prelude = build_prelude(&shim.host, &shim.user_agent);
    context
        .eval(Source::from_bytes(&prelude))
        .map_err(|err| SandboxError::Setup(err.to_string()))?;

    let completion = context
        .eval(Source::from_bytes(script))
        .map_err(|err| classify_engine_error(&err.to_string()))?;

    let answer = context
        .eval(Source::from_bytes("__state.getValue('jschl_answer');"))
        .map_err(|err| SandboxError::Execution(err.to_string()))?;

    let value = if answer.is_null() || answer.is_undefined() {
        completion
    } else {
        answer
    };

    to_json(value, &mut context)
}

fn classify_engine_error(message: &str) -> SandboxError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("loop iteration") {
        SandboxError::Timeout
    } else if lowered.contains("recursion") || lowered.contains("stack") {
        SandboxError::Memory
    } else {
        SandboxError::Execution(message.to_string())
    }
}

fn to_json(value: JsValue, context: &mut Context) -> Result<serde_json::Value, SandboxError> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(boolean) = value.as_boolean() {
        return Ok(serde_json::Value::Bool(boolean));
    }
    if let Some(number) = value.as_number() {
        if number.is_finite()
            && let Some(json_number) = serde_json::Number::from_f64(number)
        {
            return Ok(serde_json::Value::Number(json_number));
        }
        return Ok(serde_json::Value::Null);
    }

    let text = value
        .to_string(context)
        .map_err(|err| SandboxError::Execution(err.to_string()))?
        .to_std_string_escaped();
    Ok(serde_json::Value::String(text))
}

/// The browser shim. Everything a typical challenge script touches, nothing
/// more: location/window/navigator, a document with createElement and an
/// element cache, a deterministic performance counter, and the `__state`
/// answer channel the solver reads back.
fn build_prelude(host: &str, user_agent: &str) -> String {
    format!(
        r#"
var __host = "{host}";
var __scheme = "https://";
var location = {{
    href: __scheme + __host + "/",
    hostname: __host,
    protocol: "https:",
    port: ""
}};
var window = {{ location: location }};
var navigator = {{
    userAgent: "{user_agent}",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32"
}};
window.navigator = navigator;
var history = {{ replaceState: function() {{}} }};
window.history = history;
var __ticks = 0;
var performance = {{ now: function() {{ __ticks += 16; return __ticks; }} }};
window.performance = performance;
var __state = {{
    values: {{}},
    setValue: function(id, value) {{ this.values[id] = value; }},
    getValue: function(id) {{ return this.values[id]; }}
}};
function __makeElement(id) {{
    var element = {{
        id: id,
        style: {{}},
        attributes: {{}},
        children: [],
        addEventListener: function() {{}},
        removeEventListener: function() {{}},
        appendChild: function(child) {{ this.children.push(child); return child; }},
        setAttribute: function(name, value) {{ this.attributes[name] = value; }},
        getAttribute: function(name) {{ return this.attributes[name] || ""; }},
        submit: function() {{}}
    }};
    Object.defineProperty(element, "value", {{
        get: function() {{ return __state.getValue(id); }},
        set: function(v) {{ __state.setValue(id, v); }}
    }});
    return element;
}}
var document = {{
    _cache: {{}},
    location: location,
    createElement: function(tag) {{ return __makeElement(tag); }},
    querySelector: function(sel) {{ return __makeElement(sel); }},
    querySelectorAll: function(sel) {{ return []; }},
    getElementById: function(id) {{
        if (!this._cache[id]) {{
            this._cache[id] = __makeElement(id);
        }}
        return this._cache[id];
    }}
}};
window.document = document;
document.defaultView = window;
function setTimeout(cb, delay) {{ return cb(); }}
function clearTimeout() {{}}
function submit() {{}}
"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shim() -> ShimState {
        ShimState {
            host: "example.test".into(),
            user_agent: "Mozilla/5.0 test".into(),
        }
    }

    #[tokio::test]
    async fn computes_answer_through_the_shim() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let script = r#"
            setTimeout(function() {
                var a = 10, b = 32;
                document.getElementById('jschl_answer').value = a + b;
            }, 4000);
        "#;
        let value = sandbox.evaluate(script.into(), shim()).await.unwrap();
        assert_eq!(value, serde_json::json!(42.0));
    }

    #[tokio::test]
    async fn completion_value_when_no_answer_slot() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let value = sandbox
            .evaluate("'token-' + location.hostname".into(), shim())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!("token-example.test"));
    }

    #[tokio::test]
    async fn deterministic_across_runs() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let script = "performance.now() + performance.now();";
        let first = sandbox.evaluate(script.into(), shim()).await.unwrap();
        let second = sandbox.evaluate(script.into(), shim()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let sandbox = Sandbox::new(SandboxLimits {
            memory_bytes: DEFAULT_MEMORY_LIMIT,
            wall_time: Duration::from_secs(2),
        });
        let err = sandbox
            .evaluate("while(true);".into(), shim())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout));
    }

    #[tokio::test]
    async fn runaway_recursion_is_a_memory_error() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let err = sandbox
            .evaluate("function f() { return f(); } f();".into(), shim())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Memory));
    }

    #[tokio::test]
    async fn syntax_errors_are_execution_errors() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        let err = sandbox
            .evaluate("this is not javascript".into(), shim())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }

    #[tokio::test]
    async fn no_host_escape_hatches() {
        let sandbox = Sandbox::new(SandboxLimits::default());
        for probe in ["fetch('https://x')", "require('fs')", "XMLHttpRequest"] {
            let result = sandbox.evaluate(probe.into(), shim()).await;
            assert!(
                matches!(result, Err(SandboxError::Execution(_))),
                "{probe} should not resolve"
            );
        }
    }
}
