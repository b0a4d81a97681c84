//! Single-step execution.
//!
//! For one step and a snapshot of the run context, `StepExecutor::execute`
//! runs: condition check -> input mapping -> reference lookup -> invocation
//! with retries, per-attempt deadline and cancellation -> (tools only) one
//! simplified fallback attempt -> output mapping. Failures never escape: they
//! come back as an error `StepResult`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::agent::AgentDefinition;
use weft_types::config::{EngineConfig, SimplifyConfig};
use weft_types::flow::{Policy, StepKind, StepNode};
use weft_types::log::{LogEntry, LogLevel, LogTags};
use weft_types::run::StepResult;

use crate::invoke::boxed::{BoxAgentInvoker, BoxToolInvoker};
use crate::invoke::registry::Registry;
use crate::invoke::{AgentRequest, InvocationError, ToolRequest};

use super::condition;
use super::log::{LogSink, TracingLogSink};
use super::path::{get_path, is_path};
use super::retry::{simplify_map, sleep_or_cancel, RetryPolicy};
use super::state::ContextPatch;

/// Result of one step execution plus the context writes it produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    pub patch: ContextPatch,
}

impl StepOutcome {
    fn without_patch(result: StepResult) -> Self {
        Self {
            result,
            patch: ContextPatch::default(),
        }
    }
}

/// Terminal invocation failure with the retries spent on it.
struct Exhausted {
    error: String,
    retries: u32,
}

/// Successful invocation.
struct Invoked {
    output: Value,
    retries: u32,
    fallback_used: bool,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor {
    registry: Registry,
    agents: BoxAgentInvoker,
    tools: BoxToolInvoker,
    logs: Arc<dyn LogSink>,
    backoff_base_ms: u64,
    simplify: SimplifyConfig,
}

impl StepExecutor {
    pub fn new(
        registry: Registry,
        agents: BoxAgentInvoker,
        tools: BoxToolInvoker,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            agents,
            tools,
            logs: Arc::new(TracingLogSink),
            backoff_base_ms: config.backoff_base_ms,
            simplify: config.simplify,
        }
    }

    pub fn with_log_sink(mut self, logs: Arc<dyn LogSink>) -> Self {
        self.logs = logs;
        self
    }

    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.logs)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute `step` against a context snapshot.
    ///
    /// `policy` is the flow policy with the step override already applied.
    pub async fn execute(
        &self,
        run_id: Uuid,
        step: &StepNode,
        policy: Policy,
        context: &Value,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started = Instant::now();
        let mut tags = LogTags::run(run_id).with_step(&step.id);
        match &step.kind {
            StepKind::Agent { agent_id } => tags.agent = Some(agent_id.clone()),
            StepKind::Tool { tool_id } => tags.tool = Some(tool_id.clone()),
        }

        if cancel.is_cancelled() {
            return StepOutcome::without_patch(StepResult::error(&step.id, "run cancelled", 0, 0));
        }

        if let Some(expr) = &step.condition {
            match condition::evaluate(expr, context) {
                Ok(true) => {}
                Ok(false) => {
                    self.log(
                        LogEntry::new(LogLevel::Info, "step skipped", tags)
                            .with_payload(json!({ "condition": expr })),
                    );
                    return StepOutcome::without_patch(StepResult::skipped(&step.id));
                }
                Err(e) => {
                    self.log(
                        LogEntry::new(
                            LogLevel::Warn,
                            "step condition malformed, treating as satisfied",
                            tags.clone(),
                        )
                        .with_payload(json!({ "condition": expr, "error": e.to_string() })),
                    );
                }
            }
        }

        let inputs = resolve_inputs(step, context);
        self.log(
            LogEntry::new(LogLevel::Info, "step started", tags.clone()).with_payload(json!({
                "kind": step.kind.label(),
                "ref_id": step.kind.ref_id(),
            })),
        );

        let retry = RetryPolicy::new(policy, self.backoff_base_ms);
        let invoked = match &step.kind {
            StepKind::Agent { agent_id } => match self.registry.agent(agent_id) {
                Some(agent) => self.invoke_agent(agent, inputs, context, &retry, &tags, cancel).await,
                None => Err(Exhausted {
                    error: format!("reference not found: agent '{agent_id}'"),
                    retries: 0,
                }),
            },
            StepKind::Tool { tool_id } => match self.registry.tool(tool_id) {
                Some(tool) => {
                    let request = ToolRequest {
                        tool: tool.clone(),
                        inputs,
                        simplified: false,
                    };
                    self.invoke_tool(request, &retry, &tags, cancel).await
                }
                None => Err(Exhausted {
                    error: format!("reference not found: tool '{tool_id}'"),
                    retries: 0,
                }),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match invoked {
            Ok(Invoked {
                output,
                retries,
                fallback_used,
            }) => {
                self.log(
                    LogEntry::new(LogLevel::Info, "step completed", tags).with_payload(json!({
                        "duration_ms": duration_ms,
                        "retry_count": retries,
                        "fallback_used": fallback_used,
                    })),
                );
                let patch = output_patch(step, &output);
                StepOutcome {
                    result: StepResult::success(
                        &step.id,
                        output,
                        duration_ms,
                        retries,
                        fallback_used,
                    ),
                    patch,
                }
            }
            Err(Exhausted { error, retries }) => {
                self.log(
                    LogEntry::new(LogLevel::Error, "step failed", tags).with_payload(json!({
                        "error": error,
                        "duration_ms": duration_ms,
                        "retry_count": retries,
                    })),
                );
                StepOutcome::without_patch(StepResult::error(&step.id, error, duration_ms, retries))
            }
        }
    }

    async fn invoke_agent(
        &self,
        agent: &AgentDefinition,
        inputs: Map<String, Value>,
        context: &Value,
        retry: &RetryPolicy,
        tags: &LogTags,
        cancel: &CancellationToken,
    ) -> Result<Invoked, Exhausted> {
        let user_message = match &agent.prompt_template {
            Some(template) => render_template(template, &inputs),
            None => Value::Object(inputs.clone()).to_string(),
        };
        let request = AgentRequest {
            agent: agent.clone(),
            system_prompt: agent.system_prompt.clone(),
            user_message,
            inputs,
            context: context.clone(),
        };

        let agents = &self.agents;
        self.with_retries(retry, tags, cancel, || {
            let request = request.clone();
            async move { agents.invoke(request).await.map(|r| r.into_output()) }
        })
        .await
        .map(|(output, retries)| Invoked {
            output,
            retries,
            fallback_used: false,
        })
        .map_err(|(e, retries)| Exhausted {
            error: e.to_string(),
            retries,
        })
    }

    async fn invoke_tool(
        &self,
        request: ToolRequest,
        retry: &RetryPolicy,
        tags: &LogTags,
        cancel: &CancellationToken,
    ) -> Result<Invoked, Exhausted> {
        let tools = &self.tools;
        let outcome = self
            .with_retries(retry, tags, cancel, || {
                let request = request.clone();
                async move { tools.invoke(request).await }
            })
            .await;

        let (error, retries) = match outcome {
            Ok((output, retries)) => {
                return Ok(Invoked {
                    output,
                    retries,
                    fallback_used: false,
                });
            }
            Err(failure) => failure,
        };
        if !error.is_retryable() {
            return Err(Exhausted {
                error: error.to_string(),
                retries,
            });
        }

        self.log(
            LogEntry::new(
                LogLevel::Warn,
                "retrying step with simplified payload",
                tags.clone().with_attempt(retries + 2),
            )
            .with_payload(json!({ "error": error.to_string() })),
        );
        let simplified = ToolRequest {
            inputs: simplify_map(&request.inputs, &self.simplify),
            simplified: true,
            ..request
        };
        match attempt(retry.timeout, cancel, self.tools.invoke(simplified)).await {
            Ok(output) => Ok(Invoked {
                output,
                retries,
                fallback_used: true,
            }),
            Err(e) => Err(Exhausted {
                error: e.to_string(),
                retries,
            }),
        }
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Returns the value or last error together with
    /// the number of retries performed.
    async fn with_retries<F, Fut>(
        &self,
        retry: &RetryPolicy,
        tags: &LogTags,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<(Value, u32), (InvocationError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, InvocationError>>,
    {
        let mut retries = 0;
        loop {
            match attempt(retry.timeout, cancel, call()).await {
                Ok(output) => return Ok((output, retries)),
                Err(e) => {
                    if !e.is_retryable() || !retry.should_retry(retries) {
                        return Err((e, retries));
                    }
                    retries += 1;
                    let delay = retry.delay_for(retries);
                    self.log(
                        LogEntry::new(
                            LogLevel::Warn,
                            "step attempt failed, retrying",
                            tags.clone().with_attempt(retries),
                        )
                        .with_payload(json!({
                            "error": e.to_string(),
                            "delay_ms": delay.as_millis() as u64,
                        })),
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err((InvocationError::Cancelled, retries));
                    }
                }
            }
        }
    }

    fn log(&self, entry: LogEntry) {
        self.logs.record(&entry);
    }
}

/// One invocation attempt under a deadline, aborted by run cancellation.
async fn attempt<Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    invocation: Fut,
) -> Result<Value, InvocationError>
where
    Fut: Future<Output = Result<Value, InvocationError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(InvocationError::Cancelled),
        outcome = tokio::time::timeout(timeout, invocation) => match outcome {
            Ok(result) => result,
            Err(_) => Err(InvocationError::Timeout(timeout.as_millis() as u64)),
        },
    }
}

// ---------------------------------------------------------------------------
// Mapping helpers
// ---------------------------------------------------------------------------

/// Static args first, mapped inputs on top. Missing paths resolve to `null`.
pub fn resolve_inputs(step: &StepNode, context: &Value) -> Map<String, Value> {
    let mut inputs = step.args.clone();
    for (name, source) in &step.input_mapping {
        let value = match source {
            Value::String(path) if is_path(path) => {
                get_path(context, path).cloned().unwrap_or(Value::Null)
            }
            literal => literal.clone(),
        };
        inputs.insert(name.clone(), value);
    }
    inputs
}

/// Context writes for a successful output: mapped fields, then the whole
/// output under the step's name.
pub fn output_patch(step: &StepNode, output: &Value) -> ContextPatch {
    let mut patch = ContextPatch::default();
    for (field, path) in &step.output_mapping {
        if let Some(value) = output.get(field) {
            patch.set_path(path.clone(), value.clone());
        }
    }
    patch.set_key(step.display_name(), output.clone());
    patch
}

/// Replace `{{ key }}` placeholders with input values. Strings are inserted
/// verbatim, other values as JSON; unknown keys render empty.
pub fn render_template(template: &str, inputs: &Map<String, Value>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        rendered.push_str(&rest[..open]);
        let key = rest[open + 2..open + 2 + close].trim();
        match inputs.get(key) {
            Some(Value::String(s)) => rendered.push_str(s),
            Some(other) => rendered.push_str(&other.to_string()),
            None => {}
        }
        rest = &rest[open + 2 + close + 2..];
    }
    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::log::MemoryLogSink;
    use crate::flow::test_support::{agent_step, tool_step, Script};
    use weft_types::flow::StepPolicy;
    use weft_types::run::StepStatus;

    fn policy(max_retries: u32) -> Policy {
        Policy {
            timeout_ms: 1_000,
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_tool_fails_twice_then_succeeds() {
        let script = Script::new();
        script.fail("fetch", 2);
        let executor = script.executor(&[], &["fetch"]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &tool_step("s", "fetch"),
                policy(2),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.status, StepStatus::Success);
        assert_eq!(outcome.result.retry_count, 2);
        assert!(!outcome.result.fallback_used);
        assert_eq!(script.calls("fetch"), 3);
    }

    #[tokio::test]
    async fn test_tool_simplified_fallback() {
        let script = Script::new();
        script.fail("fetch", 3);
        let executor = script.executor(&[], &["fetch"]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &tool_step("s", "fetch"),
                policy(2),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.status, StepStatus::Success);
        assert_eq!(outcome.result.retry_count, 2);
        assert!(outcome.result.fallback_used);
        assert_eq!(script.calls("fetch"), 4);
        assert_eq!(script.simplified_calls("fetch"), 1);
    }

    #[tokio::test]
    async fn test_agent_retry_bound() {
        let script = Script::new();
        script.fail("writer", u32::MAX);
        let executor = script.executor(&["writer"], &[]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &agent_step("s", "writer"),
                policy(3),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.status, StepStatus::Error);
        assert_eq!(outcome.result.retry_count, 3);
        assert_eq!(script.calls("writer"), 4);
        assert!(outcome.patch.is_empty());
    }

    #[tokio::test]
    async fn test_tool_exhausts_fallback() {
        let script = Script::new();
        script.fail("fetch", u32::MAX);
        let executor = script.executor(&[], &["fetch"]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &tool_step("s", "fetch"),
                policy(1),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.result.is_error());
        // two regular attempts plus the simplified one
        assert_eq!(script.calls("fetch"), 3);
    }

    #[tokio::test]
    async fn test_reference_not_found_is_not_retried() {
        let script = Script::new();
        let executor = script.executor(&[], &[]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &tool_step("s", "ghost"),
                policy(5),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.result.is_error());
        assert_eq!(outcome.result.retry_count, 0);
        assert!(outcome.result.error.unwrap().contains("reference not found"));
        assert_eq!(script.calls("ghost"), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retry() {
        let script = Script::new();
        script.delay("slow", Duration::from_millis(200));
        let executor = script.executor(&["slow"], &[]);

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &agent_step("s", "slow"),
                Policy {
                    timeout_ms: 20,
                    max_retries: 1,
                },
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.result.is_error());
        assert_eq!(outcome.result.retry_count, 1);
        assert!(outcome.result.error.unwrap().contains("timed out"));
        assert_eq!(script.calls("slow"), 2);
    }

    #[tokio::test]
    async fn test_condition_false_skips() {
        let script = Script::new();
        let executor = script.executor(&["writer"], &[]);
        let mut step = agent_step("s", "writer");
        step.condition = Some("$.mode == \"draft\"".to_string());

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &step,
                policy(0),
                &json!({ "mode": "final" }),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.status, StepStatus::Skipped);
        assert_eq!(script.calls("writer"), 0);
    }

    #[tokio::test]
    async fn test_malformed_condition_runs_with_warning() {
        let script = Script::new();
        let logs = Arc::new(MemoryLogSink::new());
        let executor = script
            .executor(&["writer"], &[])
            .with_log_sink(logs.clone());
        let mut step = agent_step("s", "writer");
        step.condition = Some("mode is draft".to_string());

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &step,
                policy(0),
                &json!({}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.result.is_success());
        assert_eq!(logs.messages(LogLevel::Warn).len(), 1);
    }

    #[tokio::test]
    async fn test_input_and_output_mapping() {
        let script = Script::new();
        script.reply("fetch", json!({ "a": "alpha", "b": 2 }));
        let executor = script.executor(&[], &["fetch"]);
        let mut step = tool_step("s", "fetch");
        step.name = Some("fetcher".to_string());
        step.args.insert("limit".to_string(), json!(5));
        step.input_mapping.insert("topic".to_string(), json!("$.request.topic"));
        step.input_mapping.insert("limit".to_string(), json!(10));
        step.input_mapping.insert("missing".to_string(), json!("$.nope"));
        step.output_mapping.insert("a".to_string(), "$.x".to_string());
        step.output_mapping.insert("zzz".to_string(), "$.never".to_string());

        let context = json!({ "request": { "topic": "rust" } });
        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &step,
                policy(0),
                &context,
                &CancellationToken::new(),
            )
            .await;

        let seen = script.last_inputs("fetch").unwrap();
        assert_eq!(seen["topic"], json!("rust"));
        assert_eq!(seen["limit"], json!(10));
        assert_eq!(seen["missing"], Value::Null);

        let mut ctx = context.clone();
        outcome.patch.apply(&mut ctx);
        assert_eq!(ctx["x"], json!("alpha"));
        assert!(ctx.get("never").is_none());
        assert_eq!(ctx["fetcher"], json!({ "a": "alpha", "b": 2 }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let script = Script::new();
        let executor = script.executor(&["writer"], &[]);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = executor
            .execute(
                Uuid::now_v7(),
                &agent_step("s", "writer"),
                policy(3),
                &json!({}),
                &token,
            )
            .await;

        assert!(outcome.result.is_error());
        assert_eq!(script.calls("writer"), 0);
    }

    #[tokio::test]
    async fn test_step_policy_override_applies() {
        let mut step = agent_step("s", "writer");
        step.policy = Some(StepPolicy {
            timeout_ms: None,
            max_retries: Some(0),
        });
        let effective = policy(4).with_override(step.policy.as_ref());

        let script = Script::new();
        script.fail("writer", u32::MAX);
        let executor = script.executor(&["writer"], &[]);
        executor
            .execute(
                Uuid::now_v7(),
                &step,
                effective,
                &json!({}),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(script.calls("writer"), 1);
    }

    #[test]
    fn test_render_template() {
        let mut inputs = Map::new();
        inputs.insert("topic".to_string(), json!("rust"));
        inputs.insert("n".to_string(), json!(3));
        assert_eq!(
            render_template("Write {{ n }} notes on {{topic}}.{{ unknown }}", &inputs),
            "Write 3 notes on rust."
        );
        assert_eq!(render_template("no {{ close", &inputs), "no {{ close");
    }
}
