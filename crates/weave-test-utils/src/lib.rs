//! Test doubles for weave: scripted tools, an invocation log and a
//! concurrency gauge for asserting scheduling properties.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::Tool;
use weave_core::types::{ToolContext, ToolOutput};

/// A fresh context for calling tools directly in tests.
pub fn test_context() -> ToolContext {
    ToolContext::new("test-execution")
}

/// Phase of a recorded invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Finished,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub tool: String,
    pub phase: Phase,
}

/// Ordered record of tool starts and finishes across concurrent steps.
#[derive(Debug, Default)]
pub struct InvocationLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl InvocationLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, tool: &str, phase: Phase) {
        self.entries.lock().unwrap().push(LogEntry {
            tool: tool.to_string(),
            phase,
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Tool names in the order they reached `phase`.
    pub fn order(&self, phase: Phase) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.phase == phase)
            .map(|e| e.tool)
            .collect()
    }

    pub fn count(&self, tool: &str, phase: Phase) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.tool == tool && e.phase == phase)
            .count()
    }

    /// Whether `first` finished before `second` started for the first time.
    pub fn finished_before_started(&self, first: &str, second: &str) -> bool {
        let entries = self.entries();
        let finished = entries
            .iter()
            .position(|e| e.tool == first && e.phase == Phase::Finished);
        let started = entries
            .iter()
            .position(|e| e.tool == second && e.phase == Phase::Started);
        match (finished, started) {
            (Some(f), Some(s)) => f < s,
            _ => false,
        }
    }
}

/// Tracks how many tool calls are in flight, and the peak.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    gauge: Arc<ConcurrencyGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A tool with scripted behaviour: delay, failures, fixed or echoed output.
///
/// Clones share the call counter, so a test can keep a handle after
/// registering the tool.
#[derive(Clone)]
pub struct ScriptedTool {
    name: String,
    delay: Duration,
    fail_first: u32,
    always_fail: bool,
    /// `None` echoes the input back.
    output: Option<serde_json::Value>,
    calls: Arc<AtomicU32>,
    log: Option<Arc<InvocationLog>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl ScriptedTool {
    /// A tool that echoes its input.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            fail_first: 0,
            always_fail: false,
            output: None,
            calls: Arc::new(AtomicU32::new(0)),
            log: None,
            gauge: None,
        }
    }

    pub fn returning(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Fail every call.
    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_times(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_log(mut self, log: Arc<InvocationLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Number of times the tool has been invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, phase: Phase) {
        if let Some(log) = &self.log {
            log.record(&self.name, phase);
        }
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let _guard = self.gauge.as_ref().map(|g| g.enter());
            self.record(Phase::Started);

            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        self.record(Phase::Cancelled);
                        return Err(WeaveError::Cancelled);
                    }
                }
            }

            self.record(Phase::Finished);

            if self.always_fail || call < self.fail_first {
                return Ok(ToolOutput::error(format!(
                    "{} failed on call {}",
                    self.name,
                    call + 1
                )));
            }

            Ok(ToolOutput::success(self.output.clone().unwrap_or(input)))
        })
    }
}

type Transform = dyn Fn(&serde_json::Value) -> std::result::Result<serde_json::Value, String>
    + Send
    + Sync;

/// A tool backed by a closure over its input.
pub struct FnTool {
    name: String,
    transform: Arc<Transform>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<serde_json::Value, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
        }
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Closure-backed test tool"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            match (self.transform)(&input) {
                Ok(value) => Ok(ToolOutput::success(value)),
                Err(message) => Ok(ToolOutput::error(message)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let tool = ScriptedTool::new("flaky")
            .failing_times(2)
            .returning(serde_json::json!("ok"));

        for _ in 0..2 {
            let out = tool.execute(serde_json::json!({}), test_context()).await.unwrap();
            assert!(out.is_error);
        }
        let out = tool.execute(serde_json::json!({}), test_context()).await.unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "ok");
        assert_eq!(tool.calls(), 3);
    }

    #[tokio::test]
    async fn test_echo_and_log() {
        let log = InvocationLog::new();
        let tool = ScriptedTool::new("echo").with_log(log.clone());
        let out = tool
            .execute(serde_json::json!({"a": 1}), test_context())
            .await
            .unwrap();
        assert_eq!(out.content, serde_json::json!({"a": 1}));
        assert_eq!(log.order(Phase::Started), vec!["echo"]);
        assert_eq!(log.count("echo", Phase::Finished), 1);
    }

    #[test]
    fn test_gauge_peak() {
        let gauge = ConcurrencyGauge::new();
        let a = gauge.enter();
        let b = gauge.enter();
        assert_eq!(gauge.current(), 2);
        drop(a);
        drop(b);
        let _c = gauge.enter();
        assert_eq!(gauge.current(), 1);
        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_delay() {
        let tool = ScriptedTool::new("slow").with_delay(Duration::from_secs(60));
        let ctx = test_context();
        ctx.cancel.cancel();
        let err = tool.execute(serde_json::json!({}), ctx).await.unwrap_err();
        assert!(matches!(err, WeaveError::Cancelled));
    }
}
