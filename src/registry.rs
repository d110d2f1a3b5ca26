//! The injected `ToolRegistry` collaborator (spec.md §6 "Injected
//! collaborators"). This core ships a `ToolRegistry` trait and the small
//! amount of supporting plumbing (deferred completions); concrete tool
//! implementations and host-editor integration are out of scope (§1).

use serde_json::Value;
use tokio::sync::mpsc;

use crate::dispatcher::JsonRpcError;
use crate::ClientId;

/// One entry of `tools/list`'s response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The parsed `params` of a `tools/call` request.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// What a tool handler hands back to the dispatcher.
pub enum HandlerOutcome {
    /// The call completed synchronously with this result value.
    Ok(Value),
    /// The call failed synchronously.
    Err(JsonRpcError),
    /// The call is long-running; the tool will resolve `token` later via the
    /// [`DeferredSink`] it was invoked with.
    Deferred(String),
}

/// One pending tool completion, pushed through a [`DeferredSink`].
pub struct DeferredCompletion {
    pub token: String,
    pub outcome: Result<Value, JsonRpcError>,
}

/// A cloneable handle a tool can hold onto and use, from any later point in
/// time, to resolve a [`HandlerOutcome::Deferred`] it previously returned.
///
/// Resolving after the server has stopped (the channel's receiver dropped)
/// is a silent no-op, matching spec.md §4.6's "any outstanding deferred will
/// find no sender and silently drop".
#[derive(Clone)]
pub struct DeferredSink {
    tx: mpsc::UnboundedSender<DeferredCompletion>,
}

impl DeferredSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DeferredCompletion>) -> Self {
        Self { tx }
    }

    pub fn resolve(&self, token: impl Into<String>, outcome: Result<Value, JsonRpcError>) {
        let _ = self.tx.send(DeferredCompletion { token: token.into(), outcome });
    }
}

/// The mapping from JSON-RPC method name to tool handler, injected into the
/// server by the host editor. `list`/`invoke` both run on the single event
/// loop thread and must not block it; long-running work belongs behind a
/// `Deferred` token and an out-of-band task.
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolDescriptor>;

    fn invoke(&self, client: &ClientId, call: ToolCall, deferred: DeferredSink) -> HandlerOutcome;
}

/// A registry with no tools, useful for embedding the core standalone or in
/// tests that only exercise `initialize`/`tools/list`.
#[derive(Default)]
pub struct EmptyToolRegistry;

impl ToolRegistry for EmptyToolRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    fn invoke(&self, _client: &ClientId, call: ToolCall, _deferred: DeferredSink) -> HandlerOutcome {
        HandlerOutcome::Err(JsonRpcError::method_not_found(&format!("tools/call:{}", call.name)))
    }
}
