//! JSON-RPC 2.0 dispatcher (component C6 of spec.md §4.6).
//!
//! Parses one envelope per WebSocket message, routes requests to built-in
//! methods or the injected [`ToolRegistry`], and supports responses whose
//! emission is deferred until an asynchronous tool resolves its token.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::registry::{DeferredCompletion, DeferredSink, HandlerOutcome, ToolCall, ToolRegistry};
use crate::ClientId;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC's three admissible id shapes, plus "absent" tracked separately
/// by [`InboundMessage`] (a present-but-`null` id is still a request, per
/// the JSON-RPC 2.0 spec, so it is represented here rather than folded into
/// "absent").
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

impl From<&Value> for JsonRpcId {
    fn from(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number).unwrap_or(JsonRpcId::Null),
            Value::String(s) => JsonRpcId::String(s.clone()),
            _ => JsonRpcId::Null,
        }
    }
}

/// A JSON-RPC error object (`{code, message, data?}`).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn parse_error() -> Self {
        Self { code: -32700, message: "Parse error".into(), data: None }
    }

    pub fn invalid_request() -> Self {
        Self { code: -32600, message: "Invalid Request".into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self { code: -32601, message: "Method not found".into(), data: Some(json!(method)) }
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self { code: -32603, message: "Internal error".into(), data: Some(json!(detail.into())) }
    }
}

/// The result of classifying one inbound JSON-RPC message.
enum InboundMessage {
    Request { id: JsonRpcId, method: String, params: Value },
    Notification { method: String, params: Value },
    ParseError,
    InvalidRequest { id: JsonRpcId },
}

fn parse_inbound(raw: &[u8]) -> InboundMessage {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return InboundMessage::ParseError,
    };

    let Some(object) = value.as_object() else {
        return InboundMessage::InvalidRequest { id: JsonRpcId::Null };
    };

    let id = object.get("id").map(JsonRpcId::from);

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return InboundMessage::InvalidRequest { id: id.unwrap_or(JsonRpcId::Null) };
    }

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return InboundMessage::InvalidRequest { id: id.unwrap_or(JsonRpcId::Null) };
    };

    let params = object.get("params").cloned().unwrap_or(Value::Null);

    match id {
        Some(id) => InboundMessage::Request { id, method: method.to_string(), params },
        None => InboundMessage::Notification { method: method.to_string(), params },
    }
}

#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    jsonrpc: &'static str,
    id: &'a JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

fn success_response(id: &JsonRpcId, result: Value) -> Vec<u8> {
    let envelope = ResponseEnvelope { jsonrpc: "2.0", id, result: Some(result), error: None };
    serde_json::to_vec(&envelope).expect("JSON-RPC envelope is always serializable")
}

fn error_response(id: &JsonRpcId, error: JsonRpcError) -> Vec<u8> {
    let envelope = ResponseEnvelope { jsonrpc: "2.0", id, result: None, error: Some(error) };
    serde_json::to_vec(&envelope).expect("JSON-RPC envelope is always serializable")
}

/// A server-initiated notification (`send`/`broadcast`, spec.md §4.6
/// "Outbound") — no `id` field, per JSON-RPC 2.0.
pub fn encode_notification(method: &str, params: Value) -> Vec<u8> {
    let envelope = json!({ "jsonrpc": "2.0", "method": method, "params": params });
    serde_json::to_vec(&envelope).expect("notification is always serializable")
}

/// What the dispatcher wants the caller to do with one inbound message.
pub enum DispatchOutcome {
    /// Write this many bytes back to the client as its response.
    Respond(Vec<u8>),
    /// A notification, or a request whose handler deferred; nothing to
    /// write right now.
    NoResponse,
}

/// Routes parsed JSON-RPC envelopes to built-in methods or the tool
/// registry, and tracks deferred completions.
pub struct Dispatcher {
    registry: Arc<dyn ToolRegistry>,
    server_name: String,
    server_version: String,
    deferred: HashMap<String, (ClientId, JsonRpcId)>,
    deferred_tx: mpsc::UnboundedSender<DeferredCompletion>,
    deferred_rx: mpsc::UnboundedReceiver<DeferredCompletion>,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn ToolRegistry>, server_name: &str, server_version: &str) -> Self {
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            server_name: server_name.to_string(),
            server_version: server_version.to_string(),
            deferred: HashMap::new(),
            deferred_tx,
            deferred_rx,
        }
    }

    /// A sink for [`HandlerOutcome::Deferred`] completions; pass one to
    /// every `tools/call` invocation via [`DeferredSink`] clones.
    fn deferred_sink(&self) -> DeferredSink {
        DeferredSink::new(self.deferred_tx.clone())
    }

    /// Await the next tool completion. Cancel-safe: intended to sit in a
    /// `tokio::select!` arm in the server's central event loop.
    pub async fn next_completion(&mut self) -> DeferredCompletion {
        // The sender half is held by `self` too, so this channel never
        // closes out from under the loop.
        self.deferred_rx.recv().await.expect("dispatcher holds a sender clone")
    }

    /// Resolve a completed deferred call into a (client, response bytes)
    /// pair, or `None` if its client already disconnected (spec.md §4.6:
    /// "the response is dropped silently").
    pub fn resolve_completion(&mut self, completion: DeferredCompletion) -> Option<(ClientId, Vec<u8>)> {
        let (client, id) = self.deferred.remove(&completion.token)?;
        let bytes = match completion.outcome {
            Ok(result) => success_response(&id, result),
            Err(err) => error_response(&id, err),
        };
        Some((client, bytes))
    }

    /// Drop all outstanding deferred requests (spec.md §4.4 "Shutdown").
    pub fn clear_deferred(&mut self) {
        self.deferred.clear();
    }

    /// Forget any deferred calls still pending for a client that just
    /// disconnected; their eventual completion will find no entry and be
    /// dropped by [`resolve_completion`].
    pub fn forget_client(&mut self, client: &ClientId) {
        self.deferred.retain(|_, (c, _)| c != client);
    }

    /// Dispatch one WebSocket message's payload.
    pub fn dispatch(&mut self, client: &ClientId, raw: &[u8]) -> DispatchOutcome {
        match parse_inbound(raw) {
            InboundMessage::ParseError => {
                DispatchOutcome::Respond(error_response(&JsonRpcId::Null, JsonRpcError::parse_error()))
            }
            InboundMessage::InvalidRequest { id } => {
                DispatchOutcome::Respond(error_response(&id, JsonRpcError::invalid_request()))
            }
            InboundMessage::Notification { method, params } => {
                self.handle_notification(client, &method, params);
                DispatchOutcome::NoResponse
            }
            InboundMessage::Request { id, method, params } => {
                self.handle_request(client, id, &method, params)
            }
        }
    }

    fn handle_notification(&mut self, client: &ClientId, method: &str, params: Value) {
        match method {
            "notifications/initialized" => {
                log::debug!("client {client} initialized");
            }
            "tools/call" => {
                // Fire-and-forget notifications never get a response, even
                // if the underlying tool call fails.
                if let Ok(call) = parse_tool_call(params) {
                    let deferred = self.deferred_sink();
                    let _ = self.registry.invoke(client, call, deferred);
                }
            }
            other => log::debug!("ignoring unknown notification {other}"),
        }
    }

    fn handle_request(
        &mut self,
        client: &ClientId,
        id: JsonRpcId,
        method: &str,
        params: Value,
    ) -> DispatchOutcome {
        match method {
            "initialize" => DispatchOutcome::Respond(success_response(&id, self.initialize_result())),
            "notifications/initialized" => DispatchOutcome::Respond(success_response(&id, Value::Null)),
            "prompts/list" => {
                DispatchOutcome::Respond(success_response(&id, json!({ "prompts": [] })))
            }
            "tools/list" => {
                let tools = self.registry.list();
                DispatchOutcome::Respond(success_response(&id, json!({ "tools": tools })))
            }
            "tools/call" => self.handle_tools_call(client, id, params),
            other => DispatchOutcome::Respond(error_response(&id, JsonRpcError::method_not_found(other))),
        }
    }

    fn handle_tools_call(&mut self, client: &ClientId, id: JsonRpcId, params: Value) -> DispatchOutcome {
        let call = match parse_tool_call(params) {
            Ok(call) => call,
            Err(err) => return DispatchOutcome::Respond(error_response(&id, err)),
        };

        let deferred = self.deferred_sink();
        match self.registry.invoke(client, call, deferred) {
            HandlerOutcome::Ok(value) => DispatchOutcome::Respond(success_response(&id, value)),
            HandlerOutcome::Err(err) => DispatchOutcome::Respond(error_response(&id, err)),
            HandlerOutcome::Deferred(token) => {
                self.deferred.insert(token, (client.clone(), id));
                DispatchOutcome::NoResponse
            }
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "logging": {},
                "prompts": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": true },
                "tools": { "listChanged": true },
            },
            "serverInfo": {
                "name": self.server_name,
                "version": self.server_version,
            },
        })
    }
}

fn parse_tool_call(params: Value) -> Result<ToolCall, JsonRpcError> {
    let object = params
        .as_object()
        .ok_or_else(|| JsonRpcError::invalid_request())?;
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(JsonRpcError::invalid_request)?
        .to_string();
    let arguments = object.get("arguments").cloned().unwrap_or(Value::Null);
    Ok(ToolCall { name, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EmptyToolRegistry;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(EmptyToolRegistry), "test-server", "0.0.0")
    }

    fn client() -> ClientId {
        ClientId::new_for_test("client-1")
    }

    fn parse_response(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn parse_error_has_null_id() {
        let mut d = dispatcher();
        match d.dispatch(&client(), b"not json") {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert_eq!(v["error"]["code"], -32700);
                assert_eq!(v["id"], Value::Null);
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[test]
    fn invalid_request_wrong_version() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"1.0","id":1,"method":"initialize"}"#;
        match d.dispatch(&client(), raw) {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert_eq!(v["error"]["code"], -32600);
                assert_eq!(v["id"], 1);
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","id":2,"method":"nope"}"#;
        match d.dispatch(&client(), raw) {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert_eq!(v["error"]["code"], -32601);
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[test]
    fn initialize_returns_capabilities() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","id":7,"method":"initialize","params":{}}"#;
        match d.dispatch(&client(), raw) {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert_eq!(v["id"], 7);
                assert_eq!(v["result"]["protocolVersion"], "2024-11-05");
                assert_eq!(v["result"]["capabilities"]["tools"]["listChanged"], true);
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[test]
    fn notifications_initialized_gets_no_response() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(matches!(d.dispatch(&client(), raw), DispatchOutcome::NoResponse));
    }

    #[test]
    fn prompts_list_is_empty_array() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","id":3,"method":"prompts/list"}"#;
        match d.dispatch(&client(), raw) {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert!(v["result"]["prompts"].is_array());
                assert_eq!(v["result"]["prompts"].as_array().unwrap().len(), 0);
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[test]
    fn tools_call_unknown_tool_is_internal_error_from_registry() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"missing","arguments":{}}}"#;
        match d.dispatch(&client(), raw) {
            DispatchOutcome::Respond(bytes) => {
                let v = parse_response(&bytes);
                assert_eq!(v["id"], 9);
                assert!(v["error"].is_object());
            }
            DispatchOutcome::NoResponse => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn deferred_tool_call_resolves_with_same_id() {
        struct ConfirmRegistry;
        impl ToolRegistry for ConfirmRegistry {
            fn list(&self) -> Vec<crate::registry::ToolDescriptor> {
                Vec::new()
            }
            fn invoke(
                &self,
                _client: &ClientId,
                _call: ToolCall,
                deferred: DeferredSink,
            ) -> HandlerOutcome {
                deferred.resolve("tok-1", Ok(json!({ "content": [] })));
                HandlerOutcome::Deferred("tok-1".into())
            }
        }

        let mut d = Dispatcher::new(Arc::new(ConfirmRegistry), "s", "0");
        let raw = br#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"confirm","arguments":{}}}"#;
        assert!(matches!(d.dispatch(&client(), raw), DispatchOutcome::NoResponse));

        let completion = d.next_completion().await;
        let (resolved_client, bytes) = d.resolve_completion(completion).unwrap();
        assert_eq!(resolved_client, client());
        let v = parse_response(&bytes);
        assert_eq!(v["id"], 7);
        assert_eq!(v["result"]["content"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn completion_for_disconnected_client_drops_silently() {
        let mut d = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"x","arguments":{}}}"#;
        // EmptyToolRegistry errors synchronously, so fabricate a deferred
        // entry directly to exercise the forget/resolve path in isolation.
        d.deferred.insert("tok-2".into(), (client(), JsonRpcId::Number(1)));
        d.forget_client(&client());
        d.deferred_tx
            .send(DeferredCompletion { token: "tok-2".into(), outcome: Ok(Value::Null) })
            .unwrap();
        let completion = d.next_completion().await;
        assert!(d.resolve_completion(completion).is_none());
        let _ = raw;
    }
}
