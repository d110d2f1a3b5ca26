//! Thin illustrative host. Hardcodes a config and a toy tool registry to
//! prove the core runs standalone; a real embedder wires in its own
//! `ToolRegistry` and configuration loading.

use std::sync::Arc;

use serde_json::{json, Value};

use ide_mcp_bridge::{
    Callbacks, ClientId, DeferredSink, EmptyToolRegistry, HandlerOutcome, ServerConfig, ToolCall,
    ToolDescriptor, ToolRegistry,
};

struct DemoRegistry;

impl ToolRegistry for DemoRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "echo".to_string(),
            description: "Echoes its `text` argument back".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        }]
    }

    fn invoke(&self, client: &ClientId, call: ToolCall, deferred: DeferredSink) -> HandlerOutcome {
        match call.name.as_str() {
            "echo" => {
                let text = call.arguments.get("text").cloned().unwrap_or(Value::Null);
                HandlerOutcome::Ok(json!({ "content": [{ "type": "text", "text": text }] }))
            }
            other => {
                let unknown = ToolCall { name: other.to_string(), arguments: Value::Null };
                EmptyToolRegistry.invoke(client, unknown, deferred)
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ide_mcp_bridge::Result<()> {
    env_logger::init();

    let config = ServerConfig::default();
    let callbacks = Callbacks {
        on_connect: Box::new(|id| log::info!("demo: {id} connected")),
        on_message: Box::new(|id, text| log::debug!("demo: {id} sent {text}")),
        on_disconnect: Box::new(|id, code, reason| log::info!("demo: {id} disconnected ({code} {reason})")),
        on_error: Box::new(|msg| log::warn!("demo: {msg}")),
    };

    let handle = ide_mcp_bridge::start(config, Arc::new(DemoRegistry), callbacks).await?;
    log::info!("ide-mcp-bridge listening on port {}", handle.port());

    tokio::signal::ctrl_c().await.ok();
    handle.stop().await
}
