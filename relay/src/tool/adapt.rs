//! Tool adaptation: remote servers, worker agents, output normalization.
//!
//! Everything the model consumes is text. Adaptation turns whatever a
//! tool produced into a bounded text representation: text verbatim,
//! JSON compact, images and binary resources as compact placeholders.
//! Remote outputs longer than the configured cap are cut and marked
//! `[TRUNCATED]`.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use super::{DynTool, ToolOutput};
use crate::error::Result;
use crate::provider::ToolDefinition;

/// Marker appended to over-long remote tool output.
pub const TRUNCATION_MARKER: &str = "[TRUNCATED]";

/// Normalize a tool output to text, bounded by `max_len` characters.
#[must_use]
pub fn normalize_output(output: &ToolOutput, max_len: usize) -> String {
    let text = match output {
        ToolOutput::Text(text) => text.clone(),
        ToolOutput::Json(value) => serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned()),
        ToolOutput::Image { mime_type } => format!("[image: {mime_type}]"),
        ToolOutput::Binary { mime_type, bytes } => format!("[binary: {mime_type}, {bytes} bytes]"),
    };

    if max_len > 0 && text.chars().count() > max_len {
        let cut: String = text.chars().take(max_len).collect();
        format!("{cut}{TRUNCATION_MARKER}")
    } else {
        text
    }
}

/// A client for one remote tool server (Model Context Protocol or
/// compatible). The wire protocol lives in the adapter crate; the core
/// only needs these three operations.
#[async_trait]
pub trait RemoteToolClient: Send + Sync {
    /// Stable server name; duplicate tool names across servers resolve
    /// to the lexicographically first server name.
    fn server_name(&self) -> &str;

    /// Definitions of the tools this server exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Invoke one tool with its arguments serialized as a JSON string.
    async fn call_tool(&self, name: &str, arguments_json: &str) -> Result<ToolOutput>;
}

/// A remote tool exposed as a core-native [`DynTool`].
pub struct RemoteTool {
    client: Arc<dyn RemoteToolClient>,
    definition: ToolDefinition,
    max_output_len: usize,
}

impl RemoteTool {
    /// Wrap one remote tool.
    #[must_use]
    pub fn new(
        client: Arc<dyn RemoteToolClient>,
        definition: ToolDefinition,
        max_output_len: usize,
    ) -> Self {
        Self {
            client,
            definition,
            max_output_len,
        }
    }

    /// Name of the server this tool lives on.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.client.server_name()
    }
}

#[async_trait]
impl DynTool for RemoteTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> String {
        self.definition.description.clone()
    }

    fn input_schema(&self) -> Value {
        self.definition.parameters.clone()
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput> {
        let arguments_json = serde_json::to_string(&Value::Object(arguments))?;
        let output = self
            .client
            .call_tool(&self.definition.name, &arguments_json)
            .await?;
        Ok(ToolOutput::Text(normalize_output(
            &output,
            self.max_output_len,
        )))
    }
}

impl std::fmt::Debug for RemoteTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTool")
            .field("name", &self.definition.name)
            .field("server", &self.client.server_name())
            .finish_non_exhaustive()
    }
}

/// Adapt the tools of several remote servers into [`DynTool`]s.
///
/// Servers are visited in lexicographic server-name order, so a tool
/// name exposed by more than one server deterministically resolves to
/// the first server; each collision is logged exactly once.
pub async fn adapt_remote_servers(
    clients: Vec<Arc<dyn RemoteToolClient>>,
    max_output_len: usize,
) -> Result<Vec<Arc<dyn DynTool>>> {
    let mut ordered = clients;
    ordered.sort_by(|a, b| a.server_name().cmp(b.server_name()));

    let mut seen: HashSet<String> = HashSet::new();
    let mut logged: HashSet<String> = HashSet::new();
    let mut tools: Vec<Arc<dyn DynTool>> = Vec::new();

    for client in ordered {
        for definition in client.list_tools().await? {
            if seen.contains(&definition.name) {
                if logged.insert(definition.name.clone()) {
                    warn!(
                        tool = %definition.name,
                        server = client.server_name(),
                        "Duplicate remote tool name; keeping the first server's tool"
                    );
                }
                continue;
            }
            seen.insert(definition.name.clone());
            tools.push(Arc::new(RemoteTool::new(
                Arc::clone(&client),
                definition,
                max_output_len,
            )));
        }
    }

    Ok(tools)
}

/// Future type produced by a worker-agent run function.
pub type WorkerRunFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// A worker agent exposed as a tool.
///
/// The wrapper knows nothing about the executor; the composition root
/// supplies a run function that drives the worker and returns its final
/// content. The model calls it like any other tool, passing a `task`
/// string.
pub struct WorkerAgentTool {
    name: String,
    description: String,
    run: Arc<dyn Fn(String) -> WorkerRunFuture + Send + Sync>,
}

impl WorkerAgentTool {
    /// Create a worker wrapper.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        run: Arc<dyn Fn(String) -> WorkerRunFuture + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            run,
        }
    }
}

#[async_trait]
impl DynTool for WorkerAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to hand to the worker agent"
                }
            },
            "required": ["task"]
        })
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput> {
        let task = arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let content = (self.run)(task).await?;
        Ok(ToolOutput::Text(content))
    }
}

impl std::fmt::Debug for WorkerAgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgentTool")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
