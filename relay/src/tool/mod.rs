//! Tools — the capabilities an agent can invoke.
//!
//! Two layers: typed tools behind an object-safe boundary.
//!
//! - [`Tool`] — the typed convenience trait. Argument structs derive
//!   `serde::Deserialize` and `schemars::JsonSchema`; the parameter
//!   schema is generated, and argument decoding is automatic.
//! - [`DynTool`] — the object-safe capability the rest of the runtime
//!   works with: `name`, `description`, `input_schema`, `call`. Remote
//!   tools and worker-agent wrappers implement this directly.
//!
//! Every [`Tool`] is a [`DynTool`] through a blanket impl.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{AgentError, Result};
use crate::provider::ToolDefinition;

pub mod adapt;
pub mod select;

pub use adapt::{RemoteTool, RemoteToolClient, WorkerAgentTool, adapt_remote_servers};
pub use select::{
    AllSelector, EmbeddingProvider, KeywordCategorySelector, SemanticSelector, ToolSelector,
};

/// Raw output of a tool before normalization.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ToolOutput {
    /// Plain text, passed to the model verbatim (subject to length caps).
    Text(String),
    /// A JSON value, serialized compactly.
    Json(Value),
    /// An image; the model sees a compact placeholder.
    Image {
        /// MIME type of the image.
        mime_type: String,
    },
    /// An opaque binary resource; the model sees a compact placeholder.
    Binary {
        /// MIME type of the resource.
        mime_type: String,
        /// Size in bytes.
        bytes: u64,
    },
}

impl ToolOutput {
    /// Text output shorthand.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }
}

/// The object-safe tool capability.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Tool name (snake_case).
    fn name(&self) -> &str;

    /// Description that helps the model decide when to call the tool.
    fn description(&self) -> String;

    /// JSON Schema of the arguments object.
    fn input_schema(&self) -> Value;

    /// Execute with a JSON arguments object.
    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput>;

    /// The definition advertised to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }
}

/// The typed tool trait.
///
/// Implementors get schema generation and argument decoding for free:
///
/// ```rust,ignore
/// #[derive(serde::Deserialize, schemars::JsonSchema)]
/// struct SearchArgs {
///     query: String,
/// }
///
/// struct SearchTool;
///
/// #[async_trait::async_trait]
/// impl Tool for SearchTool {
///     const NAME: &'static str = "search";
///     type Args = SearchArgs;
///
///     fn description(&self) -> String {
///         "Search the knowledge base.".to_owned()
///     }
///
///     async fn run(&self, args: SearchArgs) -> Result<ToolOutput> {
///         Ok(ToolOutput::text(format!("results for {}", args.query)))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Typed arguments.
    type Args: DeserializeOwned + schemars::JsonSchema + Send;

    /// Description that helps the model decide when to call the tool.
    fn description(&self) -> String;

    /// Execute with decoded arguments.
    async fn run(&self, args: Self::Args) -> Result<ToolOutput>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> String {
        Tool::description(self)
    }

    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(<T as Tool>::Args))
            .unwrap_or_else(|_| Value::Object(Map::new()))
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput> {
        let args: T::Args = serde_json::from_value(Value::Object(arguments))
            .map_err(|e| AgentError::tool(T::NAME, format!("invalid arguments: {e}")))?;
        self.run(args).await
    }
}

/// The set of tools available to the runtime.
///
/// Names are unique: the first registration wins and later duplicates
/// are logged and ignored, matching the deterministic duplicate handling
/// of the remote adaptation layer.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn DynTool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from tools, applying first-wins dedup.
    #[must_use]
    pub fn from_tools(tools: Vec<Arc<dyn DynTool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool. Returns `false` (and keeps the incumbent) when
    /// the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn DynTool>) -> bool {
        let name = tool.name().to_owned();
        if self.index.contains_key(&name) {
            warn!(tool = %name, "Duplicate tool registration ignored");
            return false;
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        true
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn DynTool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// All tools, in registration order.
    #[must_use]
    pub fn tools(&self) -> &[Arc<dyn DynTool>] {
        &self.tools
    }

    /// Definitions for all tools, in registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// All tool names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_owned()).collect()
    }

    /// Returns `true` when the registry holds `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tool count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` when no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
