//! Tool selection — which tools participate in a request.
//!
//! Advertising every tool on every request wastes context and confuses
//! models; selectors narrow the list. Three policies ship: everything,
//! keyword-to-category prefix matching, and semantic similarity over
//! cached tool-description embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

use super::{DynTool, ToolRegistry};
use crate::error::Result;

/// Selects the tools offered to the model for one prompt.
///
/// Selectors degrade open: when a policy cannot produce a meaningful
/// narrowing (registry already small, nothing above threshold, embedder
/// down), the full list is returned rather than an empty one.
#[async_trait]
pub trait ToolSelector: Send + Sync {
    /// Select up to `max_results` tools for the prompt.
    async fn select(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        max_results: usize,
    ) -> Vec<Arc<dyn DynTool>>;
}

/// Offers every registered tool, capped at `max_results`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSelector;

#[async_trait]
impl ToolSelector for AllSelector {
    async fn select(
        &self,
        _prompt: &str,
        registry: &ToolRegistry,
        max_results: usize,
    ) -> Vec<Arc<dyn DynTool>> {
        registry.tools().iter().take(max_results).cloned().collect()
    }
}

/// Prefix-matches prompt words against category names; matched
/// categories contribute their tools.
///
/// A prompt with no matching category gets the full list — an unmatched
/// prompt is a reason to offer everything, not nothing.
#[derive(Debug, Clone, Default)]
pub struct KeywordCategorySelector {
    // category name → tool names
    categories: HashMap<String, Vec<String>>,
}

impl KeywordCategorySelector {
    /// Create a selector over category → tool-name assignments.
    #[must_use]
    pub fn new(categories: HashMap<String, Vec<String>>) -> Self {
        Self {
            categories: categories
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }

    fn matched_tool_names(&self, prompt: &str) -> Vec<String> {
        let mut names = Vec::new();
        for word in prompt.to_lowercase().split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric());
            if word.is_empty() {
                continue;
            }
            for (category, tools) in &self.categories {
                if category.starts_with(word) {
                    for tool in tools {
                        if !names.contains(tool) {
                            names.push(tool.clone());
                        }
                    }
                }
            }
        }
        names
    }
}

#[async_trait]
impl ToolSelector for KeywordCategorySelector {
    async fn select(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        max_results: usize,
    ) -> Vec<Arc<dyn DynTool>> {
        let matched = self.matched_tool_names(prompt);
        if matched.is_empty() {
            return AllSelector.select(prompt, registry, max_results).await;
        }

        matched
            .iter()
            .filter_map(|name| registry.get(name).cloned())
            .take(max_results)
            .collect()
    }
}

/// Produces embeddings for selection. Backed by whatever embedding
/// endpoint the deployment already runs; the core only needs vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed each text into a vector.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

type CachedEmbeddings = (u64, Vec<(String, Vec<f32>)>);

/// Cosine-similarity selection over tool-description embeddings.
///
/// Tool embeddings are computed once per distinct tool list and cached;
/// the cache key is a hash of the `(name, description)` pairs, so any
/// change to the list invalidates it.
pub struct SemanticSelector {
    embedder: Arc<dyn EmbeddingProvider>,
    threshold: f32,
    cache: Mutex<Option<CachedEmbeddings>>,
}

impl SemanticSelector {
    /// Create a selector with a similarity threshold in `[0, 1]`.
    #[must_use]
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
            cache: Mutex::new(None),
        }
    }

    fn list_hash(registry: &ToolRegistry) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for tool in registry.tools() {
            tool.name().hash(&mut hasher);
            tool.description().hash(&mut hasher);
        }
        hasher.finish()
    }

    async fn tool_embeddings(&self, registry: &ToolRegistry) -> Result<Vec<(String, Vec<f32>)>> {
        let hash = Self::list_hash(registry);
        if let Some((cached_hash, cached)) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            && *cached_hash == hash
        {
            return Ok(cached.clone());
        }

        let texts: Vec<String> = registry
            .tools()
            .iter()
            .map(|t| format!("{}: {}", t.name(), t.description()))
            .collect();
        let vectors = self.embedder.embed(&texts).await?;
        let embeddings: Vec<(String, Vec<f32>)> = registry
            .names()
            .into_iter()
            .zip(vectors)
            .collect();

        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some((hash, embeddings.clone()));
        debug!(tools = embeddings.len(), "Tool embedding cache refreshed");
        Ok(embeddings)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl ToolSelector for SemanticSelector {
    async fn select(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
        max_results: usize,
    ) -> Vec<Arc<dyn DynTool>> {
        // Small registries are offered whole.
        if registry.len() <= max_results {
            return registry.tools().to_vec();
        }

        let selection = async {
            let tool_embeddings = self.tool_embeddings(registry).await?;
            let prompt_embedding = self
                .embedder
                .embed(std::slice::from_ref(&prompt.to_owned()))
                .await?
                .into_iter()
                .next()
                .unwrap_or_default();

            let mut scored: Vec<(String, f32)> = tool_embeddings
                .iter()
                .map(|(name, vector)| (name.clone(), Self::cosine(&prompt_embedding, vector)))
                .filter(|(_, score)| *score >= self.threshold)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok::<Vec<(String, f32)>, crate::error::AgentError>(scored)
        }
        .await;

        match selection {
            Ok(scored) if !scored.is_empty() => scored
                .iter()
                .take(max_results)
                .filter_map(|(name, _)| registry.get(name).cloned())
                .collect(),
            // Nothing above threshold: offer the full list.
            Ok(_) => registry.tools().iter().take(max_results).cloned().collect(),
            Err(err) => {
                debug!(error = %err, "Semantic selection failed; offering full list");
                registry.tools().iter().take(max_results).cloned().collect()
            }
        }
    }
}

impl std::fmt::Debug for SemanticSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticSelector")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutput;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NamedTool {
        name: &'static str,
        description: &'static str,
    }

    #[async_trait]
    impl DynTool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> String {
            self.description.to_owned()
        }

        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn call(&self, _arguments: Map<String, Value>) -> Result<ToolOutput> {
            Ok(ToolOutput::text(self.name))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::from_tools(vec![
            Arc::new(NamedTool {
                name: "weather_lookup",
                description: "Current weather for a city",
            }),
            Arc::new(NamedTool {
                name: "order_status",
                description: "Look up an order by id",
            }),
            Arc::new(NamedTool {
                name: "knowledge_search",
                description: "Search the knowledge base",
            }),
        ])
    }

    #[tokio::test]
    async fn test_all_selector_caps_at_max() {
        let registry = registry();
        let selected = AllSelector.select("anything", &registry, 2).await;
        assert_eq!(selected.len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_selector_matches_category_prefix() {
        let categories: HashMap<String, Vec<String>> = [
            ("weather".to_owned(), vec!["weather_lookup".to_owned()]),
            ("orders".to_owned(), vec!["order_status".to_owned()]),
        ]
        .into_iter()
        .collect();
        let selector = KeywordCategorySelector::new(categories);
        let registry = registry();

        // "order" prefix-matches the "orders" category.
        let selected = selector.select("check my order please", &registry, 8).await;
        let names: Vec<&str> = selected.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["order_status"]);
    }

    #[tokio::test]
    async fn test_keyword_selector_falls_back_to_full_list() {
        let selector = KeywordCategorySelector::new(HashMap::new());
        let registry = registry();
        let selected = selector.select("hello there", &registry, 8).await;
        assert_eq!(selected.len(), 3);
    }

    struct AxisEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Map each text onto a 3-axis space by keyword.
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    if t.contains("weather") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("order") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_semantic_selector_picks_similar_tools() {
        let embedder = Arc::new(AxisEmbedder {
            calls: AtomicUsize::new(0),
        });
        let selector = SemanticSelector::new(Arc::<AxisEmbedder>::clone(&embedder), 0.5);
        let registry = registry();

        let selected = selector.select("what's the weather in Oslo", &registry, 1).await;
        let names: Vec<&str> = selected.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["weather_lookup"]);
    }

    #[tokio::test]
    async fn test_semantic_selector_caches_tool_embeddings() {
        let embedder = Arc::new(AxisEmbedder {
            calls: AtomicUsize::new(0),
        });
        let selector = SemanticSelector::new(Arc::<AxisEmbedder>::clone(&embedder), 0.5);
        let registry = registry();

        selector.select("weather", &registry, 1).await;
        selector.select("order", &registry, 1).await;
        // 1 tool-list embedding + 2 prompt embeddings.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_selector_small_registry_offered_whole() {
        let embedder = Arc::new(AxisEmbedder {
            calls: AtomicUsize::new(0),
        });
        let selector = SemanticSelector::new(Arc::<AxisEmbedder>::clone(&embedder), 0.5);
        let registry = registry();

        let selected = selector.select("anything", &registry, 8).await;
        assert_eq!(selected.len(), 3);
        // No embedding work for a registry already under the cap.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
