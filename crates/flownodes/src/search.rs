use crate::interpolate::interpolate;
use async_trait::async_trait;
use flowcore::adapters::{SearchAdapter, SearchQuery};
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};
use std::sync::Arc;

/// Web search through a [`SearchAdapter`].
///
/// Config: `query` (template, falls back to `inputs.query`), `maxResults`
/// (default 5), `freshness`, `language`.
pub struct SearchNode {
    adapter: Option<Arc<dyn SearchAdapter>>,
}

impl SearchNode {
    pub fn new(adapter: Option<Arc<dyn SearchAdapter>>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl NodeExecutor for SearchNode {
    fn node_type(&self) -> &str {
        "search"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let adapter = self
            .adapter
            .clone()
            .ok_or_else(|| NodeError::Configuration("No search adapter configured".to_string()))?;

        let query = match ctx.config.get_str("query").filter(|q| !q.is_empty()) {
            Some(template) => interpolate(template, &ctx.inputs, &ctx.run),
            None => ctx.require_input("query")?.to_display_string(),
        };
        if query.trim().is_empty() {
            return Err(NodeError::MissingInput("query".to_string()));
        }
        let optional = |key: &str| ctx.config.get_str(key).filter(|s| !s.is_empty()).map(str::to_string);
        let request = SearchQuery {
            query: query.clone(),
            max_results: ctx.config.get_i64_or("maxResults", 5).max(1) as usize,
            freshness: optional("freshness"),
            language: optional("language"),
        };

        ctx.events.info(format!("Searching: {}", query));
        let hits = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            hits = adapter.search(request) => hits?,
        };

        let results: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                let mut map = ValueMap::new();
                map.insert("title".into(), Value::from(hit.title));
                map.insert("url".into(), Value::from(hit.url));
                map.insert("snippet".into(), Value::from(hit.snippet));
                map.insert("score".into(), Value::from(hit.score));
                Value::Object(map)
            })
            .collect();
        let text = results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. {} ({})\n{}",
                    i + 1,
                    r.get("title").map(Value::to_display_string).unwrap_or_default(),
                    r.get("url").map(Value::to_display_string).unwrap_or_default(),
                    r.get("snippet").map(Value::to_display_string).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(NodeOutput::new()
            .with_output("query", query)
            .with_output("count", results.len())
            .with_output("results", results)
            .with_output("text", text))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("ai", "Web search")
            .input("query", "Search query when not configured", false)
            .output("results", "Hits with title, url, snippet and score")
    }
}
