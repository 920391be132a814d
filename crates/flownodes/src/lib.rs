//! Standard node library
//!
//! Built-in executors for workflow I/O, text, control flow, data shaping,
//! HTTP, AI, webhooks and workspace databases. Nodes needing external
//! services take their providers through [`Adapters`].

mod code;
mod condition;
mod control;
mod db;
mod document;
mod http;
pub mod interpolate;
mod io;
mod llm;
mod search;
mod text;
mod time;
mod transform;
mod try_catch;
mod variable;
mod webhook;

pub use code::{find_denied, CodeNode, DENIED_PATTERNS};
pub use condition::{evaluate, ConditionNode, Operator};
pub use control::{LoopNode, ParallelJoinNode, ParallelNode};
pub use db::{
    build_delete, build_insert, build_select, build_update, quote_identifier, DbNode, DbOperation,
    Statement,
};
pub use document::DocumentAssemblerNode;
pub use http::HttpRequestNode;
pub use io::{EndNode, InputNode, OutputNode, StartNode};
pub use llm::LlmNode;
pub use search::SearchNode;
pub use text::{RegexNode, ReplaceNode, TemplateNode, TextSplitNode};
pub use time::DelayNode;
pub use transform::{FilterNode, MergeNode, TransformNode};
pub use try_catch::TryCatchNode;
pub use variable::VariableNode;
pub use webhook::{ip_allowed, sign_payload, verify_signature, WebhookNode};

use flowcore::adapters::{DbAuthorizer, DbProvider, ModelAdapter, SearchAdapter};
use flowruntime::NodeRegistry;
use std::collections::HashMap;
use std::sync::Arc;

/// External providers handed to the nodes that need them.
#[derive(Default, Clone)]
pub struct Adapters {
    /// Model adapters keyed by provider name (`openai`, `anthropic`, ...).
    pub models: HashMap<String, Arc<dyn ModelAdapter>>,
    pub search: Option<Arc<dyn SearchAdapter>>,
    pub db: Option<Arc<dyn DbProvider>>,
    pub db_authorizer: Option<Arc<dyn DbAuthorizer>>,
}

impl Adapters {
    pub fn with_model(mut self, provider: impl Into<String>, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.models.insert(provider.into(), adapter);
        self
    }

    pub fn with_search(mut self, adapter: Arc<dyn SearchAdapter>) -> Self {
        self.search = Some(adapter);
        self
    }

    pub fn with_db(mut self, provider: Arc<dyn DbProvider>) -> Self {
        self.db = Some(provider);
        self
    }

    pub fn with_db_authorizer(mut self, authorizer: Arc<dyn DbAuthorizer>) -> Self {
        self.db_authorizer = Some(authorizer);
        self
    }
}

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    register_all_with(registry, Adapters::default());
}

/// Register all standard nodes, wiring the given providers into the
/// nodes that use them.
pub fn register_all_with(registry: &mut NodeRegistry, adapters: Adapters) {
    registry.register(Arc::new(StartNode));
    registry.register(Arc::new(EndNode));
    registry.register(Arc::new(InputNode));
    registry.register(Arc::new(OutputNode));
    registry.register(Arc::new(VariableNode));

    registry.register(Arc::new(TemplateNode));
    registry.register(Arc::new(RegexNode));
    registry.register(Arc::new(ReplaceNode));
    registry.register(Arc::new(TextSplitNode));

    registry.register(Arc::new(ConditionNode));
    registry.register(Arc::new(LoopNode));
    registry.register(Arc::new(ParallelNode));
    registry.register(Arc::new(ParallelJoinNode));
    registry.register(Arc::new(TryCatchNode));
    registry.register(Arc::new(DelayNode));

    registry.register(Arc::new(TransformNode));
    registry.register(Arc::new(MergeNode));
    registry.register(Arc::new(FilterNode));
    registry.register(Arc::new(CodeNode));
    registry.register(Arc::new(DocumentAssemblerNode));

    registry.register(Arc::new(HttpRequestNode::new()));
    registry.register(Arc::new(WebhookNode));
    registry.register(Arc::new(LlmNode::with_adapters(adapters.models)));
    registry.register(Arc::new(SearchNode::new(adapters.search)));

    for operation in DbOperation::ALL {
        registry.register(Arc::new(DbNode::new(
            operation,
            adapters.db.clone(),
            adapters.db_authorizer.clone(),
        )));
    }
}
