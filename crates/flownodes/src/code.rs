use crate::interpolate::resolve_value;
use async_trait::async_trait;
use flowcore::{ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value};

/// Substrings that make a snippet unsafe to evaluate.
pub const DENIED_PATTERNS: &[&str] = &[
    "eval(",
    "Function(",
    "require(",
    "import(",
    "process.",
    "child_process",
    "fs.",
    "__proto__",
    "constructor[",
    "globalThis",
    "window.",
    "document.",
];

pub fn find_denied(code: &str) -> Option<&'static str> {
    DENIED_PATTERNS.iter().copied().find(|p| code.contains(p))
}

/// Minimal expression node: a JSON literal is parsed as-is, anything else
/// is treated as a `{{path}}` template.
///
/// Config: `code` (alias `expression`), `language` (recorded only).
pub struct CodeNode;

#[async_trait]
impl NodeExecutor for CodeNode {
    fn node_type(&self) -> &str {
        "code"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let code = match ctx.config.get_str("code").or_else(|| ctx.config.get_str("expression")) {
            Some(code) => code.to_string(),
            None => return Err(NodeError::Configuration("Missing config: code".to_string())),
        };
        if let Some(pattern) = find_denied(&code) {
            ctx.events.warn(format!("Rejected code containing '{}'", pattern));
            return Err(NodeError::UnsafeOperation(format!(
                "code contains denied pattern '{}'",
                pattern
            )));
        }

        let language = ctx.config.get_string_or("language", "javascript");
        let trimmed = code.trim();
        let result = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(json) => Value::from(json),
            Err(_) => resolve_value(trimmed, &ctx.inputs, &ctx.run),
        };

        Ok(NodeOutput::new()
            .with_output("result", result.clone())
            .with_output("output", result)
            .with_output("language", language))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("code", "Evaluates a JSON literal or template expression")
            .output("result", "Evaluated value")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_denied_pattern_is_caught() {
        for pattern in DENIED_PATTERNS {
            let snippet = format!("let x = 1; {} y", pattern);
            assert_eq!(find_denied(&snippet), Some(*pattern));
        }
        assert_eq!(find_denied("{\"ok\": true}"), None);
        assert_eq!(find_denied("{{input.value}}"), None);
    }
}
