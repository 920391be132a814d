use crate::interpolate::interpolate;
use async_trait::async_trait;
use flowcore::{ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value};
use regex::Regex;

/// Text a node operates on: interpolated `config.text`, else the first of
/// `inputs.text|input|content`.
fn source_text(ctx: &NodeContext) -> Result<String, NodeError> {
    if let Some(text) = ctx.config.get_str("text") {
        return Ok(interpolate(text, &ctx.inputs, &ctx.run));
    }
    ["text", "input", "content"]
        .iter()
        .find_map(|key| ctx.inputs.get(*key))
        .map(Value::to_display_string)
        .ok_or_else(|| NodeError::MissingInput("text".to_string()))
}

fn compile(pattern: &str) -> Result<Regex, NodeError> {
    Regex::new(pattern)
        .map_err(|e| NodeError::Configuration(format!("Invalid regex '{}': {}", pattern, e)))
}

/// Renders `config.template` with `{{path}}` placeholders.
pub struct TemplateNode;

#[async_trait]
impl NodeExecutor for TemplateNode {
    fn node_type(&self) -> &str {
        "template"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let template = ctx.require_config_str("template")?;
        let rendered = interpolate(&template, &ctx.inputs, &ctx.run);

        Ok(NodeOutput::new()
            .with_output("result", rendered.clone())
            .with_output("output", rendered.clone())
            .with_output("text", rendered))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("text", "Renders a string template")
            .output("result", "Rendered text")
            .output("output", "Rendered text")
    }
}

/// Matches a regular expression against text.
pub struct RegexNode;

#[async_trait]
impl NodeExecutor for RegexNode {
    fn node_type(&self) -> &str {
        "regex"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let re = compile(&ctx.require_config_str("pattern")?)?;
        let text = source_text(&ctx)?;

        let matches: Vec<Value> = re
            .find_iter(&text)
            .map(|m| Value::from(m.as_str()))
            .collect();
        let groups: Vec<Value> = re
            .captures(&text)
            .map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|g| g.map(|g| Value::from(g.as_str())).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();

        Ok(NodeOutput::new()
            .with_output("matched", !matches.is_empty())
            .with_output("match", matches.first().cloned().unwrap_or_default())
            .with_output("count", matches.len())
            .with_output("matches", matches)
            .with_output("groups", groups))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("text", "Regular expression matching")
            .input("text", "Text to search", true)
            .output("matches", "All matches")
            .output("groups", "Capture groups of the first match")
    }
}

/// Literal or regex replacement.
pub struct ReplaceNode;

#[async_trait]
impl NodeExecutor for ReplaceNode {
    fn node_type(&self) -> &str {
        "replace"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let text = source_text(&ctx)?;
        let search = ctx.require_config_str("search")?;
        let replacement = interpolate(
            &ctx.config.get_string("replacement"),
            &ctx.inputs,
            &ctx.run,
        );
        let replace_all = ctx
            .config
            .get("replaceAll")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let result = if ctx.config.get_bool("useRegex") {
            let re = compile(&search)?;
            if replace_all {
                re.replace_all(&text, replacement.as_str()).into_owned()
            } else {
                re.replace(&text, replacement.as_str()).into_owned()
            }
        } else if replace_all {
            text.replace(&search, &replacement)
        } else {
            text.replacen(&search, &replacement, 1)
        };

        Ok(NodeOutput::new()
            .with_output("result", result.clone())
            .with_output("text", result))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("text", "Replaces text, literally or by regex")
            .output("result", "Text after replacement")
    }
}

/// Splits text on a separator.
pub struct TextSplitNode;

#[async_trait]
impl NodeExecutor for TextSplitNode {
    fn node_type(&self) -> &str {
        "text_split"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let text = source_text(&ctx)?;
        let separator = match ctx.config.get_str("separator") {
            Some(s) if !s.is_empty() => s.replace("\\n", "\n").replace("\\t", "\t"),
            _ => "\n".to_string(),
        };
        let trim = ctx.config.get("trim").and_then(Value::as_bool).unwrap_or(true);
        let remove_empty = ctx
            .config
            .get("removeEmpty")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let limit = ctx.config.get_i64_or("limit", 0);

        let mut parts: Vec<Value> = text
            .split(separator.as_str())
            .map(|p| if trim { p.trim() } else { p })
            .filter(|p| !remove_empty || !p.is_empty())
            .map(Value::from)
            .collect();
        if limit > 0 {
            parts.truncate(limit as usize);
        }

        Ok(NodeOutput::new()
            .with_output("count", parts.len())
            .with_output("parts", parts))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("text", "Splits text into parts").output("parts", "Split parts")
    }
}
