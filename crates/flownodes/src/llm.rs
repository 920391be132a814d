use crate::interpolate::interpolate;
use async_trait::async_trait;
use flowcore::adapters::{ChatMessage, ChatRequest, ChatRole, ModelAdapter, ToolDefinition};
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, TokenUsage, Value,
    ValueMap,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MAX_TOKENS: i64 = 2048;
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Chat completion through registered model adapters, with provider and
/// model fallbacks.
///
/// Config: `provider`, `model`, `systemPrompt`, `userPrompt` (alias
/// `prompt`), `messages`, `temperature`, `topP`, `topK`, `maxTokens`,
/// `frequencyPenalty`, `presencePenalty`, `tools`, `fallbackProviders`,
/// `fallbackModels`, `fallbackText`, `outputSchema`, `apiKeys`, `apiKey`,
/// `routingStrategy` (`budget` or `quality`), `routingModels`.
///
/// Successful calls report `cost` in USD from the candidate's per-1k
/// prices; `cost_estimated` marks prices taken from the built-in table.
#[derive(Default)]
pub struct LlmNode {
    adapters: HashMap<String, Arc<dyn ModelAdapter>>,
}

impl LlmNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, provider: impl Into<String>, adapter: Arc<dyn ModelAdapter>) -> Self {
        self.adapters.insert(provider.into(), adapter);
        self
    }

    pub fn with_adapters(adapters: HashMap<String, Arc<dyn ModelAdapter>>) -> Self {
        Self { adapters }
    }

    /// Context credential store, then `apiKeys[provider]`, then `apiKey`
    /// (primary provider only).
    fn api_key(&self, ctx: &NodeContext, provider: &str, primary: &str) -> Option<String> {
        if let Some(key) = ctx.run.credential(provider) {
            return Some(key.to_string());
        }
        if let Some(key) = ctx
            .config
            .get_object("apiKeys")
            .and_then(|keys| keys.get_str(provider))
            .filter(|k| !k.is_empty())
        {
            return Some(key.to_string());
        }
        if provider == primary {
            return ctx.config.get_str("apiKey").filter(|k| !k.is_empty()).map(str::to_string);
        }
        None
    }

    fn messages(&self, ctx: &NodeContext) -> Result<Vec<ChatMessage>, NodeError> {
        let render = |text: &str| interpolate(text, &ctx.inputs, &ctx.run);
        let mut messages = Vec::new();

        let system = ctx.config.get_string("systemPrompt");
        if !system.is_empty() {
            messages.push(ChatMessage::system(render(&system)));
        }
        if let Some(list) = ctx.config.get_array("messages") {
            for item in list.iter().filter_map(Value::as_object) {
                let role = match item.get_string_or("role", "user").as_str() {
                    "system" => ChatRole::System,
                    "assistant" => ChatRole::Assistant,
                    "user" => ChatRole::User,
                    other => {
                        return Err(NodeError::Configuration(format!(
                            "Unknown message role: {}",
                            other
                        )))
                    }
                };
                messages.push(ChatMessage {
                    role,
                    content: render(&item.get_string("content")),
                });
            }
        }
        let user = ctx.config.get_string_or("userPrompt", &ctx.config.get_string("prompt"));
        if !user.is_empty() {
            messages.push(ChatMessage::user(render(&user)));
        }

        if !messages.iter().any(|m| m.role != ChatRole::System) {
            let prompt = ctx
                .inputs
                .get("prompt")
                .or_else(|| ctx.inputs.get("input"))
                .map(Value::to_display_string)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| NodeError::MissingInput("prompt".to_string()))?;
            messages.push(ChatMessage::user(prompt));
        }
        Ok(messages)
    }

    fn request_template(&self, ctx: &NodeContext, messages: Vec<ChatMessage>) -> ChatRequest {
        let config = &ctx.config;
        let optional_f64 = |key: &str| config.get(key).and_then(Value::as_f64);
        let max_tokens = match config.get_i64_or("maxTokens", 0) {
            n if n > 0 => n,
            _ => match config.get_i64_or("max_tokens", 0) {
                n if n > 0 => n,
                _ => DEFAULT_MAX_TOKENS,
            },
        };
        let tools = config
            .get_array("tools")
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|t| ToolDefinition {
                        name: t.get_string("name"),
                        description: t.get_string("description"),
                        parameters: t.get("parameters").cloned().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ChatRequest {
            messages,
            temperature: Some(config.get_f64_or("temperature", DEFAULT_TEMPERATURE)),
            top_p: optional_f64("topP"),
            top_k: config.get("topK").and_then(Value::as_i64).map(|k| k.max(0) as u32),
            max_tokens: Some(max_tokens as u32),
            frequency_penalty: optional_f64("frequencyPenalty"),
            presence_penalty: optional_f64("presencePenalty"),
            tools,
            ..Default::default()
        }
    }
}

fn string_list(config: &ValueMap, key: &str) -> Vec<String> {
    config
        .get_array(key)
        .map(|items| {
            items
                .iter()
                .map(Value::to_display_string)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Order in which routed candidates are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Cheapest per-1k price first, higher quality breaking ties
    Budget,
    /// Highest quality first, lower price breaking ties
    Quality,
}

impl RoutingStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "budget" | "cost" | "price" | "budget_first" | "cost_first" | "price_first" => {
                Some(RoutingStrategy::Budget)
            }
            "quality" | "quality_first" | "best" => Some(RoutingStrategy::Quality),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Budget => "budget",
            RoutingStrategy::Quality => "quality",
        }
    }
}

/// One `(provider, model)` pair to try, with its price (USD per 1k tokens)
/// and quality score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
    pub quality: f64,
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
    /// Price comes from the built-in table rather than the config
    pub cost_estimated: bool,
}

impl Candidate {
    fn new(provider: &str, model: &str) -> Self {
        let (prompt_per_1k, completion_per_1k) = estimated_pricing(model);
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            quality: estimated_quality(model),
            prompt_per_1k,
            completion_per_1k,
            cost_estimated: true,
        }
    }

    /// `{provider, model, quality, promptCostPer1k, completionCostPer1k}`;
    /// missing scores and prices are estimated from the model name.
    fn from_config(entry: &ValueMap) -> Option<Self> {
        let model = first_string(entry, &["model", "name", "id"])?;
        let provider = first_string(entry, &["provider", "vendor"])
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        let mut candidate = Candidate::new(&provider, &model);
        if let Some(quality) = first_f64(entry, &["quality", "qualityScore", "quality_score"]) {
            candidate.quality = quality;
        }
        let prompt = first_f64(entry, &["promptCostPer1k", "prompt_cost_per_1k", "inputPrice"]);
        let completion = first_f64(
            entry,
            &["completionCostPer1k", "completion_cost_per_1k", "outputPrice"],
        );
        if prompt.is_some() || completion.is_some() {
            candidate.prompt_per_1k = prompt.unwrap_or(0.0);
            candidate.completion_per_1k = completion.unwrap_or(0.0);
            candidate.cost_estimated = false;
        }
        Some(candidate)
    }

    fn price(&self) -> f64 {
        self.prompt_per_1k + self.completion_per_1k
    }

    /// USD for one call, rounded to six decimals.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let raw = self.prompt_per_1k * usage.prompt_tokens as f64 / 1000.0
            + self.completion_per_1k * usage.completion_tokens as f64 / 1000.0;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }
}

fn first_string(entry: &ValueMap, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| entry.get_str(k))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_f64(entry: &ValueMap, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| entry.get(*k).and_then(Value::as_f64))
}

/// Rough list prices by model family, used when the config names none.
fn estimated_pricing(model: &str) -> (f64, f64) {
    let name = model.to_ascii_lowercase();
    let has = |parts: &[&str]| parts.iter().any(|p| name.contains(p));
    if has(&["mini", "haiku", "3.5", "lite", "small"]) {
        (0.0005, 0.0015)
    } else if has(&["4o", "turbo", "sonnet", "pro"]) {
        (0.01, 0.03)
    } else if has(&["opus", "gpt-4"]) {
        (0.03, 0.06)
    } else {
        (0.002, 0.004)
    }
}

fn estimated_quality(model: &str) -> f64 {
    let name = model.to_ascii_lowercase();
    let has = |parts: &[&str]| parts.iter().any(|p| name.contains(p));
    if name.contains("opus") || (name.contains("gpt-4") && !name.contains("mini")) {
        0.95
    } else if name.contains("4o") {
        0.9
    } else if has(&["sonnet", "turbo", "pro"]) {
        0.8
    } else if has(&["3.5", "haiku", "mini", "lite"]) {
        0.6
    } else {
        0.7
    }
}

/// `routingStrategy`, defaulting to quality when `routingModels` is set.
fn routing_strategy(config: &ValueMap) -> Option<RoutingStrategy> {
    config
        .get_str("routingStrategy")
        .and_then(RoutingStrategy::parse)
        .or_else(|| {
            config
                .get_array("routingModels")
                .filter(|m| !m.is_empty())
                .map(|_| RoutingStrategy::Quality)
        })
}

/// Unique candidates in try order. `routingModels` replaces the
/// provider-by-model cross product (providers in order, each with the
/// primary model then the fallback models); a routing strategy then
/// reorders the list, keeping ties in place.
fn attempt_plan(config: &ValueMap) -> Vec<Candidate> {
    let routed = config.get_array("routingModels").filter(|m| !m.is_empty());
    let mut candidates: Vec<Candidate> = match routed {
        Some(entries) => entries
            .iter()
            .filter_map(Value::as_object)
            .filter_map(Candidate::from_config)
            .collect(),
        None => {
            let primary = config.get_string_or("provider", DEFAULT_PROVIDER);
            let mut providers = vec![primary];
            for p in string_list(config, "fallbackProviders") {
                if !providers.contains(&p) {
                    providers.push(p);
                }
            }
            let mut models = vec![config.get_string("model")];
            models.extend(string_list(config, "fallbackModels"));

            providers
                .iter()
                .flat_map(|provider| {
                    models
                        .iter()
                        .filter(|m| !m.is_empty())
                        .map(move |model| Candidate::new(provider, model))
                })
                .collect()
        }
    };

    let mut seen = Vec::new();
    candidates.retain(|c| {
        let key = (c.provider.clone(), c.model.clone());
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });

    match routing_strategy(config) {
        Some(RoutingStrategy::Budget) => candidates.sort_by(|a, b| {
            a.price()
                .total_cmp(&b.price())
                .then(b.quality.total_cmp(&a.quality))
        }),
        Some(RoutingStrategy::Quality) => candidates.sort_by(|a, b| {
            b.quality
                .total_cmp(&a.quality)
                .then(a.price().total_cmp(&b.price()))
        }),
        None => {}
    }
    candidates
}

/// First `{...}`, else first `[...]` span of `raw`.
pub fn extract_json_candidate(raw: &str) -> Option<&str> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close)) {
            if end > start {
                return Some(&raw[start..=end]);
            }
        }
    }
    None
}

fn parse_structured(text: &str) -> Result<Value, NodeError> {
    let trimmed = text.trim();
    serde_json::from_str::<serde_json::Value>(trimmed)
        .or_else(|first| match extract_json_candidate(trimmed) {
            Some(candidate) => serde_json::from_str(candidate),
            None => Err(first),
        })
        .map(Value::from)
        .map_err(|e| NodeError::Validation(format!("llm output is not valid json: {}", e)))
}

fn usage_value(usage: &TokenUsage) -> Value {
    let mut map = ValueMap::new();
    map.insert("prompt_tokens".into(), Value::from(usage.prompt_tokens));
    map.insert("completion_tokens".into(), Value::from(usage.completion_tokens));
    map.insert("total_tokens".into(), Value::from(usage.total_tokens));
    Value::Object(map)
}

fn attempt_log(provider: &str, model: &str, status: &str, error: Option<String>) -> Value {
    let mut map = ValueMap::new();
    map.insert("provider".into(), Value::from(provider));
    map.insert("model".into(), Value::from(model));
    map.insert("status".into(), Value::from(status));
    if let Some(error) = error {
        map.insert("error".into(), Value::from(error));
    }
    Value::Object(map)
}

#[async_trait]
impl NodeExecutor for LlmNode {
    fn node_type(&self) -> &str {
        "llm"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let primary = ctx.config.get_string_or("provider", DEFAULT_PROVIDER);
        let plan = attempt_plan(&ctx.config);
        let strategy = routing_strategy(&ctx.config);
        if plan.is_empty() {
            return Err(NodeError::Configuration("Missing config: model".to_string()));
        }
        let template = self.request_template(&ctx, self.messages(&ctx)?);
        let output_schema = ctx.config.get("outputSchema").cloned();

        let mut attempts = Vec::new();
        let mut last_error: Option<NodeError> = None;

        for (index, candidate) in plan.iter().enumerate() {
            ctx.ensure_not_cancelled()?;
            let (provider, model) = (&candidate.provider, &candidate.model);

            let Some(adapter) = self.adapters.get(provider) else {
                debug!(node_id = %ctx.node.id, %provider, "No model adapter registered");
                attempts.push(attempt_log(provider, model, "skipped", Some("no adapter registered".into())));
                continue;
            };

            let request = ChatRequest {
                provider: provider.clone(),
                model: model.clone(),
                api_key: self.api_key(&ctx, provider, &primary),
                ..template.clone()
            };

            ctx.events.info(format!("Calling {}/{}", provider, model));
            let outcome = tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                outcome = adapter.chat(request) => outcome,
            };

            match outcome {
                Ok(response) => {
                    attempts.push(attempt_log(provider, model, "success", None));
                    ctx.run.add_token_usage(&response.usage);

                    let mut output = NodeOutput::new()
                        .with_output("content", response.text.clone())
                        .with_output("text", response.text.clone())
                        .with_output("usage", usage_value(&response.usage))
                        .with_output("provider", provider.as_str())
                        .with_output("model", model.as_str())
                        .with_output("finish_reason", response.finish_reason.clone())
                        .with_output("fallback_used", index > 0)
                        .with_output("cost", candidate.cost(&response.usage))
                        .with_output("cost_currency", "USD")
                        .with_output("cost_estimated", candidate.cost_estimated)
                        .with_output("attempts", attempts);
                    if let Some(strategy) = strategy {
                        output = output.with_output("routing_strategy", strategy.as_str());
                    }
                    if let Some(schema) = output_schema {
                        output = output
                            .with_output("parsed", parse_structured(&response.text)?)
                            .with_output("output_schema", schema);
                    }
                    return Ok(output);
                }
                Err(e) => {
                    warn!(node_id = %ctx.node.id, %provider, %model, error = %e, "Model call failed");
                    ctx.events.warn(format!("{}/{} failed: {}", provider, model, e));
                    attempts.push(attempt_log(provider, model, "failed", Some(e.message.clone())));
                    last_error = Some(e.into());
                }
            }
        }

        let fallback_text = ctx.config.get_string("fallbackText");
        if !fallback_text.is_empty() {
            let (provider, model) = (plan[0].provider.clone(), plan[0].model.clone());
            let mut output = NodeOutput::new()
                .with_output("content", fallback_text.clone())
                .with_output("text", fallback_text.clone())
                .with_output("usage", usage_value(&TokenUsage::default()))
                .with_output("provider", provider)
                .with_output("model", model)
                .with_output("fallback_used", true)
                .with_output("cost", 0.0)
                .with_output("cost_currency", "USD")
                .with_output("attempts", attempts);
            if let Some(strategy) = strategy {
                output = output.with_output("routing_strategy", strategy.as_str());
            }
            if let Some(error) = &last_error {
                output = output.with_output("fallback_reason", error.to_string());
            }
            if let Some(schema) = output_schema {
                output = output
                    .with_output("parsed", parse_structured(&fallback_text)?)
                    .with_output("output_schema", schema);
            }
            return Ok(output);
        }

        Err(last_error.unwrap_or_else(|| {
            NodeError::Configuration(format!(
                "No model adapter registered for provider(s): {}",
                plan.iter()
                    .map(|c| c.provider.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("ai", "Chat completion with provider and model fallbacks")
            .input("prompt", "User prompt when not configured", false)
            .output("content", "Model reply")
            .output("usage", "Token counters")
            .output("parsed", "Structured reply when outputSchema is set")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(json: serde_json::Value) -> ValueMap {
        match Value::from(json) {
            Value::Object(map) => map,
            _ => ValueMap::new(),
        }
    }

    fn pairs(plan: &[Candidate]) -> Vec<(&str, &str)> {
        plan.iter().map(|c| (c.provider.as_str(), c.model.as_str())).collect()
    }

    #[test]
    fn plan_crosses_unique_providers_with_models() {
        let plan = attempt_plan(&config(json!({
            "provider": "openai",
            "model": "gpt-4o",
            "fallbackProviders": ["anthropic", "openai"],
            "fallbackModels": ["small", ""]
        })));
        assert_eq!(
            pairs(&plan),
            vec![
                ("openai", "gpt-4o"),
                ("openai", "small"),
                ("anthropic", "gpt-4o"),
                ("anthropic", "small")
            ]
        );
        assert!(plan.iter().all(|c| c.cost_estimated));
    }

    #[test]
    fn budget_routing_tries_cheapest_first() {
        let plan = attempt_plan(&config(json!({
            "model": "claude-opus",
            "fallbackModels": ["gpt-4o-mini", "claude-sonnet"],
            "routingStrategy": "cost_first"
        })));
        assert_eq!(
            pairs(&plan),
            vec![
                ("openai", "gpt-4o-mini"),
                ("openai", "claude-sonnet"),
                ("openai", "claude-opus")
            ]
        );
    }

    #[test]
    fn routing_models_default_to_quality_order() {
        let plan = attempt_plan(&config(json!({
            "routingModels": [
                {"provider": "a", "model": "m1", "quality": 0.5},
                {"provider": "b", "model": "m2", "quality": 0.9, "promptCostPer1k": 0.02},
                {"provider": "c", "model": "m3", "quality": 0.9, "promptCostPer1k": 0.01},
                {"provider": "d"}
            ]
        })));
        assert_eq!(pairs(&plan), vec![("c", "m3"), ("b", "m2"), ("a", "m1")]);
        assert!(!plan[0].cost_estimated);
        assert_eq!(
            routing_strategy(&config(json!({"routingModels": [{"model": "x"}]}))),
            Some(RoutingStrategy::Quality)
        );
        assert_eq!(routing_strategy(&config(json!({"routingStrategy": "sideways"}))), None);
    }

    #[test]
    fn cost_is_priced_per_thousand_tokens() {
        let mut candidate = Candidate::new("openai", "custom");
        candidate.prompt_per_1k = 0.01;
        candidate.completion_per_1k = 0.03;
        assert_eq!(candidate.cost(&TokenUsage::new(1000, 500)), 0.025);
        assert_eq!(candidate.cost(&TokenUsage::default()), 0.0);
    }

    #[test]
    fn json_candidates_are_extracted_from_prose() {
        assert_eq!(extract_json_candidate("Sure: {\"a\": 1} done"), Some("{\"a\": 1}"));
        assert_eq!(extract_json_candidate("list [1, 2]"), Some("[1, 2]"));
        assert_eq!(extract_json_candidate("nothing here"), None);
        assert!(parse_structured("```json\n{\"ok\": true}\n```").is_ok());
        assert!(parse_structured("no json").is_err());
    }
}
