//! Inbound webhook validation.
//!
//! The server places the request under the run's trigger data (`method`,
//! `headers`, `query`, `body`, `raw_body`, `signature`, `remote_ip`); the
//! same keys are also read from the node inputs so a webhook node can be
//! driven directly.

use async_trait::async_trait;
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const DEFAULT_SIGNATURE_HEADER: &str = "X-Signature-256";

/// Hex HMAC-SHA256 of `body` under `secret`, as senders put it in the
/// signature header (without the `sha256=` prefix).
pub fn sign_payload(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature` (hex, optionally `sha256=`-prefixed) against the
/// HMAC of `raw_body` under `secret`. The comparison is constant-time.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature: &str) -> bool {
    let provided = signature.trim();
    let provided = provided.strip_prefix(SIGNATURE_PREFIX).unwrap_or(provided);
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&provided).is_ok()
}

/// Exact address match or CIDR containment (`10.0.0.0/8`, `fd00::/8`).
pub fn ip_allowed(ip: &str, whitelist: &[String]) -> bool {
    let Ok(addr) = ip.trim().parse::<IpAddr>() else {
        return false;
    };
    whitelist.iter().any(|entry| {
        let entry = entry.trim();
        match entry.split_once('/') {
            None => entry.parse::<IpAddr>().map(|e| e == addr).unwrap_or(false),
            Some((network, bits)) => match (network.parse::<IpAddr>(), bits.parse::<u32>()) {
                (Ok(network), Ok(bits)) => cidr_contains(network, bits, addr),
                _ => false,
            },
        }
    })
}

fn cidr_contains(network: IpAddr, bits: u32, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) if bits <= 32 => {
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) if bits <= 128 => {
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// Validates an inbound webhook request and exposes its payload.
///
/// Config: `method` (GET, POST, PUT, PATCH, DELETE or ANY; default ANY),
/// `secret`, `signatureHeader` (default `X-Signature-256`), `ipWhitelist`,
/// `requiredFields` (keys that must be present in an object body).
pub struct WebhookNode;

impl WebhookNode {
    fn request_field(&self, ctx: &NodeContext, key: &str) -> Option<Value> {
        ctx.inputs
            .get(key)
            .or_else(|| ctx.run.trigger_data().get(key))
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn header(&self, headers: &ValueMap, name: &str) -> Option<String> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_display_string())
    }
}

#[async_trait]
impl NodeExecutor for WebhookNode {
    fn node_type(&self) -> &str {
        "webhook"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let method = self
            .request_field(&ctx, "method")
            .map(|m| m.to_display_string().to_uppercase())
            .unwrap_or_else(|| "POST".to_string());
        let allowed = ctx.config.get_string_or("method", "ANY").to_uppercase();
        if allowed != "ANY" && allowed != method {
            return Err(NodeError::MethodNotAllowed(method));
        }

        if let Some(list) = ctx.config.get_array("ipWhitelist").filter(|l| !l.is_empty()) {
            let whitelist: Vec<String> = list.iter().map(Value::to_display_string).collect();
            let remote_ip = self
                .request_field(&ctx, "remote_ip")
                .map(|ip| ip.to_display_string())
                .unwrap_or_default();
            if !ip_allowed(&remote_ip, &whitelist) {
                return Err(NodeError::IpNotWhitelisted(remote_ip));
            }
        }

        let headers = self
            .request_field(&ctx, "headers")
            .and_then(|h| h.as_object().cloned())
            .unwrap_or_default();
        let body = self.request_field(&ctx, "body").unwrap_or_default();

        let secret = ctx.config.get_string("secret");
        if !secret.is_empty() {
            let header_name = ctx
                .config
                .get_string_or("signatureHeader", DEFAULT_SIGNATURE_HEADER);
            let signature = self
                .request_field(&ctx, "signature")
                .map(|s| s.to_display_string())
                .or_else(|| self.header(&headers, &header_name))
                .unwrap_or_default();
            let raw_body = self
                .request_field(&ctx, "raw_body")
                .map(|b| b.to_display_string())
                .unwrap_or_else(|| body.to_display_string());
            if !verify_signature(&secret, raw_body.as_bytes(), &signature) {
                ctx.events.warn("Webhook signature mismatch");
                return Err(NodeError::SignatureMismatch);
            }
        }

        if let Some(required) = ctx.config.get_array("requiredFields") {
            for field in required.iter().filter_map(Value::as_str) {
                if body.lookup(field).map_or(true, Value::is_null) {
                    return Err(NodeError::Validation(format!(
                        "Missing required field: {}",
                        field
                    )));
                }
            }
        }

        let query = self
            .request_field(&ctx, "query")
            .unwrap_or_else(|| Value::Object(ValueMap::new()));

        let mut output = NodeOutput::new()
            .with_output("method", method)
            .with_output("headers", headers)
            .with_output("query", query)
            .with_output("payload", body.clone())
            .with_output("body", body.clone())
            .with_output("validated", true);
        if let Value::Object(fields) = body {
            for (k, v) in fields {
                output.outputs.entry(k).or_insert(v);
            }
        }
        Ok(output)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("trigger", "Validates an inbound webhook request")
            .output("payload", "Request body")
            .output("headers", "Request headers")
            .output("query", "Query parameters")
    }
}
