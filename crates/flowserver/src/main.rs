use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use flowcore::{ExecutionContext, Value, ValueMap, Workflow};
use flowruntime::{execution_levels, Dag, FlowRuntime, NodeRegistry, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const SIGNATURE_HEADERS: [&str; 2] = ["x-signature-256", "x-hub-signature-256"];

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: ValueMap,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
}

/// Response for workflow creation
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: String,
    levels: Vec<Vec<String>>,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

impl ErrorResponse {
    fn new(kind: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.to_string(),
        }
    }
}

fn not_found(workflow_id: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse::new(
        "workflow_not_found",
        format!("Workflow {} not found", workflow_id),
    ))
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine"
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let workflow_list: Vec<_> = data
        .runtime
        .list_workflows()
        .await
        .into_iter()
        .map(|(id, w)| {
            serde_json::json!({
                "id": id,
                "name": w.name,
                "version": w.version,
                "nodes": w.nodes.len(),
                "connections": w.edges.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(workflow_list))
}

/// Create a new workflow. The graph is validated before it is stored.
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> ActixResult<impl Responder> {
    let mut workflow = match Workflow::from_json_value(body.into_inner()) {
        Ok(workflow) => workflow,
        Err(e) => return Ok(HttpResponse::BadRequest().json(ErrorResponse::new(e.kind(), e.to_string()))),
    };
    if workflow.id.is_empty() {
        workflow.id = Uuid::new_v4().to_string();
    }

    let levels = match Dag::build(&workflow).and_then(|dag| execution_levels(&dag)) {
        Ok(levels) => levels,
        Err(e) => {
            warn!("Rejected workflow {}: {}", workflow.id, e);
            return Ok(HttpResponse::BadRequest().json(ErrorResponse::new(e.kind(), e.to_string())));
        }
    };

    let workflow_id = workflow.id.clone();
    info!("Creating workflow: {} ({})", workflow.name, workflow_id);
    data.runtime.register_workflow(workflow_id.clone(), workflow).await;

    Ok(HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        levels,
        message: "Workflow created successfully".to_string(),
    }))
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.get_workflow(&workflow_id).await {
        Some(workflow) => Ok(HttpResponse::Ok().json(workflow)),
        None => Ok(not_found(&workflow_id)),
    }
}

/// Delete a workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    match data.runtime.remove_workflow(&workflow_id).await {
        Some(_) => {
            info!("Deleted workflow: {}", workflow_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "message": "Workflow deleted successfully"
            })))
        }
        None => Ok(not_found(&workflow_id)),
    }
}

async fn run(
    data: &AppState,
    workflow_id: &str,
    inputs: ValueMap,
    ctx: ExecutionContext,
) -> HttpResponse {
    let ctx = Arc::new(ctx.with_execution_id(Uuid::new_v4().to_string()));
    match data.runtime.execute_workflow(workflow_id, inputs, ctx).await {
        Ok(result) => {
            info!(
                "Workflow {} finished: {:?} in {}ms",
                workflow_id, result.status, result.duration_ms
            );
            HttpResponse::Ok().json(result)
        }
        Err(e) => {
            error!("Workflow {} execution failed: {}", workflow_id, e);
            HttpResponse::NotFound().json(ErrorResponse::new(e.kind(), e.to_string()))
        }
    }
}

/// Execute a workflow
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let req = req.map(web::Json::into_inner).unwrap_or_default();
    info!("Executing workflow: {}", workflow_id);

    let mut ctx = ExecutionContext::new(workflow_id.clone()).with_trigger("manual", req.inputs.clone());
    if let Some(user) = req.user_id {
        ctx = ctx.with_user(user);
    }
    if let Some(workspace) = req.workspace_id {
        ctx = ctx.with_workspace(workspace);
    }

    Ok(run(&data, &workflow_id, req.inputs, ctx).await)
}

/// Builds webhook trigger data from the raw request.
fn webhook_trigger(req: &HttpRequest, query: HashMap<String, String>, body: &[u8]) -> ValueMap {
    let mut headers = ValueMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), Value::from(value));
        }
    }
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|h| req.headers().get(*h))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let raw_body = String::from_utf8_lossy(body).to_string();
    let parsed = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => Value::from(json),
        Err(_) => Value::from(raw_body.as_str()),
    };
    let remote_ip = req
        .connection_info()
        .realip_remote_addr()
        .map(|addr| strip_port(addr).to_string())
        .unwrap_or_default();

    let mut data = ValueMap::new();
    data.insert("method".into(), Value::from(req.method().as_str()));
    data.insert("headers".into(), Value::Object(headers));
    data.insert(
        "query".into(),
        Value::Object(query.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
    );
    data.insert("body".into(), parsed);
    data.insert("raw_body".into(), Value::from(raw_body));
    data.insert("signature".into(), Value::from(signature));
    data.insert("remote_ip".into(), Value::from(remote_ip));
    data
}

fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

/// Webhook trigger ingress. The request becomes the run's trigger data
/// and its JSON body the initial inputs.
#[post("/api/workflows/{id}/webhook")]
async fn webhook_trigger_handler(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let trigger = webhook_trigger(&req, query.into_inner(), &body);
    let inputs = match trigger.get("body") {
        Some(Value::Object(map)) => map.clone(),
        _ => ValueMap::new(),
    };
    info!("Webhook received for workflow: {}", workflow_id);

    let ctx = ExecutionContext::new(workflow_id.clone()).with_trigger("webhook", trigger);
    Ok(run(&data, &workflow_id, inputs, ctx).await)
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    // Subscribe to events
    let mut events = data.runtime.subscribe_events();

    // Spawn task to handle WebSocket
    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                // Receive event from runtime
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("WebSocket subscriber lagged, dropped {} events", n);
                        }
                        Err(_) => break,
                    }
                }

                // Handle incoming WebSocket messages (ping/pong)
                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type).unwrap_or_default();
            serde_json::json!({
                "type": node_type,
                "description": metadata.description,
                "category": metadata.category,
                "inputs": metadata.inputs,
                "outputs": metadata.outputs,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Flow Engine Server");

    let config = RuntimeConfig {
        max_concurrent: env_or("FLOW_MAX_CONCURRENT", 10),
        timeout: Duration::from_secs(env_or("FLOW_TIMEOUT_SECS", 300)),
        ..Default::default()
    };

    // Create runtime with registered nodes
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    let runtime = FlowRuntime::with_registry(registry, config.clone());

    info!(
        max_concurrent = config.max_concurrent,
        timeout_secs = config.timeout.as_secs(),
        "✅ Runtime initialized with standard nodes"
    );

    // Create app state
    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    // Start HTTP server
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(execute_workflow)
            .service(webhook_trigger_handler)
            .service(websocket_events)
            .service(list_node_types)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
