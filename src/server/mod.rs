//! The HTTP surface of the core: `/ws` plus the JSON endpoints the
//! out-of-scope REST layer builds on.
//!
//! Deliberately a hand-routed hyper service: no sessions, no CSRF, no
//! static assets. Every response is either a well-formed JSON document or
//! `{"error": ...}`.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::{format_err, Error};
use http::{Method, StatusCode};
use hyper::{Body, Request, Response};
use serde::Serialize;
use serde_json::json;

use pulse_api_types::{NodeConfig, ThresholdConfig};
use pulse_config::{
    open_bundle, seal_bundle, DataDir, ExportPayload, NodeStore, SystemConfig, ThresholdStore,
};

use crate::history::MetricsHistory;
use crate::reload::{NodeEvent, ReloadTx};
use crate::state::StateHub;

mod ws;

/// Everything the handlers need; wired once at startup.
pub struct AppContext {
    pub hub: Arc<StateHub>,
    pub history: Arc<MetricsHistory>,
    pub nodes: Arc<tokio::sync::Mutex<NodeStore>>,
    pub thresholds: Arc<RwLock<ThresholdConfig>>,
    pub threshold_store: ThresholdStore,
    pub data_dir: DataDir,
    pub system: SystemConfig,
    pub reload: ReloadTx,
}

impl AppContext {
    /// Hosts the discovery scanner must skip: configured nodes and their
    /// known cluster members.
    pub fn configured_hosts(&self) -> HashSet<String> {
        let mut hosts = HashSet::new();
        if let Ok(store) = self.nodes.try_lock() {
            for node in store.nodes() {
                hosts.insert(node.host());
                if let Some(cluster) = &node.cluster {
                    for endpoint in &cluster.endpoints {
                        hosts.insert(endpoint.host.clone());
                    }
                }
            }
        }
        for node in &self.hub.current().nodes {
            for endpoint in &node.cluster_endpoints {
                hosts.insert(endpoint.host.clone());
            }
        }
        hosts
    }
}

/// Route one request. Never returns an error to hyper; failures become
/// `{"error": ...}` responses.
pub async fn handle(ctx: Arc<AppContext>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match route(ctx, &method, &path, req).await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("{} {} failed: {:#}", method, path, err);
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

async fn route(
    ctx: Arc<AppContext>,
    method: &Method,
    path: &str,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    match (method, path) {
        (&Method::GET, "/ws") => ws::handle_upgrade(ctx, req),
        (&Method::GET, "/api/state") => json_response(StatusCode::OK, &*ctx.hub.current()),
        (&Method::GET, "/api/charts") => get_charts(&ctx, &req),
        (&Method::GET, "/api/discover") => {
            let servers = ctx.hub.discovered();
            json_response(StatusCode::OK, &json!({ "servers": &*servers }))
        }
        (&Method::GET, "/api/config/nodes") => {
            let store = ctx.nodes.lock().await;
            let summaries: Vec<_> = store.nodes().iter().map(|n| n.to_summary()).collect();
            json_response(StatusCode::OK, &summaries)
        }
        (&Method::POST, "/api/config/nodes") => post_node(&ctx, req).await,
        (&Method::POST, "/api/config/nodes/test-connection") => test_connection(req).await,
        (&Method::GET, "/api/notifications/thresholds") => {
            let config = ctx.thresholds.read().unwrap().clone();
            json_response(StatusCode::OK, &config)
        }
        (&Method::POST, "/api/notifications/thresholds") => post_thresholds(&ctx, req).await,
        (&Method::POST, "/api/config/export") => export_config(&ctx, req).await,
        (&Method::POST, "/api/config/import") => import_config(&ctx, req).await,
        _ => {
            if let Some(id) = path.strip_prefix("/api/config/nodes/") {
                let id = id.to_string();
                match *method {
                    Method::GET => return get_node(&ctx, &id).await,
                    Method::PUT => return put_node(&ctx, &id, req).await,
                    Method::DELETE => return delete_node(&ctx, &id).await,
                    _ => {}
                }
            }
            Ok(error_response(StatusCode::NOT_FOUND, "no such endpoint"))
        }
    }
}

fn get_charts(ctx: &AppContext, req: &Request<Body>) -> Result<Response<Body>, Error> {
    let range = query_param(req, "range").unwrap_or_else(|| "1h".to_string());
    let seconds = match range.as_str() {
        "1h" => 3600,
        "24h" => 24 * 3600,
        "7d" => 7 * 24 * 3600,
        other => return Err(format_err!("unknown chart range '{}'", other)),
    };
    let now = proxmox_time::epoch_i64();
    let data = ctx.history.range_all(now - seconds, now, 720);
    json_response(StatusCode::OK, &json!({ "range": range, "data": data }))
}

async fn post_node(ctx: &AppContext, req: Request<Body>) -> Result<Response<Body>, Error> {
    let mut config: NodeConfig = read_json(req).await?;
    if config.id.is_empty() {
        config.id = generate_node_id(&config.name, &config.url);
    }
    let summary = config.to_summary();
    ctx.nodes.lock().await.add(config.clone())?;
    ctx.reload.send(NodeEvent::Added(config));
    json_response(StatusCode::OK, &summary)
}

async fn get_node(ctx: &AppContext, id: &str) -> Result<Response<Body>, Error> {
    let store = ctx.nodes.lock().await;
    match store.get(id) {
        Some(node) => json_response(StatusCode::OK, &node.to_summary()),
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            &format!("no such node '{}'", id),
        )),
    }
}

async fn put_node(
    ctx: &AppContext,
    id: &str,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let mut config: NodeConfig = read_json(req).await?;
    config.id = id.to_string();
    let mut store = ctx.nodes.lock().await;
    store.update(config)?;
    // the stored entry carries the retained secrets
    let stored = store
        .get(id)
        .cloned()
        .ok_or_else(|| format_err!("node '{}' vanished during update", id))?;
    drop(store);
    let summary = stored.to_summary();
    ctx.reload.send(NodeEvent::Updated(stored));
    json_response(StatusCode::OK, &summary)
}

async fn delete_node(ctx: &AppContext, id: &str) -> Result<Response<Body>, Error> {
    ctx.nodes.lock().await.remove(id)?;
    ctx.reload.send(NodeEvent::Removed(id.to_string()));
    json_response(StatusCode::OK, &json!({ "removed": id }))
}

async fn test_connection(req: Request<Body>) -> Result<Response<Body>, Error> {
    let config: NodeConfig = read_json(req).await?;
    match pulse_client::test_connection(&config).await {
        Ok(version) => json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "version": version.version }),
        ),
        Err(err) => Ok(error_response(StatusCode::BAD_GATEWAY, &err.to_string())),
    }
}

async fn post_thresholds(ctx: &AppContext, req: Request<Body>) -> Result<Response<Body>, Error> {
    let config: ThresholdConfig = read_json(req).await?;
    ctx.threshold_store.save(&config)?;
    *ctx.thresholds.write().unwrap() = config.clone();
    json_response(StatusCode::OK, &config)
}

async fn export_config(ctx: &AppContext, req: Request<Body>) -> Result<Response<Body>, Error> {
    #[derive(serde::Deserialize)]
    struct ExportRequest {
        passphrase: String,
    }
    let request: ExportRequest = read_json(req).await?;
    let payload = ExportPayload {
        nodes: ctx.nodes.lock().await.nodes().to_vec(),
        system: ctx.system.clone(),
        thresholds: ctx.thresholds.read().unwrap().clone(),
    };
    let bundle = seal_bundle(&payload, &request.passphrase)?;
    json_response(StatusCode::OK, &bundle)
}

async fn import_config(ctx: &AppContext, req: Request<Body>) -> Result<Response<Body>, Error> {
    #[derive(serde::Deserialize)]
    struct ImportRequest {
        passphrase: String,
        bundle: pulse_config::ExportBundle,
    }
    let request: ImportRequest = read_json(req).await?;
    let payload = open_bundle(&request.bundle, &request.passphrase)?;

    let mut store = ctx.nodes.lock().await;
    let old_ids: Vec<String> = store.nodes().iter().map(|n| n.id.clone()).collect();
    // imported nodes get fresh ids so a bundle can be applied repeatedly
    let nodes: Vec<NodeConfig> = payload
        .nodes
        .into_iter()
        .map(|mut node| {
            node.id = generate_node_id(&node.name, &node.url);
            node
        })
        .collect();
    store.replace_all(nodes.clone())?;
    drop(store);

    for id in old_ids {
        ctx.reload.send(NodeEvent::Removed(id));
    }
    for node in &nodes {
        ctx.reload.send(NodeEvent::Added(node.clone()));
    }

    ctx.threshold_store.save(&payload.thresholds)?;
    *ctx.thresholds.write().unwrap() = payload.thresholds;
    payload.system.save(&ctx.data_dir.system_path())?;

    json_response(
        StatusCode::OK,
        &json!({ "imported": nodes.len(), "note": "system settings apply on restart" }),
    )
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, Error> {
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    serde_json::from_slice(&bytes).map_err(|err| format_err!("invalid request body - {}", err))
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>, Error> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))?)
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Stable enough to be unique, opaque to clients.
fn generate_node_id(name: &str, url: &str) -> String {
    use siphasher::sip::SipHasher24;
    use std::hash::{Hash, Hasher};
    let mut hasher = SipHasher24::new_with_keys(0x6e6f6465, 0x6964);
    name.hash(&mut hasher);
    url.hash(&mut hasher);
    proxmox_time::epoch_f64().to_bits().hash(&mut hasher);
    format!("node-{:012x}", hasher.finish() & 0xffff_ffff_ffff)
}
