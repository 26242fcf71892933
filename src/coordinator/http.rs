//! Admin HTTP API for a registry node
//!
//! - `GET /health`
//! - `GET /cluster`: identity, role, observed master and live members
//! - `PUT /cluster/master` / `DELETE /cluster/master`: forced override
//! - `POST /subjects/:subject/versions`: register; followers forward to the master
//! - `GET /subjects`, `/subjects/:subject/versions[/:version]`, `/schemas/ids/:id`

use crate::common::{Error, NodeIdentity};
use crate::coordinator::server::RegistryNode;
use crate::store::SchemaId;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

type ApiResult = std::result::Result<Json<Value>, Error>;

/// Marks a registration already forwarded once, so it is never bounced back
const FORWARDED_HEADER: &str = "x-minireg-forwarded";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = json!({
            "error_code": self.error_code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    schema: String,
}

pub fn create_router(node: Arc<RegistryNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cluster", get(cluster_status))
        .route("/cluster/master", put(force_master).delete(clear_master))
        .route("/subjects", get(list_subjects))
        .route(
            "/subjects/:subject/versions",
            get(list_versions).post(register_schema),
        )
        .route("/subjects/:subject/versions/:version", get(get_version))
        .route("/schemas/ids/:id", get(get_schema_by_id))
        .with_state(node)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn cluster_status(State(node): State<Arc<RegistryNode>>) -> impl IntoResponse {
    let state = node.elector().state();
    Json(json!({
        "identity": node.identity(),
        "role": state.role().to_string(),
        "master": state.master,
        "members": state.members,
    }))
}

async fn force_master(
    State(node): State<Arc<RegistryNode>>,
    Json(master): Json<NodeIdentity>,
) -> ApiResult {
    node.set_master(Some(master)).await?;
    Ok(Json(json!({ "master": node.master_identity() })))
}

async fn clear_master(State(node): State<Arc<RegistryNode>>) -> ApiResult {
    node.set_master(None).await?;
    Ok(Json(json!({ "master": Value::Null })))
}

async fn register_schema(
    State(node): State<Arc<RegistryNode>>,
    Path(subject): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> std::result::Result<Response, Error> {
    let err = match node.registry().register(&subject, &req.schema).await {
        Ok(id) => return Ok(Json(json!({ "id": id })).into_response()),
        Err(e) => e,
    };
    let master = match (&err, node.master_identity()) {
        (Error::NotMaster(_), Some(master))
            if &master != node.identity() && !headers.contains_key(FORWARDED_HEADER) =>
        {
            master
        }
        _ => return Err(err),
    };
    forward_registration(&node, &master, &subject, &req.schema).await
}

/// Replay a registration against the master's admin API and relay its answer
async fn forward_registration(
    node: &RegistryNode,
    master: &NodeIdentity,
    subject: &str,
    schema: &str,
) -> std::result::Result<Response, Error> {
    let failed = |reason: String| Error::ForwardFailed {
        master: master.address(),
        reason,
    };

    let mut url = reqwest::Url::parse(&format!("http://{}/", master.address()))
        .map_err(|e| failed(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| failed("address cannot be a base url".into()))?
        .clear()
        .extend(["subjects", subject, "versions"]);

    tracing::debug!("Forwarding registration under {} to master {}", subject, master);
    let resp = node
        .http_client()
        .post(url)
        .header(FORWARDED_HEADER, node.identity().address())
        .json(&json!({ "schema": schema }))
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;

    let status = resp.status();
    let body: Value = resp.json().await.map_err(|e| failed(e.to_string()))?;
    Ok((status, Json(body)).into_response())
}

async fn list_subjects(State(node): State<Arc<RegistryNode>>) -> ApiResult {
    Ok(Json(json!(node.registry().subjects()?)))
}

async fn list_versions(
    State(node): State<Arc<RegistryNode>>,
    Path(subject): Path<String>,
) -> ApiResult {
    Ok(Json(json!(node.registry().versions(&subject)?)))
}

async fn get_version(
    State(node): State<Arc<RegistryNode>>,
    Path((subject, version)): Path<(String, String)>,
) -> ApiResult {
    let record = if version == "latest" {
        node.registry().latest(&subject)?
    } else {
        let version: u32 = version
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid version {:?}", version)))?;
        node.registry().version(&subject, version)?
    };
    Ok(Json(json!(record)))
}

async fn get_schema_by_id(
    State(node): State<Arc<RegistryNode>>,
    Path(id): Path<SchemaId>,
) -> ApiResult {
    let record = node.registry().schema_by_id(id)?;
    Ok(Json(json!({ "schema": record.schema })))
}
