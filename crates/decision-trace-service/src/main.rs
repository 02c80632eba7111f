use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use decision_trace_api::{
    build_policy_store, DecisionEngine, IngestReport, IngestRequest, API_CONTRACT_VERSION,
};
use decision_trace_core::{
    DecisionId, DecisionTrace, DecisionType, IngestSource, PolicyVersion,
};
use decision_trace_store_sqlite::{DecisionSummary, PatternStats};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    engine: Arc<DecisionEngine>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    body: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Ingest body as accepted over HTTP; the source channel is fixed to `api`.
#[derive(Debug, Clone, Deserialize)]
struct ServiceIngestRequest {
    message_text: Option<String>,
    message_ref: Option<String>,
    message_key: Option<String>,
    customer_name: String,
    decision_type: DecisionType,
    corrects_decision_id: Option<DecisionId>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
    customer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PatternsQuery {
    industry: Option<String>,
    decision_type: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "decision-trace-service")]
#[command(about = "Local HTTP service for decision traces")]
struct Args {
    #[arg(long, default_value = "./decision_traces.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Policy version list (JSON or YAML); built-in defaults when omitted.
    #[arg(long)]
    policies: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        },
    }
}

fn not_found(message: impl Into<String>) -> ServiceError {
    ServiceError {
        status: StatusCode::NOT_FOUND,
        body: ErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        },
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/decisions/ingest", post(decisions_ingest))
        .route("/v1/decisions", get(decisions_recent))
        .route("/v1/decisions/patterns", get(decisions_patterns))
        .route("/v1/decisions/:decision_id", get(decisions_show))
        .route("/v1/policies", get(policies_list))
        .route("/v1/policies/current", get(policies_current))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let policies = build_policy_store(args.policies.as_deref())?;
    let engine = DecisionEngine::new(args.db, policies)?;
    let state = ServiceState { engine: Arc::new(engine) };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "decision trace service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn decisions_ingest(
    State(state): State<ServiceState>,
    Json(request): Json<ServiceIngestRequest>,
) -> Result<Json<ServiceEnvelope<IngestReport>>, ServiceError> {
    let report = state
        .engine
        .ingest(IngestRequest {
            message_text: request.message_text,
            message_ref: request.message_ref,
            message_key: request.message_key,
            customer_name: request.customer_name,
            decision_type: request.decision_type,
            source: IngestSource::Api,
            corrects_decision_id: request.corrects_decision_id,
        })
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(envelope(report)))
}

async fn decisions_show(
    State(state): State<ServiceState>,
    Path(decision_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DecisionTrace>>, ServiceError> {
    let id = DecisionId::parse(&decision_id)
        .ok_or_else(|| bad_request(format!("invalid decision id: {decision_id}")))?;
    let trace = state
        .engine
        .decision(id)
        .map_err(|err| bad_request(err.to_string()))?
        .ok_or_else(|| not_found(format!("decision not found: {decision_id}")))?;
    Ok(Json(envelope(trace)))
}

async fn decisions_recent(
    State(state): State<ServiceState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<ServiceEnvelope<Vec<DecisionSummary>>>, ServiceError> {
    let limit = query.limit.unwrap_or(20);
    let summaries = match query.customer {
        Some(customer) => state.engine.decisions_for_customer(&customer, limit),
        None => state.engine.recent_decisions(limit),
    }
    .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(envelope(summaries)))
}

async fn decisions_patterns(
    State(state): State<ServiceState>,
    Query(query): Query<PatternsQuery>,
) -> Result<Json<ServiceEnvelope<PatternStats>>, ServiceError> {
    let decision_type = query
        .decision_type
        .as_deref()
        .map(|raw| {
            DecisionType::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown decision_type: {raw}")))
        })
        .transpose()?;
    let stats = state
        .engine
        .pattern_stats(query.industry.as_deref(), decision_type)
        .map_err(|err| bad_request(err.to_string()))?;
    Ok(Json(envelope(stats)))
}

async fn policies_list(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<PolicyVersion>>> {
    Json(envelope(state.engine.policies().versions().to_vec()))
}

async fn policies_current(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PolicyVersion>>, ServiceError> {
    let current = state
        .engine
        .policies()
        .current()
        .cloned()
        .ok_or_else(|| not_found("no current policy version configured"))?;
    Ok(Json(envelope(current)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("dtrace-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn mk_state(db_path: PathBuf) -> ServiceState {
        let policies = match build_policy_store(None) {
            Ok(policies) => policies,
            Err(err) => panic!("default policy store should build: {err}"),
        };
        let engine = match DecisionEngine::new(db_path, policies) {
            Ok(engine) => engine,
            Err(err) => panic!("engine should construct: {err}"),
        };
        ServiceState { engine: Arc::new(engine) }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn get_response(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(mk_state(unique_temp_db_path()));

        let response = get_response(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn ingest_show_and_list_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = app(mk_state(db_path.clone()));

        let payload = serde_json::json!({
            "message_text": "From: john.sales@company.com\n18% discount request.\nApproved by jane.vp@company.com",
            "message_ref": null,
            "message_key": "msg-svc-001",
            "customer_name": "MedTech Corp",
            "decision_type": "discount_approval",
            "corrects_decision_id": null
        });

        let ingest_response =
            post_json(router.clone(), "/v1/decisions/ingest", &payload).await;
        assert_eq!(ingest_response.status(), StatusCode::OK);
        let ingest_value = response_json(ingest_response).await;
        let decision_id = ingest_value
            .pointer("/data/trace/decision_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.trace.decision_id in {ingest_value}"))
            .to_string();
        assert!(decision_id.starts_with("dec_"));
        assert_eq!(
            ingest_value.pointer("/data/persisted").and_then(serde_json::Value::as_bool),
            Some(true)
        );

        let show_response =
            get_response(router.clone(), &format!("/v1/decisions/{decision_id}")).await;
        assert_eq!(show_response.status(), StatusCode::OK);
        let show_value = response_json(show_response).await;
        assert_eq!(
            show_value.pointer("/data/request/customer").and_then(serde_json::Value::as_str),
            Some("MedTech Corp")
        );

        let list_response = get_response(router, "/v1/decisions?limit=5").await;
        assert_eq!(list_response.status(), StatusCode::OK);
        let list_value = response_json(list_response).await;
        let rows = match list_value.pointer("/data").and_then(serde_json::Value::as_array) {
            Some(rows) => rows,
            None => panic!("decision list should be an array: {list_value}"),
        };
        assert_eq!(rows.len(), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_decision_is_a_not_found_envelope() {
        let router = app(mk_state(unique_temp_db_path()));

        let missing_id = DecisionId::new().to_string();
        let response = get_response(router, &format!("/v1/decisions/{missing_id}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert!(value.get("error").is_some());
    }

    #[tokio::test]
    async fn invalid_ingest_is_a_bad_request_envelope() {
        let router = app(mk_state(unique_temp_db_path()));

        let payload = serde_json::json!({
            "message_text": null,
            "message_ref": null,
            "message_key": null,
            "customer_name": "MedTech Corp",
            "decision_type": "discount_approval",
            "corrects_decision_id": null
        });
        let response = post_json(router, "/v1/decisions/ingest", &payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patterns_endpoint_rejects_unknown_decision_type() {
        let router = app(mk_state(unique_temp_db_path()));

        let bad = get_response(
            router.clone(),
            "/v1/decisions/patterns?decision_type=not_a_type",
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = get_response(router, "/v1/decisions/patterns?decision_type=discount_approval")
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        let value = response_json(ok).await;
        assert_eq!(
            value.pointer("/data/total").and_then(serde_json::Value::as_i64),
            Some(0)
        );
    }

    #[tokio::test]
    async fn policy_endpoints_expose_the_configured_table() {
        let router = app(mk_state(unique_temp_db_path()));

        let list = get_response(router.clone(), "/v1/policies").await;
        assert_eq!(list.status(), StatusCode::OK);
        let list_value = response_json(list).await;
        let versions = match list_value.pointer("/data").and_then(serde_json::Value::as_array) {
            Some(versions) => versions,
            None => panic!("policy list should be an array: {list_value}"),
        };
        assert_eq!(versions.len(), 2);

        let current = get_response(router, "/v1/policies/current").await;
        assert_eq!(current.status(), StatusCode::OK);
        let current_value = response_json(current).await;
        assert_eq!(
            current_value.pointer("/data/version").and_then(serde_json::Value::as_str),
            Some("v2.0")
        );
    }
}
