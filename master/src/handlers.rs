use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use common::{
    BlockRequest, BlockedList, Fingerprint, JobAccepted, JobRequest, JobStatusResponse,
    StatsResponse, UnblockRequest, UnblockResponse,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admission::DEFAULT_STATS_LIMIT;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const JOBS_ENDPOINT: &str = "/api/v1/jobs";

pub fn build_router(state: AppState) -> Router {
    // Rutas que exigen API key (si hay una configurada).
    let protected = Router::new()
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:fingerprint", get(get_job))
        .route("/api/v1/admission/blocked", get(list_blocked))
        .route("/api/v1/admission/block", post(block_source))
        .route("/api/v1/admission/unblock", post(unblock_source))
        .route("/api/v1/admission/stats", get(admission_stats))
        .route("/api/v1/admission/count/:source", get(request_count))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/v1/scripts", get(list_scripts))
        .route("/api/v1/scripts/:name", get(get_script))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- auth y origen ---------------- */

#[derive(Debug, Default, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.config.api_key.as_str();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let from_header = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_query = Query::<ApiKeyQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|q| q.0.api_key);

    match from_header.or(from_query) {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => {
            warn!("petición sin API key válida a {}", req.uri().path());
            Err(ApiError::Unauthorized)
        }
    }
}

/// Identidad del llamador para el control de admisión.
fn source_of(state: &AppState, peer: SocketAddr, headers: &HeaderMap) -> String {
    if state.config.trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

/* ---------------- handlers HTTP ---------------- */

async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "Install Scripts API",
        "version": env!("CARGO_PKG_VERSION"),
        "languages": state.catalog.languages(),
        "endpoints": {
            "/": "API information (this page)",
            "/health": "Health check endpoint",
            "/api/v1/scripts": "List all available installation scripts (supports ?lang=)",
            "/api/v1/scripts/<name>": "Get a single script by script_name (supports ?lang=)",
            "/api/v1/jobs": "POST: start an installation job",
            "/api/v1/jobs/<fingerprint>": "GET: job status and output",
            "/api/v1/admission/blocked": "GET: blocked sources",
            "/api/v1/admission/block": "POST: block a source",
            "/api/v1/admission/unblock": "POST: unblock a source",
            "/api/v1/admission/stats": "GET: recent requests (supports ?source=&limit=)",
            "/api/v1/admission/count/<source>": "GET: requests in the current window",
        }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "message": "API is running" }))
}

// Orden fijo: API key (middleware) -> admisión -> validar y lanzar.
async fn create_job(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let source = source_of(&state, peer, &headers);
    let decision = state.admission.check_and_record(&source, JOBS_ENDPOINT).await?;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            reason: decision.reason.unwrap_or_else(|| "Request blocked".to_string()),
            count: decision.count,
        });
    }

    let Json(req) = body.map_err(|e| ApiError::Validation(format!("Invalid JSON body: {e}")))?;
    let fingerprint = state.orchestrator.submit(req).await?;
    info!("job {} aceptado desde {}", fingerprint, source);

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            success: true,
            fingerprint,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let fp = Fingerprint::parse(&raw)
        .ok_or_else(|| ApiError::Validation("Invalid fingerprint format".to_string()))?;
    let record = state.orchestrator.poll(&fp).await?;
    Ok(Json(JobStatusResponse {
        success: true,
        fingerprint: record.fingerprint,
        status: record.status,
        output: record.output,
    }))
}

async fn list_blocked(State(state): State<AppState>) -> ApiResult<Json<BlockedList>> {
    let blocked = state.admission.list_blocked().await?;
    Ok(Json(BlockedList {
        success: true,
        blocked,
    }))
}

async fn block_source(
    State(state): State<AppState>,
    body: Result<Json<BlockRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body.map_err(|e| ApiError::Validation(format!("Invalid JSON body: {e}")))?;
    let source = req.source.trim();
    if source.is_empty() {
        return Err(ApiError::Validation("Missing required fields: source".to_string()));
    }
    let duration = match req.duration_hours {
        Some(h) if h > 0.0 => Some(
            Duration::try_from_secs_f64(h * 3600.0)
                .map_err(|_| ApiError::Validation("durationHours out of range".to_string()))?,
        ),
        Some(_) => {
            return Err(ApiError::Validation("durationHours must be positive".to_string()))
        }
        None => None,
    };

    let done = state
        .admission
        .block(source, req.reason.as_deref(), req.permanent, duration)
        .await?;
    if !done {
        return Err(ApiError::AdmissionDisabled);
    }
    Ok(Json(json!({ "success": true, "source": source })))
}

async fn unblock_source(
    State(state): State<AppState>,
    body: Result<Json<UnblockRequest>, JsonRejection>,
) -> ApiResult<Json<UnblockResponse>> {
    let Json(req) = body.map_err(|e| ApiError::Validation(format!("Invalid JSON body: {e}")))?;
    if !state.admission.enabled() {
        return Err(ApiError::AdmissionDisabled);
    }
    let unblocked = state.admission.unblock(req.source.trim()).await?;
    Ok(Json(UnblockResponse {
        success: true,
        unblocked,
    }))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    source: Option<String>,
    limit: Option<u32>,
}

async fn admission_stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<StatsResponse>> {
    let source = q.source.as_deref().filter(|s| !s.is_empty());
    let requests = state
        .admission
        .stats(source, q.limit.unwrap_or(DEFAULT_STATS_LIMIT))
        .await?;
    Ok(Json(StatsResponse {
        success: true,
        requests,
    }))
}

async fn request_count(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<Value>> {
    let count = state.admission.request_count(&source).await?;
    Ok(Json(json!({ "success": true, "source": source, "count": count })))
}

#[derive(Debug, Deserialize)]
struct LangQuery {
    lang: Option<String>,
}

async fn list_scripts(
    State(state): State<AppState>,
    Query(q): Query<LangQuery>,
) -> ApiResult<Json<Value>> {
    let scripts = state.catalog.list(q.lang.as_deref())?;
    Ok(Json(json!({
        "success": true,
        "count": scripts.len(),
        "scripts": scripts,
    })))
}

async fn get_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<LangQuery>,
) -> ApiResult<Json<Value>> {
    let script = state.catalog.get(&name, q.lang.as_deref())?;
    Ok(Json(json!({ "success": true, "result": script })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::Config;
    use crate::store::MemoryTaskStore;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;
    use worker::fake::{FakeExecutor, FakeStep};

    async fn app_with(config: Config, exec: FakeExecutor) -> Router {
        let admission = AdmissionController::open(&config.rate_limit).await.unwrap();
        let state = AppState::assemble(
            config,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(exec),
            admission,
        );
        build_router(state).layer(MockConnectInfo(SocketAddr::from(([1, 2, 3, 4], 40000))))
    }

    async fn app() -> Router {
        app_with(
            Config::for_tests(),
            FakeExecutor::new(vec![FakeStep::Chunk("line1\n".into()), FakeStep::Exit(0)]),
        )
        .await
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn demo_job() -> Value {
        json!({ "script": "demo", "host": "10.0.0.5", "credential": "x" })
    }

    #[tokio::test]
    async fn health_responde() {
        let app = app().await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn job_de_punta_a_punta() {
        let app = app().await;
        let (status, body) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let fp = body["fingerprint"].as_str().unwrap().to_string();
        assert_eq!(fp.len(), 64);

        let uri = format!("/api/v1/jobs/{fp}");
        let mut last = Value::Null;
        for _ in 0..200 {
            let (status, body) = send(&app, get(&uri)).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] != "PROCESSING" {
                last = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last["status"], "COMPLETED");
        assert_eq!(last["output"], "line1\n");

        let (status, body) = send(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn nombres_de_campo_viejos_se_aceptan() {
        let app = app().await;
        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/jobs",
                json!({ "script_name": "demo", "server_ip": "10.0.0.5", "server_root_password": "x", "additional": "example.com" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn validacion_devuelve_400() {
        let app = app().await;
        let (status, body) = send(&app, post_json("/api/v1/jobs", json!({ "script": "demo" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields: host, credential");
        assert_eq!(body["success"], false);

        let (status, body) = send(
            &app,
            post_json(
                "/api/v1/jobs",
                json!({ "script": "demo; rm -rf /", "host": "10.0.0.5", "credential": "x" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid script_name format");
    }

    #[tokio::test]
    async fn fingerprint_malformado_es_400() {
        let app = app().await;
        let (status, body) = send(&app, get("/api/v1/jobs/not-a-fingerprint")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid fingerprint format");
    }

    #[tokio::test]
    async fn limite_de_peticiones_devuelve_429() {
        let app = app().await;
        for _ in 0..3 {
            let (status, _) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        let (status, body) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["count"], 4);
        assert!(body["error"].as_str().unwrap().contains("Rate limit exceeded"));

        let (status, body) = send(&app, get("/api/v1/admission/blocked")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blocked"][0]["source"], "1.2.3.4");

        let (_, body) = send(&app, get("/api/v1/admission/stats?source=1.2.3.4&limit=2")).await;
        assert_eq!(body["requests"].as_array().unwrap().len(), 2);

        let (_, body) = send(&app, get("/api/v1/admission/count/1.2.3.4")).await;
        assert_eq!(body["count"], 4);
    }

    #[tokio::test]
    async fn forwarded_for_solo_si_se_confia() {
        let mut config = Config::for_tests();
        config.trust_forwarded_for = true;
        let app = app_with(config, FakeExecutor::new(vec![FakeStep::Exit(0)])).await;

        let mut req = post_json("/api/v1/jobs", demo_job());
        req.headers_mut()
            .insert("x-forwarded-for", "9.9.9.9, 10.0.0.1".parse().unwrap());
        send(&app, req).await;

        let (_, body) = send(&app, get("/api/v1/admission/stats")).await;
        assert_eq!(body["requests"][0]["source"], "9.9.9.9");
    }

    #[tokio::test]
    async fn block_y_unblock_por_http() {
        let app = app().await;
        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/admission/block",
                json!({ "source": "1.2.3.4", "reason": "abuso", "permanent": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "abuso");

        let (_, body) = send(
            &app,
            post_json("/api/v1/admission/unblock", json!({ "source": "1.2.3.4" })),
        )
        .await;
        assert_eq!(body["unblocked"], true);

        let (_, body) = send(
            &app,
            post_json("/api/v1/admission/unblock", json!({ "source": "1.2.3.4" })),
        )
        .await;
        assert_eq!(body["unblocked"], false);

        let (status, _) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn block_con_horas_enormes_queda_vigente() {
        let app = app().await;
        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/admission/block",
                json!({ "source": "1.2.3.4", "durationHours": 1e13 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Manual block");

        let (_, body) = send(&app, get("/api/v1/admission/blocked")).await;
        assert_eq!(body["blocked"][0]["permanent"], false);
        assert!(body["blocked"][0]["expires_at"].is_string());

        let (status, _) = send(
            &app,
            post_json(
                "/api/v1/admission/block",
                json!({ "source": "1.2.3.4", "durationHours": 1e300 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admision_desactivada() {
        let mut config = Config::for_tests();
        config.rate_limit.enabled = false;
        let app = app_with(config, FakeExecutor::new(vec![FakeStep::Exit(0)])).await;

        for _ in 0..5 {
            let (status, _) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        let (status, body) = send(
            &app,
            post_json("/api/v1/admission/block", json!({ "source": "1.2.3.4" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "ADMISSION_DISABLED");
    }

    #[tokio::test]
    async fn api_key_por_header_o_query() {
        let mut config = Config::for_tests();
        config.api_key = "secret".to_string();
        config.rate_limit.max_requests = 100;
        let app = app_with(config, FakeExecutor::new(vec![FakeStep::Exit(0)])).await;

        let (status, body) = send(&app, post_json("/api/v1/jobs", demo_job())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let mut req = post_json("/api/v1/jobs", demo_job());
        req.headers_mut().insert("x-api-key", "wrong".parse().unwrap());
        assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);

        let mut req = post_json("/api/v1/jobs", demo_job());
        req.headers_mut().insert("x-api-key", "secret".parse().unwrap());
        assert_eq!(send(&app, req).await.0, StatusCode::ACCEPTED);

        let req = post_json("/api/v1/jobs?api_key=secret", demo_job());
        assert_eq!(send(&app, req).await.0, StatusCode::ACCEPTED);

        // sin auth no se consulta la admisión
        let (_, body) = send(&app, get("/api/v1/admission/stats?api_key=secret")).await;
        assert_eq!(body["requests"].as_array().unwrap().len(), 2);

        // catálogo y health no piden clave
        assert_eq!(send(&app, get("/health")).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn catalogo_de_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("data_ru.json"),
            r#"[{"script_name":"demo","name":"Демо"}]"#,
        )
        .unwrap();
        let mut config = Config::for_tests();
        config.data_dir = dir.path().to_path_buf();
        let app = app_with(config, FakeExecutor::new(vec![])).await;

        let (status, body) = send(&app, get("/api/v1/scripts?lang=en")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = send(&app, get("/api/v1/scripts/demo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["name"], "Демо");

        let (status, body) = send(&app, get("/api/v1/scripts/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Script with script_name \"nope\" not found");
    }
}
