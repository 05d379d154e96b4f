use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use tally_core::error::MirrorError;
use tally_core::models::{
    Category, CategoryFilter, MonthlySummary, NewCategory, NewTransaction, Transaction,
    UpdateCategory, UpdateTransaction, parse_kind, validate_month,
};
use tally_core::service::LedgerService;
use tally_core::sync::{
    BackupReport, DrainReport, RestoreMode, RestoreOutcome, RestorePreview, SharedLedger,
    SyncEngine, SyncStatus,
};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const DRAIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    ledger: SharedLedger,
    engine: Arc<SyncEngine>,
    api_key: Option<String>,
}

impl AppState {
    fn ledger(&self) -> MutexGuard<'_, LedgerService> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransactionRequest {
    date: String,
    #[serde(rename = "type")]
    kind: String,
    amount: i64,
    category_id: String,
    memo: Option<String>,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::option_option)]
struct UpdateTransactionRequest {
    date: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    amount: Option<i64>,
    category_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    memo: Option<Option<String>>,
}

#[derive(Deserialize)]
struct TransactionQuery {
    month: Option<String>,
}

#[derive(Deserialize)]
struct CreateCategoryRequest {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct UpdateCategoryRequest {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    active: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryQuery {
    #[serde(default)]
    include_inactive: bool,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    sheet_id: String,
}

#[derive(Deserialize)]
struct RestoreQuery {
    #[serde(default)]
    mode: RestoreMode,
}

#[derive(Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    mode: RestoreMode,
    /// Without `confirm: true` the restore is only previewed.
    #[serde(default)]
    confirm: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl ApiError {
    fn bad_request(err: &anyhow::Error) -> Self {
        Self::BadRequest(format!("{err:#}"))
    }

    /// Classify a failed sync call by the mirror error underneath it.
    fn from_sync(err: anyhow::Error) -> Self {
        match err.downcast_ref::<MirrorError>() {
            Some(MirrorError::NotConnected) => {
                Self::BadRequest(MirrorError::NotConnected.to_string())
            }
            Some(_) => Self::BadGateway(format!("{err:#}")),
            None => Self::Internal(err),
        }
    }
}

fn parse_day(date: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{date}'. Use YYYY-MM-DD")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Transactions ---

async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let month = query
        .month
        .as_deref()
        .map(validate_month)
        .transpose()
        .map_err(|e| ApiError::bad_request(&e))?;
    let transactions = state
        .ledger()
        .list_transactions(month.as_deref())
        .context("failed to list transactions")?;
    Ok(Json(transactions))
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let kind = parse_kind(&req.kind).map_err(|e| ApiError::bad_request(&e))?;
    let date = parse_day(&req.date)?;

    let tx = {
        let ledger = state.ledger();
        let category = ledger
            .get_category(&req.category_id)
            .context("failed to read categories")?
            .ok_or_else(|| {
                ApiError::BadRequest(format!("Category {} not found", req.category_id))
            })?;
        if category.kind != kind {
            return Err(ApiError::BadRequest(format!(
                "Category '{}' is an {} category, not {kind}",
                category.name, category.kind
            )));
        }
        ledger
            .create_transaction(&NewTransaction {
                date,
                kind,
                amount: req.amount,
                category_id: req.category_id,
                memo: req.memo,
            })
            .map_err(|e| ApiError::bad_request(&e))?
    };

    state.engine.notify();
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, ApiError> {
    state
        .ledger()
        .get_transaction(&id)
        .context("failed to read transactions")?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {id} not found")))
}

async fn update_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTransactionRequest>,
) -> Result<Json<Transaction>, ApiError> {
    let update = UpdateTransaction {
        date: req.date.as_deref().map(parse_day).transpose()?,
        kind: req
            .kind
            .as_deref()
            .map(parse_kind)
            .transpose()
            .map_err(|e| ApiError::bad_request(&e))?,
        amount: req.amount,
        category_id: req.category_id,
        memo: req.memo,
    };
    if update.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }

    let tx = {
        let ledger = state.ledger();
        if ledger
            .get_transaction(&id)
            .context("failed to read transactions")?
            .is_none()
        {
            return Err(ApiError::NotFound(format!("Transaction {id} not found")));
        }
        if let Some(category_id) = &update.category_id {
            if ledger
                .get_category(category_id)
                .context("failed to read categories")?
                .is_none()
            {
                return Err(ApiError::BadRequest(format!(
                    "Category {category_id} not found"
                )));
            }
        }
        ledger
            .update_transaction(&id, &update)
            .map_err(|e| ApiError::bad_request(&e))?
    };

    state.engine.notify();
    Ok(Json(tx))
}

async fn delete_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .ledger()
        .delete_transaction(&id)
        .context("failed to delete transaction")?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Transaction {id} not found")));
    }
    state.engine.notify();
    Ok(StatusCode::NO_CONTENT)
}

// --- Categories ---

async fn list_categories(
    State(state): State<AppState>,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<Vec<Category>>, ApiError> {
    let kind = query
        .kind
        .as_deref()
        .map(parse_kind)
        .transpose()
        .map_err(|e| ApiError::bad_request(&e))?;
    let categories = state
        .ledger()
        .list_categories(CategoryFilter {
            include_inactive: query.include_inactive,
            kind,
        })
        .context("failed to list categories")?;
    Ok(Json(categories))
}

async fn create_category(
    State(state): State<AppState>,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let kind = parse_kind(&req.kind).map_err(|e| ApiError::bad_request(&e))?;
    let category = state
        .ledger()
        .create_category(&NewCategory {
            name: req.name,
            kind,
        })
        .map_err(|e| ApiError::bad_request(&e))?;
    state.engine.notify();
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateCategoryRequest>,
) -> Result<Json<Category>, ApiError> {
    if req.name.is_none() && req.kind.is_none() && req.active.is_none() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    let update = UpdateCategory {
        name: req.name,
        kind: req
            .kind
            .as_deref()
            .map(parse_kind)
            .transpose()
            .map_err(|e| ApiError::bad_request(&e))?,
        active: req.active,
    };

    let category = {
        let ledger = state.ledger();
        if ledger
            .get_category(&id)
            .context("failed to read categories")?
            .is_none()
        {
            return Err(ApiError::NotFound(format!("Category {id} not found")));
        }
        ledger
            .update_category(&id, &update)
            .map_err(|e| ApiError::bad_request(&e))?
    };
    state.engine.notify();
    Ok(Json(category))
}

/// Soft delete. The category stays stored and visible with `includeInactive`.
async fn deactivate_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Category>, ApiError> {
    let category = {
        let ledger = state.ledger();
        if ledger
            .get_category(&id)
            .context("failed to read categories")?
            .is_none()
        {
            return Err(ApiError::NotFound(format!("Category {id} not found")));
        }
        ledger
            .deactivate_category(&id)
            .map_err(|e| ApiError::bad_request(&e))?
    };
    state.engine.notify();
    Ok(Json(category))
}

async fn get_monthly_summary(
    State(state): State<AppState>,
    Path(month): Path<String>,
) -> Result<Json<MonthlySummary>, ApiError> {
    let month = validate_month(&month).map_err(|e| ApiError::bad_request(&e))?;
    let summary = state
        .ledger()
        .monthly_summary(&month)
        .context("failed to build summary")?;
    Ok(Json(summary))
}

// --- Sync ---

async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, ApiError> {
    Ok(Json(state.engine.status()?))
}

async fn sync_connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<SyncStatus>, ApiError> {
    if req.sheet_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "sheetId cannot be empty".to_string(),
        ));
    }
    let status = state
        .engine
        .connect(&req.sheet_id)
        .await
        .map_err(ApiError::from_sync)?;
    Ok(Json(status))
}

async fn sync_disconnect(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dropped = state.engine.disconnect()?;
    Ok(Json(
        serde_json::json!({ "disconnected": true, "droppedOps": dropped }),
    ))
}

async fn sync_backup(State(state): State<AppState>) -> Result<Json<BackupReport>, ApiError> {
    let report = state.engine.backup().await.map_err(ApiError::from_sync)?;
    Ok(Json(report))
}

async fn sync_restore_preview(
    State(state): State<AppState>,
    Query(query): Query<RestoreQuery>,
) -> Result<Json<RestorePreview>, ApiError> {
    let preview = state
        .engine
        .preview_restore(query.mode)
        .await
        .map_err(ApiError::from_sync)?;
    Ok(Json(preview))
}

async fn sync_restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreOutcome>, ApiError> {
    let confirm = req.confirm;
    let outcome = state
        .engine
        .restore(req.mode, move |_| confirm)
        .await
        .map_err(ApiError::from_sync)?;
    Ok(Json(outcome))
}

async fn sync_drain(State(state): State<AppState>) -> Result<Json<DrainReport>, ApiError> {
    let report = state.engine.drain().await.map_err(ApiError::from_sync)?;
    Ok(Json(report))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/transactions",
            get(list_transactions).post(create_transaction),
        )
        .route(
            "/api/transactions/{id}",
            get(get_transaction)
                .put(update_transaction)
                .delete(delete_transaction),
        )
        .route(
            "/api/categories",
            get(list_categories).post(create_category),
        )
        .route(
            "/api/categories/{id}",
            axum::routing::put(update_category).delete(deactivate_category),
        )
        .route("/api/summary/{month}", get(get_monthly_summary))
        .route("/api/sync/status", get(sync_status))
        .route("/api/sync/connect", post(sync_connect))
        .route("/api/sync/disconnect", post(sync_disconnect))
        .route("/api/sync/backup", post(sync_backup))
        .route(
            "/api/sync/restore",
            get(sync_restore_preview).post(sync_restore),
        )
        .route("/api/sync/drain", post(sync_drain))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn start_server(
    ledger: SharedLedger,
    engine: Arc<SyncEngine>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let state = AppState {
        ledger,
        engine: Arc::clone(&engine),
        api_key: api_key.clone(),
    };
    let app = build_router(state);

    if let Some(ref key) = api_key {
        if new_api_key {
            eprintln!("Generated API key: {key}");
        } else {
            eprintln!(
                "API key: {}...{} (see api_key file in data directory)",
                &key[..4],
                &key[key.len() - 4..],
            );
        }
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let drain_task = engine.spawn_drain_task(DRAIN_INTERVAL);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    let served = axum::serve(listener, app).await;

    drain_task.abort();
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tally_core::memory::MemoryWorkbook;
    use tally_core::sheets::SheetName;
    use tally_core::sync::RetryPolicy;
    use tower::ServiceExt;

    struct Harness {
        state: AppState,
        workbook: Arc<MemoryWorkbook>,
    }

    impl Harness {
        fn new(api_key: Option<String>) -> Self {
            let ledger: SharedLedger =
                Arc::new(Mutex::new(LedgerService::new_in_memory().unwrap()));
            let workbook = Arc::new(MemoryWorkbook::new());
            let engine = Arc::new(SyncEngine::new(
                ledger.clone(),
                workbook.clone(),
                RetryPolicy::default(),
            ));
            Self {
                state: AppState {
                    ledger,
                    engine,
                    api_key,
                },
                workbook,
            }
        }

        fn app(&self) -> Router {
            build_router(self.state.clone())
        }

        async fn send(
            &self,
            request: axum::http::Request<Body>,
        ) -> (StatusCode, serde_json::Value) {
            let response = self.app().oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
            (status, json)
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            self.send(axum::http::Request::get(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn post(
            &self,
            uri: &str,
            body: serde_json::Value,
        ) -> (StatusCode, serde_json::Value) {
            self.send(json_request("POST", uri, &body)).await
        }

        async fn put(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
            self.send(json_request("PUT", uri, &body)).await
        }

        async fn delete(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            self.send(
                axum::http::Request::delete(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        }

        async fn category(&self, name: &str, kind: &str) -> String {
            let (status, json) = self
                .post(
                    "/api/categories",
                    serde_json::json!({ "name": name, "type": kind }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            json["id"].as_str().unwrap().to_string()
        }
    }

    fn json_request(
        method: &str,
        uri: &str,
        body: &serde_json::Value,
    ) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let harness = Harness::new(Some("test-key-abc123".to_string()));

        let (status, json) = harness.get("/api/transactions").await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let harness = Harness::new(Some("test-key-abc123".to_string()));

        let (status, _) = harness
            .send(
                axum::http::Request::get("/api/transactions")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let harness = Harness::new(Some("test-key-abc123".to_string()));

        let (status, json) = harness
            .send(
                axum::http::Request::get("/api/transactions")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let harness = Harness::new(Some("secret".to_string()));

        let response = harness
            .app()
            .oneshot(
                axum::http::Request::get("/api/sync/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let harness = Harness::new(None);

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let (status, _) = harness
            .send(
                axum::http::Request::post("/api/transactions")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error =
            ApiError::Internal(anyhow::anyhow!("secret database path /home/user/.tally/db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }

    #[tokio::test]
    async fn transaction_crud() {
        let harness = Harness::new(None);
        let food = harness.category("Food", "expense").await;

        let (status, created) = harness
            .post(
                "/api/transactions",
                serde_json::json!({
                    "date": "2024-03-15",
                    "type": "expense",
                    "amount": 1200,
                    "categoryId": food,
                    "memo": "lunch"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["month"], "2024-03");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, fetched) = harness.get(&format!("/api/transactions/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["amount"], 1200);

        let (status, updated) = harness
            .put(
                &format!("/api/transactions/{id}"),
                serde_json::json!({ "date": "2024-04-01", "memo": null }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["month"], "2024-04");
        assert!(updated.get("memo").is_none());

        let (_, march) = harness.get("/api/transactions?month=2024-03").await;
        assert_eq!(march, serde_json::json!([]));
        let (_, april) = harness.get("/api/transactions?month=2024-04").await;
        assert_eq!(april.as_array().unwrap().len(), 1);

        let (status, _) = harness.delete(&format!("/api/transactions/{id}")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = harness.get(&format!("/api/transactions/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_transaction_input_returns_400() {
        let harness = Harness::new(None);
        let salary = harness.category("Salary", "income").await;

        let (status, _) = harness
            .post(
                "/api/transactions",
                serde_json::json!({
                    "date": "2024-13-01",
                    "type": "income",
                    "amount": 10,
                    "categoryId": salary
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = harness
            .post(
                "/api/transactions",
                serde_json::json!({
                    "date": "2024-01-01",
                    "type": "income",
                    "amount": -5,
                    "categoryId": salary
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = harness
            .post(
                "/api/transactions",
                serde_json::json!({
                    "date": "2024-01-01",
                    "type": "expense",
                    "amount": 5,
                    "categoryId": salary
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("income"));

        let (status, _) = harness.get("/api/transactions?month=2024-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_missing_transaction_returns_404() {
        let harness = Harness::new(None);

        let (status, _) = harness
            .put("/api/transactions/nope", serde_json::json!({ "amount": 3 }))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = harness.delete("/api/transactions/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_update_returns_400() {
        let harness = Harness::new(None);

        let (status, _) = harness
            .put("/api/transactions/any", serde_json::json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn category_delete_is_soft() {
        let harness = Harness::new(None);
        let id = harness.category("Travel", "expense").await;

        let (status, json) = harness.delete(&format!("/api/categories/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active"], false);

        let (_, active) = harness.get("/api/categories").await;
        assert_eq!(active, serde_json::json!([]));
        let (_, all) = harness.get("/api/categories?includeInactive=true").await;
        assert_eq!(all.as_array().unwrap().len(), 1);

        let (status, _) = harness.delete("/api/categories/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_category_name_returns_400() {
        let harness = Harness::new(None);
        harness.category("Food", "expense").await;

        let (status, _) = harness
            .post(
                "/api/categories",
                serde_json::json!({ "name": "food", "type": "expense" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, by_kind) = harness.get("/api/categories?type=income").await;
        assert_eq!(by_kind, serde_json::json!([]));
    }

    #[tokio::test]
    async fn monthly_summary_totals() {
        let harness = Harness::new(None);
        let salary = harness.category("Salary", "income").await;
        let rent = harness.category("Rent", "expense").await;
        for (kind, amount, category) in [("income", 3000, &salary), ("expense", 1200, &rent)] {
            let (status, _) = harness
                .post(
                    "/api/transactions",
                    serde_json::json!({
                        "date": "2024-05-02",
                        "type": kind,
                        "amount": amount,
                        "categoryId": category
                    }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, summary) = harness.get("/api/summary/2024-05").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["totalIncome"], 3000);
        assert_eq!(summary["totalExpense"], 1200);
        assert_eq!(summary["balance"], 1800);

        let (status, _) = harness.get("/api/summary/May").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backup_without_connection_returns_400() {
        let harness = Harness::new(None);

        let (status, json) = harness.post("/api/sync/backup", serde_json::json!({})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn offline_mirror_returns_502() {
        let harness = Harness::new(None);
        harness.workbook.set_offline(true);

        let (status, _) = harness
            .post("/api/sync/connect", serde_json::json!({ "sheetId": "sheet-1" }))
            .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (_, sync) = harness.get("/api/sync/status").await;
        assert_eq!(sync["connected"], false);
    }

    #[tokio::test]
    async fn connect_and_backup() {
        let harness = Harness::new(None);
        harness.category("Food", "expense").await;

        let (status, sync) = harness
            .post("/api/sync/connect", serde_json::json!({ "sheetId": "sheet-1" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sync["sheetId"], "sheet-1");

        let (status, report) = harness.post("/api/sync/backup", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["categories"], 1);

        let rows = harness
            .workbook
            .rows("sheet-1", SheetName::Categories.title());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], SheetName::Categories.header_row());

        let (_, sync) = harness.get("/api/sync/status").await;
        assert!(sync["lastSyncAt"].is_string());
        assert_eq!(sync["pendingCount"], 0);
    }

    #[tokio::test]
    async fn restore_requires_confirmation() {
        let harness = Harness::new(None);
        harness.category("Food", "expense").await;
        harness
            .post("/api/sync/connect", serde_json::json!({ "sheetId": "sheet-1" }))
            .await;
        harness.post("/api/sync/backup", serde_json::json!({})).await;
        harness.category("Fuel", "expense").await;

        let (status, preview) = harness.get("/api/sync/restore?mode=replace").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["remoteCategories"], 1);
        assert_eq!(preview["localCategories"], 2);

        let (status, outcome) = harness
            .post("/api/sync/restore", serde_json::json!({ "mode": "replace" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["applied"], false);
        let (_, categories) = harness.get("/api/categories").await;
        assert_eq!(categories.as_array().unwrap().len(), 2);

        let (status, outcome) = harness
            .post(
                "/api/sync/restore",
                serde_json::json!({ "mode": "replace", "confirm": true }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["applied"], true);
        let (_, categories) = harness.get("/api/categories").await;
        assert_eq!(categories.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_reports_queue() {
        let harness = Harness::new(None);
        harness
            .post("/api/sync/connect", serde_json::json!({ "sheetId": "sheet-1" }))
            .await;
        harness.category("Food", "expense").await;

        let (status, report) = harness.post("/api/sync/drain", serde_json::json!({})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["applied"], 1);
        assert_eq!(report["remaining"], 0);
        assert_eq!(
            harness
                .workbook
                .rows("sheet-1", SheetName::Categories.title())
                .len(),
            2
        );
    }
}
