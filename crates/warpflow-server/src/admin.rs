//! Operator admin surface under `/admin/api/tokens`.
//!
//! Every mutating route writes an audit entry (through the store) and
//! answers with the `{ success, data?, detail? }` envelope. Refresh
//! tokens never leave the process: account payloads carry the masked
//! preview only.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use warpflow_core::{AccountStatus, Actor, QuotaSnapshot};
use warpflow_dispatch::{readiness, RefreshResult};
use warpflow_store::{Account, AuditFilter, ImportSpec, StoreError};

use crate::metrics::{ACCOUNTS_IMPORTED_TOTAL, ADMIN_REFRESH_TOTAL};
use crate::state::AppState;

/// Accounts hydrated concurrently after an import.
const HYDRATE_CONCURRENCY: usize = 3;
/// How long a forced refresh waits for a busy account.
const ADMIN_LOCK_WAIT: std::time::Duration = std::time::Duration::from_secs(15);

/// Admin routes under `/admin/api/tokens`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/api/tokens",
            get(list_accounts).post(add_account),
        )
        .route("/admin/api/tokens/batch-import", post(batch_import))
        .route("/admin/api/tokens/batch-delete", post(batch_delete))
        .route("/admin/api/tokens/refresh-all", post(refresh_all))
        .route("/admin/api/tokens/statistics", get(statistics))
        .route("/admin/api/tokens/health", get(health))
        .route("/admin/api/tokens/readiness", get(readiness_route))
        .route("/admin/api/tokens/events", get(events))
        .route(
            "/admin/api/tokens/{id}",
            get(get_account).patch(patch_account).delete(delete_account),
        )
        .route("/admin/api/tokens/{id}/refresh", post(refresh_account))
}

// ── Envelope & errors ────────────────────────────────────────────────────

fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Handler error carrying its HTTP status.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "detail": self.detail })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => Self::not_found(format!("account {id} not found")),
            StoreError::DuplicateAccount(_) | StoreError::InvalidOperation(_) => {
                Self::bad_request(err.to_string())
            }
            other => {
                warn!(error = %other, "admin operation failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

// ── Payload shapes ───────────────────────────────────────────────────────

/// Masked account as returned by every route.
#[derive(Serialize)]
struct AccountView {
    id: i64,
    label: Option<String>,
    email: Option<String>,
    token_preview: String,
    status: AccountStatus,
    use_count: i64,
    error_count: i64,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    last_success_at: Option<String>,
    last_check_at: Option<String>,
    cooldown_until: Option<String>,
    quota: Option<QuotaSnapshot>,
    quota_updated_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            label: account.label,
            email: account.email,
            token_preview: account.token_preview,
            status: account.status,
            use_count: account.use_count,
            error_count: account.error_count,
            last_error_code: account.last_error_code,
            last_error_message: account.last_error_message,
            last_success_at: account.last_success_at,
            last_check_at: account.last_check_at,
            cooldown_until: account.cooldown_until,
            quota: account.quota,
            quota_updated_at: account.quota_updated_at,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct AddTokenRequest {
    token: String,
    label: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize, Default)]
struct BatchImportRequest {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    accounts: Vec<ImportSpec>,
}

#[derive(Deserialize, Default)]
struct BatchImportQuery {
    #[serde(default)]
    hydrate: bool,
}

#[derive(Deserialize)]
struct PatchRequest {
    label: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct BatchDeleteRequest {
    ids: Vec<i64>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<u32>,
    account_id: Option<i64>,
    action: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn list_accounts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let views: Vec<AccountView> = state
        .store
        .list()?
        .into_iter()
        .map(AccountView::from)
        .collect();
    Ok(ok(views))
}

async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let account = state.store.require(id)?;
    Ok(ok(AccountView::from(account)))
}

async fn add_account(
    State(state): State<AppState>,
    Json(body): Json<AddTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.store.insert(
        &ImportSpec {
            refresh_token: body.token,
            label: body.label,
            email: body.email,
        },
        Actor::Admin,
    )?;
    counter!(ACCOUNTS_IMPORTED_TOTAL).increment(1);
    Ok(ok(outcome))
}

async fn batch_import(
    State(state): State<AppState>,
    Query(query): Query<BatchImportQuery>,
    Json(body): Json<BatchImportRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut specs: Vec<ImportSpec> = body
        .tokens
        .into_iter()
        .map(|token| ImportSpec {
            refresh_token: token,
            label: None,
            email: None,
        })
        .collect();
    specs.extend(body.accounts);
    if specs.is_empty() {
        return Err(ApiError::bad_request("no tokens or accounts provided"));
    }

    let summary = state.store.batch_import(&specs, Actor::Admin)?;
    counter!(ACCOUNTS_IMPORTED_TOTAL).increment(u64::from(summary.inserted));

    let mut data = serde_json::to_value(&summary).map_err(StoreError::from)?;
    if query.hydrate {
        let inserted_ids: Vec<i64> = summary
            .rows
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                warpflow_store::ImportOutcome::Inserted { id } => Some(*id),
                _ => None,
            })
            .collect();
        let (hydrated, failed) = hydrate_accounts(&state, &inserted_ids).await;
        data["hydrated"] = json!(hydrated);
        data["hydrate_failed"] = json!(failed);
    }
    Ok(Json(json!({ "success": true, "data": data })))
}

/// Refresh freshly imported accounts so quota and status are known
/// immediately, a few at a time.
async fn hydrate_accounts(state: &AppState, ids: &[i64]) -> (usize, usize) {
    let results: Vec<bool> = futures::stream::iter(ids.iter().copied())
        .map(|id| async move {
            let Some(_guard) = state.locks.acquire_timeout(id, ADMIN_LOCK_WAIT).await else {
                return false;
            };
            let Ok(account) = state.store.require(id) else {
                return false;
            };
            matches!(
                state.refresh.refresh_account(&account, Actor::Admin).await,
                Ok(RefreshResult::Ok(_))
            )
        })
        .buffer_unordered(HYDRATE_CONCURRENCY)
        .collect()
        .await;
    let hydrated = results.iter().filter(|ok| **ok).count();
    (hydrated, results.len() - hydrated)
}

async fn patch_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PatchRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = match body.status.as_deref() {
        None => None,
        Some(raw) => Some(
            AccountStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid status: {raw}")))?,
        ),
    };
    let account = state
        .store
        .update_admin(id, body.label.as_deref(), status, Actor::Admin)?;
    Ok(ok(AccountView::from(account)))
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete(id, Actor::Admin)? {
        return Err(ApiError::not_found(format!("account {id} not found")));
    }
    Ok(ok(json!({ "deleted": true, "id": id })))
}

async fn batch_delete(
    State(state): State<AppState>,
    Json(body): Json<BatchDeleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let (requested, deleted) = state.store.batch_delete(&body.ids, Actor::Admin)?;
    Ok(ok(json!({
        "requested": requested,
        "deleted": deleted,
        "missing": requested - deleted,
    })))
}

async fn refresh_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let account = state.store.require(id)?;
    let Some(_guard) = state.locks.acquire_timeout(id, ADMIN_LOCK_WAIT).await else {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("account {id} is busy"),
        ));
    };

    match state.refresh.refresh_account(&account, Actor::Admin).await? {
        RefreshResult::Ok(updated) => {
            counter!(ADMIN_REFRESH_TOTAL, "outcome" => "ok").increment(1);
            Ok(ok(json!({
                "refreshed": true,
                "account": AccountView::from(updated),
            })))
        }
        RefreshResult::Failed { code, message, .. } => {
            counter!(ADMIN_REFRESH_TOTAL, "outcome" => "failed").increment(1);
            let account = state.store.require(id).ok().map(AccountView::from);
            Ok(ok(json!({
                "refreshed": false,
                "code": code,
                "detail": message,
                "account": account,
            })))
        }
    }
}

async fn refresh_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let accounts = state.store.list()?;
    let total = accounts.len();
    let mut refreshed = 0usize;
    let mut failed = 0usize;
    let mut skipped_busy = 0usize;

    for account in accounts {
        let Some(_guard) = state.locks.try_acquire(account.id) else {
            skipped_busy += 1;
            continue;
        };
        match state.refresh.refresh_account(&account, Actor::Admin).await? {
            RefreshResult::Ok(_) => refreshed += 1,
            RefreshResult::Failed { .. } => failed += 1,
        }
    }

    Ok(ok(json!({
        "total": total,
        "refreshed": refreshed,
        "failed": failed,
        "skipped_busy": skipped_busy,
    })))
}

async fn statistics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(ok(state.store.statistics()?))
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let monitor = state.monitor.status()?;
    let snapshots = state.store.list_health()?;
    Ok(ok(json!({
        "monitor": monitor,
        "snapshots": snapshots,
    })))
}

async fn readiness_route(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let accounts = state.store.list()?;
    Ok(ok(readiness(&accounts, Utc::now())))
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = AuditFilter {
        account_id: query.account_id,
        action: query.action,
    };
    let events = state
        .store
        .list_audit(&filter, query.limit.unwrap_or(100))?;
    Ok(ok(events))
}
