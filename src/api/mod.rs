//! HTTP API for health checks, ledger stats and transaction status

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::engine::TxManager;
use crate::error::{TxmError, TxmResult};
use crate::store::TransactionStats;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TxManager>,
    pub chain_manager: Arc<ChainManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions/:id", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    manager: Arc<TxManager>,
    chain_manager: Arc<ChainManager>,
) -> TxmResult<()> {
    let app = router(AppState {
        manager,
        chain_manager,
        started_at: Instant::now(),
    });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxmError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - ledger store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.manager.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);
    let ready = db_ok && chains_ok;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

/// Transaction counts by state
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)),
        Err(e) => {
            error!("Failed to load stats: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TransactionStats::default()),
            )
        }
    }
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(tx_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid transaction id: {}", id));
    };

    match state.manager.get_transaction(tx_id).await {
        Ok(tx) => (StatusCode::OK, Json(tx)).into_response(),
        Err(e @ TxmError::TransactionNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => {
            error!("Failed to load transaction {}: {}", tx_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChainContext, QueueLimits};
    use crate::locks::{AccountLocks, LocalLeases};
    use crate::store::{InMemoryTxStore, NewTransaction, TxStore};
    use crate::testing::{keystore_with_key, FakeChain};
    use crate::tx::{FeeModel, GasPolicy, RetryPolicy};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::{Address, Bytes, U256};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<TxManager>, Address) {
        let store: Arc<dyn TxStore> = Arc::new(InMemoryTxStore::new());
        let chain = Arc::new(FakeChain::new(1));
        let (keystore, from) = keystore_with_key(1);

        let chain_manager = Arc::new(ChainManager::empty());
        chain_manager.insert(chain.clone());

        let manager = Arc::new(TxManager::new(store.clone(), Arc::new(LocalLeases::new())));
        manager.add_chain(Arc::new(ChainContext::new(
            chain,
            store,
            keystore,
            GasPolicy::new(FeeModel::Legacy, 3, 1.2, 100, 1).unwrap(),
            RetryPolicy::new(
                0,
                Duration::from_millis(1),
                Duration::from_millis(1),
                Duration::from_secs(1),
            ),
            Arc::new(AccountLocks::new()),
            QueueLimits::default(),
        )));

        let router = router(AppState {
            manager: manager.clone(),
            chain_manager,
            started_at: Instant::now(),
        });
        (router, manager, from)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (app, _, _) = app();

        let (status, body) = get(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get(app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"][0]["chain_id"], 1);
    }

    #[tokio::test]
    async fn test_transaction_status_and_stats() {
        let (app, manager, from) = app();
        let id = manager
            .create_transaction(&NewTransaction {
                chain_id: 1,
                from,
                to: Address::repeat_byte(0x55),
                value: U256::one(),
                data: Bytes::default(),
                gas_limit: 21_000,
            })
            .await
            .unwrap();

        let (status, body) = get(app.clone(), &format!("/transactions/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "in_progress");
        assert_eq!(body["nonce"], 0);

        let (status, body) = get(app.clone(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["in_progress"], 1);

        let (status, _) = get(app.clone(), &format!("/transactions/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(app, "/transactions/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
