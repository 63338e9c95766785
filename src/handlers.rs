use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use url::form_urlencoded;

use crate::config::Config;
use crate::error::AppError;
use crate::forwarder::OrderForwarder;
use crate::models::{HealthResponse, InstallQuery, WebhookMeta};
use crate::services::{OAuthService, WebhookService};
use crate::store::InMemoryStore;

pub const SERVICE_NAME: &str = "innocigs-connector";
pub const HEADER_HMAC: &str = "x-shopify-hmac-sha256";
const HEADER_TOPIC: &str = "x-shopify-topic";
const HEADER_SHOP_DOMAIN: &str = "x-shopify-shop-domain";
const HEADER_WEBHOOK_ID: &str = "x-shopify-webhook-id";
const MAX_WEBHOOK_BODY: usize = 1_048_576;

#[derive(Clone)]
pub struct AppState {
    pub webhook_service: WebhookService,
    pub oauth_service: OAuthService,
}

impl AppState {
    /// Wires services with fresh in-memory stores.
    pub fn new(
        config: &Config,
        client: reqwest::Client,
        forwarder: Option<Arc<dyn OrderForwarder>>,
    ) -> Self {
        Self {
            webhook_service: WebhookService::new(config.shopify.webhook_secret.clone(), forwarder),
            oauth_service: OAuthService::new(
                client,
                config,
                Arc::new(InMemoryStore::new()),
                Arc::new(InMemoryStore::new()),
            ),
        }
    }
}

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/auth", get(begin_install))
        .route("/auth/callback", get(oauth_callback))
        .route("/webhooks/orders-create", post(orders_create_webhook))
        .fallback(|| async { AppError::NotFound })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state)
}

async fn liveness() -> &'static str {
    "innocigs-connector is running"
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: SERVICE_NAME,
    })
}

async fn begin_install(
    State(state): State<AppState>,
    Query(query): Query<InstallQuery>,
) -> Result<Response, AppError> {
    let location = state
        .oauth_service
        .begin_install(query.shop.as_deref())
        .await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

async fn oauth_callback(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<String, AppError> {
    let params: Vec<(String, String)> = query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let shop = state.oauth_service.complete_callback(&params).await?;
    Ok(format!("App installed for {shop}"))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The body is taken as raw bytes; it is hashed before anything parses it.
async fn orders_create_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<&'static str, AppError> {
    if body.len() > MAX_WEBHOOK_BODY {
        return Err(AppError::PayloadTooLarge);
    }

    let meta = WebhookMeta {
        hmac: header_value(&headers, HEADER_HMAC),
        content_type: header_value(&headers, header::CONTENT_TYPE.as_str()),
        topic: header_value(&headers, HEADER_TOPIC),
        shop_domain: header_value(&headers, HEADER_SHOP_DOMAIN),
        webhook_id: header_value(&headers, HEADER_WEBHOOK_ID),
    };

    state
        .webhook_service
        .handle_order_created(&body, &meta)
        .await?;

    info!("Acknowledged orders/create webhook ({} bytes)", body.len());
    Ok("ok")
}
