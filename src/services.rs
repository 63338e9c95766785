use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, ShopifyConfig};
use crate::error::AppError;
use crate::forwarder::OrderForwarder;
use crate::models::{ShopifyOrder, TokenExchangeRequest, TokenExchangeResponse, WebhookMeta};
use crate::signature::{constant_time_eq, verify_query_signature, verify_webhook_signature};
use crate::store::ShopStore;
use crate::transform::to_innocigs_order;

const SHOP_SUFFIX: &str = ".myshopify.com";
const INNOCIGS_CREDENTIALS: &str = "INNOCIGS_API_TOKEN or INNOCIGS_CUSTOMER_ID/INNOCIGS_API_SECRET";

/// Validates and lowercases a `*.myshopify.com` host name.
pub fn normalize_shop(raw: &str) -> Result<String, AppError> {
    let shop = raw.trim().to_ascii_lowercase();
    let valid = shop
        .strip_suffix(SHOP_SUFFIX)
        .is_some_and(|handle| {
            !handle.is_empty()
                && !handle.starts_with('-')
                && handle
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if valid {
        Ok(shop)
    } else {
        Err(AppError::InvalidShop(raw.to_string()))
    }
}

/// 32 lowercase hex characters from 16 random bytes.
pub fn generate_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Shopify OAuth install and callback handling.
#[derive(Clone)]
pub struct OAuthService {
    client: reqwest::Client,
    shopify: ShopifyConfig,
    app_url: Option<String>,
    pending: Arc<dyn ShopStore>,
    tokens: Arc<dyn ShopStore>,
}

impl OAuthService {
    pub fn new(
        client: reqwest::Client,
        config: &Config,
        pending: Arc<dyn ShopStore>,
        tokens: Arc<dyn ShopStore>,
    ) -> Self {
        Self {
            client,
            shopify: config.shopify.clone(),
            app_url: config.app_url.clone(),
            pending,
            tokens,
        }
    }

    /// Issues a nonce for `shop` and returns the authorize URL to redirect to.
    pub async fn begin_install(&self, shop: Option<&str>) -> Result<String, AppError> {
        let shop = shop
            .filter(|s| !s.trim().is_empty())
            .ok_or(AppError::MissingParameter("shop"))?;
        let shop = normalize_shop(shop)?;

        let client_id = self
            .shopify
            .api_key
            .as_deref()
            .ok_or(AppError::Configuration("SHOPIFY_API_KEY"))?;
        let app_url = self
            .app_url
            .as_deref()
            .ok_or(AppError::Configuration("APP_URL"))?;

        let nonce = generate_nonce();
        let redirect_uri = format!("{app_url}/auth/callback");
        let authorize_url = Url::parse_with_params(
            &format!("https://{shop}/admin/oauth/authorize"),
            [
                ("client_id", client_id),
                ("scope", self.shopify.scopes.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("state", nonce.as_str()),
            ],
        )
        .map_err(|_| AppError::InvalidShop(shop.clone()))?;

        if self.access_token(&shop).await.is_some() {
            info!("Shop {} is already authorized, starting a fresh install", shop);
        }
        self.pending.set(&shop, nonce).await;
        info!("Started OAuth install for shop {}", shop);

        Ok(authorize_url.into())
    }

    /// Validates a callback and stores the exchanged access token. Returns the shop.
    pub async fn complete_callback(
        &self,
        params: &[(String, String)],
    ) -> Result<String, AppError> {
        let shop = first_param(params, "shop").ok_or(AppError::MissingParameter("shop"))?;
        let code = first_param(params, "code").ok_or(AppError::MissingParameter("code"))?;
        let state = first_param(params, "state").ok_or(AppError::MissingParameter("state"))?;
        first_param(params, "hmac").ok_or(AppError::MissingParameter("hmac"))?;
        let shop = normalize_shop(shop)?;

        let client_id = self
            .shopify
            .api_key
            .as_deref()
            .ok_or(AppError::Configuration("SHOPIFY_API_KEY"))?;
        let client_secret = self
            .shopify
            .api_secret
            .as_ref()
            .map(|secret| secret.expose_secret())
            .ok_or(AppError::Configuration("SHOPIFY_API_SECRET"))?;

        // Unsigned callbacks must not be able to cancel a pending install.
        if !verify_query_signature(params, client_secret) {
            warn!("OAuth callback HMAC mismatch for shop {}", shop);
            return Err(AppError::Unauthorized("Invalid HMAC"));
        }

        // Single use: once the signature holds, the nonce is gone whatever happens next.
        let expected = self.pending.take(&shop).await.ok_or_else(|| {
            warn!("OAuth callback for shop {} without a pending install", shop);
            AppError::Unauthorized("Invalid state")
        })?;
        if !constant_time_eq(state, &expected) {
            warn!("OAuth state mismatch for shop {}", shop);
            return Err(AppError::Unauthorized("Invalid state"));
        }

        let token = self
            .exchange_code(&shop, client_id, client_secret, code)
            .await?;
        self.tokens.set(&shop, token).await;
        info!("Stored access token for shop {}", shop);

        Ok(shop)
    }

    pub async fn access_token(&self, shop: &str) -> Option<String> {
        self.tokens.get(shop).await
    }

    fn token_url(&self, shop: &str) -> String {
        match &self.shopify.admin_origin {
            Some(origin) => format!("{origin}/admin/oauth/access_token"),
            None => format!("https://{shop}/admin/oauth/access_token"),
        }
    }

    async fn exchange_code(
        &self,
        shop: &str,
        client_id: &str,
        client_secret: &str,
        code: &str,
    ) -> Result<String, AppError> {
        let response = self
            .client
            .post(self.token_url(shop))
            .json(&TokenExchangeRequest {
                client_id,
                client_secret,
                code,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::TokenExchange {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let parsed: Option<TokenExchangeResponse> = serde_json::from_str(&body).ok();
        match parsed {
            Some(TokenExchangeResponse {
                access_token: Some(token),
                scope,
            }) if !token.is_empty() => {
                debug!("Granted scopes for {}: {}", shop, scope.unwrap_or_default());
                Ok(token)
            }
            _ => Err(AppError::MissingAccessToken),
        }
    }
}

/// Verifies `orders/create` deliveries and relays them to InnoCigs.
#[derive(Clone)]
pub struct WebhookService {
    webhook_secret: Option<SecretString>,
    forwarder: Option<Arc<dyn OrderForwarder>>,
}

impl WebhookService {
    pub fn new(
        webhook_secret: Option<SecretString>,
        forwarder: Option<Arc<dyn OrderForwarder>>,
    ) -> Self {
        Self {
            webhook_secret,
            forwarder,
        }
    }

    /// `body` must be the raw request body. Once the signature checks out
    /// this returns `Ok` whether or not InnoCigs took the order.
    pub async fn handle_order_created(
        &self,
        body: &[u8],
        meta: &WebhookMeta,
    ) -> Result<(), AppError> {
        let secret = self
            .webhook_secret
            .as_ref()
            .map(|secret| secret.expose_secret())
            .ok_or(AppError::Configuration("SHOPIFY_WEBHOOK_SECRET"))?;

        if !verify_webhook_signature(body, meta.hmac.as_deref(), secret) {
            warn!(
                "Rejected webhook {} from {}: invalid signature",
                meta.webhook_id.as_deref().unwrap_or("-"),
                meta.shop_domain.as_deref().unwrap_or("-")
            );
            return Err(AppError::Unauthorized("Invalid webhook signature"));
        }

        let forwarder = self
            .forwarder
            .as_ref()
            .ok_or(AppError::Configuration(INNOCIGS_CREDENTIALS))?;

        info!(
            "Verified webhook {} ({}) from {}, content type {}",
            meta.webhook_id.as_deref().unwrap_or("-"),
            meta.topic.as_deref().unwrap_or("-"),
            meta.shop_domain.as_deref().unwrap_or("-"),
            meta.content_type.as_deref().unwrap_or("-")
        );

        let order: ShopifyOrder = match serde_json::from_slice(body) {
            Ok(order) => order,
            Err(e) => {
                error!("Verified webhook body is not an order, dropping it: {}", e);
                return Ok(());
            }
        };

        for line in order.line_items.iter().filter(|l| l.sku.is_none()) {
            warn!(
                "Line item '{}' has no SKU; forwarding with an empty article id",
                line.title.as_deref().unwrap_or("-")
            );
        }

        let request = to_innocigs_order(&order);
        info!(
            "Forwarding order {} ({}) with {} item(s)",
            request.order_id,
            order.name.as_deref().unwrap_or("-"),
            request.items.len()
        );

        match forwarder.forward(&request).await {
            Ok(outcome) if outcome.is_success() => {
                info!("InnoCigs accepted order {} ({})", request.order_id, outcome.status);
            }
            Ok(outcome) => {
                error!(
                    "InnoCigs rejected order {} ({}): {}",
                    request.order_id, outcome.status, outcome.body
                );
            }
            Err(e) => {
                error!("Forwarding order {} failed: {}", request.order_id, e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InnoCigsConfig, InnoCigsMode};
    use crate::forwarder::test_support::RecordingForwarder;
    use crate::signature::{compute_hmac_base64, compute_hmac_hex, signable_message};
    use crate::store::InMemoryStore;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SHOP: &str = "foo.myshopify.com";

    fn test_config(admin_origin: Option<String>) -> Config {
        Config {
            app_url: Some("https://relay.example.com".into()),
            bind_addr: "127.0.0.1:0".into(),
            shopify: ShopifyConfig {
                api_key: Some("client-id".into()),
                api_secret: Some("client-secret".into()),
                webhook_secret: Some("webhook-secret".into()),
                scopes: "read_orders".into(),
                admin_origin,
            },
            innocigs: InnoCigsConfig {
                api_base: "http://localhost".into(),
                mode: InnoCigsMode::Order,
                auth: None,
            },
        }
    }

    fn oauth_service(config: &Config) -> (OAuthService, InMemoryStore, InMemoryStore) {
        let pending = InMemoryStore::new();
        let tokens = InMemoryStore::new();
        let service = OAuthService::new(
            reqwest::Client::new(),
            config,
            Arc::new(pending.clone()),
            Arc::new(tokens.clone()),
        );
        (service, pending, tokens)
    }

    fn signed_callback(state: &str, secret: &str) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = [
            ("code", "auth-code"),
            ("shop", SHOP),
            ("state", state),
            ("timestamp", "1700000000"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let message = signable_message(params.iter().map(|(k, v)| (k.as_str(), v.as_str())), &[]);
        params.push(("hmac".into(), compute_hmac_hex(&message, secret)));
        params
    }

    async fn mount_token_endpoint(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/admin/oauth/access_token"))
            .and(body_json(serde_json::json!({
                "client_id": "client-id",
                "client_secret": "client-secret",
                "code": "auth-code"
            })))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[test]
    fn shop_domains_are_validated() {
        assert_eq!(normalize_shop("Foo.MyShopify.com").unwrap(), SHOP);
        assert_eq!(normalize_shop("my-shop-1.myshopify.com").unwrap(), "my-shop-1.myshopify.com");
        assert!(normalize_shop("foo.example.com").is_err());
        assert!(normalize_shop(".myshopify.com").is_err());
        assert!(normalize_shop("evil.com/x.myshopify.com").is_err());
        assert!(normalize_shop("a.b.myshopify.com").is_err());
        assert!(normalize_shop("-foo.myshopify.com").is_err());
    }

    #[test]
    fn nonce_is_32_hex_chars_and_random() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn install_stores_nonce_and_builds_authorize_url() {
        let config = test_config(None);
        let (service, pending, _) = oauth_service(&config);

        let location = service.begin_install(Some(SHOP)).await.unwrap();
        let url = Url::parse(&location).unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        assert_eq!(url.host_str(), Some(SHOP));
        assert_eq!(url.path(), "/admin/oauth/authorize");
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("client_id".into(), "client-id".into())));
        assert!(params.contains(&("scope".into(), "read_orders".into())));
        assert!(params.contains(&(
            "redirect_uri".into(),
            "https://relay.example.com/auth/callback".into()
        )));
        assert!(params.contains(&("state".into(), nonce)));
    }

    #[tokio::test]
    async fn install_requires_shop_then_configuration() {
        let mut config = test_config(None);
        config.shopify.api_key = None;
        let (service, _, _) = oauth_service(&config);

        assert!(matches!(
            service.begin_install(None).await,
            Err(AppError::MissingParameter("shop"))
        ));
        assert!(matches!(
            service.begin_install(Some(SHOP)).await,
            Err(AppError::Configuration("SHOPIFY_API_KEY"))
        ));
    }

    #[tokio::test]
    async fn repeated_install_replaces_pending_nonce() {
        let config = test_config(None);
        let (service, pending, _) = oauth_service(&config);

        service.begin_install(Some(SHOP)).await.unwrap();
        let first = pending.get(SHOP).await.unwrap();
        service.begin_install(Some(SHOP)).await.unwrap();
        let second = pending.get(SHOP).await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn callback_exchanges_code_and_stores_token() {
        let server = MockServer::start().await;
        mount_token_endpoint(
            &server,
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "shpat_123",
                "scope": "read_orders"
            })),
        )
        .await;

        let config = test_config(Some(server.uri()));
        let (service, pending, tokens) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        let shop = service
            .complete_callback(&signed_callback(&nonce, "client-secret"))
            .await
            .unwrap();

        assert_eq!(shop, SHOP);
        assert_eq!(tokens.get(SHOP).await.as_deref(), Some("shpat_123"));
        assert_eq!(service.access_token(SHOP).await.as_deref(), Some("shpat_123"));
        assert_eq!(pending.get(SHOP).await, None);
    }

    #[tokio::test]
    async fn stale_state_is_rejected_even_with_a_pending_session() {
        let config = test_config(None);
        let (service, pending, tokens) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        assert!(pending.get(SHOP).await.is_some());

        let stale = signed_callback("0123456789abcdef0123456789abcdef", "client-secret");
        let result = service.complete_callback(&stale).await;

        assert!(matches!(result, Err(AppError::Unauthorized("Invalid state"))));
        assert_eq!(tokens.get(SHOP).await, None);
    }

    #[tokio::test]
    async fn nonce_is_consumed_by_a_failed_callback() {
        let config = test_config(None);
        let (service, pending, _) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        let stale = signed_callback("0123456789abcdef0123456789abcdef", "client-secret");
        let bad = service.complete_callback(&stale).await;
        assert!(matches!(bad, Err(AppError::Unauthorized("Invalid state"))));
        assert_eq!(pending.get(SHOP).await, None);

        let replay = service
            .complete_callback(&signed_callback(&nonce, "client-secret"))
            .await;
        assert!(matches!(replay, Err(AppError::Unauthorized("Invalid state"))));
    }

    #[tokio::test]
    async fn unsigned_callback_leaves_pending_install_intact() {
        let server = MockServer::start().await;
        mount_token_endpoint(
            &server,
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "shpat_123"
            })),
        )
        .await;

        let config = test_config(Some(server.uri()));
        let (service, pending, tokens) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        let forged = service
            .complete_callback(&signed_callback("attacker-state", "wrong-secret"))
            .await;
        assert!(matches!(forged, Err(AppError::Unauthorized("Invalid HMAC"))));
        assert_eq!(pending.get(SHOP).await.as_deref(), Some(nonce.as_str()));

        let shop = service
            .complete_callback(&signed_callback(&nonce, "client-secret"))
            .await
            .unwrap();
        assert_eq!(shop, SHOP);
        assert_eq!(tokens.get(SHOP).await.as_deref(), Some("shpat_123"));
    }

    #[tokio::test]
    async fn callback_without_pending_install_is_rejected() {
        let config = test_config(None);
        let (service, _, _) = oauth_service(&config);

        let result = service
            .complete_callback(&signed_callback("anything", "client-secret"))
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn callback_reports_missing_parameters() {
        let config = test_config(None);
        let (service, _, _) = oauth_service(&config);
        let mut params = signed_callback("n", "client-secret");
        params.retain(|(k, _)| k != "code");

        assert!(matches!(
            service.complete_callback(&params).await,
            Err(AppError::MissingParameter("code"))
        ));
    }

    #[tokio::test]
    async fn token_response_without_token_is_an_error() {
        let server = MockServer::start().await;
        mount_token_endpoint(
            &server,
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"scope": "read_orders"})),
        )
        .await;

        let config = test_config(Some(server.uri()));
        let (service, pending, tokens) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        let result = service
            .complete_callback(&signed_callback(&nonce, "client-secret"))
            .await;

        assert!(matches!(result, Err(AppError::MissingAccessToken)));
        assert_eq!(tokens.get(SHOP).await, None);
    }

    #[tokio::test]
    async fn rejected_token_exchange_surfaces_status() {
        let server = MockServer::start().await;
        mount_token_endpoint(
            &server,
            ResponseTemplate::new(400).set_body_string("invalid_request"),
        )
        .await;

        let config = test_config(Some(server.uri()));
        let (service, pending, _) = oauth_service(&config);
        service.begin_install(Some(SHOP)).await.unwrap();
        let nonce = pending.get(SHOP).await.unwrap();

        let result = service
            .complete_callback(&signed_callback(&nonce, "client-secret"))
            .await;

        match result {
            Err(AppError::TokenExchange { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid_request");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn webhook_with_valid_signature_is_forwarded() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let service = WebhookService::new(Some("webhook-secret".into()), Some(forwarder.clone()));
        let body = br#"{"id":123,"line_items":[{"sku":"A1","quantity":2}]}"#;
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(body, "webhook-secret")),
            ..Default::default()
        };

        service.handle_order_created(body, &meta).await.unwrap();

        let orders = forwarder.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "123");
        assert_eq!(orders[0].items[0].article_id, "A1");
        assert_eq!(orders[0].items[0].quantity, 2);
    }

    #[tokio::test]
    async fn malformed_line_item_does_not_drop_the_order() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let service = WebhookService::new(Some("webhook-secret".into()), Some(forwarder.clone()));
        let body = serde_json::to_vec(&serde_json::json!({
            "id": 123,
            "shipping_address": "",
            "line_items": [{"sku": "A1", "quantity": 2}, null]
        }))
        .unwrap();
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(&body, "webhook-secret")),
            ..Default::default()
        };

        service.handle_order_created(&body, &meta).await.unwrap();

        let orders = forwarder.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "123");
        assert_eq!(orders[0].shipping_address.country_code, "DE");
        assert_eq!(orders[0].items.len(), 1);
        assert_eq!(orders[0].items[0].article_id, "A1");
        assert_eq!(orders[0].items[0].quantity, 2);
    }

    #[tokio::test]
    async fn downstream_rejection_is_swallowed() {
        let forwarder = Arc::new(RecordingForwarder::with_status(503));
        let service = WebhookService::new(Some("webhook-secret".into()), Some(forwarder.clone()));
        let body = br#"{"id":1}"#;
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(body, "webhook-secret")),
            ..Default::default()
        };

        assert!(service.handle_order_created(body, &meta).await.is_ok());
        assert_eq!(forwarder.orders().len(), 1);
    }

    #[tokio::test]
    async fn invalid_signature_never_reaches_forwarder() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let service = WebhookService::new(Some("webhook-secret".into()), Some(forwarder.clone()));
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(b"{}", "other-secret")),
            ..Default::default()
        };

        assert!(matches!(
            service.handle_order_created(b"{}", &meta).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(forwarder.orders().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_a_configuration_error() {
        let service = WebhookService::new(None, Some(Arc::new(RecordingForwarder::default())));
        let meta = WebhookMeta {
            hmac: Some("anything".into()),
            ..Default::default()
        };

        assert!(matches!(
            service.handle_order_created(b"{}", &meta).await,
            Err(AppError::Configuration("SHOPIFY_WEBHOOK_SECRET"))
        ));
    }

    #[tokio::test]
    async fn missing_credentials_is_a_configuration_error() {
        let service = WebhookService::new(Some("webhook-secret".into()), None);
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(b"{}", "webhook-secret")),
            ..Default::default()
        };

        assert!(matches!(
            service.handle_order_created(b"{}", &meta).await,
            Err(AppError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn verified_non_order_body_is_acknowledged_without_forwarding() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let service = WebhookService::new(Some("webhook-secret".into()), Some(forwarder.clone()));
        let body = b"not json";
        let meta = WebhookMeta {
            hmac: Some(compute_hmac_base64(body, "webhook-secret")),
            ..Default::default()
        };

        assert!(service.handle_order_created(body, &meta).await.is_ok());
        assert!(forwarder.orders().is_empty());
    }
}
