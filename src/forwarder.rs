use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::{InnoCigsAuth, InnoCigsConfig, InnoCigsMode};
use crate::error::AppError;
use crate::models::InnoCigsOrder;

pub const COMPOSITE_AUTH_HEADER: &str = "X-Innocigs-Auth";

/// What InnoCigs answered. Non-2xx answers are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub status: u16,
    pub body: String,
}

impl ForwardOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait OrderForwarder: Send + Sync {
    /// Sends one order downstream. Only transport failures are `Err`.
    async fn forward(&self, order: &InnoCigsOrder) -> Result<ForwardOutcome, AppError>;
}

pub struct HttpForwarder {
    client: reqwest::Client,
    endpoint: String,
    auth: InnoCigsAuth,
}

impl HttpForwarder {
    pub fn new(
        client: reqwest::Client,
        api_base: &str,
        mode: InnoCigsMode,
        auth: InnoCigsAuth,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint_for(api_base, mode),
            auth,
        }
    }

    /// `None` when no InnoCigs credentials are configured.
    pub fn from_config(client: reqwest::Client, config: &InnoCigsConfig) -> Option<Self> {
        let auth = config.auth.clone()?;
        Some(Self::new(client, &config.api_base, config.mode, auth))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn endpoint_for(api_base: &str, mode: InnoCigsMode) -> String {
    format!("{}/{}", api_base.trim_end_matches('/'), mode.path())
}

#[async_trait]
impl OrderForwarder for HttpForwarder {
    async fn forward(&self, order: &InnoCigsOrder) -> Result<ForwardOutcome, AppError> {
        let request = self.client.post(&self.endpoint).json(order);
        let request = match &self.auth {
            InnoCigsAuth::Composite { id, secret } => {
                let value = format!("{id}:{}", secret.expose_secret());
                request.header(COMPOSITE_AUTH_HEADER, value)
            }
            InnoCigsAuth::Bearer(token) => request.bearer_auth(token.expose_secret()),
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_else(|e| {
            warn!("Failed to read InnoCigs response body: {}", e);
            String::new()
        });

        debug!("InnoCigs answered {} for order {}: {}", status, order.order_id, body);

        Ok(ForwardOutcome { status, body })
    }
}
