use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use secrecy::SecretString;
use tracing::info;

pub const DEFAULT_SCOPES: &str = "read_orders,write_orders,read_products";
pub const DEFAULT_INNOCIGS_API_BASE: &str = "https://api.innocigs.com/v1";
const DEFAULT_PORT: &str = "10000";

/// Which InnoCigs intake endpoint orders are posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InnoCigsMode {
    #[default]
    Order,
    Dropship,
}

impl InnoCigsMode {
    pub fn path(self) -> &'static str {
        match self {
            InnoCigsMode::Order => "order",
            InnoCigsMode::Dropship => "dropship",
        }
    }
}

impl FromStr for InnoCigsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "order" => Ok(InnoCigsMode::Order),
            "dropship" => Ok(InnoCigsMode::Dropship),
            other => Err(anyhow!(
                "INNOCIGS_MODE must be 'order' or 'dropship', got '{other}'"
            )),
        }
    }
}

impl fmt::Display for InnoCigsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Credentials presented to the InnoCigs API.
#[derive(Debug, Clone)]
pub enum InnoCigsAuth {
    /// Sent as `X-Innocigs-Auth: {id}:{secret}`.
    Composite { id: String, secret: SecretString },
    /// Sent as `Authorization: Bearer {token}`.
    Bearer(SecretString),
}

#[derive(Debug, Clone, Default)]
pub struct ShopifyConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
    pub scopes: String,
    /// Overrides `https://{shop}` as the origin of the token exchange call.
    pub admin_origin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InnoCigsConfig {
    pub api_base: String,
    pub mode: InnoCigsMode,
    pub auth: Option<InnoCigsAuth>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_url: Option<String>,
    pub bind_addr: String,
    pub shopify: ShopifyConfig,
    pub innocigs: InnoCigsConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source. Empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let app_url = var("APP_URL").map(|u| u.trim_end_matches('/').to_string());
        if let Some(ref url) = app_url {
            info!("Using configured APP_URL: {}", url);
        } else {
            info!("No APP_URL configured, OAuth install is disabled");
        }

        let bind_addr = var("BIND_ADDR")
            .or_else(|| var("PORT").map(|p| format!("0.0.0.0:{p}")))
            .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_PORT}"));

        let api_secret = var("SHOPIFY_API_SECRET");
        let shopify = ShopifyConfig {
            api_key: var("SHOPIFY_API_KEY"),
            webhook_secret: var("SHOPIFY_WEBHOOK_SECRET")
                .or_else(|| api_secret.clone())
                .map(SecretString::from),
            api_secret: api_secret.map(SecretString::from),
            scopes: var("SHOPIFY_SCOPES").unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
            admin_origin: var("SHOPIFY_ADMIN_ORIGIN").map(|o| o.trim_end_matches('/').to_string()),
        };

        let mode = match var("INNOCIGS_MODE") {
            Some(raw) => raw.parse()?,
            None => InnoCigsMode::default(),
        };

        let auth = match (
            var("INNOCIGS_API_TOKEN"),
            var("INNOCIGS_CUSTOMER_ID"),
            var("INNOCIGS_API_SECRET"),
        ) {
            (Some(token), _, _) => Some(InnoCigsAuth::Bearer(token.into())),
            (None, Some(id), Some(secret)) => Some(InnoCigsAuth::Composite {
                id,
                secret: secret.into(),
            }),
            _ => None,
        };

        let innocigs = InnoCigsConfig {
            api_base: var("INNOCIGS_API_BASE")
                .map(|b| b.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_INNOCIGS_API_BASE.to_string()),
            mode,
            auth,
        };

        Ok(Self {
            app_url,
            bind_addr,
            shopify,
            innocigs,
        })
    }

    pub fn log_startup_info(&self) {
        info!("Listening on {}", self.bind_addr);
        info!(
            "Forwarding orders to {}/{} ({} mode)",
            self.innocigs.api_base,
            self.innocigs.mode.path(),
            self.innocigs.mode
        );

        if self.shopify.webhook_secret.is_none() {
            tracing::warn!("No Shopify webhook secret set; webhooks will be rejected with 500");
        }
        if self.innocigs.auth.is_none() {
            tracing::warn!("No InnoCigs credentials set; webhooks will be rejected with 500");
        }
    }
}
