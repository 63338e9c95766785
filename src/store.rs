use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Key-value storage keyed by shop domain.
///
/// Used for pending OAuth nonces and issued access tokens. Every operation
/// touches a single key; concurrent writers for the same shop overwrite
/// each other.
#[async_trait]
pub trait ShopStore: Send + Sync {
    async fn get(&self, shop: &str) -> Option<String>;

    async fn set(&self, shop: &str, value: String);

    /// Removes and returns the value in one step.
    async fn take(&self, shop: &str) -> Option<String>;

    async fn delete(&self, shop: &str) {
        self.take(shop).await;
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShopStore for InMemoryStore {
    async fn get(&self, shop: &str) -> Option<String> {
        self.entries.read().await.get(shop).cloned()
    }

    async fn set(&self, shop: &str, value: String) {
        self.entries.write().await.insert(shop.to_string(), value);
    }

    async fn take(&self, shop: &str) -> Option<String> {
        self.entries.write().await.remove(shop)
    }
}
