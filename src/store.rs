use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::fixtures::demo_config;
use crate::types::{ApiKey, ClientConfig, Lead, NewLead};

const FEED_CAPACITY: usize = 64;
pub const API_KEY_PREFIX: &str = "ansury_";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn generate_api_key() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{API_KEY_PREFIX}{}", &random[..24])
}

/// Row-fetch/upsert/subscribe contract over client configuration, API keys and leads.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_client(&self, id: &str) -> Result<Option<ClientConfig>, StoreError>;

    /// Insert or replace the row keyed by `config.id`. Last writer wins.
    async fn upsert_client(&self, config: ClientConfig) -> Result<ClientConfig, StoreError>;

    /// Live view of one client row. Dropping the subscription unsubscribes.
    fn subscribe(&self, client_id: &str) -> ConfigSubscription;

    async fn find_api_key(&self, client_id: &str, key: &str)
        -> Result<Option<ApiKey>, StoreError>;

    async fn list_api_keys(&self, client_id: &str) -> Result<Vec<ApiKey>, StoreError>;

    async fn create_api_key(&self, client_id: &str, name: &str) -> Result<ApiKey, StoreError>;

    /// Hard delete. Returns whether a key was removed.
    async fn revoke_api_key(&self, id: &str) -> Result<bool, StoreError>;

    async fn insert_lead(&self, lead: NewLead) -> Result<Lead, StoreError>;

    async fn list_leads(&self, client_id: &str) -> Result<Vec<Lead>, StoreError>;
}

/// In-process fan-out of configuration rows as they change.
#[derive(Clone)]
pub struct ConfigFeed {
    tx: broadcast::Sender<ClientConfig>,
}

impl Default for ConfigFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }
}

impl ConfigFeed {
    pub fn publish(&self, config: ClientConfig) {
        // No receivers is the common case when no widget is mounted.
        let _ = self.tx.send(config);
    }

    pub fn subscribe(&self, client_id: &str) -> ConfigSubscription {
        ConfigSubscription {
            client_id: client_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct ConfigSubscription {
    client_id: String,
    rx: broadcast::Receiver<ClientConfig>,
}

impl ConfigSubscription {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Next value of the subscribed row, or `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<ClientConfig> {
        loop {
            match self.rx.recv().await {
                Ok(config) if config.id == self.client_id => return Some(config),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        client_id = %self.client_id,
                        skipped,
                        "config subscription lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Store,
    Demo,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: ClientConfig,
    pub source: ConfigSource,
}

/// Store lookup with the demo table as fallback. A store failure only
/// surfaces when the demo table cannot answer either.
pub async fn resolve_config(
    store: &dyn ConfigStore,
    client_id: &str,
) -> Result<Option<ResolvedConfig>, StoreError> {
    let stored = match store.get_client(client_id).await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!(client_id, error = %err, "config lookup failed, checking demo table");
            return match demo_config(client_id) {
                Some(config) => Ok(Some(ResolvedConfig {
                    config,
                    source: ConfigSource::Demo,
                })),
                None => Err(err),
            };
        }
    };

    if let Some(config) = stored {
        return Ok(Some(ResolvedConfig {
            config,
            source: ConfigSource::Store,
        }));
    }

    Ok(demo_config(client_id).map(|config| ResolvedConfig {
        config,
        source: ConfigSource::Demo,
    }))
}

#[derive(Default)]
pub struct MemoryStore {
    clients: RwLock<HashMap<String, ClientConfig>>,
    api_keys: RwLock<Vec<ApiKey>>,
    leads: RwLock<Vec<Lead>>,
    feed: ConfigFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_client(&self, id: &str) -> Result<Option<ClientConfig>, StoreError> {
        Ok(self.clients.read().await.get(id).cloned())
    }

    async fn upsert_client(&self, mut config: ClientConfig) -> Result<ClientConfig, StoreError> {
        {
            let mut clients = self.clients.write().await;
            config.created_at = clients
                .get(&config.id)
                .map(|existing| existing.created_at.clone())
                .unwrap_or_else(now_iso);
            clients.insert(config.id.clone(), config.clone());
        }
        self.feed.publish(config.clone());
        Ok(config)
    }

    fn subscribe(&self, client_id: &str) -> ConfigSubscription {
        self.feed.subscribe(client_id)
    }

    async fn find_api_key(
        &self,
        client_id: &str,
        key: &str,
    ) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .api_keys
            .read()
            .await
            .iter()
            .find(|record| record.client_id == client_id && record.key == key)
            .cloned())
    }

    async fn list_api_keys(&self, client_id: &str) -> Result<Vec<ApiKey>, StoreError> {
        Ok(self
            .api_keys
            .read()
            .await
            .iter()
            .filter(|record| record.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn create_api_key(&self, client_id: &str, name: &str) -> Result<ApiKey, StoreError> {
        if !self.clients.read().await.contains_key(client_id) {
            return Err(StoreError::UnknownClient(client_id.to_string()));
        }
        let record = ApiKey {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            key: generate_api_key(),
            name: name.to_string(),
            created_at: now_iso(),
        };
        self.api_keys.write().await.push(record.clone());
        Ok(record)
    }

    async fn revoke_api_key(&self, id: &str) -> Result<bool, StoreError> {
        let mut keys = self.api_keys.write().await;
        let before = keys.len();
        keys.retain(|record| record.id != id);
        Ok(keys.len() != before)
    }

    async fn insert_lead(&self, lead: NewLead) -> Result<Lead, StoreError> {
        let record = Lead {
            id: Uuid::new_v4().to_string(),
            client_id: lead.client_id,
            name: lead.name,
            email: lead.email,
            phone: lead.phone,
            chat_transcript: lead.chat_transcript,
            created_at: now_iso(),
        };
        self.leads.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_leads(&self, client_id: &str) -> Result<Vec<Lead>, StoreError> {
        Ok(self
            .leads
            .read()
            .await
            .iter()
            .filter(|lead| lead.client_id == client_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fixtures::fallback_profile;
    use crate::types::ChatMessage;

    pub(crate) fn stored_client(id: &str) -> ClientConfig {
        ClientConfig {
            id: id.to_string(),
            name: "Acme Bot".to_string(),
            greeting: "Welcome to Acme".to_string(),
            system_instruction: "Sell anvils.".to_string(),
            authorized_origins: vec!["https://acme.example".to_string()],
            ..fallback_profile()
        }
    }

    /// Store whose every call fails, for exercising error paths.
    pub(crate) struct BrokenStore {
        pub feed: ConfigFeed,
    }

    fn broken() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl ConfigStore for BrokenStore {
        async fn get_client(&self, _id: &str) -> Result<Option<ClientConfig>, StoreError> {
            Err(broken())
        }
        async fn upsert_client(&self, _config: ClientConfig) -> Result<ClientConfig, StoreError> {
            Err(broken())
        }
        fn subscribe(&self, client_id: &str) -> ConfigSubscription {
            self.feed.subscribe(client_id)
        }
        async fn find_api_key(&self, _: &str, _: &str) -> Result<Option<ApiKey>, StoreError> {
            Err(broken())
        }
        async fn list_api_keys(&self, _: &str) -> Result<Vec<ApiKey>, StoreError> {
            Err(broken())
        }
        async fn create_api_key(&self, _: &str, _: &str) -> Result<ApiKey, StoreError> {
            Err(broken())
        }
        async fn revoke_api_key(&self, _: &str) -> Result<bool, StoreError> {
            Err(broken())
        }
        async fn insert_lead(&self, _: NewLead) -> Result<Lead, StoreError> {
            Err(broken())
        }
        async fn list_leads(&self, _: &str) -> Result<Vec<Lead>, StoreError> {
            Err(broken())
        }
    }

    #[test]
    fn generated_keys_have_prefix_and_length() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + 24);
        assert_ne!(key, generate_api_key());
    }

    #[tokio::test]
    async fn resolve_prefers_store_then_demo() {
        let store = MemoryStore::new();
        let resolved = resolve_config(&store, "ansury-lux-123").await.unwrap().unwrap();
        assert_eq!(resolved.source, ConfigSource::Demo);

        store.upsert_client(stored_client("ansury-lux-123")).await.unwrap();
        let resolved = resolve_config(&store, "ansury-lux-123").await.unwrap().unwrap();
        assert_eq!(resolved.source, ConfigSource::Store);
        assert_eq!(resolved.config.name, "Acme Bot");

        assert!(resolve_config(&store, "missing-id-xyz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_falls_back_to_demo_when_store_fails() {
        let store = BrokenStore {
            feed: ConfigFeed::default(),
        };
        let resolved = resolve_config(&store, "ansury-saas-456").await.unwrap().unwrap();
        assert_eq!(resolved.source, ConfigSource::Demo);
        assert!(resolve_config(&store, "acme").await.is_err());
    }

    #[tokio::test]
    async fn subscription_only_sees_its_own_row() {
        let store = MemoryStore::new();
        let mut subscription = store.subscribe("acme");
        assert_eq!(subscription.client_id(), "acme");

        store.upsert_client(stored_client("other")).await.unwrap();
        let mut updated = stored_client("acme");
        updated.primary_color = "#FF0000".to_string();
        store.upsert_client(updated).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "acme");
        assert_eq!(next.primary_color, "#FF0000");
    }

    #[tokio::test]
    async fn upsert_keeps_original_created_at() {
        let store = MemoryStore::new();
        let first = store.upsert_client(stored_client("acme")).await.unwrap();
        let mut renamed = stored_client("acme");
        renamed.name = "Acme 2".to_string();
        let second = store.upsert_client(renamed).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.name, "Acme 2");
    }

    #[tokio::test]
    async fn api_keys_are_scoped_and_hard_deleted() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.create_api_key("ghost", "prod").await,
            Err(StoreError::UnknownClient(_))
        ));

        store.upsert_client(stored_client("acme")).await.unwrap();
        store.upsert_client(stored_client("other")).await.unwrap();
        let key = store.create_api_key("acme", "prod").await.unwrap();

        assert!(store.find_api_key("acme", &key.key).await.unwrap().is_some());
        assert!(store.find_api_key("other", &key.key).await.unwrap().is_none());
        assert_eq!(store.list_api_keys("acme").await.unwrap().len(), 1);

        assert!(store.revoke_api_key(&key.id).await.unwrap());
        assert!(!store.revoke_api_key(&key.id).await.unwrap());
        assert!(store.find_api_key("acme", &key.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lead_transcript_round_trips() {
        let store = MemoryStore::new();
        let transcript = vec![
            ChatMessage::assistant("Welcome"),
            ChatMessage::user("What's your budget range?"),
            ChatMessage::assistant("Anything above 2M."),
        ];
        let lead = store
            .insert_lead(NewLead {
                client_id: "acme".to_string(),
                name: "Dana".to_string(),
                email: "dana@example.com".to_string(),
                phone: "555-0100".to_string(),
                chat_transcript: transcript.clone(),
            })
            .await
            .unwrap();

        let leads = store.list_leads("acme").await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, lead.id);
        assert_eq!(leads[0].chat_transcript, transcript);
    }
}
