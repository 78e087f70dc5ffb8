use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgListener, PgPoolOptions, PgRow},
    types::Json,
    PgPool, Row,
};
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};
use crate::store::{generate_api_key, now_iso, ConfigFeed, ConfigStore, ConfigSubscription};
use crate::types::{ApiKey, ChatMessage, ClientConfig, Lead, NewLead};

/// Channel the `clients` trigger notifies with the changed row id.
pub const CONFIG_CHANGE_CHANNEL: &str = "client_config_changes";

const CLIENT_COLUMNS: &str = "id, user_id, name, primary_color, greeting, system_instruction, logo_url, thinking_enabled, thinking_budget, authorized_origins, created_at";

pub struct PgStore {
    pool: PgPool,
    feed: ConfigFeed,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, ConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CONFIG_CHANGE_CHANNEL).await?;

        let store = Self {
            pool,
            feed: ConfigFeed::default(),
        };
        store.spawn_change_listener(listener);
        Ok(store)
    }

    fn spawn_change_listener(&self, mut listener: PgListener) {
        let pool = self.pool.clone();
        let feed = self.feed.clone();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let client_id = notification.payload();
                        match fetch_client(&pool, client_id).await {
                            Ok(Some(config)) => feed.publish(config),
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(client_id, error = %err, "failed to reload changed client row");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "config change listener interrupted");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }
}

fn client_from_row(row: &PgRow) -> Result<ClientConfig, sqlx::Error> {
    Ok(ClientConfig {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        primary_color: row.try_get("primary_color")?,
        greeting: row.try_get("greeting")?,
        system_instruction: row.try_get("system_instruction")?,
        logo_url: row.try_get("logo_url")?,
        thinking_enabled: row.try_get("thinking_enabled")?,
        thinking_budget: row.try_get("thinking_budget")?,
        authorized_origins: row.try_get("authorized_origins")?,
        created_at: row.try_get("created_at")?,
    })
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKey, sqlx::Error> {
    Ok(ApiKey {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn lead_from_row(row: &PgRow) -> Result<Lead, sqlx::Error> {
    let transcript: Json<Vec<ChatMessage>> = row.try_get("chat_transcript")?;
    Ok(Lead {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        chat_transcript: transcript.0,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_client(pool: &PgPool, id: &str) -> Result<Option<ClientConfig>, StoreError> {
    let row = sqlx::query(&format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(client_from_row).transpose()?)
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_client(&self, id: &str) -> Result<Option<ClientConfig>, StoreError> {
        fetch_client(&self.pool, id).await
    }

    async fn upsert_client(&self, config: ClientConfig) -> Result<ClientConfig, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO clients ({CLIENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET user_id = EXCLUDED.user_id, name = EXCLUDED.name, \
             primary_color = EXCLUDED.primary_color, greeting = EXCLUDED.greeting, \
             system_instruction = EXCLUDED.system_instruction, logo_url = EXCLUDED.logo_url, \
             thinking_enabled = EXCLUDED.thinking_enabled, thinking_budget = EXCLUDED.thinking_budget, \
             authorized_origins = EXCLUDED.authorized_origins \
             RETURNING {CLIENT_COLUMNS}"
        ))
        .bind(&config.id)
        .bind(&config.user_id)
        .bind(&config.name)
        .bind(&config.primary_color)
        .bind(&config.greeting)
        .bind(&config.system_instruction)
        .bind(&config.logo_url)
        .bind(config.thinking_enabled)
        .bind(config.thinking_budget)
        .bind(&config.authorized_origins)
        .bind(now_iso())
        .fetch_one(&self.pool)
        .await?;
        Ok(client_from_row(&row)?)
    }

    fn subscribe(&self, client_id: &str) -> ConfigSubscription {
        self.feed.subscribe(client_id)
    }

    async fn find_api_key(
        &self,
        client_id: &str,
        key: &str,
    ) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query(
            "SELECT id, client_id, key, name, created_at FROM api_keys WHERE client_id = $1 AND key = $2",
        )
        .bind(client_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(api_key_from_row).transpose()?)
    }

    async fn list_api_keys(&self, client_id: &str) -> Result<Vec<ApiKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, client_id, key, name, created_at FROM api_keys WHERE client_id = $1 ORDER BY created_at ASC",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(api_key_from_row).collect::<Result<_, _>>()?)
    }

    async fn create_api_key(&self, client_id: &str, name: &str) -> Result<ApiKey, StoreError> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM clients WHERE id = $1")
            .bind(client_id)
            .fetch_one(&self.pool)
            .await?
            > 0;
        if !exists {
            return Err(StoreError::UnknownClient(client_id.to_string()));
        }

        let record = ApiKey {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            key: generate_api_key(),
            name: name.to_string(),
            created_at: now_iso(),
        };
        sqlx::query(
            "INSERT INTO api_keys (id, client_id, key, name, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.id)
        .bind(&record.client_id)
        .bind(&record.key)
        .bind(&record.name)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn revoke_api_key(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
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
        sqlx::query(
            "INSERT INTO leads (id, client_id, name, email, phone, chat_transcript, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&record.id)
        .bind(&record.client_id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.phone)
        .bind(Json(&record.chat_transcript))
        .bind(&record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_leads(&self, client_id: &str) -> Result<Vec<Lead>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, client_id, name, email, phone, chat_transcript, created_at FROM leads WHERE client_id = $1 ORDER BY created_at DESC",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(lead_from_row).collect::<Result<_, _>>()?)
    }
}

/// These run against a live server and are skipped unless `DATABASE_URL` is set.
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::tests::stored_client;

    async fn live_store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgStore::connect(&url).await.unwrap())
    }

    fn unique_id(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    async fn next_change(subscription: &mut ConfigSubscription) -> ClientConfig {
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_reaches_subscribers() {
        let Some(store) = live_store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let id = unique_id("acme");
        let mut subscription = store.subscribe(&id);

        let first = store.upsert_client(stored_client(&id)).await.unwrap();
        assert_eq!(next_change(&mut subscription).await, first);

        let mut renamed = stored_client(&id);
        renamed.name = "Acme Concierge".to_string();
        let second = store.upsert_client(renamed).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.name, "Acme Concierge");

        let pushed = next_change(&mut subscription).await;
        assert_eq!(pushed.name, "Acme Concierge");
        assert_eq!(store.get_client(&id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn lead_transcript_survives_storage() {
        let Some(store) = live_store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let client_id = unique_id("ansury-lux");
        let transcript = vec![
            ChatMessage::assistant("Welcome to Acme"),
            ChatMessage::user("Do you ship to São Paulo?\nAnd \"quoted\" text"),
            ChatMessage::assistant("Yes, within 5 days."),
        ];

        let saved = store
            .insert_lead(NewLead {
                client_id: client_id.clone(),
                name: "Ana".to_string(),
                email: "ana@example.com".to_string(),
                phone: "555-0101".to_string(),
                chat_transcript: transcript.clone(),
            })
            .await
            .unwrap();

        let leads = store.list_leads(&client_id).await.unwrap();
        assert_eq!(leads, vec![saved]);
        assert_eq!(leads[0].chat_transcript, transcript);
    }

    #[tokio::test]
    async fn api_keys_require_a_client_and_revoke_by_deleting() {
        let Some(store) = live_store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let missing = unique_id("missing");
        assert!(matches!(
            store.create_api_key(&missing, "Website").await,
            Err(StoreError::UnknownClient(id)) if id == missing
        ));

        let id = unique_id("acme");
        store.upsert_client(stored_client(&id)).await.unwrap();
        let key = store.create_api_key(&id, "Website").await.unwrap();
        assert_eq!(store.find_api_key(&id, &key.key).await.unwrap(), Some(key.clone()));
        assert_eq!(store.list_api_keys(&id).await.unwrap(), vec![key.clone()]);

        assert!(store.revoke_api_key(&key.id).await.unwrap());
        assert_eq!(store.find_api_key(&id, &key.key).await.unwrap(), None);
        assert!(!store.revoke_api_key(&key.id).await.unwrap());
    }
}
