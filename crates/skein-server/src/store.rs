//! Durable message store.
//!
//! The hub only needs the [`MessageStore`] seam; everything else in
//! this module is the MySQL implementation behind it. Persistence is
//! best-effort: the store is invoked from the log flusher, never from
//! the routing path.

use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tracing::info;

use crate::error::HubError;

/// One delivered direct chat message.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub from_domain: u32,
    pub to_domain: u32,
    pub from: String,
    pub to: String,
    pub kind: u8,
    pub text: String,
    pub extra: String,
    pub create_at: DateTime<Utc>,
}

/// One delivered group chat message. Same shape, different table.
#[derive(Debug, Clone)]
pub struct GroupRecord(pub ChatRecord);

/// Batched persistence of delivered chat traffic.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn save_chat_msgs(&self, msgs: Vec<ChatRecord>) -> Result<(), HubError>;
    async fn save_group_msgs(&self, msgs: Vec<GroupRecord>) -> Result<(), HubError>;
}

/// MySQL-backed store. Tables are created on connect.
pub struct MySqlMessageStore {
    pool: MySqlPool,
}

impl MySqlMessageStore {
    pub async fn connect(source: &str) -> Result<Self, HubError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(source)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("store: mysql connected");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), HubError> {
        for table in ["t_chat_msg", "t_group_msg"] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
                    from_domain INT UNSIGNED NOT NULL,
                    to_domain INT UNSIGNED NOT NULL,
                    `from` VARCHAR(64) NOT NULL,
                    `to` VARCHAR(64) NOT NULL,
                    type TINYINT UNSIGNED NOT NULL,
                    text VARCHAR(1024) NOT NULL,
                    extra VARCHAR(255) NOT NULL,
                    create_at DATETIME NOT NULL,
                    PRIMARY KEY (id)
                )"
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn insert(&self, table: &str, msgs: &[ChatRecord]) -> Result<(), HubError> {
        for msg in msgs {
            sqlx::query(&format!(
                "INSERT INTO {table}
                    (from_domain, to_domain, `from`, `to`, type, text, extra, create_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(msg.from_domain)
            .bind(msg.to_domain)
            .bind(&msg.from)
            .bind(&msg.to)
            .bind(msg.kind)
            .bind(&msg.text)
            .bind(&msg.extra)
            .bind(msg.create_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for MySqlMessageStore {
    async fn save_chat_msgs(&self, msgs: Vec<ChatRecord>) -> Result<(), HubError> {
        self.insert("t_chat_msg", &msgs).await
    }

    async fn save_group_msgs(&self, msgs: Vec<GroupRecord>) -> Result<(), HubError> {
        let inner: Vec<ChatRecord> = msgs.into_iter().map(|g| g.0).collect();
        self.insert("t_group_msg", &inner).await
    }
}
