// PostgreSQL implementation of the OffsetStore trait
//
// Offsets live in a single `topic_offset` table keyed by
// ("groupId", "topic", "partition"). The client connection is opened lazily
// and re-opened whenever the previous one has closed. After a database
// restart the first write fails and the registration that issued it rebuilds.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use super::OffsetStore;
use crate::kafka::constants::OFFSET_TABLE;
use crate::kafka::error::{ControllerError, Result};

/// PostgreSQL-backed implementation of OffsetStore
pub struct PostgresOffsetStore {
    config: tokio_postgres::Config,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresOffsetStore {
    /// Create a store; no connection is made until first use
    pub fn new(config: tokio_postgres::Config) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    /// Create a store and verify the database is reachable
    pub async fn connect(config: tokio_postgres::Config) -> Result<Self> {
        let store = Self::new(config);
        store.client().await?;
        Ok(store)
    }

    /// Create the offset table if it does not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!(
                r#"CREATE TABLE IF NOT EXISTS {OFFSET_TABLE} (
                    "groupId" TEXT NOT NULL,
                    "topic" TEXT NOT NULL,
                    "partition" INTEGER NOT NULL,
                    "offset" BIGINT NOT NULL,
                    PRIMARY KEY ("groupId", "topic", "partition")
                )"#
            ))
            .await?;
        info!("offset table {} ready", OFFSET_TABLE);
        Ok(())
    }

    /// Current client, reconnecting if the previous connection closed
    async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;

        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            debug!("offset store connection closed, reconnecting");
        }

        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    async fn get_offset(&self, group: &str, topic: &str, partition: i32) -> Result<Option<i64>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    r#"SELECT "offset" FROM {OFFSET_TABLE}
                       WHERE "topic" = $1 AND "partition" = $2 AND "groupId" = $3"#
                ),
                &[&topic, &partition, &group],
            )
            .await?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(row.try_get::<_, i64>(0)?)),
            _ => Err(ControllerError::Store(format!(
                "{} rows for {}/{}[{}]",
                rows.len(),
                group,
                topic,
                partition
            ))),
        }
    }

    async fn create_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                &format!(
                    r#"INSERT INTO {OFFSET_TABLE} ("groupId", "topic", "partition", "offset")
                       VALUES ($1, $2, $3, $4)"#
                ),
                &[&group, &topic, &partition, &offset],
            )
            .await?;
        Ok(())
    }

    async fn set_offset(&self, group: &str, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                &format!(
                    r#"UPDATE {OFFSET_TABLE} SET "offset" = $1
                       WHERE "topic" = $2 AND "partition" = $3 AND "groupId" = $4"#
                ),
                &[&offset, &topic, &partition, &group],
            )
            .await?;

        // A missing row means the checkpoint did not persist
        if updated == 0 {
            return Err(ControllerError::Store(format!(
                "no offset row for {}/{}[{}]",
                group, topic, partition
            )));
        }
        Ok(())
    }
}
