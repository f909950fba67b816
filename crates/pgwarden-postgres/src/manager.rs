//! `tokio-postgres` backed [`ConnectionManager`]

use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Client;
use tracing::warn;

use pgwarden_core::{ConfigError, WardenConfig, WardenResult};

use crate::config::PostgresConfig;
use crate::error::pg_error;
use crate::pool::{ConnectionManager, Pool};

/// Pool of `tokio-postgres` clients
pub type PostgresPool = Pool<PostgresManager>;

/// Opens TLS-capable `tokio-postgres` sessions
pub struct PostgresManager {
    config: PostgresConfig,
    tls: MakeTlsConnector,
}

impl PostgresManager {
    pub fn new(config: PostgresConfig) -> WardenResult<Self> {
        config.validate()?;
        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("TLS initialisation failed: {e}")))?;
        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
        })
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionManager for PostgresManager {
    type Connection = Client;

    async fn connect(&self) -> WardenResult<Client> {
        let (client, connection) = self
            .config
            .build_pg_config()
            .connect(self.tls.clone())
            .await
            .map_err(pg_error)?;

        // The connection future drives the socket; it ends when the client
        // is dropped or the server goes away.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection task ended with error");
            }
        });

        Ok(client)
    }

    async fn validate(&self, conn: &mut Client) -> WardenResult<()> {
        conn.simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(pg_error)
    }

    fn has_broken(&self, conn: &Client) -> bool {
        conn.is_closed()
    }

    async fn execute_batch(&self, conn: &mut Client, sql: &str) -> WardenResult<()> {
        conn.batch_execute(sql).await.map_err(pg_error)
    }

    async fn server_version(&self, conn: &mut Client) -> Option<String> {
        let row = conn.query_one("SHOW server_version", &[]).await.ok()?;
        row.try_get::<_, String>(0).ok()
    }
}

impl Pool<PostgresManager> {
    /// Connect a pool using the configured database URL and pool settings
    pub async fn from_config(config: &WardenConfig) -> WardenResult<Self> {
        let pg = PostgresConfig::from_warden_config(config)?;
        let manager = PostgresManager::new(pg)?;
        Pool::connect(manager, config.pool.clone()).await
    }
}
