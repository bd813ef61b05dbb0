//! PostgreSQL audit store.
//! One pipelined `tokio_postgres::Client` shared by the accounting worker; the connection
//! future runs on its own task and is aborted on close.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use super::store::{AuditStore, SessionEndStatus};
use crate::error::{AaaError, AaaResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tacacs_sessions (
        id VARCHAR(255) PRIMARY KEY,
        username VARCHAR(255) NOT NULL,
        client_ip VARCHAR(45) NOT NULL,
        start_time TIMESTAMP NOT NULL,
        end_time TIMESTAMP,
        status VARCHAR(50) NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS tacacs_commands (
        id SERIAL PRIMARY KEY,
        session_id VARCHAR(255),
        command TEXT NOT NULL,
        timestamp TIMESTAMP NOT NULL,
        allowed BOOLEAN NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_username ON tacacs_sessions(username)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON tacacs_sessions(start_time)",
    "CREATE INDEX IF NOT EXISTS idx_commands_session_id ON tacacs_commands(session_id)",
];

const INSERT_SESSION: &str =
    "INSERT INTO tacacs_sessions (id, username, client_ip, start_time, status) VALUES ($1, $2, $3, $4, 'active')";
const END_SESSION: &str = "UPDATE tacacs_sessions SET end_time = $1, status = $2 WHERE id = $3";
const INSERT_COMMAND: &str =
    "INSERT INTO tacacs_commands (session_id, command, timestamp, allowed) VALUES ($1, $2, $3, $4)";

impl From<tokio_postgres::Error> for AaaError {
    fn from(e: tokio_postgres::Error) -> Self { AaaError::PersistenceUnavailable(e.to_string()) }
}

pub struct PostgresAuditStore {
    client: Client,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresAuditStore {
    /// Connect with a libpq-style connection string (`host=... user=... dbname=...` or a
    /// `postgres://` URL).
    pub async fn connect(conn_str: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .context("failed to connect to audit database")?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "tacplane::postgres", "audit database connection error: {}", e);
            }
        });
        let store = Self { client, connection: Mutex::new(Some(handle)) };
        store.ensure_schema().await?;
        info!(target: "tacplane::postgres", "audit database ready");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for stmt in SCHEMA {
            self.client
                .batch_execute(stmt)
                .await
                .with_context(|| format!("while applying audit schema: {}", stmt.lines().next().unwrap_or_default()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn append_session_start(
        &self,
        id: &str,
        principal: &str,
        client_address: &str,
        started_at: DateTime<Utc>,
    ) -> AaaResult<()> {
        let start = started_at.naive_utc();
        self.client.execute(INSERT_SESSION, &[&id, &principal, &client_address, &start]).await?;
        Ok(())
    }

    async fn mark_session_ended(&self, id: &str, ended_at: DateTime<Utc>, status: SessionEndStatus) -> AaaResult<()> {
        let end = ended_at.naive_utc();
        self.client.execute(END_SESSION, &[&end, &status.as_str(), &id]).await?;
        Ok(())
    }

    async fn append_command(
        &self,
        session_id: &str,
        command: &str,
        timestamp: DateTime<Utc>,
        allowed: bool,
    ) -> AaaResult<()> {
        let ts = timestamp.naive_utc();
        self.client.execute(INSERT_COMMAND, &[&session_id, &command, &ts, &allowed]).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.connection.lock().take() {
            handle.abort();
            info!(target: "tacplane::postgres", "audit database connection closed");
        }
    }
}
