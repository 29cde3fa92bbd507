//! Query executor: a thin I/O wrapper over one database endpoint.
//!
//! Runs an ordered sequence of statements against a single endpoint and
//! returns string-typed rows. No retry logic lives here: blind retry of
//! non-idempotent statements is a correctness hazard, so retries are
//! exclusively the convergence poller's responsibility.

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

use crate::error::VerifyError;

/// Network endpoint of one cluster member's SQL listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, defaulting the port when absent.
    pub fn parse(raw: &str, default_port: u16) -> Self {
        match raw.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Self::new(host, port),
                Err(_) => Self::new(raw, default_port),
            },
            None => Self::new(raw, default_port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Admin credentials handed to the engine by the credential collaborator.
///
/// The engine never generates or persists these.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// One result row. NULL columns are carried as empty strings.
pub type Row = Vec<String>;

/// Executes statement batches against one endpoint.
///
/// The trait seam exists so scenario and verifier logic can run against an
/// in-memory cluster in tests.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Runs `statements` in order against `endpoint` and returns the
    /// concatenated rows of every result set. When `transactional` is true
    /// the batch commits atomically or not at all.
    async fn execute(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
        statements: &[String],
        transactional: bool,
    ) -> Result<Vec<Row>, VerifyError>;
}

#[async_trait]
impl<T: QueryRunner + ?Sized> QueryRunner for std::sync::Arc<T> {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
        statements: &[String],
        transactional: bool,
    ) -> Result<Vec<Row>, VerifyError> {
        (**self)
            .execute(endpoint, credentials, statements, transactional)
            .await
    }
}

/// Production runner speaking the PostgreSQL wire protocol.
#[derive(Debug, Clone)]
pub struct PgRunner {
    /// Database name used for every connection.
    pub dbname: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for PgRunner {
    fn default() -> Self {
        Self {
            dbname: "postgres".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PgRunner {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
    ) -> Result<tokio_postgres::Client, VerifyError> {
        let conn = format!(
            "host={} port={} user={} password={} dbname={} connect_timeout={}",
            endpoint.host,
            endpoint.port,
            credentials.username,
            credentials.password,
            self.dbname,
            self.connect_timeout.as_secs().max(1),
        );
        let (client, connection) =
            tokio_postgres::connect(&conn, NoTls)
                .await
                .map_err(|err| VerifyError::Connection {
                    endpoint: endpoint.to_string(),
                    source: anyhow!(err),
                })?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }
}

#[async_trait]
impl QueryRunner for PgRunner {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        credentials: &AdminCredentials,
        statements: &[String],
        transactional: bool,
    ) -> Result<Vec<Row>, VerifyError> {
        if statements.is_empty() {
            return Err(VerifyError::Config(
                "statement batch must not be empty".to_string(),
            ));
        }

        let client = self.connect(endpoint, credentials).await?;

        if transactional {
            client
                .simple_query("BEGIN")
                .await
                .map_err(|err| classify(endpoint, &client, err))?;
        }

        let mut rows = Vec::new();
        for statement in statements {
            debug!(endpoint = %endpoint, statement, "executing statement");
            match client.simple_query(statement).await {
                Ok(messages) => collect_rows(&mut rows, messages),
                Err(err) => {
                    if transactional {
                        let _ = client.simple_query("ROLLBACK").await;
                    }
                    return Err(classify(endpoint, &client, err));
                }
            }
        }

        if transactional {
            client
                .simple_query("COMMIT")
                .await
                .map_err(|err| classify(endpoint, &client, err))?;
        }

        Ok(rows)
    }
}

/// Maps a wire error to the taxonomy: errors on a torn connection are
/// transient connection failures, everything else is a statement failure.
fn classify(
    endpoint: &Endpoint,
    client: &tokio_postgres::Client,
    err: tokio_postgres::Error,
) -> VerifyError {
    if client.is_closed() {
        VerifyError::Connection {
            endpoint: endpoint.to_string(),
            source: anyhow!(err),
        }
    } else {
        VerifyError::Statement {
            endpoint: endpoint.to_string(),
            source: anyhow!(err),
        }
    }
}

fn collect_rows(rows: &mut Vec<Row>, messages: Vec<SimpleQueryMessage>) {
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let mut columns = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                columns.push(row.get(idx).unwrap_or_default().to_string());
            }
            rows.push(columns);
        }
    }
}
