//! Collaborator capabilities: CRM HTTP API client and warehouse client.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use xfields_core::{is_plain_identifier, truncate_chars, ContactId};

pub const CRATE_NAME: &str = "xfields-storage";

/// Postgres caps bind parameters per statement at u16::MAX.
const MAX_BIND_PARAMS: usize = 65_535;
const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Worst-case wall time of one request including every retry and backoff sleep.
    pub fn total_budget(&self, per_attempt: Duration) -> Duration {
        let attempts = u32::try_from(self.max_retries + 1).unwrap_or(u32::MAX);
        (0..self.max_retries)
            .map(|i| self.delay_for_attempt(i))
            .fold(per_attempt.saturating_mul(attempts), Duration::saturating_add)
    }
}

#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub auth: Option<BasicAuth>,
    pub backoff: BackoffPolicy,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            auth: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{status} error for url {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Generic JSON-over-HTTP client with transport-level retries.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    auth: Option<BasicAuth>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = normalize_base_url(&config.base_url)
            .with_context(|| format!("parsing API base url {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            auth: config.auth,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| FetchError::InvalidUrl(path.to_string()))
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let url = self.endpoint(path)?;
        let span = info_span!("api_get", url = %url);
        self.get_json_with_retries(url, query).instrument(span).await
    }

    async fn get_json_with_retries(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url.clone()).query(query);
            if let Some(auth) = &self.auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                            url: url.to_string(),
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying API request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        message: error_message(status, &body),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying API request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn normalize_base_url(raw: &str) -> anyhow::Result<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Ok(Url::parse(&with_slash)?)
}

fn error_message(status: StatusCode, body: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let kind = if status.is_client_error() {
        "Client Error"
    } else {
        "Server Error"
    };
    let body = body.trim();
    if body.is_empty() {
        format!("{reason} ({kind})")
    } else {
        format!("{reason} ({kind}): {}", truncate_chars(body, ERROR_BODY_CHARS))
    }
}

// ---------------------------------------------------------------------------
// Warehouse
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("row has {actual} cells but batch has {expected} columns")]
    RowArity { expected: usize, actual: usize },
    #[error("query result has no integer vanid column")]
    MissingIdColumn,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// `schema.table` (or bare `table`) destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl FromStr for TableName {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WarehouseError::InvalidTable(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        let (schema, name) = match parts.as_slice() {
            [name] => (None, *name),
            [schema, name] => (Some(*schema), *name),
            _ => return Err(invalid()),
        };
        if !is_plain_identifier(name) || !schema.map(is_plain_identifier).unwrap_or(true) {
            return Err(invalid());
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Varchar(u32),
    Date,
    TimestampTz,
}

impl ColumnKind {
    pub fn sql_type(&self) -> String {
        match self {
            ColumnKind::BigInt => "BIGINT".to_string(),
            ColumnKind::Varchar(len) => format!("VARCHAR({len})"),
            ColumnKind::Date => "DATE".to_string(),
            ColumnKind::TimestampTz => "TIMESTAMPTZ".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    BigInt(i64),
    Text(Option<String>),
    Date(NaiveDate),
    TimestampTz(DateTime<Utc>),
}

/// Column-typed batch of rows bound for one append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBatch {
    columns: Vec<ColumnSpec>,
    rows: Vec<Vec<CellValue>>,
}

impl RowBatch {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<(), WarehouseError> {
        if row.len() != self.columns.len() {
            return Err(WarehouseError::RowArity {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows per INSERT statement so bind parameters stay under the protocol limit.
    pub fn rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMS / self.columns.len().max(1)).max(1)
    }
}

/// Minimal warehouse capability used by the selector and the writer.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Run a read-only query and collect its `vanid` column.
    async fn query_identifiers(&self, sql: &str) -> Result<Vec<ContactId>, WarehouseError>;

    /// Create the table if missing and add any columns it lacks.
    async fn ensure_table(
        &self,
        table: &TableName,
        columns: &[ColumnSpec],
    ) -> Result<(), WarehouseError>;

    /// Append rows; never updates or deletes.
    async fn append(&self, table: &TableName, batch: &RowBatch) -> Result<u64, WarehouseError>;
}

#[derive(Clone)]
pub enum WarehouseConnection {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        username: String,
        password: String,
    },
}

impl fmt::Debug for WarehouseConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseConnection::Url(_) => f.write_str("WarehouseConnection::Url(<redacted>)"),
            WarehouseConnection::Parts {
                host,
                port,
                database,
                username,
                ..
            } => f
                .debug_struct("WarehouseConnection::Parts")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl WarehouseConnection {
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        match self {
            WarehouseConnection::Url(url) => {
                PgConnectOptions::from_str(url).context("parsing warehouse connection url")
            }
            WarehouseConnection::Parts {
                host,
                port,
                database,
                username,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(username)
                .password(password)),
        }
    }
}

/// Warehouse client over the Postgres wire protocol (Postgres or Redshift).
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(connection: &WarehouseConnection) -> anyhow::Result<Self> {
        info!("connecting to warehouse");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connection.connect_options()?)
            .await
            .context("connecting to warehouse")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn existing_columns(&self, table: &TableName) -> Result<HashSet<String>, WarehouseError> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(table.schema().unwrap_or("public"))
        .bind(table.name())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("column_name").map_err(WarehouseError::from))
            .collect()
    }
}

#[async_trait]
impl WarehouseClient for PgWarehouse {
    async fn query_identifiers(&self, sql: &str) -> Result<Vec<ContactId>, WarehouseError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let value = match row.try_get::<Option<i64>, _>("vanid") {
                Ok(v) => v,
                Err(_) => row
                    .try_get::<Option<i32>, _>("vanid")
                    .map_err(|_| WarehouseError::MissingIdColumn)?
                    .map(i64::from),
            };
            if let Some(v) = value {
                ids.push(ContactId(v));
            }
        }
        Ok(ids)
    }

    async fn ensure_table(
        &self,
        table: &TableName,
        columns: &[ColumnSpec],
    ) -> Result<(), WarehouseError> {
        validate_columns(columns)?;
        sqlx::query(&create_table_sql(table, columns))
            .execute(&self.pool)
            .await?;

        let existing = self.existing_columns(table).await?;
        for column in missing_columns(&existing, columns) {
            info!(table = %table, column = %column.name, "adding column to destination table");
            sqlx::query(&add_column_sql(table, column))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn append(&self, table: &TableName, batch: &RowBatch) -> Result<u64, WarehouseError> {
        if batch.is_empty() {
            return Ok(0);
        }
        validate_columns(batch.columns())?;

        let prefix = insert_prefix_sql(table, batch.columns());
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in batch.rows().chunks(batch.rows_per_statement()) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(prefix.as_str());
            qb.push_values(chunk, |mut b, row| {
                for cell in row {
                    match cell {
                        CellValue::BigInt(v) => {
                            b.push_bind(*v);
                        }
                        CellValue::Text(v) => {
                            b.push_bind(v.clone());
                        }
                        CellValue::Date(v) => {
                            b.push_bind(*v);
                        }
                        CellValue::TimestampTz(v) => {
                            b.push_bind(*v);
                        }
                    }
                }
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(table = %table, rows = written, "appended rows");
        Ok(written)
    }
}

fn validate_columns(columns: &[ColumnSpec]) -> Result<(), WarehouseError> {
    match columns.iter().find(|c| !is_plain_identifier(&c.name)) {
        Some(bad) => Err(WarehouseError::InvalidColumn(bad.name.clone())),
        None => Ok(()),
    }
}

pub fn create_table_sql(table: &TableName, columns: &[ColumnSpec]) -> String {
    let defs = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({defs})", table.quoted())
}

pub fn add_column_sql(table: &TableName, column: &ColumnSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table.quoted(),
        quote_ident(&column.name),
        column.kind.sql_type()
    )
}

pub fn insert_prefix_sql(table: &TableName, columns: &[ColumnSpec]) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({names}) ", table.quoted())
}

pub fn missing_columns<'a>(existing: &HashSet<String>, columns: &'a [ColumnSpec]) -> Vec<&'a ColumnSpec> {
    columns
        .iter()
        .filter(|c| !existing.contains(&c.name))
        .collect()
}
