use crate::config::Credentials;
use crate::error::{AppError, Result};
use crate::sample::{FieldValue, Sample, MEASUREMENT};
use crate::store::{SampleQuery, TimeSeriesStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Pool, Postgres, Row, TypeInfo};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

pub type DbPool = Pool<Postgres>;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);

/// Field columns of the `census` table. Every field a built-in adapter emits
/// must be listed here.
const FIELD_COLUMNS: &[(&str, &str)] = &[
    ("power", "DOUBLE PRECISION"),
    ("energy_wh", "DOUBLE PRECISION"),
    ("is_valid", "BOOLEAN"),
    ("device_temperature", "DOUBLE PRECISION"),
    ("power_a", "DOUBLE PRECISION"),
    ("power_b", "DOUBLE PRECISION"),
    ("power_c", "DOUBLE PRECISION"),
    ("power_factor_a", "DOUBLE PRECISION"),
    ("power_factor_b", "DOUBLE PRECISION"),
    ("power_factor_c", "DOUBLE PRECISION"),
    ("current_a", "DOUBLE PRECISION"),
    ("current_b", "DOUBLE PRECISION"),
    ("current_c", "DOUBLE PRECISION"),
    ("voltage_a", "DOUBLE PRECISION"),
    ("voltage_b", "DOUBLE PRECISION"),
    ("voltage_c", "DOUBLE PRECISION"),
    ("is_valid_a", "BOOLEAN"),
    ("is_valid_b", "BOOLEAN"),
    ("is_valid_c", "BOOLEAN"),
    ("energy_wh_a", "DOUBLE PRECISION"),
    ("energy_wh_b", "DOUBLE PRECISION"),
    ("energy_wh_c", "DOUBLE PRECISION"),
];

/// Gateway to a PostgreSQL/TimescaleDB store.
///
/// The pool connects lazily. Each operation leases one connection and the
/// lease is returned when the `PoolConnection` drops, whichever way the
/// operation exits. Until [`verify`](Self::verify) succeeds every operation
/// fails with [`AppError::StoreUnverified`].
pub struct TimescaleGateway {
    pool: Option<DbPool>,
    database: String,
    verified: AtomicBool,
}

impl TimescaleGateway {
    pub fn new(credentials: &Credentials) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options(credentials));
        Self {
            pool: Some(pool),
            database: credentials.database.clone(),
            verified: AtomicBool::new(false),
        }
    }

    /// Gateway without credentials; it can never be verified.
    pub fn unconfigured() -> Self {
        Self {
            pool: None,
            database: String::new(),
            verified: AtomicBool::new(false),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    /// Ping the server, check the selected database and make sure the
    /// measurement table exists. Records the outcome for later operations.
    pub async fn verify(&self) -> bool {
        let outcome = self.check().await;
        match &outcome {
            Ok(()) => info!(database = %self.database, "time-series store verified"),
            Err(e) => error!(
                database = %self.database,
                error = %e,
                "time-series store verification failed; samples will not be persisted"
            ),
        }
        self.verified.store(outcome.is_ok(), Ordering::SeqCst);
        outcome.is_ok()
    }

    async fn check(&self) -> Result<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| AppError::Config("no time-series store credentials".into()))?;
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT 1").execute(&mut *conn).await?;

        let current: String = sqlx::query_scalar("SELECT current_database()::text")
            .fetch_one(&mut *conn)
            .await?;
        if current != self.database {
            return Err(AppError::Config(format!(
                "connected to database '{}' instead of '{}'",
                current, self.database
            )));
        }

        sqlx::query(&create_table_sql(MEASUREMENT))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_device_ts ON {0} (device, ts)",
            MEASUREMENT
        ))
        .execute(&mut *conn)
        .await?;

        // Plain PostgreSQL has no hypertables; the table still works.
        if let Err(e) = sqlx::query(&format!(
            "SELECT create_hypertable('{}', 'ts', if_not_exists => TRUE)",
            MEASUREMENT
        ))
        .execute(&mut *conn)
        .await
        {
            warn!(error = %e, "create_hypertable unavailable; using a plain table");
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        match &self.pool {
            Some(pool) if self.is_verified() => Ok(pool.acquire().await?),
            _ => Err(AppError::StoreUnverified),
        }
    }
}

fn connect_options(credentials: &Credentials) -> PgConnectOptions {
    let ssl_mode = match (credentials.ssl, credentials.verify_ssl) {
        (false, _) => PgSslMode::Disable,
        (true, false) => PgSslMode::Require,
        (true, true) => PgSslMode::VerifyFull,
    };
    PgConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port)
        .username(&credentials.username)
        .password(&credentials.password)
        .database(&credentials.database)
        .ssl_mode(ssl_mode)
}

fn create_table_sql(table: &str) -> String {
    let fields: Vec<String> = FIELD_COLUMNS
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (ts TIMESTAMPTZ NOT NULL, device TEXT NOT NULL, fetch_success BOOLEAN NOT NULL, {})",
        table,
        fields.join(", ")
    )
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, PartialEq)]
enum SqlValue {
    Ts(DateTime<Utc>),
    Text(Option<String>),
    F64(Option<f64>),
    I64(Option<i64>),
    Bool(Option<bool>),
}

/// Multi-row INSERT for samples. Columns are the union of all field names;
/// a sample lacking a field binds NULL for it.
fn build_insert(table: &str, samples: &[Sample]) -> Result<(String, Vec<SqlValue>)> {
    if !is_identifier(table) {
        return Err(AppError::Config(format!("invalid measurement name '{}'", table)));
    }
    // first value seen per column decides the type of its NULLs
    let mut field_cols: BTreeMap<&str, &FieldValue> = BTreeMap::new();
    for s in samples {
        for (k, v) in &s.fields {
            if !is_identifier(k) {
                return Err(AppError::Config(format!("invalid field name '{}'", k)));
            }
            field_cols.entry(k.as_str()).or_insert(v);
        }
    }
    let mut columns: Vec<&str> = vec!["ts", "device", "fetch_success"];
    columns.extend(field_cols.keys().copied());
    let cols_per_row = columns.len();

    let mut values_placeholders: Vec<String> = Vec::with_capacity(samples.len());
    let mut binds: Vec<SqlValue> = Vec::with_capacity(samples.len() * cols_per_row);
    let mut arg_index = 1;
    for s in samples {
        let start = arg_index;
        arg_index += cols_per_row;
        let tuple: Vec<String> = (start..arg_index).map(|i| format!("${}", i)).collect();
        values_placeholders.push(format!("({})", tuple.join(", ")));

        binds.push(SqlValue::Ts(s.ts));
        binds.push(SqlValue::Text(Some(s.device.clone())));
        binds.push(SqlValue::Bool(Some(s.fetch_success)));
        for (col, kind) in &field_cols {
            let sqlv = match s.fields.get(*col) {
                Some(FieldValue::F64(v)) => SqlValue::F64(Some(*v)),
                Some(FieldValue::I64(v)) => SqlValue::I64(Some(*v)),
                Some(FieldValue::Bool(v)) => SqlValue::Bool(Some(*v)),
                Some(FieldValue::Text(v)) => SqlValue::Text(Some(v.clone())),
                None => match kind {
                    FieldValue::F64(_) => SqlValue::F64(None),
                    FieldValue::I64(_) => SqlValue::I64(None),
                    FieldValue::Bool(_) => SqlValue::Bool(None),
                    FieldValue::Text(_) => SqlValue::Text(None),
                },
            };
            binds.push(sqlv);
        }
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        values_placeholders.join(", ")
    );
    Ok((sql, binds))
}

fn sample_from_row(row: &PgRow) -> Result<Sample> {
    let ts: DateTime<Utc> = row.try_get("ts")?;
    let device: String = row.try_get("device")?;
    let fetch_success: bool = row.try_get("fetch_success")?;

    let mut fields = BTreeMap::new();
    for col in row.columns() {
        let name = col.name();
        if matches!(name, "ts" | "device" | "fetch_success") {
            continue;
        }
        let idx = col.ordinal();
        let value = match col.type_info().name() {
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(FieldValue::F64),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(FieldValue::I64),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| FieldValue::I64(v.into())),
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(FieldValue::Bool),
            "TEXT" | "VARCHAR" => row.try_get::<Option<String>, _>(idx)?.map(FieldValue::Text),
            _ => None,
        };
        if let Some(v) = value {
            fields.insert(name.to_string(), v);
        }
    }
    Ok(Sample {
        ts,
        device,
        fetch_success,
        fields,
    })
}

#[async_trait]
impl TimeSeriesStore for TimescaleGateway {
    async fn write(&self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let (sql, binds) = build_insert(MEASUREMENT, samples)?;
        let mut conn = self.acquire().await?;

        let mut q = sqlx::query(&sql);
        for b in binds {
            q = match b {
                SqlValue::Ts(v) => q.bind(v),
                SqlValue::Text(v) => q.bind(v),
                SqlValue::F64(v) => q.bind(v),
                SqlValue::I64(v) => q.bind(v),
                SqlValue::Bool(v) => q.bind(v),
            };
        }
        q.execute(&mut *conn).await?;
        Ok(())
    }

    async fn query(&self, query: &SampleQuery) -> Result<Vec<Sample>> {
        if !is_identifier(&query.measurement) {
            return Err(AppError::Config(format!(
                "invalid measurement name '{}'",
                query.measurement
            )));
        }
        let mut conn = self.acquire().await?;
        let sql = format!(
            "SELECT * FROM {} WHERE device = $1 AND ts >= $2 AND ts < $3 ORDER BY ts",
            query.measurement
        );
        let rows = sqlx::query(&sql)
            .bind(&query.device)
            .bind(query.range.start)
            .bind(query.range.end)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(sample_from_row).collect()
    }
}
