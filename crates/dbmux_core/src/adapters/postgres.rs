//! PostgreSQL-family adapter backed by deadpool-postgres.
//!
//! Serves postgres and the wire-compatible kingbase, gaussdb, highgo and
//! vastbase tags.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use parking_lot::RwLock;
use serde_json::{Number, Value};
use tokio::sync::Mutex;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::adapters::DatabaseAdapter;
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{
    ColumnInfo, ColumnMeta, ConnectionConfig, DatabaseType, IndexInfo, QueryResult, Row,
    SchemaInfo, TableInfo,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_SIZE: usize = 4;
const APPLICATION_NAME: &str = "dbmux";

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Adapter for PostgreSQL wire-compatible servers.
pub struct PostgresAdapter {
    config: ConnectionConfig,
    pool: RwLock<Option<Pool>>,
    /// Client pinned for the open transaction, if any.
    transaction: Mutex<Option<Object>>,
}

impl PostgresAdapter {
    /// Create an unconnected adapter.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, pool: RwLock::new(None), transaction: Mutex::new(None) }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(self.config.host_or_default());
        if let Some(port) = self.config.port_or_default() {
            pg_config.port(port);
        }
        if let Some(database) = &self.config.database {
            pg_config.dbname(database);
        }
        if let Some(user) = &self.config.user {
            pg_config.user(user);
        }
        if let Some(password) = &self.config.password {
            pg_config.password(password);
        }
        pg_config.application_name(APPLICATION_NAME);
        pg_config.connect_timeout(CONNECT_TIMEOUT);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));
        pg_config
    }

    fn current_pool(&self) -> DbmuxResult<Pool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| DbmuxError::connection(format!("{} is not connected", self.config.db_type)))
    }

    async fn client(&self) -> DbmuxResult<Object> {
        let pool = self.current_pool()?;
        pool.get()
            .await
            .map_err(|e| DbmuxError::connection(format!("Failed to acquire connection: {e}")))
    }

    async fn run(client: &Object, query: &str, params: &[Value]) -> DbmuxResult<QueryResult> {
        let started = Instant::now();
        let statement = client.prepare(query).await?;
        let bound = bind_params(statement.params(), params)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let result = if statement.columns().is_empty() {
            let affected = client.execute(&statement, &refs).await?;
            QueryResult::affected(affected)
        } else {
            let rows = client.query(&statement, &refs).await?;
            let columns = statement
                .columns()
                .iter()
                .map(|c| ColumnMeta { name: c.name().to_string(), type_name: c.type_().name().to_string() })
                .collect();
            QueryResult::with_rows(columns, rows.iter().map(row_to_json).collect())
        };

        Ok(result.timed(started.elapsed().as_millis() as u64))
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn database_type(&self) -> DatabaseType {
        self.config.db_type
    }

    async fn connect(&self) -> DbmuxResult<()> {
        let manager = Manager::from_config(
            self.pg_config(),
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .wait_timeout(Some(CONNECT_TIMEOUT))
            .create_timeout(Some(CONNECT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DbmuxError::connection(format!("Failed to create pool: {e}")))?;

        // Validate by establishing a real connection
        let client = pool.get().await.map_err(|e| {
            DbmuxError::connection(format!("{} connection failed: {e}", self.config.db_type))
        })?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| DbmuxError::connection_with_source("Connection validation failed", e))?;
        drop(client);

        tracing::info!(
            db_type = %self.config.db_type,
            host = %self.config.host_or_default(),
            database = ?self.config.database,
            "PostgreSQL connection pool created"
        );

        if let Some(previous) = self.pool.write().replace(pool) {
            previous.close();
        }
        Ok(())
    }

    async fn disconnect(&self) -> DbmuxResult<()> {
        self.transaction.lock().await.take();
        if let Some(pool) = self.pool.write().take() {
            pool.close();
            tracing::info!(db_type = %self.config.db_type, "PostgreSQL connection pool closed");
        }
        Ok(())
    }

    async fn execute_query(&self, query: &str, params: &[Value]) -> DbmuxResult<QueryResult> {
        let transaction = self.transaction.lock().await;
        if let Some(client) = transaction.as_ref() {
            return Self::run(client, query, params).await;
        }
        drop(transaction);

        let client = self.client().await?;
        Self::run(&client, query, params).await
    }

    async fn get_schema(&self, tables: Option<&[String]>) -> DbmuxResult<SchemaInfo> {
        let client = self.client().await?;
        let filter: Option<Vec<String>> = tables.map(|t| t.to_vec());

        let header = client
            .query_one("SELECT version() AS version, current_database()::text AS name", &[])
            .await
            .map_err(|e| DbmuxError::schema_with_source("Failed to read server version", e))?;

        let table_rows = client
            .query(
                r#"
                SELECT c.relname::text AS name, c.reltuples::bigint AS estimated_rows
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relkind IN ('r', 'p')
                  AND n.nspname = current_schema()
                  AND ($1::text[] IS NULL OR c.relname::text = ANY($1))
                ORDER BY c.relname
                "#,
                &[&filter],
            )
            .await
            .map_err(|e| DbmuxError::schema_with_source("Failed to list tables", e))?;

        let column_rows = client
            .query(
                r#"
                SELECT
                    c.relname::text AS table_name,
                    a.attname::text AS name,
                    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                    NOT a.attnotnull AS nullable,
                    pg_get_expr(d.adbin, d.adrelid) AS default_value,
                    col_description(c.oid, a.attnum) AS comment
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE c.relkind IN ('r', 'p')
                  AND n.nspname = current_schema()
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                  AND ($1::text[] IS NULL OR c.relname::text = ANY($1))
                ORDER BY c.relname, a.attnum
                "#,
                &[&filter],
            )
            .await
            .map_err(|e| DbmuxError::schema_with_source("Failed to read columns", e))?;

        let index_rows = client
            .query(
                r#"
                SELECT
                    t.relname::text AS table_name,
                    i.relname::text AS index_name,
                    a.attname::text AS column_name,
                    ix.indisunique AS is_unique,
                    ix.indisprimary AS is_primary
                FROM pg_catalog.pg_index ix
                JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
                JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
                WHERE n.nspname = current_schema()
                  AND ($1::text[] IS NULL OR t.relname::text = ANY($1))
                ORDER BY t.relname, i.relname, array_position(ix.indkey::int2[], a.attnum)
                "#,
                &[&filter],
            )
            .await
            .map_err(|e| DbmuxError::schema_with_source("Failed to read indexes", e))?;

        let mut by_name: BTreeMap<String, TableInfo> = table_rows
            .iter()
            .map(|row| {
                let name: String = row.get("name");
                let mut table = TableInfo::new(name.clone(), Vec::new());
                table.estimated_rows = row.get::<_, Option<i64>>("estimated_rows").map(|n| n.max(0));
                (name, table)
            })
            .collect();

        for row in &column_rows {
            let table_name: String = row.get("table_name");
            if let Some(table) = by_name.get_mut(&table_name) {
                table.columns.push(ColumnInfo {
                    name: row.get("name"),
                    data_type: row.get("data_type"),
                    nullable: row.get("nullable"),
                    default_value: row.get("default_value"),
                    comment: row.get("comment"),
                });
            }
        }

        for row in &index_rows {
            let table_name: String = row.get("table_name");
            let Some(table) = by_name.get_mut(&table_name) else {
                continue;
            };
            let column: String = row.get("column_name");
            if row.get::<_, bool>("is_primary") {
                table.primary_keys.push(column);
                continue;
            }
            let index_name: String = row.get("index_name");
            match table.indexes.iter_mut().find(|idx| idx.name == index_name) {
                Some(index) => index.columns.push(column),
                None => table.indexes.push(IndexInfo {
                    name: index_name,
                    columns: vec![column],
                    unique: row.get("is_unique"),
                }),
            }
        }

        Ok(SchemaInfo {
            database_type: self.config.db_type,
            database_name: header.get("name"),
            tables: by_name.into_values().collect(),
            version: header.get("version"),
        })
    }

    async fn begin_transaction(&self) -> DbmuxResult<()> {
        let mut transaction = self.transaction.lock().await;
        if transaction.is_some() {
            return Err(DbmuxError::query("A transaction is already in progress"));
        }
        let client = self.client().await?;
        client.batch_execute("BEGIN").await?;
        *transaction = Some(client);
        Ok(())
    }

    async fn commit(&self) -> DbmuxResult<()> {
        let client = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| DbmuxError::query("No transaction in progress"))?;
        client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&self) -> DbmuxResult<()> {
        let client = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| DbmuxError::query("No transaction in progress"))?;
        client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

/// Convert JSON parameters to the types the prepared statement expects.
fn bind_params(types: &[Type], params: &[Value]) -> DbmuxResult<Vec<BoxedParam>> {
    if types.len() != params.len() {
        return Err(DbmuxError::query(format!(
            "Statement expects {} parameters, got {}",
            types.len(),
            params.len()
        )));
    }
    types.iter().zip(params).map(|(ty, value)| json_to_param(ty, value)).collect()
}

fn json_to_param(ty: &Type, value: &Value) -> DbmuxResult<BoxedParam> {
    let mismatch = || DbmuxError::query(format!("Cannot bind {value} as {}", ty.name()));

    if value.is_null() {
        let null: BoxedParam = match *ty {
            Type::BOOL => Box::new(None::<bool>),
            Type::INT2 => Box::new(None::<i16>),
            Type::INT4 => Box::new(None::<i32>),
            Type::INT8 => Box::new(None::<i64>),
            Type::FLOAT4 => Box::new(None::<f32>),
            Type::FLOAT8 => Box::new(None::<f64>),
            Type::JSON | Type::JSONB => Box::new(None::<Value>),
            Type::UUID => Box::new(None::<Uuid>),
            Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
            Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
            Type::DATE => Box::new(None::<NaiveDate>),
            _ => Box::new(None::<String>),
        };
        return Ok(null);
    }

    let param: BoxedParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => Box::new(
            value.as_i64().and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?,
        ),
        Type::INT4 => Box::new(
            value.as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?,
        ),
        Type::INT8 => Box::new(value.as_i64().ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(value.as_f64().ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(value.as_f64().ok_or_else(mismatch)?),
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::UUID => Box::new(
            value.as_str().and_then(|s| Uuid::parse_str(s).ok()).ok_or_else(mismatch)?,
        ),
        Type::TIMESTAMPTZ => Box::new(
            value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(mismatch)?,
        ),
        Type::TIMESTAMP => Box::new(
            value
                .as_str()
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
                .ok_or_else(mismatch)?,
        ),
        Type::DATE => Box::new(
            value.as_str().and_then(|s| s.parse::<NaiveDate>().ok()).ok_or_else(mismatch)?,
        ),
        _ => Box::new(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    };
    Ok(param)
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a row into a JSON object keyed by column name.
fn row_to_json(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = match *col.type_() {
                Type::BOOL => get::<bool>(row, i).map(Value::Bool),
                Type::INT2 => get::<i16>(row, i).map(|v| Value::Number(v.into())),
                Type::INT4 => get::<i32>(row, i).map(|v| Value::Number(v.into())),
                Type::INT8 => get::<i64>(row, i).map(|v| Value::Number(v.into())),
                Type::OID => get::<u32>(row, i).map(|v| Value::Number(v.into())),
                Type::FLOAT4 => {
                    get::<f32>(row, i).and_then(|v| Number::from_f64(v as f64)).map(Value::Number)
                }
                Type::FLOAT8 => get::<f64>(row, i).and_then(Number::from_f64).map(Value::Number),
                Type::UUID => get::<Uuid>(row, i).map(|v| Value::String(v.to_string())),
                Type::JSON | Type::JSONB => get::<Value>(row, i),
                Type::TIMESTAMPTZ => {
                    get::<DateTime<Utc>>(row, i).map(|v| Value::String(v.to_rfc3339()))
                }
                Type::TIMESTAMP => get::<NaiveDateTime>(row, i).map(|v| Value::String(v.to_string())),
                Type::DATE => get::<NaiveDate>(row, i).map(|v| Value::String(v.to_string())),
                Type::TIME => get::<NaiveTime>(row, i).map(|v| Value::String(v.to_string())),
                Type::INT4_ARRAY => get::<Vec<i32>>(row, i)
                    .map(|v| Value::Array(v.into_iter().map(|x| Value::Number(x.into())).collect())),
                Type::INT8_ARRAY => get::<Vec<i64>>(row, i)
                    .map(|v| Value::Array(v.into_iter().map(|x| Value::Number(x.into())).collect())),
                Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<String>>(row, i)
                    .map(|v| Value::Array(v.into_iter().map(Value::String).collect())),
                // Everything else as text when the driver can decode it
                _ => get::<String>(row, i).map(Value::String),
            };
            (col.name().to_string(), value.unwrap_or(Value::Null))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_params_checks_arity() {
        let err = bind_params(&[Type::INT4], &[]).err().unwrap();
        assert!(err.to_string().contains("expects 1 parameters"));
    }

    #[test]
    fn test_bind_params_rejects_out_of_range_int() {
        let err = bind_params(&[Type::INT2], &[serde_json::json!(100_000)]).err().unwrap();
        assert!(matches!(err, DbmuxError::Query { .. }));
    }

    #[test]
    fn test_bind_params_accepts_matching_values() {
        let params = bind_params(
            &[Type::INT4, Type::TEXT, Type::BOOL, Type::JSONB, Type::INT8],
            &[
                serde_json::json!(7),
                serde_json::json!("alice"),
                serde_json::json!(true),
                serde_json::json!({"k": 1}),
                Value::Null,
            ],
        )
        .unwrap();
        assert_eq!(params.len(), 5);
    }

    #[tokio::test]
    async fn test_query_before_connect_fails() {
        let adapter = PostgresAdapter::new(
            ConnectionConfig::new(DatabaseType::Postgres).with_endpoint("localhost", 5432),
        );
        let err = adapter.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.category(), "Connection");
        assert!(adapter.disconnect().await.is_ok());
    }
}
