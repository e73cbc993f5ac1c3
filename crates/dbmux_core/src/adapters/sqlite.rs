//! SQLite file adapter backed by rusqlite.
//!
//! The connection is opened read-only unless the configuration allows writes.
//! All driver calls run on the blocking thread pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde_json::{Number, Value};

use crate::adapters::DatabaseAdapter;
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{
    ColumnInfo, ColumnMeta, ConnectionConfig, DatabaseType, IndexInfo, QueryResult, Row,
    SchemaInfo, TableInfo,
};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Adapter for a SQLite database file.
pub struct SqliteAdapter {
    path: PathBuf,
    read_only: bool,
    connection: SharedConnection,
}

impl SqliteAdapter {
    /// Create an unconnected adapter. Fails if no file path is configured.
    pub fn new(config: ConnectionConfig) -> DbmuxResult<Self> {
        let path = config
            .file_path
            .clone()
            .ok_or_else(|| DbmuxError::config("SQLite connections require a file path"))?;
        Ok(Self { path, read_only: !config.allow_write, connection: Arc::new(Mutex::new(None)) })
    }

    /// Run a closure against the open connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> DbmuxResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DbmuxResult<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| DbmuxError::connection("sqlite is not connected"))?;
            f(conn)
        })
        .await
        .map_err(|e| DbmuxError::internal_with_source("SQLite worker task failed", e))?
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn connect(&self) -> DbmuxResult<()> {
        let path = self.path.clone();
        let read_only = self.read_only;
        let connection = Arc::clone(&self.connection);

        tokio::task::spawn_blocking(move || -> DbmuxResult<()> {
            let flags = if read_only {
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
            } else {
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
            };
            let conn = Connection::open_with_flags(&path, flags).map_err(|e| {
                DbmuxError::connection_with_source(
                    format!("Failed to open SQLite database '{}'", path.display()),
                    e,
                )
            })?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| DbmuxError::connection_with_source("Connection validation failed", e))?;
            *connection.lock() = Some(conn);
            Ok(())
        })
        .await
        .map_err(|e| DbmuxError::internal_with_source("SQLite worker task failed", e))??;

        tracing::info!(path = %self.path.display(), read_only = self.read_only, "SQLite database opened");
        Ok(())
    }

    async fn disconnect(&self) -> DbmuxResult<()> {
        let connection = Arc::clone(&self.connection);
        let closed = tokio::task::spawn_blocking(move || connection.lock().take())
            .await
            .map_err(|e| DbmuxError::internal_with_source("SQLite worker task failed", e))?;

        if let Some(conn) = closed {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "Error closing SQLite database");
            } else {
                tracing::info!(path = %self.path.display(), "SQLite database closed");
            }
        }
        Ok(())
    }

    async fn execute_query(&self, query: &str, params: &[Value]) -> DbmuxResult<QueryResult> {
        let query = query.to_string();
        let params: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

        self.with_connection(move |conn| {
            let started = Instant::now();
            let mut stmt = conn.prepare(&query)?;
            let bound = rusqlite::params_from_iter(params.iter());

            let result = if stmt.column_count() == 0 {
                let affected = stmt.execute(bound)?;
                QueryResult::affected(affected as u64)
            } else {
                let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
                let mut type_names: Vec<Option<&'static str>> = vec![None; names.len()];
                let mut rows = Vec::new();
                let mut cursor = stmt.query(bound)?;
                while let Some(row) = cursor.next()? {
                    let mut out = Row::new();
                    for (i, name) in names.iter().enumerate() {
                        let value = row.get_ref(i)?;
                        if type_names[i].is_none() && value != ValueRef::Null {
                            type_names[i] = Some(storage_class(value));
                        }
                        out.insert(name.clone(), value_to_json(value));
                    }
                    rows.push(out);
                }
                let columns = names
                    .into_iter()
                    .zip(type_names)
                    .map(|(name, ty)| ColumnMeta { name, type_name: ty.unwrap_or("null").to_string() })
                    .collect();
                QueryResult::with_rows(columns, rows)
            };

            Ok(result.timed(started.elapsed().as_millis() as u64))
        })
        .await
    }

    async fn get_schema(&self, tables: Option<&[String]>) -> DbmuxResult<SchemaInfo> {
        let filter: Option<Vec<String>> = tables.map(|t| t.to_vec());
        let database_name = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());

        self.with_connection(move |conn| {
            let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;

            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut tables = Vec::new();
            for name in names {
                if let Some(filter) = &filter {
                    if !filter.contains(&name) {
                        continue;
                    }
                }
                tables.push(read_table(conn, &name)?);
            }

            Ok(SchemaInfo {
                database_type: DatabaseType::Sqlite,
                database_name,
                tables,
                version: Some(version),
            })
        })
        .await
        .map_err(|e| match e {
            DbmuxError::Query { message, .. } => DbmuxError::schema(message),
            other => other,
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn read_table(conn: &Connection, name: &str) -> DbmuxResult<TableInfo> {
    let ident = quote_ident(name);

    let mut primary_keys: Vec<(i64, String)> = Vec::new();
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({ident})"))?;
    let columns = stmt
        .query_map([], |row| {
            let column_name: String = row.get("name")?;
            let pk: i64 = row.get("pk")?;
            let column = ColumnInfo {
                name: column_name.clone(),
                data_type: row.get("type")?,
                nullable: row.get::<_, i64>("notnull")? == 0,
                default_value: row.get("dflt_value")?,
                comment: None,
            };
            Ok((column, pk))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(column, pk)| {
            if pk > 0 {
                primary_keys.push((pk, column.name.clone()));
            }
            column
        })
        .collect();
    primary_keys.sort();

    let mut stmt = conn.prepare(&format!("PRAGMA index_list({ident})"))?;
    let index_list = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>("name")?, row.get::<_, i64>("unique")?, row.get::<_, String>("origin")?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut indexes = Vec::new();
    for (index_name, unique, origin) in index_list {
        if origin == "pk" {
            continue;
        }
        let mut stmt = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index_name)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, Option<String>>("name"))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        indexes.push(IndexInfo { name: index_name, columns, unique: unique != 0 });
    }

    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {ident}"), [], |row| row.get(0))?;

    Ok(TableInfo {
        name: name.to_string(),
        columns,
        primary_keys: primary_keys.into_iter().map(|(_, name)| name).collect(),
        indexes,
        estimated_rows: Some(count),
    })
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn storage_class(value: ValueRef<'_>) -> &'static str {
    match value {
        ValueRef::Null => "null",
        ValueRef::Integer(_) => "integer",
        ValueRef::Real(_) => "real",
        ValueRef::Text(_) => "text",
        ValueRef::Blob(_) => "blob",
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
        }
    }
}
