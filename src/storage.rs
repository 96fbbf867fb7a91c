//! Storage drivers that execute compiled call plans.

use std::fmt;
use std::sync::Mutex;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::Value;

use crate::error::{StorageError, StorageErrorKind};
use crate::interpreter::CompiledQuery;
use crate::token::Record;

/// What a driver returns for an executed plan.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageResponse {
    Rows(Vec<Record>),
    /// The key generated for the last inserted record, when there is one.
    Inserted(Option<Value>),
    Affected(u64),
}

pub trait Storage: Send + Sync + fmt::Debug {
    fn execute(&self, query: &CompiledQuery) -> Result<StorageResponse, StorageError>;

    /// Whether `error` signals a duplicate key, which lets a repository
    /// retry an insert as an update.
    fn is_duplicate_key(&self, error: &StorageError) -> bool {
        error.kind == StorageErrorKind::DuplicateKey
    }
}

/// Executes SQL plans against a SQLite database.
#[derive(Debug)]
pub struct SqliteStorage {
    connection: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let connection = Connection::open_in_memory()
            .map_err(|e| storage_error("", "open", &e))?;
        Ok(Self::new(connection))
    }

    /// Runs raw SQL, such as a schema, outside of any plan.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        let connection = self.lock("", "batch")?;
        connection
            .execute_batch(sql)
            .map_err(|e| storage_error("", "batch", &e))
    }

    fn lock(
        &self,
        collection: &str,
        method: &str,
    ) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.connection.lock().map_err(|_| StorageError {
            kind: StorageErrorKind::Driver,
            collection: collection.to_owned(),
            method: method.to_owned(),
            message: "the connection lock is poisoned".to_owned(),
        })
    }
}

impl Storage for SqliteStorage {
    fn execute(&self, query: &CompiledQuery) -> Result<StorageResponse, StorageError> {
        let plan_error = |message: &str| StorageError {
            kind: StorageErrorKind::Plan,
            collection: query.collection.clone(),
            method: query.method.clone(),
            message: message.to_owned(),
        };
        let driver_error = |e: rusqlite::Error| storage_error(&query.collection, &query.method, &e);

        let (sql, params) = match query.arguments.as_slice() {
            [Value::String(sql), Value::Array(params)] => (sql, params),
            _ => return Err(plan_error("expected the SQL text and its parameters")),
        };
        let params = params.iter().map(to_sql_value);

        tracing::trace!(collection = %query.collection, sql = %sql, "executing statement");
        let connection = self.lock(&query.collection, &query.method)?;
        match query.method.as_str() {
            "select" => {
                let mut statement = connection.prepare(sql).map_err(driver_error)?;
                let columns = statement
                    .column_names()
                    .into_iter()
                    .map(str::to_owned)
                    .collect::<Vec<_>>();

                let mut rows = statement
                    .query(params_from_iter(params))
                    .map_err(driver_error)?;
                let mut records = Vec::new();
                while let Some(row) = rows.next().map_err(driver_error)? {
                    let mut record = Record::new();
                    for (index, column) in columns.iter().enumerate() {
                        if record.contains_key(column) {
                            continue;
                        }
                        let value = row.get_ref(index).map_err(driver_error)?;
                        record.insert(column.clone(), from_sql_value(value));
                    }
                    records.push(record);
                }
                Ok(StorageResponse::Rows(records))
            }
            "insert" => {
                connection
                    .execute(sql, params_from_iter(params))
                    .map_err(driver_error)?;
                let id = connection.last_insert_rowid();
                Ok(StorageResponse::Inserted((id != 0).then(|| Value::from(id))))
            }
            "update" | "delete" => {
                let affected = connection
                    .execute(sql, params_from_iter(params))
                    .map_err(driver_error)?;
                Ok(StorageResponse::Affected(affected as u64))
            }
            _ => Err(plan_error("unknown statement kind")),
        }
    }
}

fn storage_error(collection: &str, method: &str, error: &rusqlite::Error) -> StorageError {
    let kind = match error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                ) =>
        {
            StorageErrorKind::DuplicateKey
        }
        _ => StorageErrorKind::Driver,
    };
    StorageError {
        kind,
        collection: collection.to_owned(),
        method: method.to_owned(),
        message: error.to_string(),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
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

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}
