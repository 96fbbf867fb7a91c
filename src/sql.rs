//! Compilation of typed queries into SQL statements with positional
//! parameters.
//!
//! The plan's method names the kind of statement (`select`, `insert`,
//! `update` or `delete`) and its arguments are the SQL text followed by the
//! array of parameters bound to its `?` placeholders.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use serde_json::Value;

use crate::ast::{
    Action, AggregationQuery, DeleteQuery, FindQuery, FunctionCall, InsertQuery, Join, Operand,
    Operator, Predicate, Query, Sort, UpdateQuery,
};
use crate::error::QueryError;
use crate::interpreter::{CompiledQuery, QueryInterpreter};
use crate::normaliser::{Normaliser, PassThrough};
use crate::sequencer::{JoinType, SortDirection};

#[derive(Clone, Debug)]
pub struct SqlInterpreter {
    normaliser: Arc<dyn Normaliser>,
}

impl Default for SqlInterpreter {
    fn default() -> Self {
        Self::new(Arc::new(PassThrough))
    }
}

impl SqlInterpreter {
    pub fn new(normaliser: Arc<dyn Normaliser>) -> Self {
        Self { normaliser }
    }
}

impl QueryInterpreter for SqlInterpreter {
    fn interpret(&self, query: &Query) -> Result<CompiledQuery, QueryError> {
        let mut statement = Statement::default();
        let (method, key) = match query {
            Query::Find(query) => {
                statement.find(query)?;
                ("select", query.key.clone())
            }
            Query::Aggregate(query) => {
                statement.aggregate(query)?;
                ("select", None)
            }
            Query::Insert(query) => {
                statement.insert(query)?;
                ("insert", None)
            }
            Query::Update(query) => {
                statement.update(query)?;
                ("update", None)
            }
            Query::Delete(query) => {
                statement.delete(query)?;
                ("delete", None)
            }
        };

        let mut compiled = CompiledQuery::new(
            query.table(),
            method,
            vec![Value::String(statement.sql), Value::Array(statement.params)],
        );
        compiled.key = key;
        Ok(compiled)
    }

    fn normaliser(&self) -> &dyn Normaliser {
        self.normaliser.as_ref()
    }
}

/// Checks that `name` is a plain or dotted identifier, or a `*` column.
pub fn identifier(name: &str) -> Result<&str, QueryError> {
    let mut segments = name.split('.').peekable();
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        let mut chars = segment.chars();
        let valid = match chars.next() {
            Some('*') => last && segment.len() == 1,
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if !valid {
            return Err(QueryError::InvalidIdentifier(name.to_owned()));
        }
    }
    Ok(name)
}

fn sql_function(name: &str) -> Result<String, QueryError> {
    Ok(match name {
        "count" => "COUNT".to_owned(),
        "total" => "SUM".to_owned(),
        "maximum" => "MAX".to_owned(),
        "minimum" => "MIN".to_owned(),
        "average" => "AVG".to_owned(),
        other => identifier(other)?.to_uppercase(),
    })
}

fn join_keyword(kind: JoinType) -> &'static str {
    match kind {
        JoinType::Inner => "INNER JOIN",
        JoinType::Left => "LEFT JOIN",
        JoinType::Right => "RIGHT JOIN",
        JoinType::Full => "FULL OUTER JOIN",
    }
}

fn operator_sql(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Lt => "<",
        Operator::Le => "<=",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::In => "IN",
        Operator::NotIn => "NOT IN",
        Operator::Like => "LIKE",
    }
}

#[derive(Debug, Default)]
struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    fn bind(&mut self, value: Value) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn find(&mut self, query: &FindQuery) -> Result<(), QueryError> {
        self.sql.push_str("SELECT * FROM ");
        self.sql.push_str(identifier(&query.table)?);
        self.joins(&query.joins)?;
        self.filter(query.filter.as_ref())?;
        self.group(&query.group)?;
        self.sort(&query.sort)?;
        self.limit(query.limit, query.offset);
        Ok(())
    }

    fn aggregate(&mut self, query: &AggregationQuery) -> Result<(), QueryError> {
        let mut columns = query
            .group
            .iter()
            .map(|field| identifier(field).map(str::to_owned))
            .collect::<Result<Vec<_>, _>>()?;
        for operation in &query.operations {
            let call = self.call(operation)?;
            columns.push(format!("{} AS {}", call, identifier(&operation.name)?));
        }

        self.sql.push_str("SELECT ");
        self.sql.push_str(&columns.iter().join(", "));
        self.sql.push_str(" FROM ");
        self.sql.push_str(identifier(&query.table)?);
        self.joins(&query.joins)?;
        self.filter(query.filter.as_ref())?;
        self.group(&query.group)?;
        self.sort(&query.sort)?;
        self.limit(query.limit, query.offset);
        Ok(())
    }

    fn insert(&mut self, query: &InsertQuery) -> Result<(), QueryError> {
        let table = identifier(&query.table)?;
        let columns = match query.values.first() {
            Some(record) => record.keys().cloned().collect::<Vec<_>>(),
            None => return Err(QueryError::InconsistentRecords),
        };
        let expected = columns.iter().collect::<BTreeSet<_>>();
        if query
            .values
            .iter()
            .any(|record| record.keys().collect::<BTreeSet<_>>() != expected)
        {
            return Err(QueryError::InconsistentRecords);
        }

        if columns.is_empty() {
            if query.values.len() > 1 {
                return Err(QueryError::Unsupported {
                    action: Action::Insert,
                    feature: "several records without fields".to_owned(),
                });
            }
            self.sql = format!("INSERT INTO {} DEFAULT VALUES", table);
            return Ok(());
        }

        let column_list = columns
            .iter()
            .map(|column| identifier(column))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .join(", ");
        let mut rows = Vec::with_capacity(query.values.len());
        for record in &query.values {
            let placeholders = columns
                .iter()
                .map(|column| {
                    let value = record.get(column).cloned().unwrap_or(Value::Null);
                    self.bind(value)
                })
                .join(", ");
            rows.push(format!("({})", placeholders));
        }

        self.sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            column_list,
            rows.iter().join(", ")
        );
        Ok(())
    }

    fn update(&mut self, query: &UpdateQuery) -> Result<(), QueryError> {
        if query.values.is_empty() {
            return Err(QueryError::Unsupported {
                action: Action::Update,
                feature: "updates without values".to_owned(),
            });
        }

        let mut assignments = Vec::with_capacity(query.values.len());
        for (field, value) in &query.values {
            let field = identifier(field)?;
            assignments.push(format!("{} = {}", field, self.bind(value.clone())));
        }

        self.sql = format!(
            "UPDATE {} SET {}",
            identifier(&query.table)?,
            assignments.iter().join(", ")
        );
        self.filter(query.filter.as_ref())
    }

    fn delete(&mut self, query: &DeleteQuery) -> Result<(), QueryError> {
        self.sql = format!("DELETE FROM {}", identifier(&query.table)?);
        self.filter(query.filter.as_ref())
    }

    fn joins(&mut self, joins: &[Join]) -> Result<(), QueryError> {
        for join in joins {
            let on = self.predicate(&join.on)?;
            self.sql.push(' ');
            self.sql.push_str(join_keyword(join.kind));
            self.sql.push(' ');
            self.sql.push_str(identifier(&join.collection)?);
            if !join.alias.is_empty() {
                self.sql.push_str(" AS ");
                self.sql.push_str(identifier(&join.alias)?);
            }
            self.sql.push_str(" ON ");
            self.sql.push_str(&on);
        }
        Ok(())
    }

    fn filter(&mut self, filter: Option<&Predicate>) -> Result<(), QueryError> {
        if let Some(filter) = filter {
            let condition = self.predicate(filter)?;
            self.sql.push_str(" WHERE ");
            self.sql.push_str(&condition);
        }
        Ok(())
    }

    fn group(&mut self, group: &[String]) -> Result<(), QueryError> {
        if !group.is_empty() {
            let fields = group
                .iter()
                .map(|field| identifier(field))
                .collect::<Result<Vec<_>, _>>()?;
            self.sql.push_str(" GROUP BY ");
            self.sql.push_str(&fields.into_iter().join(", "));
        }
        Ok(())
    }

    fn sort(&mut self, sort: &[Sort]) -> Result<(), QueryError> {
        if !sort.is_empty() {
            let keys = sort
                .iter()
                .map(|sort| {
                    let direction = match sort.direction {
                        SortDirection::Ascending => "ASC",
                        SortDirection::Descending => "DESC",
                    };
                    identifier(&sort.field).map(|field| format!("{} {}", field, direction))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.sql.push_str(" ORDER BY ");
            self.sql.push_str(&keys.iter().join(", "));
        }
        Ok(())
    }

    fn limit(&mut self, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (None, None) => {}
            (Some(limit), None) => self.sql.push_str(&format!(" LIMIT {}", limit)),
            (limit, Some(offset)) => {
                // SQLite only accepts an offset after a limit, -1 means none.
                let limit = limit.map_or_else(|| "-1".to_owned(), |limit| limit.to_string());
                self.sql
                    .push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
            }
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String, QueryError> {
        Ok(match predicate {
            Predicate::Compare {
                lhs,
                op: op @ (Operator::Eq | Operator::Ne),
                rhs: Operand::Value(Value::Null),
            } => {
                let lhs = self.operand(lhs)?;
                if *op == Operator::Eq {
                    format!("{} IS NULL", lhs)
                } else {
                    format!("{} IS NOT NULL", lhs)
                }
            }
            Predicate::Compare {
                lhs,
                op: op @ (Operator::In | Operator::NotIn),
                rhs,
            } => {
                let lhs = self.operand(lhs)?;
                let items = match rhs {
                    Operand::List(items) => items
                        .iter()
                        .map(|item| self.operand(item))
                        .collect::<Result<Vec<_>, _>>()?,
                    Operand::Value(Value::Array(items)) => items
                        .iter()
                        .map(|item| self.bind(item.clone()).to_owned())
                        .collect(),
                    other => vec![self.operand(other)?],
                };
                format!("{} {} ({})", lhs, operator_sql(*op), items.iter().join(", "))
            }
            Predicate::Compare { lhs, op, rhs } => {
                let lhs = self.operand(lhs)?;
                let rhs = self.operand(rhs)?;
                format!("{} {} {}", lhs, operator_sql(*op), rhs)
            }
            Predicate::Test(operand) => self.operand(operand)?,
            Predicate::And(predicates) => format!("({})", self.predicates(predicates, " AND ")?),
            Predicate::Or(predicates) => format!("({})", self.predicates(predicates, " OR ")?),
            Predicate::Not(predicate) => format!("NOT ({})", self.predicate(predicate)?),
        })
    }

    fn predicates(&mut self, predicates: &[Predicate], separator: &str) -> Result<String, QueryError> {
        let parts = predicates
            .iter()
            .map(|predicate| self.predicate(predicate))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.iter().join(separator))
    }

    fn operand(&mut self, operand: &Operand) -> Result<String, QueryError> {
        Ok(match operand {
            Operand::Field(field) => identifier(field)?.to_owned(),
            Operand::Value(Value::Array(items)) => {
                // Arrays outside of a list comparison are stored as JSON text.
                self.bind(Value::String(Value::Array(items.clone()).to_string()))
                    .to_owned()
            }
            Operand::Value(value) => self.bind(value.clone()).to_owned(),
            Operand::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.operand(item))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("({})", items.iter().join(", "))
            }
            Operand::Call(call) => self.call(call)?,
        })
    }

    fn call(&mut self, call: &FunctionCall) -> Result<String, QueryError> {
        let name = sql_function(&call.name)?;
        let args = call
            .args
            .iter()
            .map(|arg| match arg {
                Operand::Value(Value::String(star)) if star == "*" => Ok("*".to_owned()),
                arg => self.operand(arg),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("{}({})", name, args.iter().join(", ")))
    }
}
