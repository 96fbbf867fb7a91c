use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::error::QueryError;
use crate::sequencer::{JoinType, SortDirection};
use crate::token::Record;

pub type Identifier = String;
pub type FieldName = Identifier;
pub type CollectionName = Identifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Find,
    Aggregate,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Find => "find",
            Action::Aggregate => "aggregate",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        write!(f, "{}", name)
    }
}

/// A typed query, ready to be compiled by a backend interpreter.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Find(FindQuery),
    Aggregate(AggregationQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

impl Query {
    pub fn action(&self) -> Action {
        match self {
            Query::Find(_) => Action::Find,
            Query::Aggregate(_) => Action::Aggregate,
            Query::Insert(_) => Action::Insert,
            Query::Update(_) => Action::Update,
            Query::Delete(_) => Action::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Query::Find(query) => &query.table,
            Query::Aggregate(query) => &query.table,
            Query::Insert(query) => &query.table,
            Query::Update(query) => &query.table,
            Query::Delete(query) => &query.table,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindQuery {
    pub table: CollectionName,
    pub joins: Vec<Join>,
    pub filter: Option<Predicate>,
    pub group: Vec<FieldName>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// The primary key value when the filter selects a single entity by key.
    pub key: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregationQuery {
    pub table: CollectionName,
    pub joins: Vec<Join>,
    pub operations: Vec<FunctionCall>,
    pub filter: Option<Predicate>,
    pub group: Vec<FieldName>,
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertQuery {
    pub table: CollectionName,
    pub values: Vec<Record>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateQuery {
    pub table: CollectionName,
    pub values: Record,
    pub filter: Option<Predicate>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteQuery {
    pub table: CollectionName,
    pub filter: Option<Predicate>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub kind: JoinType,
    pub collection: CollectionName,
    /// Empty when the collection is joined under its own name.
    pub alias: Identifier,
    pub on: Predicate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    pub field: FieldName,
    pub direction: SortDirection,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare {
        lhs: Operand,
        op: Operator,
        rhs: Operand,
    },
    /// A lone operand, such as a boolean field.
    Test(Operand),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Field(FieldName),
    Value(Value),
    List(Vec<Operand>),
    Call(FunctionCall),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionCall {
    pub name: Identifier,
    pub args: Vec<Operand>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "in" => Ok(Operator::In),
            "not in" => Ok(Operator::NotIn),
            "like" => Ok(Operator::Like),
            _ => Err(QueryError::UnknownOperator(s.to_owned())),
        }
    }
}
