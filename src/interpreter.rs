//! Compilation of typed queries into backend call plans.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::ast::{
    Action, DeleteQuery, FindQuery, InsertQuery, Operand, Operator, Predicate, Query, UpdateQuery,
};
use crate::error::QueryError;
use crate::normaliser::{DocumentNormaliser, NormaliseOptions, Normaliser};
use crate::token::Record;

/// A modifier invoked on the result of the primary call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Call {
    pub method: String,
    pub arguments: Vec<Value>,
}

impl Call {
    pub fn new(method: &str, arguments: Vec<Value>) -> Self {
        Self {
            method: method.to_owned(),
            arguments,
        }
    }
}

/// The plan a storage driver executes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub collection: String,
    pub method: String,
    pub arguments: Vec<Value>,
    pub calls: Vec<Call>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
}

impl CompiledQuery {
    pub fn new(collection: &str, method: &str, arguments: Vec<Value>) -> Self {
        Self {
            collection: collection.to_owned(),
            method: method.to_owned(),
            arguments,
            calls: Vec::new(),
            key: None,
        }
    }
}

pub trait QueryInterpreter: Send + Sync + fmt::Debug {
    fn interpret(&self, query: &Query) -> Result<CompiledQuery, QueryError>;

    /// The normaliser applied to payloads leaving the core, and to rows
    /// coming back from storage.
    fn normaliser(&self) -> &dyn Normaliser;
}

/// Compiles queries into calls against a document store.
#[derive(Clone, Debug)]
pub struct DocumentInterpreter {
    normaliser: Arc<dyn Normaliser>,
}

impl Default for DocumentInterpreter {
    fn default() -> Self {
        Self::new(Arc::new(DocumentNormaliser))
    }
}

impl DocumentInterpreter {
    pub fn new(normaliser: Arc<dyn Normaliser>) -> Self {
        Self { normaliser }
    }

    fn normalise(&self, data: Value, options: NormaliseOptions) -> Value {
        self.normaliser.normalise(data, options)
    }

    fn compile_find(&self, query: &FindQuery) -> Result<CompiledQuery, QueryError> {
        if !query.joins.is_empty() {
            return Err(unsupported(Action::Find, "joins"));
        }
        if !query.group.is_empty() {
            return Err(unsupported(Action::Find, "grouping"));
        }

        let filter = self.compile_filter(Action::Find, query.filter.as_ref())?;
        let mut compiled = CompiledQuery::new(
            &query.table,
            "find",
            vec![self.normalise(filter, NormaliseOptions::Both)],
        );

        if let Some(limit) = query.limit {
            compiled.calls.push(Call::new("limit", vec![json!(limit)]));
        }
        if let Some(offset) = query.offset {
            compiled.calls.push(Call::new("skip", vec![json!(offset)]));
        }
        if !query.sort.is_empty() {
            let sort: Record = query
                .sort
                .iter()
                .map(|sort| (sort.field.clone(), json!(sort.direction.signum())))
                .collect();
            compiled.calls.push(Call::new(
                "sort",
                vec![self.normalise(Value::Object(sort), NormaliseOptions::Keys)],
            ));
        }

        compiled.key = query.key.clone();
        Ok(compiled)
    }

    fn compile_insert(&self, query: &InsertQuery) -> CompiledQuery {
        let values = match query.values.as_slice() {
            [record] => self.normalise(Value::Object(record.clone()), NormaliseOptions::Both),
            records => Value::Array(
                records
                    .iter()
                    .map(|record| {
                        self.normalise(Value::Object(record.clone()), NormaliseOptions::Both)
                    })
                    .collect(),
            ),
        };
        CompiledQuery::new(&query.table, "insert", vec![values])
    }

    fn compile_update(&self, query: &UpdateQuery) -> Result<CompiledQuery, QueryError> {
        let filter = self.compile_filter(Action::Update, query.filter.as_ref())?;
        let values = self.normalise(Value::Object(query.values.clone()), NormaliseOptions::Both);
        Ok(CompiledQuery::new(
            &query.table,
            "update",
            vec![
                self.normalise(filter, NormaliseOptions::Both),
                json!({ "$set": values }),
                json!({ "multiple": true }),
            ],
        ))
    }

    fn compile_delete(&self, query: &DeleteQuery) -> Result<CompiledQuery, QueryError> {
        let filter = self.compile_filter(Action::Delete, query.filter.as_ref())?;
        Ok(CompiledQuery::new(
            &query.table,
            "remove",
            vec![self.normalise(filter, NormaliseOptions::Both)],
        ))
    }

    fn compile_filter(
        &self,
        action: Action,
        filter: Option<&Predicate>,
    ) -> Result<Value, QueryError> {
        match filter {
            None => Ok(json!({})),
            Some(predicate) => compile_predicate(action, predicate),
        }
    }
}

impl QueryInterpreter for DocumentInterpreter {
    fn interpret(&self, query: &Query) -> Result<CompiledQuery, QueryError> {
        match query {
            Query::Find(query) => self.compile_find(query),
            Query::Insert(query) => Ok(self.compile_insert(query)),
            Query::Update(query) => self.compile_update(query),
            Query::Delete(query) => self.compile_delete(query),
            Query::Aggregate(_) => Err(QueryError::UnsupportedAction(Action::Aggregate)),
        }
    }

    fn normaliser(&self) -> &dyn Normaliser {
        self.normaliser.as_ref()
    }
}

fn unsupported(action: Action, feature: &str) -> QueryError {
    QueryError::Unsupported {
        action,
        feature: feature.to_owned(),
    }
}

fn compile_predicate(action: Action, predicate: &Predicate) -> Result<Value, QueryError> {
    match predicate {
        Predicate::Compare { lhs, op, rhs } => match (lhs, rhs) {
            (Operand::Field(field), rhs) => compile_comparison(action, field, *op, rhs),
            (lhs, Operand::Field(field)) => {
                let op = flip(*op).ok_or_else(|| unsupported(action, "reversed comparisons"))?;
                compile_comparison(action, field, op, lhs)
            }
            _ => Err(unsupported(action, "comparisons without a field")),
        },
        Predicate::Test(Operand::Field(field)) => Ok(json!({ field.as_str(): true })),
        Predicate::Test(_) => Err(unsupported(action, "tests of anything but a field")),
        Predicate::And(predicates) => {
            let documents = predicates
                .iter()
                .map(|predicate| compile_predicate(action, predicate))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(merge_conjunction(documents))
        }
        Predicate::Or(predicates) => {
            let documents = predicates
                .iter()
                .map(|predicate| compile_predicate(action, predicate))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "$or": documents }))
        }
        Predicate::Not(predicate) => Ok(json!({ "$nor": [compile_predicate(action, predicate)?] })),
    }
}

fn compile_comparison(
    action: Action,
    field: &str,
    op: Operator,
    rhs: &Operand,
) -> Result<Value, QueryError> {
    let value = match rhs {
        Operand::Value(value) => value.clone(),
        Operand::List(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Operand::Value(value) => Ok(value.clone()),
                    _ => Err(unsupported(action, "lists of anything but literals")),
                })
                .collect::<Result<_, _>>()?,
        ),
        Operand::Field(_) => return Err(unsupported(action, "field to field comparisons")),
        Operand::Call(_) => return Err(unsupported(action, "function calls")),
    };

    let condition = match op {
        Operator::Eq => value,
        Operator::Ne => json!({ "$ne": value }),
        Operator::Lt => json!({ "$lt": value }),
        Operator::Le => json!({ "$lte": value }),
        Operator::Gt => json!({ "$gt": value }),
        Operator::Ge => json!({ "$gte": value }),
        Operator::In => json!({ "$in": as_list(value) }),
        Operator::NotIn => json!({ "$nin": as_list(value) }),
        Operator::Like => match value {
            Value::String(pattern) => json!({ "$regex": like_to_regex(&pattern) }),
            _ => return Err(unsupported(action, "non-string patterns")),
        },
    };
    Ok(json!({ field: condition }))
}

fn as_list(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        other => Value::Array(vec![other]),
    }
}

fn flip(op: Operator) -> Option<Operator> {
    match op {
        Operator::Eq | Operator::Ne => Some(op),
        Operator::Lt => Some(Operator::Gt),
        Operator::Le => Some(Operator::Ge),
        Operator::Gt => Some(Operator::Lt),
        Operator::Ge => Some(Operator::Le),
        Operator::In | Operator::NotIn | Operator::Like => None,
    }
}

/// Merges the conditions into one document when no field repeats.
fn merge_conjunction(documents: Vec<Value>) -> Value {
    let mut merged = Record::new();
    let mergeable = documents.iter().all(|document| match document {
        Value::Object(conditions) => conditions.iter().all(|(field, condition)| {
            !field.starts_with('$')
                && merged.insert(field.clone(), condition.clone()).is_none()
        }),
        _ => false,
    });

    if mergeable {
        Value::Object(merged)
    } else {
        json!({ "$and": documents })
    }
}

/// Anchored regular expression equivalent to a `like` pattern.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionCall, Join, Sort};
    use crate::sequencer::{JoinType, SortDirection};

    fn compare(field: &str, op: Operator, value: Value) -> Predicate {
        Predicate::Compare {
            lhs: Operand::Field(field.to_owned()),
            op,
            rhs: Operand::Value(value),
        }
    }

    #[test]
    fn test_find_modifiers() {
        let query = Query::Find(FindQuery {
            table: "orders".to_owned(),
            sort: vec![Sort {
                field: "created".to_owned(),
                direction: SortDirection::Descending,
            }],
            limit: Some(10),
            ..FindQuery::default()
        });

        let compiled = DocumentInterpreter::default().interpret(&query).unwrap();
        assert_eq!(compiled.method, "find");
        assert_eq!(compiled.arguments, vec![json!({})]);
        assert_eq!(
            compiled.calls,
            vec![
                Call::new("limit", vec![json!(10)]),
                Call::new("sort", vec![json!({"created": -1})]),
            ]
        );
        assert_eq!(compiled.key, None);
    }

    #[test]
    fn test_find_by_key_is_normalised() {
        let query = Query::Find(FindQuery {
            table: "orders".to_owned(),
            filter: Some(compare("id", Operator::Eq, json!(4))),
            sort: vec![Sort {
                field: "id".to_owned(),
                direction: SortDirection::Ascending,
            }],
            offset: Some(5),
            key: Some(json!(4)),
            ..FindQuery::default()
        });

        let compiled = DocumentInterpreter::default().interpret(&query).unwrap();
        assert_eq!(compiled.arguments, vec![json!({"_id": 4})]);
        assert_eq!(
            compiled.calls,
            vec![
                Call::new("skip", vec![json!(5)]),
                Call::new("sort", vec![json!({"_id": 1})]),
            ]
        );
        assert_eq!(compiled.key, Some(json!(4)));
    }

    #[test]
    fn test_filter_documents() {
        let filter = Predicate::Or(vec![
            Predicate::And(vec![
                compare("total", Operator::Ge, json!(10)),
                compare("status", Operator::In, json!(["new", "paid"])),
            ]),
            Predicate::And(vec![
                compare("total", Operator::Gt, json!(1)),
                compare("total", Operator::Lt, json!(5)),
            ]),
            Predicate::Not(Box::new(compare("name", Operator::Like, json!("a_c%")))),
            Predicate::Compare {
                lhs: Operand::Value(json!(3)),
                op: Operator::Lt,
                rhs: Operand::Field("count".to_owned()),
            },
        ]);

        assert_eq!(
            compile_predicate(Action::Find, &filter).unwrap(),
            json!({"$or": [
                {"total": {"$gte": 10}, "status": {"$in": ["new", "paid"]}},
                {"$and": [{"total": {"$gt": 1}}, {"total": {"$lt": 5}}]},
                {"$nor": [{"name": {"$regex": "^a.c.*$"}}]},
                {"count": {"$gt": 3}},
            ]})
        );
    }

    #[test]
    fn test_update_insert_delete() {
        let interpreter = DocumentInterpreter::default();
        let mut values = Record::new();
        values.insert("status".to_owned(), json!("shipped"));

        let compiled = interpreter
            .interpret(&Query::Update(UpdateQuery {
                table: "orders".to_owned(),
                values: values.clone(),
                filter: Some(compare("id", Operator::Eq, json!(1))),
            }))
            .unwrap();
        assert_eq!(compiled.method, "update");
        assert_eq!(
            compiled.arguments,
            vec![
                json!({"_id": 1}),
                json!({"$set": {"status": "shipped"}}),
                json!({"multiple": true}),
            ]
        );

        let compiled = interpreter
            .interpret(&Query::Insert(InsertQuery {
                table: "orders".to_owned(),
                values: vec![values.clone(), values],
            }))
            .unwrap();
        assert_eq!(compiled.method, "insert");
        assert_eq!(
            compiled.arguments,
            vec![json!([{"status": "shipped"}, {"status": "shipped"}])]
        );

        let compiled = interpreter
            .interpret(&Query::Delete(DeleteQuery {
                table: "orders".to_owned(),
                filter: None,
            }))
            .unwrap();
        assert_eq!((compiled.method.as_str(), compiled.arguments), ("remove", vec![json!({})]));
    }

    #[test]
    fn test_unsupported_features() {
        let interpreter = DocumentInterpreter::default();
        assert_eq!(
            interpreter.interpret(&Query::Aggregate(Default::default())),
            Err(QueryError::UnsupportedAction(Action::Aggregate))
        );

        let query = Query::Find(FindQuery {
            table: "orders".to_owned(),
            joins: vec![Join {
                kind: JoinType::Left,
                collection: "items".to_owned(),
                alias: String::new(),
                on: Predicate::Test(Operand::Field("x".to_owned())),
            }],
            ..FindQuery::default()
        });
        assert!(matches!(
            interpreter.interpret(&query),
            Err(QueryError::Unsupported { action: Action::Find, .. })
        ));

        let filter = Predicate::Compare {
            lhs: Operand::Field("a".to_owned()),
            op: Operator::Eq,
            rhs: Operand::Call(FunctionCall {
                name: "lower".to_owned(),
                args: vec![],
            }),
        };
        assert!(compile_predicate(Action::Find, &filter).is_err());
    }
}
