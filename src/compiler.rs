//! Lowering of validated token sequences into typed queries.
//!
//! The grammar has already checked the overall shape, so the lowering only
//! has to walk the tokens once with a [`Cursor`]. Anything it still cannot
//! make sense of is reported as a malformed sequence.

use std::str::FromStr;

use serde_json::Value;

use crate::ast::{
    AggregationQuery, DeleteQuery, FindQuery, FunctionCall, InsertQuery, Join, Operand, Operator,
    Predicate, Query, Sort, UpdateQuery,
};
use crate::error::QueryError;
use crate::metadata::DEFAULT_PRIMARY_KEY;
use crate::sequencer::{Cursor, JoinType, SaveMode, SequenceType, SortDirection, TokenSequencer};
use crate::token::{Record, Token, LITERAL_KINDS};

const JOIN_KINDS: [&str; 4] = ["inner", "left", "right", "full"];

/// Lowers a sequence into the query its type describes.
pub fn compile_sequence(sequence: &TokenSequencer) -> Result<Query, QueryError> {
    let mut lowering = Lowering {
        cursor: sequence.cursor(),
    };

    let table = sequence.collection().to_owned();
    let query = match sequence.sequence_type() {
        SequenceType::Expression => return Err(QueryError::NotAQuery),
        SequenceType::Find => lowering.find(table, primary_key(sequence))?,
        SequenceType::Save => lowering.save(table, sequence)?,
        SequenceType::Update => lowering.update(table)?,
        SequenceType::Delete => Query::Delete(DeleteQuery {
            table,
            filter: lowering.filter()?,
        }),
    };

    lowering.finish()?;
    Ok(query)
}

/// Lowers a free-standing expression into a predicate.
pub fn compile_expression(tokens: &[Token]) -> Result<Predicate, QueryError> {
    let mut lowering = Lowering {
        cursor: Cursor::new(tokens),
    };
    let predicate = lowering.expression()?;
    lowering.finish()?;
    Ok(predicate)
}

fn primary_key(sequence: &TokenSequencer) -> &str {
    sequence
        .metadata()
        .map_or(DEFAULT_PRIMARY_KEY, |metadata| metadata.primary_key())
}

struct Lowering<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Lowering<'a> {
    fn malformed(&self, expected: &str) -> QueryError {
        QueryError::Malformed {
            position: self.cursor.position(),
            expected: expected.to_owned(),
            found: self
                .cursor
                .peek()
                .map_or_else(|| "the end of the sequence".to_owned(), |token| token.to_string()),
        }
    }

    fn finish(&self) -> Result<(), QueryError> {
        if self.cursor.is_done() {
            Ok(())
        } else {
            Err(self.malformed("the end of the sequence"))
        }
    }

    fn expect(&mut self, kind: &str) -> Result<&'a Token, QueryError> {
        match self.cursor.peek() {
            Some(token) if token.is(kind) => {
                self.cursor.next();
                Ok(token)
            }
            _ => Err(self.malformed(kind)),
        }
    }

    fn expect_field(&mut self) -> Result<String, QueryError> {
        match self.expect("field")? {
            Token::Reference { name, .. } => Ok(name.clone()),
            _ => Err(self.malformed("a field reference")),
        }
    }

    fn expect_count(&mut self) -> Result<u64, QueryError> {
        let value = self.expect("int")?.value().and_then(Value::as_u64);
        value.ok_or_else(|| self.malformed("a non-negative integer"))
    }

    fn find(&mut self, table: String, primary_key: &str) -> Result<Query, QueryError> {
        let mut operations = Vec::new();
        while self.cursor.peek_is("function") {
            operations.push(self.call()?);
        }

        let mut joins = Vec::new();
        while JOIN_KINDS.iter().any(|kind| self.cursor.peek_is(kind)) {
            joins.push(self.join()?);
        }

        let filter = self.filter()?;

        let mut group = Vec::new();
        if self.cursor.eat("group") {
            while self.cursor.peek_is("field") {
                group.push(self.expect_field()?);
            }
        }

        let mut sort = Vec::new();
        if self.cursor.eat("sort") {
            while self.cursor.peek_is("field") {
                let field = self.expect_field()?;
                let direction = self
                    .expect("sort-direction")?
                    .value()
                    .and_then(Value::as_str)
                    .and_then(|direction| SortDirection::from_str(direction).ok());
                let direction = direction.ok_or_else(|| self.malformed("a sort direction"))?;
                sort.push(Sort { field, direction });
            }
        }

        let (mut limit, mut offset) = (None, None);
        if self.cursor.eat("limit") {
            limit = Some(self.expect_count()?);
            if self.cursor.eat("offset") {
                offset = Some(self.expect_count()?);
            }
        }

        if !operations.is_empty() {
            return Ok(Query::Aggregate(AggregationQuery {
                table,
                joins,
                operations,
                filter,
                group,
                sort,
                limit,
                offset,
            }));
        }

        let key = filter
            .as_ref()
            .and_then(|filter| primary_key_value(filter, &table, primary_key));
        Ok(Query::Find(FindQuery {
            table,
            joins,
            filter,
            group,
            sort,
            limit,
            offset,
            key,
        }))
    }

    fn save(&mut self, table: String, sequence: &TokenSequencer) -> Result<Query, QueryError> {
        let mut records = Vec::new();
        while let Some(Token::Entity(record)) = self.cursor.peek() {
            self.cursor.next();
            records.push(record.clone());
        }
        if records.is_empty() {
            return Err(self.malformed("an entity"));
        }

        let primary_key = primary_key(sequence);
        let auto_increment = sequence
            .metadata()
            .map_or(true, |metadata| metadata.primary_key_metadata().is_auto_increment());
        let has_key = |record: &Record| record.get(primary_key).map_or(false, |v| !v.is_null());

        let update = match sequence.save_mode() {
            SaveMode::Insert => false,
            SaveMode::Update => true,
            SaveMode::Auto => auto_increment && records.len() == 1 && has_key(&records[0]),
        };
        if !update {
            return Ok(Query::Insert(InsertQuery {
                table,
                values: records,
            }));
        }

        if records.len() != 1 {
            return Err(QueryError::Unsupported {
                action: crate::ast::Action::Update,
                feature: "saving several entities at once".to_owned(),
            });
        }
        let mut values = records.remove(0);
        let key = match values.remove(primary_key) {
            Some(key) if !key.is_null() => key,
            _ => return Err(QueryError::MissingPrimaryKey(primary_key.to_owned())),
        };

        Ok(Query::Update(UpdateQuery {
            table,
            values,
            filter: Some(Predicate::Compare {
                lhs: Operand::Field(primary_key.to_owned()),
                op: Operator::Eq,
                rhs: Operand::Value(key),
            }),
        }))
    }

    fn update(&mut self, table: String) -> Result<Query, QueryError> {
        let mut values = Record::new();
        while self.cursor.peek_is("field") {
            let field = self.expect_field()?;
            if self.operator()? != Operator::Eq {
                return Err(QueryError::Malformed {
                    position: self.cursor.position() - 1,
                    expected: "an assignment".to_owned(),
                    found: "a comparison".to_owned(),
                });
            }
            match self.operand()? {
                Operand::Value(value) => {
                    values.insert(field, value);
                }
                _ => return Err(self.malformed("a literal value")),
            }
        }
        if values.is_empty() {
            return Err(self.malformed("an assignment"));
        }

        Ok(Query::Update(UpdateQuery {
            table,
            values,
            filter: self.filter()?,
        }))
    }

    fn filter(&mut self) -> Result<Option<Predicate>, QueryError> {
        if self.cursor.eat("where") {
            Ok(Some(self.expression()?))
        } else {
            Ok(None)
        }
    }

    fn join(&mut self) -> Result<Join, QueryError> {
        let kind = match self.cursor.next().map(Token::kind) {
            Some("inner") => JoinType::Inner,
            Some("left") => JoinType::Left,
            Some("right") => JoinType::Right,
            Some("full") => JoinType::Full,
            _ => return Err(self.malformed("a join type")),
        };
        self.cursor.eat("outer");
        self.expect("join")?;

        let (collection, alias) = match self.expect("collection")? {
            Token::Reference { name, alias, .. } => (name.clone(), alias.clone()),
            _ => return Err(self.malformed("a collection reference")),
        };
        self.expect("on")?;
        let on = self.group()?;

        Ok(Join {
            kind,
            collection,
            alias,
            on,
        })
    }

    /// `open <expression> close`
    fn group(&mut self) -> Result<Predicate, QueryError> {
        self.expect("open")?;
        let predicate = self.expression()?;
        self.expect("close")?;
        Ok(predicate)
    }

    fn expression(&mut self) -> Result<Predicate, QueryError> {
        let mut terms = vec![self.conjunction()?];
        while self.cursor.eat("or") {
            terms.push(self.conjunction()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::Or(terms)
        })
    }

    fn conjunction(&mut self) -> Result<Predicate, QueryError> {
        let mut terms = vec![self.term()?];
        while self.cursor.eat("and") {
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Predicate::And(terms)
        })
    }

    fn term(&mut self) -> Result<Predicate, QueryError> {
        if self.cursor.eat("not") {
            return Ok(Predicate::Not(Box::new(self.term()?)));
        }
        if self.cursor.peek_is("open") {
            return self.group();
        }

        let lhs = self.operand()?;
        if !self.cursor.peek_is("operator") {
            return Ok(Predicate::Test(lhs));
        }
        let op = self.operator()?;
        let rhs = if self.cursor.peek_is("open") {
            self.list()?
        } else {
            self.operand()?
        };
        Ok(Predicate::Compare { lhs, op, rhs })
    }

    fn operator(&mut self) -> Result<Operator, QueryError> {
        let symbol = self.expect("operator")?.value().and_then(Value::as_str);
        match symbol {
            Some(symbol) => symbol.parse(),
            None => Err(self.malformed("an operator")),
        }
    }

    /// `open <operand>* close`
    fn list(&mut self) -> Result<Operand, QueryError> {
        self.expect("open")?;
        let mut items = Vec::new();
        while !self.cursor.eat("close") {
            if self.cursor.is_done() {
                return Err(self.malformed("close"));
            }
            items.push(if self.cursor.peek_is("open") {
                self.list()?
            } else {
                self.operand()?
            });
        }
        Ok(Operand::List(items))
    }

    fn operand(&mut self) -> Result<Operand, QueryError> {
        match self.cursor.peek() {
            Some(Token::Reference { kind, name, .. }) if kind == "field" => {
                self.cursor.next();
                Ok(Operand::Field(name.clone()))
            }
            Some(Token::Value { kind, value }) if LITERAL_KINDS.contains(&kind.as_str()) => {
                self.cursor.next();
                Ok(Operand::Value(value.clone()))
            }
            Some(token) if token.is("function") => Ok(Operand::Call(self.call()?)),
            _ => Err(self.malformed("an operand")),
        }
    }

    /// `function open <operand>* close`
    fn call(&mut self) -> Result<FunctionCall, QueryError> {
        let name = self.expect("function")?.value().and_then(Value::as_str);
        let name = name.ok_or_else(|| self.malformed("a function name"))?.to_owned();
        let args = match self.list()? {
            Operand::List(args) => args,
            _ => return Err(self.malformed("function arguments")),
        };
        Ok(FunctionCall { name, args })
    }
}

/// The compared value when `filter` is exactly `primary key = literal`.
fn primary_key_value(filter: &Predicate, table: &str, primary_key: &str) -> Option<Value> {
    match filter {
        Predicate::Compare {
            lhs: Operand::Field(field),
            op: Operator::Eq,
            rhs: Operand::Value(value),
        } if !value.is_null()
            && (field == primary_key || *field == format!("{}.{}", table, primary_key)) =>
        {
            Some(value.clone())
        }
        _ => None,
    }
}
