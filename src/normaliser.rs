//! Translation of payloads between the core's representation and a backend's.

use std::fmt;

use serde_json::Value;

const DOCUMENT_KEY: &str = "_id";
const ENTITY_KEY: &str = "id";

/// Which parts of a payload are transformed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NormaliseOptions {
    #[default]
    Both,
    Keys,
    Values,
}

impl NormaliseOptions {
    fn keys(self) -> bool {
        self != NormaliseOptions::Values
    }

    fn values(self) -> bool {
        self != NormaliseOptions::Keys
    }
}

pub trait Normaliser: Send + Sync + fmt::Debug {
    fn normalise(&self, data: Value, options: NormaliseOptions) -> Value;

    fn denormalise(&self, data: Value, options: NormaliseOptions) -> Value;
}

/// Leaves every payload untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl Normaliser for PassThrough {
    fn normalise(&self, data: Value, _options: NormaliseOptions) -> Value {
        data
    }

    fn denormalise(&self, data: Value, _options: NormaliseOptions) -> Value {
        data
    }
}

/// Stores the entity key `id` under the document key `_id`.
///
/// With [`NormaliseOptions::Keys`] only the top level map is renamed, with
/// `Values` nested maps and arrays are renamed but the top level is not, and
/// `Both` does the two.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentNormaliser;

impl DocumentNormaliser {
    fn rename(data: Value, options: NormaliseOptions, from: &str, to: &str) -> Value {
        match data {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| {
                        let key = if options.keys() && key == from {
                            to.to_owned()
                        } else {
                            key
                        };
                        let value = if options.values() {
                            Self::rename(value, NormaliseOptions::Both, from, to)
                        } else {
                            value
                        };
                        (key, value)
                    })
                    .collect(),
            ),
            Value::Array(items) if options.values() => Value::Array(
                items
                    .into_iter()
                    .map(|item| Self::rename(item, NormaliseOptions::Both, from, to))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl Normaliser for DocumentNormaliser {
    fn normalise(&self, data: Value, options: NormaliseOptions) -> Value {
        Self::rename(data, options, ENTITY_KEY, DOCUMENT_KEY)
    }

    fn denormalise(&self, data: Value, options: NormaliseOptions) -> Value {
        Self::rename(data, options, DOCUMENT_KEY, ENTITY_KEY)
    }
}
