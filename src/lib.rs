pub mod ast;
pub mod collection;
pub mod compiler;
pub mod error;
pub mod grammar;
pub mod interpreter;
pub mod metadata;
pub mod normaliser;
pub mod parser;
pub mod registry;
pub mod repository;
pub mod sequencer;
pub mod sql;
pub mod storage;
pub mod token;

pub use compiler::compile_sequence;
pub use grammar::TokenParser;
pub use interpreter::{CompiledQuery, DocumentInterpreter, QueryInterpreter};
pub use metadata::EntityMetadata;
pub use parser::{parse_command, parse_grammar, parse_tokens};
pub use registry::MetadataRegistry;
pub use repository::{IncludeRelationships, Repository, RepositoryManager};
pub use sequencer::TokenSequencer;
pub use sql::SqlInterpreter;
pub use storage::{SqliteStorage, Storage};
pub use token::{Token, TokenFactory};
