use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rustyline::{error::ReadlineError, Editor};
use structopt::StructOpt;

use tokenmap::{
    compile_sequence, parse_command, parse_grammar, DocumentInterpreter, QueryInterpreter,
    SqlInterpreter, TokenParser,
};

const GRAMMAR_FILENAME: &str = "grammar.tql";

#[derive(Debug)]
enum Backend {
    Document,
    Sql,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "document" => Ok(Backend::Document),
            "sql" => Ok(Backend::Sql),
            other => Err(anyhow!("unknown backend '{}'", other)),
        }
    }
}

/// Validates token sequences and prints the call plans they compile to.
#[derive(Debug, StructOpt)]
#[structopt(name = "tokenmap")]
struct Opt {
    /// Grammar definitions to validate against instead of the bundled ones.
    #[structopt(long, parse(from_os_str))]
    grammar: Option<PathBuf>,

    /// Which interpreter compiles queries: document or sql.
    #[structopt(long, default_value = "document")]
    backend: Backend,

    /// Logs more, can be repeated.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn load_parser(path: Option<&Path>) -> Result<TokenParser> {
    let path = match path {
        Some(path) => Some(path),
        None => Some(Path::new(GRAMMAR_FILENAME)).filter(|path| path.exists()),
    };

    let parser = match path {
        Some(path) => {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_grammar(&code).with_context(|| format!("invalid grammar in {}", path.display()))?
        }
        None => TokenParser::with_default_grammar()?,
    };
    Ok(parser)
}

fn handle_input(parser: &TokenParser, interpreter: &dyn QueryInterpreter, line: &str) -> Result<String> {
    let sequence = parse_command(line)?.into_sequence();
    parser.parse_token_sequence(&sequence)?;
    if !sequence.sequence_type().is_query() {
        return Ok("ok".to_owned());
    }

    let query = compile_sequence(&sequence)?;
    let compiled = interpreter.interpret(&query)?;
    Ok(serde_json::to_string_pretty(&compiled)?)
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let level = match opt.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let parser = load_parser(opt.grammar.as_deref())?;
    let interpreter: Box<dyn QueryInterpreter> = match opt.backend {
        Backend::Document => Box::new(DocumentInterpreter::default()),
        Backend::Sql => Box::new(SqlInterpreter::default()),
    };

    // TODO: complete rule names and token kinds
    let mut editor = Editor::<()>::new();
    loop {
        let readline = editor.readline("> ");
        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(line.as_str());

                match handle_input(&parser, interpreter.as_ref(), &line) {
                    Ok(output) => {
                        println!("{}", output);
                    }
                    Err(e) => {
                        println!("Error: {}", e);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }

    Ok(())
}
