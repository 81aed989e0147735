//! The `exhume` binary: recover deleted rows from SQLite database files.
//!
//! Subcommands:
//! - `csv`: dump recovered rows (and optionally likely-live ones) to CSV
//! - `undelete`: re-insert recovered rows into a copy of the database
//! - `grep`: search freed regions for a byte pattern
//!
//! Exit codes: 0 rows recovered / matches found, 1 fatal error, 2 clean
//! run with nothing recovered, 3 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use exhume_error::Result;
use exhume_recover::{HeuristicsRegistry, Session};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod csv_out;
mod output_dir;
mod undelete;

#[derive(Parser, Debug)]
#[command(name = "exhume")]
#[command(version, about = "Recovers deleted rows from SQLite database files")]
struct Cli {
    /// Give more output (repeat for trace level).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Heuristics file to use instead of the per-user one.
    #[arg(long, global = true, value_name = "FILE")]
    heuristics: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump recovered rows to CSV, one file per table.
    Csv {
        /// SQLite database file.
        db: PathBuf,

        /// Only this table, written to stdout.
        #[arg(long)]
        table: Option<String>,

        /// Also emit rows that match a live row bytewise.
        #[arg(long)]
        include_live: bool,

        /// Output directory (default: derived from the database name).
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Insert recovered rows into a copy of the database.
    Undelete {
        /// SQLite database file.
        db: PathBuf,

        /// Output path (default: `<db>.undeleted` beside the input).
        output: Option<PathBuf>,
    },

    /// Search freed regions for a byte pattern.
    Grep {
        /// SQLite database file.
        db: PathBuf,

        /// Byte-level regular expression (\xNN escapes permitted).
        pattern: String,

        /// Search every page, not just freed regions.
        #[arg(long)]
        all_pages: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_registry(cli: &Cli) -> Result<HeuristicsRegistry> {
    match &cli.heuristics {
        Some(path) => HeuristicsRegistry::load_from_path(path),
        None => HeuristicsRegistry::load_default(),
    }
}

fn run(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Command::Csv {
            db,
            table,
            include_live,
            output_dir,
        } => {
            let registry = load_registry(cli)?;
            let session = Session::open(db, registry)?;
            let recovered = csv_out::dump(&session, table.as_deref(), *include_live, output_dir.as_deref(), db)?;
            Ok(success_code(recovered))
        }
        Command::Undelete { db, output } => {
            let registry = load_registry(cli)?;
            let session = Session::open(db, registry)?;
            let inserted = undelete::run(&session, db, output.as_deref())?;
            Ok(success_code(inserted))
        }
        Command::Grep {
            db,
            pattern,
            all_pages,
        } => {
            // Grep needs no heuristics; an empty registry avoids a
            // config failure blocking an unrelated search.
            let session = Session::open(db, HeuristicsRegistry::empty())?;
            let matches = session.grep(pattern, *all_pages)?;
            for m in &matches {
                println!("{}:{}", m.page, m.offset);
            }
            if matches.is_empty() {
                warn!("pattern not found");
            } else {
                info!(matches = matches.len(), "search complete");
            }
            Ok(success_code(matches.len()))
        }
    }
}

/// 0 when the run produced data, 2 on a clean run with nothing found.
const fn success_code(found: usize) -> u8 {
    if found > 0 { 0 } else { 2 }
}
