//! Command surface of the `provdb` binary.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_command`] runs a single
//! command against an already opened store. Every command except `bands
//! --format table` prints pretty JSON on stdout. Logs go to stderr.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use provdb_core::{
    display_date, AlwaysProceed, ErrorCheckpoint, FlatRecordKind, FormulaMode, MigrationOptions,
    MigrationOutcome, StructureFilter, StructureMatch, DEFAULT_GROUP_SIZE,
};
use provdb_store_sqlite::{BandsQuery, SqliteProvenanceStore};

pub mod logging;

#[derive(Debug, Parser)]
#[command(name = "provdb")]
#[command(about = "Provenance database maintenance and query CLI")]
pub struct Cli {
    #[arg(long, default_value = "./provdb.sqlite3")]
    db: PathBuf,

    /// Log at debug level regardless of `RUST_LOG`.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the schema in the target database.
    Init,
    /// Node creation statistics.
    Stats(StatsArgs),
    /// Nodes sharing a uuid.
    Duplicates,
    /// Every ancestor of the given nodes.
    Parents(ParentsArgs),
    /// Run a raw SQL statement.
    Raw(RawArgs),
    /// Bands nodes with their closest ancestor structure.
    Bands(BandsArgs),
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    user_id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct ParentsArgs {
    #[arg(long = "node-id", required = true, num_args = 1..)]
    node_ids: Vec<i64>,
}

#[derive(Debug, Args)]
pub struct RawArgs {
    #[arg(long)]
    sql: String,
}

#[derive(Debug, Args)]
pub struct BandsArgs {
    /// Only list bands owned by this email. Without it, bands of every
    /// user are listed.
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    past_days: Option<u32>,
    #[arg(long = "group-name")]
    group_names: Vec<String>,
    #[arg(long = "group-id")]
    group_ids: Vec<i64>,
    #[arg(long = "element")]
    elements: Vec<String>,
    #[arg(long = "element-only")]
    elements_only: Vec<String>,
    /// hill, hill_compact, reduce, count or count_compact.
    #[arg(long, default_value = "hill", value_parser = parse_formula_mode)]
    formula_mode: FormulaMode,
    #[arg(long, value_enum, default_value_t = OutputFormatArg::Table)]
    format: OutputFormatArg,
}

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Move db_dbattribute rows into db_dbnode.attributes.
    Attributes(FlatMigrateArgs),
    /// Move db_dbextra rows into db_dbnode.extras.
    Extras(FlatMigrateArgs),
    /// Validate and canonicalize legacy JSON text columns.
    JsonColumns,
}

#[derive(Debug, Args)]
pub struct FlatMigrateArgs {
    #[arg(long)]
    create_columns: bool,
    #[arg(long, default_value_t = DEFAULT_GROUP_SIZE)]
    group_size: usize,
    /// Commit even when some rows could not be converted.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormatArg {
    Table,
    Json,
}

/// Asks on stderr whether a migration with conversion errors should be
/// committed. Anything but `y`/`yes` declines.
pub struct PromptCheckpoint<R> {
    input: R,
}

impl<R: BufRead> PromptCheckpoint<R> {
    #[must_use]
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> ErrorCheckpoint for PromptCheckpoint<R> {
    fn proceed(&mut self, error_count: usize) -> bool {
        eprint!("{error_count} record(s) could not be converted. Commit anyway? [y/N] ");
        io::stderr().flush().ok();

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read confirmation, declining");
                false
            }
        }
    }
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, when the
/// command fails, or when a flat record migration was rolled back.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteProvenanceStore::open(&cli.db)?;
    store.migrate()?;
    tracing::debug!(db = %cli.db.display(), "store ready");

    if matches!(cli.command, Command::Init) {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "db": cli.db.display().to_string(),
                "status": "initialized",
            }))?
        );
        return Ok(());
    }

    run_command(cli.command, &mut store)
}

/// Executes one command against an existing store handle.
///
/// # Errors
/// Returns an error when the underlying store operation fails or a flat
/// record migration was rolled back.
pub fn run_command(command: Command, store: &mut SqliteProvenanceStore) -> Result<()> {
    match command {
        Command::Init => Ok(()),
        Command::Stats(args) => {
            let report = store.creation_statistics(args.user_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Duplicates => {
            let duplicates = store.duplicate_node_uuids()?;
            println!("{}", serde_json::to_string_pretty(&duplicates)?);
            Ok(())
        }
        Command::Parents(args) => {
            let parents = store.all_parents(&args.node_ids)?;
            println!("{}", serde_json::to_string_pretty(&parents)?);
            Ok(())
        }
        Command::Raw(args) => {
            let rows = store.raw(&args.sql)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Command::Bands(args) => {
            let format = args.format;
            let matches = store.bands_and_parent_structures(&build_bands_query(args))?;
            match format {
                OutputFormatArg::Json => {
                    println!("{}", serde_json::to_string_pretty(&matches)?);
                }
                OutputFormatArg::Table => print_bands_table(&matches)?,
            }
            Ok(())
        }
        Command::Migrate { command } => run_migrate(command, store),
    }
}

fn run_migrate(command: MigrateCommand, store: &mut SqliteProvenanceStore) -> Result<()> {
    let (kind, args) = match command {
        MigrateCommand::Attributes(args) => (FlatRecordKind::Attributes, args),
        MigrateCommand::Extras(args) => (FlatRecordKind::Extras, args),
        MigrateCommand::JsonColumns => {
            let report = store.migrate_json_columns()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
    };

    let options = MigrationOptions {
        create_columns: args.create_columns,
        group_size: args.group_size,
    };
    let report = if args.yes {
        store.migrate_flat_records(kind, &options, &mut AlwaysProceed)?
    } else {
        let stdin = io::stdin();
        let mut checkpoint = PromptCheckpoint::new(stdin.lock());
        store.migrate_flat_records(kind, &options, &mut checkpoint)?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    match report.outcome {
        MigrationOutcome::Committed => Ok(()),
        MigrationOutcome::RolledBack => Err(anyhow!(
            "{} migration rolled back after {} conversion error(s)",
            kind.as_str(),
            report.error_count
        )),
    }
}

fn build_bands_query(args: BandsArgs) -> BandsQuery {
    BandsQuery {
        owner_email: args.user,
        past_days: args.past_days,
        group_names: args.group_names,
        group_ids: args.group_ids,
        filter: StructureFilter {
            elements: non_empty(args.elements),
            elements_only: non_empty(args.elements_only),
            formula_mode: args.formula_mode,
        },
        ..BandsQuery::default()
    }
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn parse_formula_mode(value: &str) -> Result<FormulaMode, String> {
    FormulaMode::parse(value).ok_or_else(|| format!("unknown formula mode '{value}'"))
}

fn print_bands_table(matches: &[StructureMatch]) -> Result<()> {
    println!("{:<8} {:<24} {:<12} label", "id", "formula", "created");
    println!("{}", "-".repeat(70));
    for item in matches {
        println!(
            "{:<8} {:<24} {:<12} {}",
            item.record_id,
            item.formula,
            display_date(item.creation_date)?,
            item.label
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse cli args {args:?}: {err}"),
        }
    }

    #[test]
    fn bands_arguments_map_onto_query() {
        let cli = parse(&[
            "provdb",
            "bands",
            "--user",
            "alice@example.com",
            "--past-days",
            "7",
            "--group-name",
            "a",
            "--group-name",
            "b",
            "--element",
            "Si",
            "--formula-mode",
            "hill_compact",
            "--format",
            "json",
        ]);

        let Command::Bands(args) = cli.command else {
            panic!("expected bands command");
        };
        assert_eq!(args.format, OutputFormatArg::Json);

        let query = build_bands_query(args);
        assert_eq!(query.owner_email.as_deref(), Some("alice@example.com"));
        assert_eq!(query.past_days, Some(7));
        assert_eq!(query.group_names, vec!["a", "b"]);
        assert!(query.group_ids.is_empty());
        assert_eq!(query.filter.elements, Some(vec!["Si".to_string()]));
        assert_eq!(query.filter.elements_only, None);
        assert_eq!(query.filter.formula_mode, FormulaMode::HillCompact);
    }

    #[test]
    fn formula_mode_defaults_to_hill_and_rejects_unknown_names() {
        let cli = parse(&["provdb", "bands"]);
        let Command::Bands(args) = cli.command else {
            panic!("expected bands command");
        };
        assert_eq!(args.formula_mode, FormulaMode::Hill);
        assert_eq!(args.format, OutputFormatArg::Table);

        assert!(Cli::try_parse_from(["provdb", "bands", "--formula-mode", "iupac"]).is_err());
    }

    #[test]
    fn migrate_defaults_to_prompting_with_standard_group_size() {
        let cli = parse(&["provdb", "--db", "x.sqlite3", "migrate", "attributes"]);
        let Command::Migrate {
            command: MigrateCommand::Attributes(args),
        } = cli.command
        else {
            panic!("expected migrate attributes");
        };
        assert!(!args.yes);
        assert!(!args.create_columns);
        assert_eq!(args.group_size, DEFAULT_GROUP_SIZE);
    }

    #[test]
    fn parents_requires_a_node_id() {
        assert!(Cli::try_parse_from(["provdb", "parents"]).is_err());
        let cli = parse(&["provdb", "parents", "--node-id", "3", "4"]);
        let Command::Parents(args) = cli.command else {
            panic!("expected parents command");
        };
        assert_eq!(args.node_ids, vec![3, 4]);
    }

    #[test]
    fn debug_flag_is_global() {
        assert!(parse(&["provdb", "duplicates", "--debug"]).debug());
        assert!(!parse(&["provdb", "duplicates"]).debug());
    }

    #[test]
    fn prompt_accepts_only_explicit_yes() {
        for (answer, expected) in [
            ("y\n", true),
            ("YES\n", true),
            ("n\n", false),
            ("\n", false),
            ("", false),
            ("maybe\n", false),
        ] {
            let mut checkpoint = PromptCheckpoint::new(Cursor::new(answer.as_bytes()));
            assert_eq!(checkpoint.proceed(2), expected, "answer {answer:?}");
        }
    }
}
