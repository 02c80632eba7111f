use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use decision_trace_api::{build_policy_store, DecisionEngine, IngestRequest};
use decision_trace_core::{DecisionId, DecisionType, IngestSource};
use decision_trace_store_sqlite::SqliteStore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dtrace")]
#[command(about = "Decision trace CLI")]
struct Cli {
    #[arg(long, default_value = "./decision_traces.sqlite3")]
    db: PathBuf,

    /// Policy version list (JSON or YAML); built-in defaults when omitted.
    #[arg(long)]
    policies: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Ingest(IngestArgs),
    Decision {
        #[command(subcommand)]
        command: Box<DecisionCommand>,
    },
    Patterns(PatternsArgs),
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Read the message text from a file.
    #[arg(long, conflicts_with = "text")]
    file: Option<PathBuf>,
    /// Pass the message text inline.
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    customer: String,
    #[arg(long)]
    decision_type: DecisionTypeArg,
    /// Idempotency key; derived from the text content when omitted.
    #[arg(long)]
    message_key: Option<String>,
    /// Decision id this message corrects.
    #[arg(long)]
    corrects: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DecisionCommand {
    Show(DecisionShowArgs),
    Recent(DecisionRecentArgs),
}

#[derive(Debug, Args)]
struct DecisionShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct DecisionRecentArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    customer: Option<String>,
}

#[derive(Debug, Args)]
struct PatternsArgs {
    #[arg(long)]
    industry: Option<String>,
    #[arg(long)]
    decision_type: Option<DecisionTypeArg>,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    List,
    Current,
    At(PolicyAtArgs),
}

#[derive(Debug, Args)]
struct PolicyAtArgs {
    /// RFC 3339 timestamp to resolve against the version table.
    #[arg(long)]
    timestamp: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DecisionTypeArg {
    DiscountApproval,
    CreditExtension,
    RefundRequest,
    ContractException,
    PaymentTerms,
    Other,
}

impl From<DecisionTypeArg> for DecisionType {
    fn from(value: DecisionTypeArg) -> Self {
        match value {
            DecisionTypeArg::DiscountApproval => Self::DiscountApproval,
            DecisionTypeArg::CreditExtension => Self::CreditExtension,
            DecisionTypeArg::RefundRequest => Self::RefundRequest,
            DecisionTypeArg::ContractException => Self::ContractException,
            DecisionTypeArg::PaymentTerms => Self::PaymentTerms,
            DecisionTypeArg::Other => Self::Other,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Ingest(args) => {
            let engine = build_engine(&cli.db, cli.policies.as_deref())?;
            run_ingest(args, &engine)
        }
        Command::Decision { command } => {
            let engine = build_engine(&cli.db, cli.policies.as_deref())?;
            run_decision(*command, &engine)
        }
        Command::Patterns(args) => {
            let engine = build_engine(&cli.db, cli.policies.as_deref())?;
            run_patterns(&args, &engine)
        }
        Command::Policy { command } => {
            let engine = build_engine(&cli.db, cli.policies.as_deref())?;
            run_policy(*command, &engine)
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
    }
}

fn build_engine(db: &Path, policies: Option<&Path>) -> Result<DecisionEngine> {
    let store = build_policy_store(policies)?;
    DecisionEngine::new(db.to_path_buf(), store)
}

fn run_ingest(args: IngestArgs, engine: &DecisionEngine) -> Result<()> {
    let message_text = match (args.file, args.text) {
        (Some(path), None) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read message file {}", path.display()))?,
        (None, Some(text)) => text,
        (None, None) => return Err(anyhow!("one of --file or --text is required")),
        (Some(_), Some(_)) => return Err(anyhow!("--file and --text are mutually exclusive")),
    };
    let corrects = args
        .corrects
        .as_deref()
        .map(|raw| {
            DecisionId::parse(raw).ok_or_else(|| anyhow!("invalid decision id: {raw}"))
        })
        .transpose()?;

    let report = engine.ingest(IngestRequest {
        message_text: Some(message_text),
        message_ref: None,
        message_key: args.message_key,
        customer_name: args.customer,
        decision_type: args.decision_type.into(),
        source: IngestSource::Manual,
        corrects_decision_id: corrects,
    })?;
    emit_json(serde_json::to_value(&report).context("failed to serialize ingest report")?)
}

fn run_decision(command: DecisionCommand, engine: &DecisionEngine) -> Result<()> {
    match command {
        DecisionCommand::Show(args) => {
            let id = DecisionId::parse(&args.id)
                .ok_or_else(|| anyhow!("invalid decision id: {}", args.id))?;
            let trace = engine
                .decision(id)?
                .ok_or_else(|| anyhow!("decision not found: {}", args.id))?;
            emit_json(serde_json::to_value(&trace).context("failed to serialize trace")?)
        }
        DecisionCommand::Recent(args) => {
            let summaries = match args.customer {
                Some(customer) => engine.decisions_for_customer(&customer, args.limit)?,
                None => engine.recent_decisions(args.limit)?,
            };
            emit_json(serde_json::json!({ "decisions": summaries }))
        }
    }
}

fn run_patterns(args: &PatternsArgs, engine: &DecisionEngine) -> Result<()> {
    let stats =
        engine.pattern_stats(args.industry.as_deref(), args.decision_type.map(Into::into))?;
    emit_json(serde_json::to_value(&stats).context("failed to serialize pattern stats")?)
}

fn run_policy(command: PolicyCommand, engine: &DecisionEngine) -> Result<()> {
    match command {
        PolicyCommand::List => emit_json(serde_json::json!({
            "versions": engine.policies().versions()
        })),
        PolicyCommand::Current => {
            let current = engine
                .policies()
                .current()
                .ok_or_else(|| anyhow!("no current policy version configured"))?;
            emit_json(serde_json::to_value(current).context("failed to serialize policy")?)
        }
        PolicyCommand::At(args) => {
            let timestamp = OffsetDateTime::parse(&args.timestamp, &Rfc3339)
                .with_context(|| format!("invalid RFC 3339 timestamp: {}", args.timestamp))?;
            let resolved = engine.policies().resolve(timestamp);
            emit_json(serde_json::json!({
                "timestamp": args.timestamp,
                "policy": resolved
            }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize report")?)
        }
    }
}
