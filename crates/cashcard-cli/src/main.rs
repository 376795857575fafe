use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use cashcard_api::{parse_sort, CashCardApi, CreateCardRequest, UpdateCardRequest};
use cashcard_core::{CardId, Identity, PageSpec, Role, SortSpec};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ccd")]
#[command(about = "CashCard ledger CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "./cashcard.sqlite3")]
    db: PathBuf,

    /// Caller identity name, normally asserted by an authenticating layer.
    #[arg(long = "as", global = true)]
    identity: Option<String>,

    /// Roles granted to the caller; repeatable.
    #[arg(long = "role", global = true, value_enum)]
    roles: Vec<RoleArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Card {
        #[command(subcommand)]
        command: Box<CardCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CardCommand {
    Create(CardCreateArgs),
    Get(CardIdArg),
    List(CardListArgs),
    Update(CardUpdateArgs),
    Deactivate(CardIdArg),
}

#[derive(Debug, Args)]
struct CardCreateArgs {
    #[arg(long)]
    amount: f64,
}

#[derive(Debug, Args)]
struct CardIdArg {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct CardListArgs {
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    size: u32,
    /// Sort expression such as `amount,desc`. Defaults to `amount,asc`.
    #[arg(long)]
    sort: Option<String>,
}

#[derive(Debug, Args)]
struct CardUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    amount: f64,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    Show(CardIdArg),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    CardOwner,
    Admin,
}

impl RoleArg {
    fn into_role(self) -> Role {
        match self {
            Self::CardOwner => Role::CardOwner,
            Self::Admin => Role::Admin,
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
    let api = CashCardApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Card { command } => {
            let identity = caller_identity(cli.identity.as_deref(), &cli.roles)?;
            run_card(*command, &api, &identity)
        }
        Command::Audit { command } => {
            let identity = caller_identity(cli.identity.as_deref(), &cli.roles)?;
            run_audit(*command, &api, &identity)
        }
    }
}

fn caller_identity(name: Option<&str>, roles: &[RoleArg]) -> Result<Identity> {
    let name = name.ok_or_else(|| anyhow!("caller identity MUST be provided with --as"))?;
    Ok(Identity::new(name, roles.iter().map(|role| role.into_role())))
}

fn run_db(command: DbCommand, api: &CashCardApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_card(command: CardCommand, api: &CashCardApi, identity: &Identity) -> Result<()> {
    match command {
        CardCommand::Create(args) => {
            let card =
                api.create_card(identity, CreateCardRequest { amount: Some(args.amount) })?;
            emit_json(serde_json::to_value(&card).context("failed to serialize card")?)
        }
        CardCommand::Get(args) => {
            let card = api.get_card(identity, parse_card_id(&args.id)?)?;
            emit_json(serde_json::to_value(&card).context("failed to serialize card")?)
        }
        CardCommand::List(args) => {
            let page = PageSpec { page: args.page, size: args.size };
            let sort = match args.sort.as_deref() {
                Some(raw) => parse_sort(raw)
                    .ok_or_else(|| anyhow!("invalid sort expression: {raw}"))?,
                None => SortSpec::default(),
            };
            let cards = api.list_cards(identity, &page, &sort)?;
            emit_json(serde_json::json!({ "cards": cards }))
        }
        CardCommand::Update(args) => {
            let card = api.update_card(
                identity,
                parse_card_id(&args.id)?,
                UpdateCardRequest { amount: Some(args.amount) },
            )?;
            emit_json(serde_json::to_value(&card).context("failed to serialize card")?)
        }
        CardCommand::Deactivate(args) => {
            let entry = api.deactivate_card(identity, parse_card_id(&args.id)?)?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize audit entry")?)
        }
    }
}

fn run_audit(command: AuditCommand, api: &CashCardApi, identity: &Identity) -> Result<()> {
    match command {
        AuditCommand::Show(args) => {
            let entry = api.audit_entry(identity, parse_card_id(&args.id)?)?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize audit entry")?)
        }
    }
}

fn parse_card_id(value: &str) -> Result<CardId> {
    CardId::parse(value).ok_or_else(|| anyhow!("invalid card id: {value}"))
}
