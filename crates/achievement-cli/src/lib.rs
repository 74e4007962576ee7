//! Embedded command surface for the achievement lifecycle engine.
//!
//! Hosts can drive the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against store paths.
//! - [`execute`] for execution against an already opened [`SqliteEngine`].
//!
//! Every command renders its result as JSON. Failures are rendered by
//! [`ErrorEnvelope`] with the stable codes of [`achievement_core::ErrorKind`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use achievement_core::{
    now_utc, parse_rfc3339_utc, AchievementCategory, AchievementError, AchievementStatus,
    Attachment, CategoryDetails, CommonDetails, DetailPatch, ErrorKind, NewAchievement,
    ReferenceFilter, ReferenceId, StudentId, UserId,
};
use achievement_lifecycle::{AchievementLifecycle, RequestContext};
use achievement_store_sqlite::{SqliteDetailStore, SqliteReferenceStore};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Each store owns a single `rusqlite::Connection`, so an engine is `Send`
/// but not `Sync`: open one per worker or request instead of sharing it.
/// Concurrent engines on the same files are serialized by SQLite's
/// IMMEDIATE transactions.
pub type SqliteEngine = AchievementLifecycle<SqliteDetailStore, SqliteReferenceStore>;

#[derive(Debug, Parser)]
#[command(name = "ach")]
#[command(about = "Achievement lifecycle CLI")]
pub struct Cli {
    /// Reference store (workflow status, history, advisors).
    #[arg(long, env = "ACHIEVEMENT_DB", default_value = "./achievements.sqlite3")]
    db: PathBuf,

    /// Detail document store.
    #[arg(
        long,
        env = "ACHIEVEMENT_DETAIL_DB",
        default_value = "./achievement_details.sqlite3"
    )]
    detail_db: PathBuf,

    /// Caller recorded as actor in history and as reviewer on verify/reject.
    #[arg(long, env = "ACHIEVEMENT_ACTOR", default_value = "cli")]
    actor: String,

    /// Tracing filter directives, e.g. `info` or `achievement_lifecycle=debug`.
    #[arg(long, env = "ACHIEVEMENT_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

/// Locations of the two stores.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub db: PathBuf,
    pub detail_db: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a draft achievement.
    Create(Box<CreateArgs>),
    /// Apply a partial content update to a draft.
    Update(UpdateArgs),
    /// Record attachment metadata on a draft.
    Attach(AttachArgs),
    Submit(IdArgs),
    Verify(IdArgs),
    Reject(RejectArgs),
    /// Soft delete.
    Delete(IdArgs),
    /// Hard delete of a draft and its detail document.
    Purge(IdArgs),
    Show(ShowArgs),
    List(FilterArgs),
    History(IdArgs),
    Stats(FilterArgs),
    Report(StudentArgs),
    Advisor {
        #[command(subcommand)]
        command: AdvisorCommand,
    },
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    student: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    category: CategoryArg,
    /// Category-specific fields as a JSON object.
    #[arg(long, default_value = "{}")]
    details_json: String,
    #[arg(long, default_value_t = 0.0)]
    points: f64,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    event_date: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    organizer: Option<String>,
    #[arg(long)]
    score: Option<f64>,
    #[arg(long, default_value = "{}")]
    extensions_json: String,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    /// Partial update; `extensions` keys set to null are removed.
    #[arg(long)]
    patch_json: String,
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    file_name: String,
    #[arg(long)]
    file_url: String,
    #[arg(long)]
    file_type: String,
    #[arg(long)]
    uploaded_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    note: String,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: String,
    /// Skip the detail lookup and print the reference record only.
    #[arg(long)]
    reference_only: bool,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    student: Option<String>,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
pub struct StudentArgs {
    #[arg(long)]
    student: String,
}

#[derive(Debug, Subcommand)]
pub enum AdvisorCommand {
    /// Set the advisor of a student; omit `--advisor` to clear it.
    Assign {
        #[arg(long)]
        student: String,
        #[arg(long)]
        advisor: Option<String>,
    },
    /// Non-deleted achievements of every student advised by `--advisor`.
    Queue {
        #[arg(long)]
        advisor: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    Competition,
    Publication,
    Organization,
    Certification,
    Other,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    Submitted,
    Verified,
    Rejected,
    Deleted,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AdvisorAssignment {
    pub student_id: StudentId,
    pub advisor_id: Option<UserId>,
}

/// Failure rendering written to stderr by the binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_detail: Option<String>,
}

impl ErrorEnvelope {
    /// Domain failures keep their kind; anything else is reported as a store failure.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<AchievementError>() {
            Some(domain) => {
                let kind = domain.kind();
                Self {
                    code: kind.as_str().to_string(),
                    message: domain.to_string(),
                    status: kind.suggested_http_status(),
                    orphaned_detail: domain.orphaned_detail().map(|id| id.as_str().to_string()),
                }
            }
            None => Self {
                code: ErrorKind::Store.as_str().to_string(),
                message: format!("{err:#}"),
                status: ErrorKind::Store.suggested_http_status(),
                orphaned_detail: None,
            },
        }
    }
}

/// Installs the stderr tracing subscriber. Stdout stays reserved for JSON.
///
/// # Errors
/// Returns an error for malformed filter directives or when a global
/// subscriber is already installed.
pub fn init_tracing(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(raw) => {
            EnvFilter::try_new(raw).map_err(|err| anyhow!("invalid --log-level value: {err}"))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the stores cannot be opened or migrated, or when
/// the command fails. Domain failures stay downcastable to
/// [`AchievementError`].
pub fn run_cli(cli: Cli) -> Result<()> {
    let paths = StorePaths {
        db: cli.db,
        detail_db: cli.detail_db,
    };
    run_with_db(&paths, &cli.actor, cli.command)
}

/// Executes a parsed command against the stores at `paths` and prints the
/// JSON result to stdout.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(paths: &StorePaths, actor: &str, command: Command) -> Result<()> {
    let engine = open_engine(paths)?;
    let ctx = RequestContext::new(UserId::parse(actor)?);
    let output = execute(command, &engine, &ctx)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Opens and migrates both stores.
///
/// # Errors
/// Returns an error when either database cannot be opened or migrated.
pub fn open_engine(paths: &StorePaths) -> Result<SqliteEngine> {
    let references = SqliteReferenceStore::open(&paths.db)
        .with_context(|| format!("failed to open reference store {}", paths.db.display()))?;
    references.migrate()?;

    let details = SqliteDetailStore::open(&paths.detail_db).with_context(|| {
        format!(
            "failed to open detail store {}",
            paths.detail_db.display()
        )
    })?;
    details.migrate()?;

    debug!(
        db = %paths.db.display(),
        detail_db = %paths.detail_db.display(),
        "stores opened"
    );
    Ok(AchievementLifecycle::new(details, references))
}

/// Executes a parsed command against an existing engine and returns its JSON
/// rendering.
///
/// # Errors
/// Returns an error when argument decoding or the engine operation fails.
pub fn execute(command: Command, engine: &SqliteEngine, ctx: &RequestContext) -> Result<Value> {
    match command {
        Command::Create(args) => {
            let input = new_achievement_from_args(*args)?;
            to_json(&engine.create(ctx, &input)?)
        }
        Command::Update(args) => {
            let patch: DetailPatch = serde_json::from_str(&args.patch_json)
                .map_err(|err| invalid(format!("invalid --patch-json: {err}")))?;
            to_json(&engine.update_content(ctx, ReferenceId::parse(&args.id)?, &patch)?)
        }
        Command::Attach(args) => {
            let attachment = Attachment {
                file_name: args.file_name,
                file_url: args.file_url,
                file_type: args.file_type,
                uploaded_at: parse_optional_utc(args.uploaded_at.as_deref())?
                    .unwrap_or_else(now_utc),
            };
            to_json(&engine.append_attachment(ctx, ReferenceId::parse(&args.id)?, &attachment)?)
        }
        Command::Submit(args) => to_json(&engine.submit(ctx, ReferenceId::parse(&args.id)?)?),
        Command::Verify(args) => to_json(&engine.verify(ctx, ReferenceId::parse(&args.id)?)?),
        Command::Reject(args) => to_json(&engine.reject(
            ctx,
            ReferenceId::parse(&args.id)?,
            &args.note,
        )?),
        Command::Delete(args) => to_json(&engine.delete(ctx, ReferenceId::parse(&args.id)?)?),
        Command::Purge(args) => to_json(&engine.purge(ctx, ReferenceId::parse(&args.id)?)?),
        Command::Show(args) => {
            let reference_id = ReferenceId::parse(&args.id)?;
            if args.reference_only {
                to_json(&engine.get_reference(ctx, reference_id)?)
            } else {
                to_json(&engine.get_detail(ctx, reference_id)?)
            }
        }
        Command::List(args) => to_json(&engine.list(ctx, &filter_from_args(&args)?)?),
        Command::History(args) => to_json(&engine.history(ctx, ReferenceId::parse(&args.id)?)?),
        Command::Stats(args) => to_json(&engine.statistics(ctx, &filter_from_args(&args)?)?),
        Command::Report(args) => {
            to_json(&engine.student_report(ctx, &StudentId::parse(&args.student)?)?)
        }
        Command::Advisor { command } => run_advisor(command, engine, ctx),
    }
}

fn run_advisor(
    command: AdvisorCommand,
    engine: &SqliteEngine,
    ctx: &RequestContext,
) -> Result<Value> {
    match command {
        AdvisorCommand::Assign { student, advisor } => {
            let assignment = AdvisorAssignment {
                student_id: StudentId::parse(&student)?,
                advisor_id: advisor.as_deref().map(UserId::parse).transpose()?,
            };
            ctx.checkpoint("advisor assignment")?;
            engine
                .references()
                .assign_advisor(&assignment.student_id, assignment.advisor_id.as_ref())?;
            to_json(&assignment)
        }
        AdvisorCommand::Queue { advisor } => {
            to_json(&engine.list_for_advisor(ctx, &UserId::parse(&advisor)?)?)
        }
    }
}

fn new_achievement_from_args(args: CreateArgs) -> Result<NewAchievement> {
    let category = map_category(args.category);
    let mut details = parse_json_object(&args.details_json, "--details-json")?;
    details.insert(
        "category".to_string(),
        Value::String(category.as_str().to_string()),
    );
    let details: CategoryDetails = serde_json::from_value(Value::Object(details))
        .map_err(|err| {
            invalid(format!(
                "invalid --details-json for category {}: {err} (use --extensions-json for other fields)",
                category.as_str()
            ))
        })?;

    let extensions: BTreeMap<String, Value> =
        parse_json_object(&args.extensions_json, "--extensions-json")?
            .into_iter()
            .collect();

    Ok(NewAchievement {
        student_id: StudentId::parse(&args.student)?,
        title: args.title,
        description: args.description,
        details,
        common: CommonDetails {
            event_date: parse_optional_utc(args.event_date.as_deref())?,
            location: args.location,
            organizer: args.organizer,
            score: args.score,
        },
        extensions,
        points: args.points,
        tags: args.tags,
    })
}

fn filter_from_args(args: &FilterArgs) -> Result<ReferenceFilter> {
    Ok(ReferenceFilter {
        status: args.status.map(map_status),
        student_id: args.student.as_deref().map(StudentId::parse).transpose()?,
        include_deleted: args.include_deleted,
    })
}

fn map_category(value: CategoryArg) -> AchievementCategory {
    match value {
        CategoryArg::Competition => AchievementCategory::Competition,
        CategoryArg::Publication => AchievementCategory::Publication,
        CategoryArg::Organization => AchievementCategory::Organization,
        CategoryArg::Certification => AchievementCategory::Certification,
        CategoryArg::Other => AchievementCategory::Other,
    }
}

fn map_status(value: StatusArg) -> AchievementStatus {
    match value {
        StatusArg::Draft => AchievementStatus::Draft,
        StatusArg::Submitted => AchievementStatus::Submitted,
        StatusArg::Verified => AchievementStatus::Verified,
        StatusArg::Rejected => AchievementStatus::Rejected,
        StatusArg::Deleted => AchievementStatus::Deleted,
    }
}

fn parse_json_object(raw: &str, flag: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(invalid(format!("{flag} must be a JSON object"))),
        Err(err) => Err(invalid(format!("invalid {flag}: {err}"))),
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    Ok(raw.map(parse_rfc3339_utc).transpose()?)
}

fn invalid(message: String) -> anyhow::Error {
    AchievementError::Validation(message).into()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
