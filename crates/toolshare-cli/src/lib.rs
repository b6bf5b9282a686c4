//! Command surface for the ToolShare core.
//!
//! This binary stands in for the excluded web layer: every core operation
//! (reservation ledger, trust aggregator, registry, reports) is reachable as
//! a subcommand, and results are printed as JSON for the caller to render.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use time::{Duration, OffsetDateTime};
use toolshare_core::{
    now_utc, parse_rfc3339_utc, DateRange, DomainError, RegistrationInput, ReservationId,
    ReservationStatus, Score, ToolId, ToolStatus, UserId,
};
use toolshare_store_sqlite::{SqliteStore, StoreError};

#[derive(Debug, Parser)]
#[command(name = "toolshare")]
#[command(about = "ToolShare lending core CLI")]
pub struct Cli {
    #[arg(long, default_value = "./toolshare.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the database schema.
    Init,
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Tool {
        #[command(subcommand)]
        command: ToolCommand,
    },
    Reservation {
        #[command(subcommand)]
        command: ReservationCommand,
    },
    Rating {
        #[command(subcommand)]
        command: RatingCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(RegisterArgs),
    Login(LoginArgs),
    Logout {
        #[arg(long)]
        token: String,
    },
    Show {
        #[arg(long)]
        user_id: i64,
    },
    Delete(ActorTargetArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long, default_value_t = 24)]
    ttl_hours: i64,
}

#[derive(Debug, Args)]
pub struct ActorTargetArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    actor: i64,
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Subcommand)]
pub enum ToolCommand {
    Add(ToolAddArgs),
    Update(ToolUpdateArgs),
    Delete {
        #[arg(long)]
        tool_id: i64,
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        admin: bool,
    },
    Search {
        #[arg(long)]
        query: String,
    },
    List {
        #[arg(long)]
        owner: i64,
    },
}

#[derive(Debug, Args)]
pub struct ToolAddArgs {
    #[arg(long)]
    owner: i64,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    category: String,
}

#[derive(Debug, Args)]
pub struct ToolUpdateArgs {
    #[arg(long)]
    tool_id: i64,
    #[arg(long)]
    actor: i64,
    #[arg(long)]
    admin: bool,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long, default_value = "available")]
    status: ToolStatusArg,
}

#[derive(Debug, Subcommand)]
pub enum ReservationCommand {
    Create(ReservationCreateArgs),
    Status(ReservationStatusArgs),
    Delete {
        #[arg(long)]
        reservation_id: i64,
        #[arg(long)]
        actor: i64,
        #[arg(long)]
        admin: bool,
    },
    Show {
        #[arg(long)]
        reservation_id: i64,
    },
}

#[derive(Debug, Args)]
pub struct ReservationCreateArgs {
    #[arg(long)]
    tool_id: i64,
    #[arg(long)]
    borrower: i64,
    /// RFC3339 UTC instant, inclusive.
    #[arg(long)]
    start: String,
    /// RFC3339 UTC instant, exclusive.
    #[arg(long)]
    end: String,
}

#[derive(Debug, Args)]
pub struct ReservationStatusArgs {
    #[arg(long)]
    reservation_id: i64,
    #[arg(long)]
    status: ReservationStatusArg,
    #[arg(long)]
    actor: i64,
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Subcommand)]
pub enum RatingCommand {
    Add(RatingAddArgs),
}

#[derive(Debug, Args)]
pub struct RatingAddArgs {
    #[arg(long)]
    reservation_id: i64,
    #[arg(long)]
    rater: i64,
    #[arg(long)]
    score: i64,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Activity {
        #[arg(long)]
        user_id: i64,
    },
    TopRated,
    NeverReserved,
    Available {
        /// RFC3339 UTC instant to test availability against; defaults to now.
        #[arg(long)]
        as_of: Option<String>,
    },
    Ratable {
        #[arg(long)]
        user_id: i64,
    },
    Borrowed {
        #[arg(long)]
        user_id: i64,
    },
    Lent {
        #[arg(long)]
        user_id: i64,
    },
    RatingsReceived {
        #[arg(long)]
        user_id: i64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ToolStatusArg {
    Available,
    Reserved,
    Unavailable,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReservationStatusArg {
    Approved,
    Completed,
    Cancelled,
}

fn map_tool_status(value: ToolStatusArg) -> ToolStatus {
    match value {
        ToolStatusArg::Available => ToolStatus::Available,
        ToolStatusArg::Reserved => ToolStatus::Reserved,
        ToolStatusArg::Unavailable => ToolStatus::Unavailable,
    }
}

fn map_reservation_status(value: ReservationStatusArg) -> ReservationStatus {
    match value {
        ReservationStatusArg::Approved => ReservationStatus::Approved,
        ReservationStatusArg::Completed => ReservationStatus::Completed,
        ReservationStatusArg::Cancelled => ReservationStatus::Cancelled,
    }
}

/// Executes a parsed command against the configured database.
///
/// # Errors
/// Returns an error when store open/migrate fails or the operation is
/// rejected; rejections keep their [`DomainError`] kind for the envelope.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

#[allow(clippy::too_many_lines)]
fn run_command(command: Command, store: &mut SqliteStore) -> Result<()> {
    match command {
        Command::Init => {
            print_json(&serde_json::json!({ "initialized": true }))?;
        }
        Command::User { command } => match command {
            UserCommand::Register(args) => {
                let input = RegistrationInput {
                    username: args.username,
                    email: args.email,
                    password: args.password,
                };
                let user = store.register_user(&input)?;
                print_json(&user)?;
            }
            UserCommand::Login(args) => {
                let user = store
                    .authenticate(&args.username, &args.password)?
                    .ok_or_else(|| {
                        StoreError::from(DomainError::Validation(
                            "invalid username or password".to_string(),
                        ))
                    })?;
                let session = store.create_session(user.user_id, Duration::hours(args.ttl_hours))?;
                print_json(&serde_json::json!({ "user": user, "session": session }))?;
            }
            UserCommand::Logout { token } => {
                let revoked = store.revoke_session(&token)?;
                print_json(&serde_json::json!({ "revoked": revoked }))?;
            }
            UserCommand::Show { user_id } => {
                let user = store.get_user(UserId(user_id))?;
                print_json(&user)?;
            }
            UserCommand::Delete(args) => {
                store.delete_user(UserId(args.user_id), UserId(args.actor), args.admin)?;
                print_json(&serde_json::json!({ "deleted": true }))?;
            }
        },
        Command::Tool { command } => match command {
            ToolCommand::Add(args) => {
                let tool = store.add_tool(
                    UserId(args.owner),
                    &args.name,
                    &args.description,
                    &args.category,
                )?;
                print_json(&tool)?;
            }
            ToolCommand::Update(args) => {
                let tool = store.update_tool(
                    ToolId(args.tool_id),
                    UserId(args.actor),
                    args.admin,
                    &args.name,
                    &args.description,
                    &args.category,
                    map_tool_status(args.status),
                )?;
                print_json(&tool)?;
            }
            ToolCommand::Delete {
                tool_id,
                actor,
                admin,
            } => {
                store.delete_tool(ToolId(tool_id), UserId(actor), admin)?;
                print_json(&serde_json::json!({ "deleted": true }))?;
            }
            ToolCommand::Search { query } => {
                let tools = store.search_tools(&query)?;
                print_json(&tools)?;
            }
            ToolCommand::List { owner } => {
                let tools = store.list_tools_owned_by(UserId(owner))?;
                print_json(&tools)?;
            }
        },
        Command::Reservation { command } => match command {
            ReservationCommand::Create(args) => {
                let range = DateRange::new(parse_utc(&args.start)?, parse_utc(&args.end)?)
                    .map_err(StoreError::from)?;
                let reservation =
                    store.create_reservation(ToolId(args.tool_id), UserId(args.borrower), range)?;
                print_json(&reservation)?;
            }
            ReservationCommand::Status(args) => {
                let reservation = store.update_reservation_status(
                    ReservationId(args.reservation_id),
                    map_reservation_status(args.status),
                    UserId(args.actor),
                    args.admin,
                )?;
                print_json(&reservation)?;
            }
            ReservationCommand::Delete {
                reservation_id,
                actor,
                admin,
            } => {
                store.delete_reservation(ReservationId(reservation_id), UserId(actor), admin)?;
                print_json(&serde_json::json!({ "deleted": true }))?;
            }
            ReservationCommand::Show { reservation_id } => {
                let reservation = store.get_reservation(ReservationId(reservation_id))?;
                print_json(&reservation)?;
            }
        },
        Command::Rating { command } => match command {
            RatingCommand::Add(args) => {
                let score = Score::new(args.score).map_err(StoreError::from)?;
                let rating = store.record_rating(
                    ReservationId(args.reservation_id),
                    UserId(args.rater),
                    score,
                    args.comment.as_deref(),
                )?;
                print_json(&rating)?;
            }
        },
        Command::Report { command } => match command {
            ReportCommand::Activity { user_id } => {
                print_json(&store.activity_report(UserId(user_id))?)?;
            }
            ReportCommand::TopRated => {
                print_json(&store.top_rated_users()?)?;
            }
            ReportCommand::NeverReserved => {
                print_json(&store.never_reserved_tools()?)?;
            }
            ReportCommand::Available { as_of } => {
                let as_of = parse_optional_utc(as_of.as_deref())?;
                print_json(&store.available_tools(as_of)?)?;
            }
            ReportCommand::Ratable { user_id } => {
                print_json(&store.ratable_reservations(UserId(user_id))?)?;
            }
            ReportCommand::Borrowed { user_id } => {
                print_json(&store.reservations_borrowed_by(UserId(user_id))?)?;
            }
            ReportCommand::Lent { user_id } => {
                print_json(&store.reservations_for_owner(UserId(user_id))?)?;
            }
            ReportCommand::RatingsReceived { user_id } => {
                print_json(&store.ratings_received(UserId(user_id))?)?;
            }
        },
    }
    Ok(())
}

/// Maps a rejection onto the stable envelope code the collaborator layer
/// pattern-matches on.
#[must_use]
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    let Some(store_err) = err.downcast_ref::<StoreError>() else {
        return "internal";
    };
    match store_err.as_domain() {
        Some(DomainError::InvalidInterval) => "invalid_interval",
        Some(DomainError::SelfBooking) => "self_booking",
        Some(DomainError::BookingConflict { .. }) => "booking_conflict",
        Some(DomainError::InvalidScore(_)) => "invalid_score",
        Some(DomainError::Unauthorized { .. }) => "unauthorized",
        Some(DomainError::NotFound { .. }) => "not_found",
        Some(DomainError::InvalidTransition { .. }) => "invalid_transition",
        Some(DomainError::ReservationNotCompleted(_)) => "reservation_not_completed",
        Some(DomainError::NotParticipant(..)) => "not_participant",
        Some(DomainError::DuplicateRating(..)) => "duplicate_rating",
        Some(DomainError::Validation(_)) => "validation",
        None => "storage",
    }
}

/// Prints the error envelope to stderr; the caller decides the exit code.
pub fn print_error_envelope(err: &anyhow::Error) {
    let envelope = serde_json::json!({
        "error": { "kind": error_kind(err), "message": err.to_string() }
    });
    eprintln!("{envelope}");
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_utc(value: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(value).map_err(|err| anyhow!("{err}"))
}

fn parse_optional_utc(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_utc(raw),
        None => Ok(now_utc()),
    }
}
