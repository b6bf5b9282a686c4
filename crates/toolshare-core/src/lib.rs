//! Domain core for the ToolShare lending platform.
//!
//! Pure types and rules only: the interval overlap policy, the reservation
//! status machine, trust-score arithmetic, and the error taxonomy. All
//! storage and I/O live in `toolshare-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 5;

/// Everything a core operation can reject with. Storage failures are a
/// separate concern wrapped by the store crate.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid interval: start must be strictly before end")]
    InvalidInterval,
    #[error("a tool cannot be reserved by its own owner")]
    SelfBooking,
    #[error("requested dates conflict with reservation {conflicting}")]
    BookingConflict { conflicting: ReservationId },
    #[error("score must be between {MIN_SCORE} and {MAX_SCORE}, got {0}")]
    InvalidScore(i64),
    #[error("user {actor} is not authorized to {action}")]
    Unauthorized { actor: UserId, action: &'static str },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("illegal reservation status transition: {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("reservation {0} is not completed and cannot be rated yet")]
    ReservationNotCompleted(ReservationId),
    #[error("user {0} did not take part in reservation {1}")]
    NotParticipant(UserId, ReservationId),
    #[error("user {1} already rated reservation {0}")]
    DuplicateRating(ReservationId, UserId),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ToolId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ReservationId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RatingId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ToolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ReservationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for RatingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Advisory listing status. The reservation ledger, not this flag, decides
/// booking conflicts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Available,
    Reserved,
    Unavailable,
}

impl ToolStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::Unavailable => "unavailable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "reserved" => Some(Self::Reserved),
            "unavailable" => Some(Self::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Active reservations are the ones that count toward conflict checks.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }

    /// The reservation lifecycle: pending -> approved -> completed, with
    /// cancellation allowed from either active state. Terminal states accept
    /// nothing.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Cancelled)
                | (Self::Approved, Self::Completed)
                | (Self::Approved, Self::Cancelled)
        )
    }
}

impl Display for ReservationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open interval `[start, end)` over UTC instants.
///
/// This type carries the single overlap policy for the whole workspace:
/// touching endpoints (one reservation ending exactly when another starts)
/// do not conflict. Every conflict check must go through [`Self::overlaps`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct DateRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl DateRange {
    /// Builds a well-formed range.
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidInterval`] unless `start < end`.
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, DomainError> {
        if start >= end {
            return Err(DomainError::InvalidInterval);
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl Display for DateRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A validated rating score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Score(i64);

impl Score {
    /// # Errors
    /// Returns [`DomainError::InvalidScore`] when `value` lies outside
    /// `[MIN_SCORE, MAX_SCORE]`.
    pub fn new(value: i64) -> Result<Self, DomainError> {
        if !(MIN_SCORE..=MAX_SCORE).contains(&value) {
            return Err(DomainError::InvalidScore(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn value(self) -> i64 {
        self.0
    }
}

/// Arithmetic mean of received scores; 0.0 for a user with no ratings yet.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn trust_score(scores: &[i64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<i64>() as f64 / scores.len() as f64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub trust_score: f64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tool {
    pub tool_id: ToolId,
    pub owner_id: UserId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub status: ToolStatus,
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub tool_id: ToolId,
    pub borrower_id: UserId,
    pub range: DateRange,
    pub status: ReservationStatus,
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rating {
    pub rating_id: RatingId,
    pub reservation_id: ReservationId,
    pub rater_id: UserId,
    pub rated_user_id: UserId,
    pub score: Score,
    pub comment: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: Ulid,
    pub user_id: UserId,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Registration payload validated before anything touches storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationInput {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegistrationInput {
    /// Field-level checks; uniqueness is enforced by the registry.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for blank or malformed fields.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.username.trim().is_empty() {
            return Err(DomainError::Validation(
                "username must not be blank".to_string(),
            ));
        }
        if self.username.trim() != self.username {
            return Err(DomainError::Validation(
                "username must not have leading or trailing whitespace".to_string(),
            ));
        }
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@')
        {
            return Err(DomainError::Validation(format!(
                "invalid email address: {email:?}"
            )));
        }
        if self.password.is_empty() {
            return Err(DomainError::Validation(
                "password must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityDirection {
    Borrowed,
    Lent,
}

impl ActivityDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Borrowed => "borrowed",
            Self::Lent => "lent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "borrowed" => Some(Self::Borrowed),
            "lent" => Some(Self::Lent),
            _ => None,
        }
    }
}

/// One row of the per-user activity report: borrowed and lent reservations
/// merged, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEntry {
    pub direction: ActivityDirection,
    pub tool_name: String,
    pub counterparty: String,
    pub activity_date: OffsetDateTime,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopRatedUser {
    pub user_id: UserId,
    pub username: String,
    pub avg_rating: f64,
    pub rating_count: usize,
}

/// A completed reservation the user took part in but has not rated yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatableReservation {
    pub reservation_id: ReservationId,
    pub tool_name: String,
    pub counterparty_id: UserId,
    pub counterparty_name: String,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DomainError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DomainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DomainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DomainError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
