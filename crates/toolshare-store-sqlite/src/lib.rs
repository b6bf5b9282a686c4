//! SQLite-backed store for the ToolShare core: the reservation ledger, the
//! trust-score aggregator, the tool/user registry, session lifecycle, and
//! the read-only reporting views.
//!
//! Every multi-row write runs inside an immediate transaction, so the
//! check-then-insert sequence of [`SqliteStore::create_reservation`] is
//! atomic across connections and processes sharing one database file. The
//! interval overlap policy itself lives in [`toolshare_core::DateRange`];
//! this crate is its only call site and the schema deliberately carries no
//! SQL copy of the rule.

#![allow(clippy::missing_errors_doc)]

use std::fmt::Write as _;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use toolshare_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ActivityDirection, ActivityEntry, DateRange,
    DomainError, RatableReservation, Rating, RatingId, RegistrationInput, Reservation,
    ReservationId, ReservationStatus, Role, Score, Session, Tool, ToolId, ToolStatus, TopRatedUser,
    User, UserId,
};
use tracing::{debug, info};
use ulid::Ulid;

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  email TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
  trust_score REAL NOT NULL DEFAULT 0 CHECK (trust_score BETWEEN 0 AND 5),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tools (
  tool_id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  category TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'available' CHECK (
    status IN ('available', 'reserved', 'unavailable')
  ),
  last_updated TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES users(user_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tools_owner ON tools(owner_id);
CREATE INDEX IF NOT EXISTS idx_tools_name ON tools(name);

CREATE TABLE IF NOT EXISTS reservations (
  reservation_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tool_id INTEGER NOT NULL,
  borrower_id INTEGER NOT NULL,
  start_at TEXT NOT NULL,
  end_at TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending' CHECK (
    status IN ('pending', 'approved', 'completed', 'cancelled')
  ),
  last_updated TEXT NOT NULL,
  CHECK (start_at < end_at),
  FOREIGN KEY (tool_id) REFERENCES tools(tool_id) ON DELETE CASCADE,
  FOREIGN KEY (borrower_id) REFERENCES users(user_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_reservations_tool_status
  ON reservations(tool_id, status);
CREATE INDEX IF NOT EXISTS idx_reservations_borrower
  ON reservations(borrower_id);

CREATE TABLE IF NOT EXISTS ratings (
  rating_id INTEGER PRIMARY KEY AUTOINCREMENT,
  reservation_id INTEGER NOT NULL,
  rater_id INTEGER NOT NULL,
  rated_user_id INTEGER NOT NULL,
  score INTEGER NOT NULL CHECK (score BETWEEN 1 AND 5),
  comment TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (reservation_id, rater_id),
  FOREIGN KEY (reservation_id) REFERENCES reservations(reservation_id) ON DELETE CASCADE,
  FOREIGN KEY (rater_id) REFERENCES users(user_id) ON DELETE CASCADE,
  FOREIGN KEY (rated_user_id) REFERENCES users(user_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ratings_rated_user ON ratings(rated_user_id);

CREATE TABLE IF NOT EXISTS sessions (
  token TEXT PRIMARY KEY,
  user_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// The typed domain rejection, when this failure is one.
    #[must_use]
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            Self::Sqlite(_) | Self::Corrupt(_) => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A reservation joined with the names the dashboard listings show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservationListing {
    pub reservation: Reservation,
    pub tool_name: String,
    pub counterparty: String,
}

/// A received rating joined with the rater's username.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatingReceived {
    pub rating: Rating,
    pub rater_name: String,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory database for tests; same pragmas apart from the journal.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        self.conn.execute_batch(SCHEMA_V1)?;

        let now = fmt_ts(now_utc())?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![MIGRATION_VERSION, now],
        )?;

        debug!(version = MIGRATION_VERSION, "schema migration applied");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tool/User registry
    // ------------------------------------------------------------------

    pub fn register_user(&mut self, input: &RegistrationInput) -> StoreResult<User> {
        input.validate()?;

        let now = now_utc();
        let now_raw = fmt_ts(now)?;
        let password_hash = hash_password(&input.password);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT user_id FROM users WHERE username = ?1 OR email = ?2",
                params![input.username, input.email],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(DomainError::Validation(
                "username or email already taken".to_string(),
            )
            .into());
        }

        tx.execute(
            "INSERT INTO users(username, email, password_hash, role, trust_score, created_at)
             VALUES (?1, ?2, ?3, 'user', 0, ?4)",
            params![input.username, input.email, password_hash, now_raw],
        )?;
        let user_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(user_id, username = %input.username, "user registered");
        Ok(User {
            user_id: UserId(user_id),
            username: input.username.clone(),
            email: input.email.clone(),
            role: Role::User,
            trust_score: 0.0,
            created_at: now,
        })
    }

    /// Credential check for the collaborator layer; `None` means unknown
    /// username or wrong password, indistinguishably.
    pub fn authenticate(&self, username: &str, password: &str) -> StoreResult<Option<User>> {
        let password_hash = hash_password(password);
        let user = self
            .conn
            .query_row(
                &format!("{USER_SELECT} WHERE username = ?1 AND password_hash = ?2"),
                params![username, password_hash],
                parse_user_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: UserId) -> StoreResult<User> {
        self.conn
            .query_row(
                &format!("{USER_SELECT} WHERE user_id = ?1"),
                params![user_id.0],
                parse_user_row,
            )
            .optional()?
            .ok_or_else(|| not_found("user", user_id.0))
    }

    /// Admin-only; cascades over the user's tools, reservations, ratings,
    /// and sessions via foreign keys.
    pub fn delete_user(&mut self, target: UserId, actor: UserId, is_admin: bool) -> StoreResult<()> {
        if !is_admin {
            return Err(DomainError::Unauthorized {
                actor,
                action: "delete users",
            }
            .into());
        }
        if target == actor {
            return Err(DomainError::Validation(
                "administrators cannot delete their own account".to_string(),
            )
            .into());
        }

        let affected = self
            .conn
            .execute("DELETE FROM users WHERE user_id = ?1", params![target.0])?;
        if affected == 0 {
            return Err(not_found("user", target.0));
        }

        info!(user_id = target.0, "user deleted");
        Ok(())
    }

    pub fn add_tool(
        &mut self,
        owner_id: UserId,
        name: &str,
        description: &str,
        category: &str,
    ) -> StoreResult<Tool> {
        if name.trim().is_empty() {
            return Err(DomainError::Validation("tool name must not be blank".to_string()).into());
        }

        let now = now_utc();
        let now_raw = fmt_ts(now)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_user_exists(&tx, owner_id)?;
        tx.execute(
            "INSERT INTO tools(owner_id, name, description, category, status, last_updated)
             VALUES (?1, ?2, ?3, ?4, 'available', ?5)",
            params![owner_id.0, name, description, category, now_raw],
        )?;
        let tool_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(tool_id, owner_id = owner_id.0, "tool listed");
        Ok(Tool {
            tool_id: ToolId(tool_id),
            owner_id,
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            status: ToolStatus::Available,
            last_updated: now,
        })
    }

    /// Owner-or-admin edit of a listing; bumps `last_updated`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_tool(
        &mut self,
        tool_id: ToolId,
        actor: UserId,
        is_admin: bool,
        name: &str,
        description: &str,
        category: &str,
        status: ToolStatus,
    ) -> StoreResult<Tool> {
        let now_raw = fmt_ts(now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner = tool_owner(&tx, tool_id)?;
        if owner != actor && !is_admin {
            return Err(DomainError::Unauthorized {
                actor,
                action: "edit this tool",
            }
            .into());
        }

        tx.execute(
            "UPDATE tools
             SET name = ?2, description = ?3, category = ?4, status = ?5, last_updated = ?6
             WHERE tool_id = ?1",
            params![
                tool_id.0,
                name,
                description,
                category,
                status.as_str(),
                now_raw
            ],
        )?;

        let tool = tx.query_row(
            &format!("{TOOL_SELECT} WHERE tool_id = ?1"),
            params![tool_id.0],
            parse_tool_row,
        )?;
        tx.commit()?;
        Ok(tool)
    }

    pub fn delete_tool(&mut self, tool_id: ToolId, actor: UserId, is_admin: bool) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner = tool_owner(&tx, tool_id)?;
        if owner != actor && !is_admin {
            return Err(DomainError::Unauthorized {
                actor,
                action: "delete this tool",
            }
            .into());
        }

        tx.execute("DELETE FROM tools WHERE tool_id = ?1", params![tool_id.0])?;
        tx.commit()?;

        info!(tool_id = tool_id.0, "tool delisted");
        Ok(())
    }

    pub fn get_tool(&self, tool_id: ToolId) -> StoreResult<Tool> {
        self.conn
            .query_row(
                &format!("{TOOL_SELECT} WHERE tool_id = ?1"),
                params![tool_id.0],
                parse_tool_row,
            )
            .optional()?
            .ok_or_else(|| not_found("tool", tool_id.0))
    }

    pub fn list_tools_owned_by(&self, owner_id: UserId) -> StoreResult<Vec<Tool>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{TOOL_SELECT} WHERE owner_id = ?1 ORDER BY tool_id ASC"))?;
        let rows = stmt.query_map(params![owner_id.0], parse_tool_row)?;
        collect_rows(rows)
    }

    /// Case-insensitive substring match over name and category.
    pub fn search_tools(&self, query: &str) -> StoreResult<Vec<Tool>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let mut stmt = self.conn.prepare(&format!(
            "{TOOL_SELECT}
             WHERE lower(name) LIKE ?1 OR lower(category) LIKE ?1
             ORDER BY name ASC, tool_id ASC"
        ))?;
        let rows = stmt.query_map(params![pattern], parse_tool_row)?;
        collect_rows(rows)
    }

    // ------------------------------------------------------------------
    // Reservation ledger
    // ------------------------------------------------------------------

    /// Atomic check-then-insert of a booking request.
    ///
    /// The immediate transaction takes the database write lock before the
    /// conflict scan, so two concurrent conflicting requests serialize and
    /// the second observes the first's row. Exactly one of them succeeds.
    pub fn create_reservation(
        &mut self,
        tool_id: ToolId,
        borrower_id: UserId,
        range: DateRange,
    ) -> StoreResult<Reservation> {
        let now = now_utc();
        let now_raw = fmt_ts(now)?;
        let start_raw = fmt_ts(range.start)?;
        let end_raw = fmt_ts(range.end)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner = tool_owner(&tx, tool_id)?;
        ensure_user_exists(&tx, borrower_id)?;
        if owner == borrower_id {
            return Err(DomainError::SelfBooking.into());
        }

        // Single call site of the overlap policy.
        for (existing_id, existing) in active_reservation_ranges(&tx, tool_id)? {
            if existing.overlaps(&range) {
                debug!(
                    tool_id = tool_id.0,
                    borrower_id = borrower_id.0,
                    conflicting = existing_id.0,
                    "booking conflict"
                );
                return Err(DomainError::BookingConflict {
                    conflicting: existing_id,
                }
                .into());
            }
        }

        tx.execute(
            "INSERT INTO reservations(tool_id, borrower_id, start_at, end_at, status, last_updated)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![tool_id.0, borrower_id.0, start_raw, end_raw, now_raw],
        )?;
        let reservation_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            reservation_id,
            tool_id = tool_id.0,
            borrower_id = borrower_id.0,
            "reservation created"
        );
        Ok(Reservation {
            reservation_id: ReservationId(reservation_id),
            tool_id,
            borrower_id,
            range,
            status: ReservationStatus::Pending,
            last_updated: now,
        })
    }

    /// Advances the reservation lifecycle. Only the owning tool's owner or
    /// an admin may do this, and only along a legal transition; both
    /// violations reject explicitly rather than silently matching no rows.
    pub fn update_reservation_status(
        &mut self,
        reservation_id: ReservationId,
        new_status: ReservationStatus,
        actor: UserId,
        is_admin: bool,
    ) -> StoreResult<Reservation> {
        let now = now_utc();
        let now_raw = fmt_ts(now)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut reservation = get_reservation_tx(&tx, reservation_id)?;
        let owner = tool_owner(&tx, reservation.tool_id)?;
        if owner != actor && !is_admin {
            return Err(DomainError::Unauthorized {
                actor,
                action: "update this reservation",
            }
            .into());
        }
        if !reservation.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidTransition {
                from: reservation.status,
                to: new_status,
            }
            .into());
        }

        tx.execute(
            "UPDATE reservations SET status = ?2, last_updated = ?3 WHERE reservation_id = ?1",
            params![reservation_id.0, new_status.as_str(), now_raw],
        )?;
        tx.commit()?;

        info!(
            reservation_id = reservation_id.0,
            from = %reservation.status,
            to = %new_status,
            "reservation status updated"
        );
        reservation.status = new_status;
        reservation.last_updated = now;
        Ok(reservation)
    }

    /// Borrower-or-admin removal of a reservation.
    pub fn delete_reservation(
        &mut self,
        reservation_id: ReservationId,
        actor: UserId,
        is_admin: bool,
    ) -> StoreResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reservation = get_reservation_tx(&tx, reservation_id)?;
        if reservation.borrower_id != actor && !is_admin {
            return Err(DomainError::Unauthorized {
                actor,
                action: "delete this reservation",
            }
            .into());
        }

        tx.execute(
            "DELETE FROM reservations WHERE reservation_id = ?1",
            params![reservation_id.0],
        )?;
        tx.commit()?;

        info!(reservation_id = reservation_id.0, "reservation deleted");
        Ok(())
    }

    pub fn get_reservation(&self, reservation_id: ReservationId) -> StoreResult<Reservation> {
        self.conn
            .query_row(
                &format!("{RESERVATION_SELECT} WHERE reservation_id = ?1"),
                params![reservation_id.0],
                parse_reservation_row,
            )
            .optional()?
            .ok_or_else(|| not_found("reservation", reservation_id.0))
    }

    // ------------------------------------------------------------------
    // Trust score aggregator
    // ------------------------------------------------------------------

    /// Records a rating for a completed exchange and recomputes the rated
    /// user's trust score in the same transaction; no intermediate state is
    /// observable.
    ///
    /// The rated user is derived from the reservation (the rater's
    /// counterparty), never taken from the caller.
    pub fn record_rating(
        &mut self,
        reservation_id: ReservationId,
        rater_id: UserId,
        score: Score,
        comment: Option<&str>,
    ) -> StoreResult<Rating> {
        let now = now_utc();
        let now_raw = fmt_ts(now)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reservation = get_reservation_tx(&tx, reservation_id)?;
        if reservation.status != ReservationStatus::Completed {
            return Err(DomainError::ReservationNotCompleted(reservation_id).into());
        }

        let owner = tool_owner(&tx, reservation.tool_id)?;
        let rated_user_id = if rater_id == reservation.borrower_id {
            owner
        } else if rater_id == owner {
            reservation.borrower_id
        } else {
            return Err(DomainError::NotParticipant(rater_id, reservation_id).into());
        };

        let already: Option<i64> = tx
            .query_row(
                "SELECT rating_id FROM ratings WHERE reservation_id = ?1 AND rater_id = ?2",
                params![reservation_id.0, rater_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Err(DomainError::DuplicateRating(reservation_id, rater_id).into());
        }

        tx.execute(
            "INSERT INTO ratings(reservation_id, rater_id, rated_user_id, score, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reservation_id.0,
                rater_id.0,
                rated_user_id.0,
                score.value(),
                comment,
                now_raw
            ],
        )?;
        let rating_id = tx.last_insert_rowid();

        // Materialized aggregate: trust_score must equal avg(score) over the
        // rated user's ratings after every insert.
        tx.execute(
            "UPDATE users
             SET trust_score = (
                SELECT AVG(score) FROM ratings WHERE rated_user_id = ?1
             )
             WHERE user_id = ?1",
            params![rated_user_id.0],
        )?;
        let new_trust: f64 = tx.query_row(
            "SELECT trust_score FROM users WHERE user_id = ?1",
            params![rated_user_id.0],
            |row| row.get(0),
        )?;
        tx.commit()?;

        info!(
            rating_id,
            reservation_id = reservation_id.0,
            rated_user_id = rated_user_id.0,
            trust_score = new_trust,
            "rating recorded"
        );
        Ok(Rating {
            rating_id: RatingId(rating_id),
            reservation_id,
            rater_id,
            rated_user_id,
            score,
            comment: comment.map(ToString::to_string),
            created_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn create_session(&mut self, user_id: UserId, ttl: Duration) -> StoreResult<Session> {
        let now = now_utc();
        let expires_at = now + ttl;
        let token = Ulid::new();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_user_exists(&tx, user_id)?;
        tx.execute(
            "INSERT INTO sessions(token, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                token.to_string(),
                user_id.0,
                fmt_ts(now)?,
                fmt_ts(expires_at)?
            ],
        )?;
        tx.commit()?;

        Ok(Session {
            token,
            user_id,
            created_at: now,
            expires_at,
        })
    }

    /// Resolves a session token to its user; `None` for unknown or expired
    /// tokens. Expired rows are removed on sight.
    pub fn session_user(&mut self, token: &str) -> StoreResult<Option<User>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((user_id, expires_raw)) = row else {
            return Ok(None);
        };
        let expires_at = parse_ts("sessions.expires_at", &expires_raw)?;
        if expires_at <= now_utc() {
            self.conn
                .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
            return Ok(None);
        }

        Ok(Some(self.get_user(UserId(user_id))?))
    }

    /// Returns whether a session row was removed.
    pub fn revoke_session(&mut self, token: &str) -> StoreResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(affected > 0)
    }

    pub fn purge_expired_sessions(&mut self) -> StoreResult<usize> {
        let rows: Vec<(String, String)> = {
            let mut stmt = self.conn.prepare("SELECT token, expires_at FROM sessions")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            collect_rows(mapped)?
        };

        let now = now_utc();
        let mut purged = 0;
        for (token, expires_raw) in rows {
            if parse_ts("sessions.expires_at", &expires_raw)? <= now {
                purged += self
                    .conn
                    .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
            }
        }
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    /// Tools listed as available with no active reservation covering `as_of`.
    pub fn available_tools(&self, as_of: OffsetDateTime) -> StoreResult<Vec<Tool>> {
        let candidates = {
            let mut stmt = self.conn.prepare(&format!(
                "{TOOL_SELECT} WHERE status = 'available' ORDER BY tool_id ASC"
            ))?;
            let rows = stmt.query_map([], parse_tool_row)?;
            collect_rows(rows)?
        };

        let mut out = Vec::with_capacity(candidates.len());
        for tool in candidates {
            let busy = active_reservation_ranges(&self.conn, tool.tool_id)?
                .iter()
                .any(|(_, range)| range.contains(as_of));
            if !busy {
                out.push(tool);
            }
        }
        Ok(out)
    }

    /// Per-user chronological union of borrowed and lent reservations,
    /// newest activity first: a merge of two already-sorted sequences.
    pub fn activity_report(&self, user_id: UserId) -> StoreResult<Vec<ActivityEntry>> {
        let borrowed = self.activity_rows(
            user_id,
            ActivityDirection::Borrowed,
            "SELECT t.name, owner.username, r.start_at, r.status
             FROM reservations r
             JOIN tools t ON r.tool_id = t.tool_id
             JOIN users owner ON t.owner_id = owner.user_id
             WHERE r.borrower_id = ?1
             ORDER BY r.start_at DESC, r.reservation_id DESC",
        )?;
        let lent = self.activity_rows(
            user_id,
            ActivityDirection::Lent,
            "SELECT t.name, borrower.username, r.start_at, r.status
             FROM reservations r
             JOIN tools t ON r.tool_id = t.tool_id
             JOIN users borrower ON r.borrower_id = borrower.user_id
             WHERE t.owner_id = ?1
             ORDER BY r.start_at DESC, r.reservation_id DESC",
        )?;

        Ok(merge_by_date_desc(borrowed, lent))
    }

    /// Users whose mean received rating strictly exceeds 4.0.
    pub fn top_rated_users(&self) -> StoreResult<Vec<TopRatedUser>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.username, AVG(r.score), COUNT(r.rating_id)
             FROM users u
             JOIN ratings r ON u.user_id = r.rated_user_id
             GROUP BY u.user_id, u.username
             HAVING AVG(r.score) > 4.0
             ORDER BY AVG(r.score) DESC, u.user_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let user_id: i64 = row.get(0)?;
            let username: String = row.get(1)?;
            let avg_rating: f64 = row.get(2)?;
            let count: i64 = row.get(3)?;
            Ok(TopRatedUser {
                user_id: UserId(user_id),
                username,
                avg_rating,
                rating_count: usize::try_from(count).unwrap_or(0),
            })
        })?;
        collect_rows(rows)
    }

    /// Set difference: tools that have never appeared in any reservation.
    pub fn never_reserved_tools(&self) -> StoreResult<Vec<Tool>> {
        let mut stmt = self.conn.prepare(&format!(
            "{TOOL_SELECT}
             WHERE tool_id NOT IN (SELECT DISTINCT tool_id FROM reservations)
             ORDER BY tool_id ASC"
        ))?;
        let rows = stmt.query_map([], parse_tool_row)?;
        collect_rows(rows)
    }

    /// Completed exchanges the user participated in and has not rated yet.
    pub fn ratable_reservations(&self, user_id: UserId) -> StoreResult<Vec<RatableReservation>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.reservation_id, t.name,
                    CASE WHEN r.borrower_id = ?1 THEN t.owner_id ELSE r.borrower_id END,
                    CASE WHEN r.borrower_id = ?1 THEN owner.username ELSE borrower.username END
             FROM reservations r
             JOIN tools t ON r.tool_id = t.tool_id
             JOIN users owner ON t.owner_id = owner.user_id
             JOIN users borrower ON r.borrower_id = borrower.user_id
             WHERE r.status = 'completed'
               AND (r.borrower_id = ?1 OR t.owner_id = ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM ratings rt
                   WHERE rt.reservation_id = r.reservation_id AND rt.rater_id = ?1
               )
             ORDER BY r.reservation_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.0], |row| {
            let reservation_id: i64 = row.get(0)?;
            let tool_name: String = row.get(1)?;
            let counterparty_id: i64 = row.get(2)?;
            let counterparty_name: String = row.get(3)?;
            Ok(RatableReservation {
                reservation_id: ReservationId(reservation_id),
                tool_name,
                counterparty_id: UserId(counterparty_id),
                counterparty_name,
            })
        })?;
        collect_rows(rows)
    }

    pub fn reservations_borrowed_by(&self, user_id: UserId) -> StoreResult<Vec<ReservationListing>> {
        self.reservation_listings(
            user_id,
            "SELECT r.reservation_id, r.tool_id, r.borrower_id, r.start_at, r.end_at,
                    r.status, r.last_updated, t.name, owner.username
             FROM reservations r
             JOIN tools t ON r.tool_id = t.tool_id
             JOIN users owner ON t.owner_id = owner.user_id
             WHERE r.borrower_id = ?1
             ORDER BY r.start_at DESC, r.reservation_id DESC",
        )
    }

    pub fn reservations_for_owner(&self, user_id: UserId) -> StoreResult<Vec<ReservationListing>> {
        self.reservation_listings(
            user_id,
            "SELECT r.reservation_id, r.tool_id, r.borrower_id, r.start_at, r.end_at,
                    r.status, r.last_updated, t.name, borrower.username
             FROM reservations r
             JOIN tools t ON r.tool_id = t.tool_id
             JOIN users borrower ON r.borrower_id = borrower.user_id
             WHERE t.owner_id = ?1
             ORDER BY r.start_at DESC, r.reservation_id DESC",
        )
    }

    pub fn ratings_received(&self, user_id: UserId) -> StoreResult<Vec<RatingReceived>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.rating_id, r.reservation_id, r.rater_id, r.rated_user_id,
                    r.score, r.comment, r.created_at, u.username
             FROM ratings r
             JOIN users u ON r.rater_id = u.user_id
             WHERE r.rated_user_id = ?1
             ORDER BY r.created_at DESC, r.rating_id DESC",
        )?;
        let rows = stmt.query_map(params![user_id.0], |row| {
            let rating = parse_rating_row(row)?;
            let rater_name: String = row.get(7)?;
            Ok(RatingReceived { rating, rater_name })
        })?;
        collect_rows(rows)
    }

    fn reservation_listings(
        &self,
        user_id: UserId,
        query: &str,
    ) -> StoreResult<Vec<ReservationListing>> {
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(params![user_id.0], |row| {
            let reservation = parse_reservation_row(row)?;
            let tool_name: String = row.get(7)?;
            let counterparty: String = row.get(8)?;
            Ok(ReservationListing {
                reservation,
                tool_name,
                counterparty,
            })
        })?;
        collect_rows(rows)
    }

    fn activity_rows(
        &self,
        user_id: UserId,
        direction: ActivityDirection,
        query: &str,
    ) -> StoreResult<Vec<ActivityEntry>> {
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(params![user_id.0], |row| {
            let tool_name: String = row.get(0)?;
            let counterparty: String = row.get(1)?;
            let date_raw: String = row.get(2)?;
            let status_raw: String = row.get(3)?;

            let activity_date = parse_rfc3339_utc(&date_raw)
                .map_err(|err| column_err(2, err.to_string()))?;
            let status = ReservationStatus::parse(&status_raw)
                .ok_or_else(|| column_err(3, format!("invalid reservation status: {status_raw}")))?;
            Ok(ActivityEntry {
                direction,
                tool_name,
                counterparty,
                activity_date,
                status,
            })
        })?;
        collect_rows(rows)
    }
}

const USER_SELECT: &str =
    "SELECT user_id, username, email, role, trust_score, created_at FROM users";
const TOOL_SELECT: &str =
    "SELECT tool_id, owner_id, name, description, category, status, last_updated FROM tools";
const RESERVATION_SELECT: &str =
    "SELECT reservation_id, tool_id, borrower_id, start_at, end_at, status, last_updated
     FROM reservations";

fn configure(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn not_found(entity: &'static str, id: i64) -> StoreError {
    DomainError::NotFound { entity, id }.into()
}

fn fmt_ts(value: OffsetDateTime) -> StoreResult<String> {
    format_rfc3339(value).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn parse_ts(column: &str, value: &str) -> StoreResult<OffsetDateTime> {
    parse_rfc3339_utc(value).map_err(|err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn column_err(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let user_id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let email: String = row.get(2)?;
    let role_raw: String = row.get(3)?;
    let trust_score: f64 = row.get(4)?;
    let created_raw: String = row.get(5)?;

    let role = Role::parse(&role_raw)
        .ok_or_else(|| column_err(3, format!("invalid role: {role_raw}")))?;
    let created_at =
        parse_rfc3339_utc(&created_raw).map_err(|err| column_err(5, err.to_string()))?;
    Ok(User {
        user_id: UserId(user_id),
        username,
        email,
        role,
        trust_score,
        created_at,
    })
}

fn parse_tool_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tool> {
    let tool_id: i64 = row.get(0)?;
    let owner_id: i64 = row.get(1)?;
    let name: String = row.get(2)?;
    let description: String = row.get(3)?;
    let category: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;

    let status = ToolStatus::parse(&status_raw)
        .ok_or_else(|| column_err(5, format!("invalid tool status: {status_raw}")))?;
    let last_updated =
        parse_rfc3339_utc(&updated_raw).map_err(|err| column_err(6, err.to_string()))?;
    Ok(Tool {
        tool_id: ToolId(tool_id),
        owner_id: UserId(owner_id),
        name,
        description,
        category,
        status,
        last_updated,
    })
}

fn parse_reservation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reservation> {
    let reservation_id: i64 = row.get(0)?;
    let tool_id: i64 = row.get(1)?;
    let borrower_id: i64 = row.get(2)?;
    let start_raw: String = row.get(3)?;
    let end_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;

    let start = parse_rfc3339_utc(&start_raw).map_err(|err| column_err(3, err.to_string()))?;
    let end = parse_rfc3339_utc(&end_raw).map_err(|err| column_err(4, err.to_string()))?;
    let range = DateRange::new(start, end).map_err(|err| column_err(4, err.to_string()))?;
    let status = ReservationStatus::parse(&status_raw)
        .ok_or_else(|| column_err(5, format!("invalid reservation status: {status_raw}")))?;
    let last_updated =
        parse_rfc3339_utc(&updated_raw).map_err(|err| column_err(6, err.to_string()))?;
    Ok(Reservation {
        reservation_id: ReservationId(reservation_id),
        tool_id: ToolId(tool_id),
        borrower_id: UserId(borrower_id),
        range,
        status,
        last_updated,
    })
}

fn parse_rating_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rating> {
    let rating_id: i64 = row.get(0)?;
    let reservation_id: i64 = row.get(1)?;
    let rater_id: i64 = row.get(2)?;
    let rated_user_id: i64 = row.get(3)?;
    let score_raw: i64 = row.get(4)?;
    let comment: Option<String> = row.get(5)?;
    let created_raw: String = row.get(6)?;

    let score = Score::new(score_raw).map_err(|err| column_err(4, err.to_string()))?;
    let created_at =
        parse_rfc3339_utc(&created_raw).map_err(|err| column_err(6, err.to_string()))?;
    Ok(Rating {
        rating_id: RatingId(rating_id),
        reservation_id: ReservationId(reservation_id),
        rater_id: UserId(rater_id),
        rated_user_id: UserId(rated_user_id),
        score,
        comment,
        created_at,
    })
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> StoreResult<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn ensure_user_exists(conn: &Connection, user_id: UserId) -> StoreResult<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT user_id FROM users WHERE user_id = ?1",
            params![user_id.0],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(not_found("user", user_id.0));
    }
    Ok(())
}

fn get_reservation_tx(
    conn: &Connection,
    reservation_id: ReservationId,
) -> StoreResult<Reservation> {
    conn.query_row(
        &format!("{RESERVATION_SELECT} WHERE reservation_id = ?1"),
        params![reservation_id.0],
        parse_reservation_row,
    )
    .optional()?
    .ok_or_else(|| not_found("reservation", reservation_id.0))
}

fn tool_owner(conn: &Connection, tool_id: ToolId) -> StoreResult<UserId> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT owner_id FROM tools WHERE tool_id = ?1",
            params![tool_id.0],
            |row| row.get(0),
        )
        .optional()?;
    owner
        .map(UserId)
        .ok_or_else(|| not_found("tool", tool_id.0))
}

/// Active (pending or approved) reservation intervals for a tool.
fn active_reservation_ranges(
    conn: &Connection,
    tool_id: ToolId,
) -> StoreResult<Vec<(ReservationId, DateRange)>> {
    let raw: Vec<(i64, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT reservation_id, start_at, end_at
             FROM reservations
             WHERE tool_id = ?1 AND status IN ('pending', 'approved')
             ORDER BY reservation_id ASC",
        )?;
        let rows = stmt.query_map(params![tool_id.0], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        collect_rows(rows)?
    };

    let mut ranges = Vec::with_capacity(raw.len());
    for (id, start_raw, end_raw) in raw {
        let start = parse_ts("reservations.start_at", &start_raw)?;
        let end = parse_ts("reservations.end_at", &end_raw)?;
        let range = DateRange::new(start, end)
            .map_err(|err| StoreError::Corrupt(format!("reservation {id}: {err}")))?;
        ranges.push((ReservationId(id), range));
    }
    Ok(ranges)
}

/// Merges two date-descending activity sequences, preserving order.
fn merge_by_date_desc(a: Vec<ActivityEntry>, b: Vec<ActivityEntry>) -> Vec<ActivityEntry> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut left = a.into_iter().peekable();
    let mut right = b.into_iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(lhs), Some(rhs)) => {
                if lhs.activity_date >= rhs.activity_date {
                    if let Some(entry) = left.next() {
                        merged.push(entry);
                    }
                } else if let Some(entry) = right.next() {
                    merged.push(entry);
                }
            }
            (Some(_), None) => {
                merged.extend(left);
                break;
            }
            (None, _) => {
                merged.extend(right);
                break;
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn entry(direction: ActivityDirection, date: &str) -> ActivityEntry {
        ActivityEntry {
            direction,
            tool_name: "drill".to_string(),
            counterparty: "bob".to_string(),
            activity_date: must_ok(parse_rfc3339_utc(date)),
            status: ReservationStatus::Completed,
        }
    }

    #[test]
    fn merge_keeps_descending_order_across_both_sides() {
        let borrowed = vec![
            entry(ActivityDirection::Borrowed, "2024-06-09T00:00:00Z"),
            entry(ActivityDirection::Borrowed, "2024-06-03T00:00:00Z"),
        ];
        let lent = vec![
            entry(ActivityDirection::Lent, "2024-06-07T00:00:00Z"),
            entry(ActivityDirection::Lent, "2024-06-01T00:00:00Z"),
        ];

        let merged = merge_by_date_desc(borrowed, lent);
        let dates: Vec<_> = merged.iter().map(|item| item.activity_date).collect();
        let mut sorted = dates.clone();
        sorted.sort_by(|x, y| y.cmp(x));
        assert_eq!(dates, sorted);
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn merge_handles_empty_sides() {
        let only = vec![entry(ActivityDirection::Lent, "2024-06-01T00:00:00Z")];
        assert_eq!(merge_by_date_desc(only.clone(), Vec::new()), only);
        assert_eq!(merge_by_date_desc(Vec::new(), only.clone()), only);
        assert!(merge_by_date_desc(Vec::new(), Vec::new()).is_empty());
    }

    #[test]
    fn password_hash_is_stable_hex() {
        let first = hash_password("hunter2");
        let second = hash_password("hunter2");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, hash_password("hunter3"));
    }
}
