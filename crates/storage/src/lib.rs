use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::str::FromStr;
use uuid::Uuid;

use shared::domain::{
    FriendRequestRecord, FriendSummary, RequestDirection, RequestId, RequestStatus, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One stored side of a mirrored request pair.
#[derive(Debug, Clone)]
pub struct StoredRequestSide {
    pub request_id: RequestId,
    pub owner_user_id: UserId,
    pub direction: RequestDirection,
    pub other_user_id: UserId,
    pub message: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

/// Outcome of attempting to create a request pair. The precondition
/// re-reads run inside the insert transaction so a racing pair of
/// `send_request` calls produces exactly one created request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertRequestOutcome {
    Created,
    DuplicatePending(RequestId),
    AlreadyFriends,
}

/// Outcome of resolving (accepting/rejecting) a request pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Applied,
    AlreadyResolved,
}

/// A logical request whose two mirrored rows disagree on status.
#[derive(Debug, Clone)]
pub struct DivergentRequest {
    pub request_id: RequestId,
    pub sender_id: UserId,
    pub sender_status: RequestStatus,
    pub recipient_id: UserId,
    pub recipient_status: RequestStatus,
}

fn status_to_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "pending",
        RequestStatus::Accepted => "accepted",
        RequestStatus::Rejected => "rejected",
    }
}

fn status_from_str(raw: &str) -> RequestStatus {
    match raw {
        "accepted" => RequestStatus::Accepted,
        "rejected" => RequestStatus::Rejected,
        _ => RequestStatus::Pending,
    }
}

fn direction_from_str(raw: &str) -> RequestDirection {
    match raw {
        "sent" => RequestDirection::Sent,
        _ => RequestDirection::Received,
    }
}

fn parse_request_id(raw: &str) -> Result<RequestId> {
    Ok(RequestId(
        Uuid::parse_str(raw).context("malformed request id in store")?,
    ))
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // SQLite admits one writer at a time. A single pooled connection
        // serializes transactions instead of surfacing busy errors, and
        // keeps `sqlite::memory:` databases on the connection that ran
        // the migrations.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn are_friends(&self, user_id: UserId, other_id: UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM friend_links WHERE user_id = ? AND friend_user_id = ?",
        )
        .bind(user_id.0)
        .bind(other_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Create both mirrored rows of a new request in one transaction.
    /// The already-friends and duplicate-pending preconditions are
    /// re-checked inside the transaction; the later of two racing writers
    /// observes the earlier one's row and backs off.
    pub async fn try_insert_request_pair(
        &self,
        request_id: RequestId,
        sender_id: UserId,
        recipient_id: UserId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<InsertRequestOutcome> {
        let mut tx = self.pool.begin().await?;

        let friends: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM friend_links WHERE user_id = ? AND friend_user_id = ?",
        )
        .bind(sender_id.0)
        .bind(recipient_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if friends > 0 {
            return Ok(InsertRequestOutcome::AlreadyFriends);
        }

        let pending = sqlx::query(
            "SELECT request_id FROM friend_request_sides
             WHERE owner_user_id = ? AND other_user_id = ? AND status = 'pending'
             LIMIT 1",
        )
        .bind(recipient_id.0)
        .bind(sender_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = pending {
            return Ok(InsertRequestOutcome::DuplicatePending(parse_request_id(
                &row.get::<String, _>(0),
            )?));
        }

        sqlx::query(
            "INSERT INTO friend_request_sides
             (request_id, owner_user_id, direction, other_user_id, message, status, created_at)
             VALUES (?, ?, 'sent', ?, ?, 'pending', ?)",
        )
        .bind(request_id.0.to_string())
        .bind(sender_id.0)
        .bind(recipient_id.0)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO friend_request_sides
             (request_id, owner_user_id, direction, other_user_id, message, status, created_at)
             VALUES (?, ?, 'received', ?, ?, 'pending', ?)",
        )
        .bind(request_id.0.to_string())
        .bind(recipient_id.0)
        .bind(sender_id.0)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InsertRequestOutcome::Created)
    }

    pub async fn request_side(
        &self,
        request_id: RequestId,
        owner_user_id: UserId,
    ) -> Result<Option<StoredRequestSide>> {
        let row = sqlx::query(
            "SELECT request_id, owner_user_id, direction, other_user_id, message, status, created_at
             FROM friend_request_sides
             WHERE request_id = ? AND owner_user_id = ?",
        )
        .bind(request_id.0.to_string())
        .bind(owner_user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_side).transpose()
    }

    /// Mark both mirrored rows with a terminal status in one transaction.
    /// Accepting also inserts the symmetric friend links, guarded against
    /// duplicates. Only pending rows transition; a request already resolved
    /// by a racing handler reports `AlreadyResolved`.
    pub async fn resolve_request_pair(
        &self,
        request_id: RequestId,
        sender_id: UserId,
        recipient_id: UserId,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE friend_request_sides SET status = ?
             WHERE request_id = ? AND status = 'pending'",
        )
        .bind(status_to_str(status))
        .bind(request_id.0.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(ResolveOutcome::AlreadyResolved);
        }

        if status == RequestStatus::Accepted {
            for (a, b) in [(sender_id, recipient_id), (recipient_id, sender_id)] {
                sqlx::query(
                    "INSERT OR IGNORE INTO friend_links (user_id, friend_user_id, created_at)
                     VALUES (?, ?, ?)",
                )
                .bind(a.0)
                .bind(b.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(ResolveOutcome::Applied)
    }

    /// Drop both rows of a still-pending request (sender-side cancel).
    /// Returns false if the request already left the pending state.
    pub async fn delete_pending_request_pair(&self, request_id: RequestId) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM friend_request_sides WHERE request_id = ? AND status = 'pending'",
        )
        .bind(request_id.0.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }

    /// Remove both directions of a friendship in one transaction.
    /// Returns false when the pair was not linked.
    pub async fn remove_friend_pair(&self, user_id: UserId, friend_id: UserId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            removed += sqlx::query(
                "DELETE FROM friend_links WHERE user_id = ? AND friend_user_id = ?",
            )
            .bind(a.0)
            .bind(b.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(removed > 0)
    }

    pub async fn list_friends(&self, user_id: UserId) -> Result<Vec<FriendSummary>> {
        let rows = sqlx::query(
            "SELECT l.friend_user_id, u.username, l.created_at
             FROM friend_links l
             INNER JOIN users u ON u.id = l.friend_user_id
             WHERE l.user_id = ?
             ORDER BY lower(u.username) ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FriendSummary {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                friends_since: r.get::<DateTime<Utc>, _>(2),
            })
            .collect())
    }

    pub async fn list_request_records(&self, user_id: UserId) -> Result<Vec<FriendRequestRecord>> {
        let rows = sqlx::query(
            "SELECT s.request_id, s.direction, s.other_user_id, u.username, s.message, s.status, s.created_at
             FROM friend_request_sides s
             INNER JOIN users u ON u.id = s.other_user_id
             WHERE s.owner_user_id = ?
             ORDER BY s.created_at DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(FriendRequestRecord {
                    request_id: parse_request_id(&r.get::<String, _>(0))?,
                    direction: direction_from_str(&r.get::<String, _>(1)),
                    other_user_id: UserId(r.get::<i64, _>(2)),
                    other_username: r.get::<String, _>(3),
                    message: r.get::<String, _>(4),
                    status: status_from_str(&r.get::<String, _>(5)),
                    created_at: r.get::<DateTime<Utc>, _>(6),
                })
            })
            .collect()
    }

    /// Request pairs whose two rows disagree on status, the signature a
    /// partial write leaves behind. This codebase writes both rows in one
    /// transaction, so hits here come from external writers or history.
    pub async fn find_divergent_requests(&self) -> Result<Vec<DivergentRequest>> {
        let rows = sqlx::query(
            "SELECT a.request_id, a.owner_user_id, a.status, b.owner_user_id, b.status
             FROM friend_request_sides a
             INNER JOIN friend_request_sides b
                ON b.request_id = a.request_id AND b.direction = 'received'
             WHERE a.direction = 'sent' AND a.status <> b.status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(DivergentRequest {
                    request_id: parse_request_id(&r.get::<String, _>(0))?,
                    sender_id: UserId(r.get::<i64, _>(1)),
                    sender_status: status_from_str(&r.get::<String, _>(2)),
                    recipient_id: UserId(r.get::<i64, _>(3)),
                    recipient_status: status_from_str(&r.get::<String, _>(4)),
                })
            })
            .collect()
    }

    /// Force both rows of a request to one status; used by the sweep after
    /// it picks the winning side.
    pub async fn repair_request_status(
        &self,
        request_id: RequestId,
        status: RequestStatus,
        sender_id: UserId,
        recipient_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE friend_request_sides SET status = ? WHERE request_id = ?")
            .bind(status_to_str(status))
            .bind(request_id.0.to_string())
            .execute(&mut *tx)
            .await?;
        if status == RequestStatus::Accepted {
            for (a, b) in [(sender_id, recipient_id), (recipient_id, sender_id)] {
                sqlx::query(
                    "INSERT OR IGNORE INTO friend_links (user_id, friend_user_id, created_at)
                     VALUES (?, ?, ?)",
                )
                .bind(a.0)
                .bind(b.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Test-only escape hatch: overwrite one side's status outside a
    /// transaction, simulating a partial write from an external tool.
    pub async fn force_side_status(
        &self,
        request_id: RequestId,
        owner_user_id: UserId,
        status: RequestStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE friend_request_sides SET status = ?
             WHERE request_id = ? AND owner_user_id = ?",
        )
        .bind(status_to_str(status))
        .bind(request_id.0.to_string())
        .bind(owner_user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_side(r: sqlx::sqlite::SqliteRow) -> Result<StoredRequestSide> {
    Ok(StoredRequestSide {
        request_id: parse_request_id(&r.get::<String, _>(0))?,
        owner_user_id: UserId(r.get::<i64, _>(1)),
        direction: direction_from_str(&r.get::<String, _>(2)),
        other_user_id: UserId(r.get::<i64, _>(3)),
        message: r.get::<String, _>(4),
        status: status_from_str(&r.get::<String, _>(5)),
        created_at: r.get::<DateTime<Utc>, _>(6),
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
