//! Postgres-backed participant store.
//!
//! Table `room_participants` is owned by the REST layer; this service only
//! consumes join tokens and updates `status` / `feed_id`.

use super::{ParticipantStatus, ParticipantStore, PendingParticipant};
use crate::errors::SignalingError;

use async_trait::async_trait;
use common::types::{FeedId, RoomId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Pool size for the participant store.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Bound on acquiring a pooled connection.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PgParticipantStore {
    pool: PgPool,
}

impl PgParticipantStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool against `database_url`.
    ///
    /// # Errors
    ///
    /// `Store` if the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self, SignalingError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ParticipantStore for PgParticipantStore {
    #[instrument(skip_all, name = "signal.store.consume_join_token")]
    async fn consume_join_token(
        &self,
        token: &str,
    ) -> Result<Option<PendingParticipant>, SignalingError> {
        // Single UPDATE so two connections racing on one token cannot both win
        let row = sqlx::query(
            r#"
            UPDATE room_participants
            SET status = 'joining', updated_at = NOW()
            WHERE join_token = $1 AND status = 'pending'
            RETURNING id, room_id, user_id, display_name
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let pending = PendingParticipant {
            record_id: row.try_get("id")?,
            room_id: RoomId::new(row.try_get::<String, _>("room_id")?),
            user_id: row.try_get("user_id")?,
            display_name: row.try_get("display_name")?,
        };

        debug!(
            target: "signal.store",
            room_id = %pending.room_id,
            record_id = %pending.record_id,
            "Join token consumed"
        );

        Ok(Some(pending))
    }

    #[instrument(skip_all, name = "signal.store.update_status")]
    async fn update_status(
        &self,
        record_id: Uuid,
        status: ParticipantStatus,
        feed_id: Option<&FeedId>,
    ) -> Result<(), SignalingError> {
        sqlx::query(
            r#"
            UPDATE room_participants
            SET status = $1, feed_id = COALESCE($2, feed_id), updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(feed_id.map(ToString::to_string))
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        debug!(
            target: "signal.store",
            record_id = %record_id,
            status = %status,
            "Participant status updated"
        );

        Ok(())
    }
}
