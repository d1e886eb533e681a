//! SQLite database operations
//!
//! All database access goes through this module.
//! Relationship mutations are conditional single-statement writes, so
//! concurrent duplicate deliveries settle on the same row without a lock.

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    /// Get the relationship for an ordered pair
    pub async fn get_relationship(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<Option<FollowRelationship>, AppError> {
        let relationship = sqlx::query_as::<_, FollowRelationship>(
            "SELECT * FROM follow_relationships WHERE source_actor_id = ? AND target_actor_id = ?",
        )
        .bind(source_actor_id)
        .bind(target_actor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship)
    }

    /// Get the relationship created by a Follow activity
    ///
    /// Follow ids are chosen by the sending server, so the lookup is scoped
    /// to rows where `party` is on the expected side.
    pub async fn get_relationship_by_follow_id(
        &self,
        follow_activity_id: &str,
        party: FollowParty<'_>,
    ) -> Result<Option<FollowRelationship>, AppError> {
        let (sql, actor_id) = match party {
            FollowParty::Source(actor_id) => (
                "SELECT * FROM follow_relationships \
                 WHERE follow_activity_id = ? AND source_actor_id = ? LIMIT 1",
                actor_id,
            ),
            FollowParty::Target(actor_id) => (
                "SELECT * FROM follow_relationships \
                 WHERE follow_activity_id = ? AND target_actor_id = ? LIMIT 1",
                actor_id,
            ),
        };

        let relationship = sqlx::query_as::<_, FollowRelationship>(sql)
            .bind(follow_activity_id)
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(relationship)
    }

    /// Create a pending follow request unless the pair already has a row
    ///
    /// # Returns
    /// `true` when a new row was created
    pub async fn insert_pending_follow(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
        follow_activity_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO follow_relationships \
             (id, source_actor_id, target_actor_id, follow_activity_id, approved, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(EntityId::new().0)
        .bind(source_actor_id)
        .bind(target_actor_id)
        .bind(follow_activity_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Approve a pending follow request
    ///
    /// # Returns
    /// `true` when a pending row became approved
    pub async fn approve_follow(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE follow_relationships SET approved = 1, updated_at = ? \
             WHERE source_actor_id = ? AND target_actor_id = ? AND approved = 0",
        )
        .bind(Utc::now())
        .bind(source_actor_id)
        .bind(target_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove the relationship for an ordered pair
    ///
    /// # Returns
    /// `true` when a row was deleted
    pub async fn delete_follow(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM follow_relationships WHERE source_actor_id = ? AND target_actor_id = ?",
        )
        .bind(source_actor_id)
        .bind(target_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a pending follow request, leaving approved follows alone
    ///
    /// # Returns
    /// `true` when a pending row was deleted
    pub async fn delete_pending_follow(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM follow_relationships \
             WHERE source_actor_id = ? AND target_actor_id = ? AND approved = 0",
        )
        .bind(source_actor_id)
        .bind(target_actor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count rows for an ordered pair (0 or 1)
    pub async fn count_relationships(
        &self,
        source_actor_id: &str,
        target_actor_id: &str,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follow_relationships WHERE source_actor_id = ? AND target_actor_id = ?",
        )
        .bind(source_actor_id)
        .bind(target_actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
