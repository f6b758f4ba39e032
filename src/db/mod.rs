//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs the state store (`mastery_state` table) and the
//! pgmq queues the event bus runs on.

pub mod bus;
pub mod pgmq;
pub mod state;

pub use bus::PgmqBus;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Queue names.
pub mod queues {
    pub const LEARNING_EVENTS: &str = "learning_events";
    pub const MASTERY_UPDATED: &str = "mastery_updated";
    pub const DEAD_LETTER: &str = "mastery_dead_letter";
    pub const MANUAL_REVIEW: &str = "mastery_manual_review";

    pub const ALL: [&str; 4] = [LEARNING_EVENTS, MASTERY_UPDATED, DEAD_LETTER, MANUAL_REVIEW];
}

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Create every queue the engine reads or writes.
    pub async fn ensure_queues(&self) -> Result<()> {
        for queue in queues::ALL {
            self.create_queue(queue).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
