//! Durable store: PostgreSQL behind a shared pool.
//!
//! The store is the single source of truth for message lifecycle state.
//! Lifecycle-advancing writes use guarded updates (`WHERE column IS NULL`)
//! so they are idempotent and monotonic without application-level locking.

mod attachments;
mod conversations;
mod credentials;
mod messages;
mod reactions;
mod schema;
mod users;

pub use attachments::AttachmentRow;
pub use conversations::{ConversationRow, MembershipRow};
pub use credentials::RefreshCredentialRow;
pub use messages::{MessageMeta, UpsertOutcome};
pub use users::UserRow;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::Result;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to PostgreSQL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the bundled schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Store schema up to date");
        Ok(())
    }

    /// Lightweight probe used by the health endpoint.
    pub async fn readiness(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
