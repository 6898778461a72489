//! Database utilities and connection pooling

use anyhow::{Context, Result};
use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type DbConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Creates a new database connection pool.
pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder()
        .max_size(10) // Max 10 connections
        .build(manager)
        .context("Failed to create R2D2 pool")?;
    Ok(pool)
}

/// Runs database migrations.
pub fn run_migrations(connection: &mut impl MigrationHarness<diesel::pg::Pg>) -> Result<()> {
    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    Ok(())
}

/// Run a blocking database closure on the tokio blocking pool.
///
/// Diesel connections are synchronous; every service call that touches the
/// database goes through here so async tasks never block a runtime worker.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> crate::error::ServiceResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> crate::error::ServiceResult<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}
