// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres pool backing the oracle store. Every oracle instance sharing one
//! database goes through a [Db], so session settings (statement timeout and
//! application name) are applied uniformly when a pooled connection is made.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::{anyhow, Context};
use diesel::migration::{Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel::{Connection as _, ConnectionError, PgConnection};
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use futures::FutureExt;
use tracing::{debug, info};
use url::Url;

type OraclePool = Pool<AsyncPgConnection>;

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    /// Upper bound on pooled connections held by this oracle.
    #[arg(long, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    /// Milliseconds to wait for a free pooled connection.
    #[arg(long, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,

    /// Per-statement timeout in milliseconds. Unset leaves the server default.
    #[arg(long)]
    pub db_statement_timeout_ms: Option<u64>,

    /// Reported as `application_name`, which shows which oracle holds a lock row.
    #[arg(long, default_value_t = Self::default().db_application_name)]
    pub db_application_name: String,
}

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }

    /// Session statements run on each freshly established connection.
    fn session_setup(&self) -> Vec<String> {
        let mut statements = vec![format!(
            "SET application_name = '{}'",
            self.db_application_name.replace('\'', "''")
        )];
        if let Some(timeout) = self.statement_timeout() {
            statements.push(format!("SET statement_timeout = {}", timeout.as_millis()));
        }
        statements
    }

    async fn build_pool(&self, database_url: &Url) -> anyhow::Result<OraclePool> {
        let setup = self.session_setup();
        let mut manager_config = ManagerConfig::default();
        manager_config.custom_setup = Box::new(move |url| {
            let setup = setup.clone();
            async move {
                let mut conn = AsyncPgConnection::establish(url).await?;
                for statement in setup {
                    diesel::sql_query(statement)
                        .execute(&mut conn)
                        .await
                        .map_err(ConnectionError::CouldntSetupConfiguration)?;
                }
                Ok(conn)
            }
            .boxed()
        });
        let manager =
            AsyncDieselConnectionManager::new_with_config(database_url.as_str(), manager_config);
        Pool::builder()
            .max_size(self.db_connection_pool_size)
            .connection_timeout(self.connection_timeout())
            .build(manager)
            .await
            .context("Failed to build oracle connection pool")
    }
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 10,
            db_connection_timeout_ms: 30_000,
            db_statement_timeout_ms: None,
            db_application_name: "bridge-oracle".to_string(),
        }
    }
}

/// Cloneable handle on the shared pool.
#[derive(Clone)]
pub struct Db {
    pool: OraclePool,
    database_url: Url,
}

/// A pooled connection, returned to the pool on drop.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    pub async fn new(database_url: Url, args: DbArgs) -> anyhow::Result<Self> {
        let pool = args.build_pool(&database_url).await?;
        debug!(
            pool_size = args.db_connection_pool_size,
            "Oracle database pool ready"
        );
        Ok(Self { pool, database_url })
    }

    /// Fails once [DbArgs::connection_timeout] elapses without a free connection.
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("No database connection available: {e}"))?;
        Ok(Connection(conn))
    }

    pub fn state(&self) -> bb8::State {
        self.pool.state()
    }

    /// Applies pending migrations over a blocking connection outside the pool.
    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        let database_url = self.database_url.to_string();
        let applied = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut conn = PgConnection::establish(&database_url)
                .context("Failed to connect for migrations")?;
            let versions = conn
                .run_pending_migrations(Embedded(migrations))
                .map_err(|e| anyhow!("Failed to run migrations: {e:?}"))?;
            Ok(versions
                .into_iter()
                .map(|v| v.as_owned())
                .collect::<Vec<_>>())
        })
        .await??;
        info!("Applied {} oracle migration(s)", applied.len());
        Ok(applied)
    }

    async fn drop_public_schema(&self) -> anyhow::Result<()> {
        let mut conn = self.connect().await?;
        diesel::sql_query("DROP SCHEMA IF EXISTS public CASCADE")
            .execute(&mut conn)
            .await?;
        diesel::sql_query("CREATE SCHEMA public")
            .execute(&mut conn)
            .await?;
        info!("Dropped oracle tables");
        Ok(())
    }
}

/// Recreates the oracle tables from scratch. Used by integration tests.
pub async fn reset_database(
    database_url: Url,
    args: DbArgs,
    migrations: &'static EmbeddedMigrations,
) -> anyhow::Result<Db> {
    let db = Db::new(database_url, args).await?;
    db.drop_public_schema().await?;
    db.run_migrations(migrations).await?;
    Ok(db)
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// Lets a `&'static EmbeddedMigrations` be handed to the harness by value.
struct Embedded(&'static EmbeddedMigrations);

impl MigrationSource<Pg> for Embedded {
    fn migrations(&self) -> diesel::migration::Result<Vec<Box<dyn Migration<Pg>>>> {
        self.0.migrations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_args_timeouts() {
        let args = DbArgs::default();
        assert_eq!(args.connection_timeout(), Duration::from_secs(30));
        assert_eq!(args.statement_timeout(), None);

        let args = DbArgs {
            db_statement_timeout_ms: Some(1500),
            ..DbArgs::default()
        };
        assert_eq!(args.statement_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_session_setup_statements() {
        let args = DbArgs::default();
        assert_eq!(
            args.session_setup(),
            vec!["SET application_name = 'bridge-oracle'".to_string()]
        );

        let args = DbArgs {
            db_statement_timeout_ms: Some(250),
            db_application_name: "oracle's node".to_string(),
            ..DbArgs::default()
        };
        assert_eq!(
            args.session_setup(),
            vec![
                "SET application_name = 'oracle''s node'".to_string(),
                "SET statement_timeout = 250".to_string(),
            ]
        );
    }
}
