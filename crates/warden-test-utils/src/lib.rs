//! Store fixtures for warden integration tests.
//!
//! [`ScratchStore`] provisions a [`TaskStore`] backend and owns its
//! cleanup, so a test can run the same behavioral checks against any
//! backend:
//!
//! - [`ScratchStore::memory`] wraps the in-memory backend; teardown is a
//!   no-op.
//! - [`ScratchStore::postgres`] creates a uniquely-named scratch database
//!   on a shared server and applies the store migrations through
//!   `warden_store::pool`. The server comes from `WARDEN_TEST_PG_URL`
//!   when set (CI setup script), otherwise a testcontainers instance is
//!   started once per test binary. Teardown drops the scratch database.
//!
//! ```ignore
//! let scratch = ScratchStore::postgres().await;
//! let store = scratch.handle();
//! store.insert(task).await?;
//! scratch.teardown().await;
//! ```

use std::path::Path;
use std::sync::Arc;

use sqlx::Executor;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use warden_store::config::DbConfig;
use warden_store::{MemoryTaskStore, PostgresTaskStore, TaskStore, pool};

/// The shared PostgreSQL server scratch databases are created on.
enum PgServer {
    /// Supplied by the environment; nothing to keep alive.
    External { base_url: String },
    /// Started via testcontainers; the handle keeps it alive for the
    /// whole test binary.
    Container {
        base_url: String,
        _container: ContainerAsync<Postgres>,
    },
}

impl PgServer {
    fn base_url(&self) -> &str {
        match self {
            Self::External { base_url } => base_url,
            Self::Container { base_url, .. } => base_url,
        }
    }
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn pg_server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(base_url) = std::env::var("WARDEN_TEST_PG_URL") {
                return PgServer::External { base_url };
            }

            let container = Postgres::default()
                .with_tag("17")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            PgServer::Container {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: container,
            }
        })
        .await
}

/// Path to the warden-store migrations directory within the workspace.
fn migrations_dir() -> &'static Path {
    Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../warden-store/migrations"
    ))
}

/// A provisioned store backend plus whatever cleanup it needs.
pub enum ScratchStore {
    Memory {
        store: Arc<MemoryTaskStore>,
    },
    Postgres {
        store: Arc<PostgresTaskStore>,
        db: DbConfig,
    },
}

impl ScratchStore {
    /// The in-memory backend; nothing to provision or tear down.
    pub fn memory() -> Self {
        Self::Memory {
            store: Arc::new(MemoryTaskStore::new()),
        }
    }

    /// A PostgreSQL backend in a fresh scratch database with migrations
    /// applied. Panics on provisioning failures: a broken fixture should
    /// fail the test loudly, not produce misleading assertions.
    pub async fn postgres() -> Self {
        let server = pg_server().await;
        let db_name = format!("warden_test_{}", Uuid::new_v4().simple());
        let db = DbConfig::new(format!("{}/{db_name}", server.base_url()));

        // The store's own bootstrap path: create-if-missing through the
        // maintenance database, then the runtime migrator.
        pool::ensure_database_exists(&db)
            .await
            .expect("failed to create scratch database");
        let pg_pool = pool::create_pool(&db)
            .await
            .expect("failed to connect to scratch database");
        pool::run_migrations(&pg_pool, migrations_dir())
            .await
            .expect("migrations should succeed");

        Self::Postgres {
            store: Arc::new(PostgresTaskStore::new(pg_pool)),
            db,
        }
    }

    /// The backend behind the store contract, ready for generic checks.
    pub fn handle(&self) -> Arc<dyn TaskStore> {
        match self {
            Self::Memory { store } => Arc::clone(store) as Arc<dyn TaskStore>,
            Self::Postgres { store, .. } => Arc::clone(store) as Arc<dyn TaskStore>,
        }
    }

    /// Short backend label for assertion messages.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Release the backend. For PostgreSQL this closes the pool,
    /// terminates stray connections, and drops the scratch database;
    /// failures are ignored since the server (or container) is disposable
    /// anyway.
    pub async fn teardown(self) {
        let Self::Postgres { store, db } = self else {
            return;
        };
        store.pool().close().await;

        let Some(db_name) = db.database_name().map(str::to_owned) else {
            return;
        };
        let Ok(maint_pool) = pool::create_pool(&DbConfig::new(db.maintenance_url())).await else {
            return;
        };

        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
        );
        let _ = maint_pool.execute(terminate.as_str()).await;
        let drop_db = format!("DROP DATABASE IF EXISTS {db_name}");
        let _ = maint_pool.execute(drop_db.as_str()).await;
        maint_pool.close().await;
    }
}
