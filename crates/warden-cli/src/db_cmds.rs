//! `warden init` and `warden db-init`.

use anyhow::{bail, Context, Result};

use warden_core::CoreConfig;
use warden_store::pool;

use crate::config::{self, ConfigFile, DatabaseSection, WardenConfig};

/// The store schema, embedded so an installed binary can bootstrap a
/// database without a checkout.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init.sql",
    include_str!("../../warden-store/migrations/0001_init.sql"),
)];

/// Write the config file.
pub fn init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
        },
        core: CoreConfig::default(),
    };
    config::save_config(&file)?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Create the database if needed and apply migrations.
pub async fn db_init(config: &WardenConfig) -> Result<()> {
    pool::ensure_database_exists(&config.db_config).await?;
    let pool = pool::create_pool(&config.db_config).await?;

    // Materialize the embedded migrations so the runtime Migrator can
    // track them in its bookkeeping table.
    let dir = tempfile::tempdir().context("failed to create migrations temp dir")?;
    for (name, sql) in MIGRATIONS {
        std::fs::write(dir.path().join(name), sql)
            .with_context(|| format!("failed to write migration {name}"))?;
    }
    pool::run_migrations(&pool, dir.path()).await?;

    println!("database ready at {}", config.db_config.database_url);
    Ok(())
}
