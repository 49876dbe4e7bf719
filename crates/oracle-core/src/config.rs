// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;

use sqlx::sqlite::SqliteConnectOptions;

/// Oracle core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Chain whose log broadcasts this node tracks
    pub evm_chain_id: i64,
    /// Maximum database pool connections (PostgreSQL only)
    pub max_db_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ORACLE_DATABASE_URL`: PostgreSQL or SQLite connection string
    /// - `ORACLE_EVM_CHAIN_ID`: chain id of the tracked EVM chain
    ///
    /// Optional (with defaults):
    /// - `ORACLE_DB_MAX_CONNECTIONS`: pool size (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ORACLE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ORACLE_DATABASE_URL"))?;

        let evm_chain_id: i64 = std::env::var("ORACLE_EVM_CHAIN_ID")
            .map_err(|_| ConfigError::Missing("ORACLE_EVM_CHAIN_ID"))?
            .parse()
            .map_err(|_| ConfigError::Invalid("ORACLE_EVM_CHAIN_ID", "must be an integer"))?;

        let max_db_connections: u32 = std::env::var("ORACLE_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "ORACLE_DB_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            evm_chain_id,
            max_db_connections,
        })
    }

    /// True if the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }

    /// SQLite connect options parsed from the database URL, or `None` for
    /// PostgreSQL.
    ///
    /// Accepts both `sqlite:path` and `sqlite://path`, plus sqlx query
    /// parameters. The database file is created if missing unless the URL
    /// asks for read-only mode.
    pub fn sqlite_options(&self) -> Result<Option<SqliteConnectOptions>, ConfigError> {
        if !self.is_sqlite() {
            return Ok(None);
        }

        let options = SqliteConnectOptions::from_str(&self.database_url)
            .map_err(|_| ConfigError::Invalid("ORACLE_DATABASE_URL", "not a valid SQLite URL"))?
            .create_if_missing(true);
        Ok(Some(options))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
