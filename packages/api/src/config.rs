//! Process configuration read from environment variables.
//!
//! Object storage is configured separately through
//! [`storage::StorageConfig::from_env`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use actors::{EVENTS_QUEUE, QueueSettings, RetryPolicy, SystemConfig, WORK_QUEUE, WorkerSettings};
use db::DbConfig;

use crate::producer::ProducerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}={value}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} requires {1} to be set as well")]
    Incomplete(&'static str, &'static str),
}

/// Everything the server needs besides object storage.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub db: DbConfig,
    pub system: SystemConfig,
    pub producer: ProducerSettings,
}

impl AppConfig {
    /// Read the configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BIND_ADDR` | `0.0.0.0:8080` |
    /// | `DATABASE_URL`, `DB_NAMESPACE`, `DB_DATABASE` | `mem://`, `evaluations`, `main` |
    /// | `DB_USER` + `DB_PASSWORD` | none |
    /// | `WORKER_CONCURRENCY` | 4 |
    /// | `QUEUE_LOCK_DURATION_SECS` | 60 |
    /// | `QUEUE_MAX_DELIVERY_COUNT` | 5 |
    /// | `QUEUE_MAX_MESSAGE_BYTES` | 262144 |
    /// | `QUEUE_SESSION_ORDERING` | true |
    /// | `QUEUE_MAX_DEAD_LETTERS` | 10000 |
    /// | `QUEUE_STATE_DIR` | none |
    /// | `SCORING_TIMEOUT_SECS` | 30 |
    /// | `SCORING_MAX_ATTEMPTS` | 3 |
    /// | `RETRY_BASE_DELAY_MS`, `RETRY_MAX_DELAY_MS` | 500, 30000 |
    /// | `INLINE_PAYLOAD_LIMIT_BYTES` | 262144 |
    /// | `MESSAGE_INLINE_LIMIT_BYTES` | 65536 |
    /// | `MESSAGE_PAYLOAD_TTL_SECS` | 604800 (0 disables expiry) |
    /// | `RESULT_INLINE_LIMIT_BYTES` | 65536 |
    /// | `IDEMPOTENCY_TTL_SECS` | 86400 |
    /// | `PROGRESS_EVERY` | 10 |
    /// | `RECONCILE_INTERVAL_SECS`, `ORPHAN_GRACE_SECS` | 30, 120 |
    /// | `STALE_RUNNING_SECS`, `RECONCILE_BATCH_SIZE` | 300, 100 |
    ///
    /// A scoring call must fit inside one queue lock period.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let bind_addr = env
            .parsed("BIND_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let mut db = DbConfig::default();
        if let Some(endpoint) = env.string("DATABASE_URL") {
            db = db.with_endpoint(endpoint);
        }
        if let Some(namespace) = env.string("DB_NAMESPACE") {
            db = db.with_namespace(namespace);
        }
        if let Some(database) = env.string("DB_DATABASE") {
            db = db.with_database(database);
        }
        match (env.string("DB_USER"), env.string("DB_PASSWORD")) {
            (Some(user), Some(password)) => db = db.with_credentials(user, password),
            (Some(_), None) => return Err(ConfigError::Incomplete("DB_USER", "DB_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Incomplete("DB_PASSWORD", "DB_USER")),
            (None, None) => {}
        }

        let queue = |name: &str| -> Result<QueueSettings, ConfigError> {
            Ok(QueueSettings::new(name)
                .with_lock_duration(Duration::from_secs(
                    env.positive("QUEUE_LOCK_DURATION_SECS")?.unwrap_or(60),
                ))
                .with_max_delivery_count(env.parsed("QUEUE_MAX_DELIVERY_COUNT")?.unwrap_or(5))
                .with_max_message_bytes(env.parsed("QUEUE_MAX_MESSAGE_BYTES")?.unwrap_or(256 * 1024))
                .with_session_ordering(env.boolean("QUEUE_SESSION_ORDERING")?.unwrap_or(true))
                .with_max_dead_letters(env.positive("QUEUE_MAX_DEAD_LETTERS")?.unwrap_or(10_000)))
        };

        let retry = RetryPolicy {
            max_attempts: env.positive("SCORING_MAX_ATTEMPTS")?.unwrap_or(3),
            base_delay: Duration::from_millis(env.parsed("RETRY_BASE_DELAY_MS")?.unwrap_or(500)),
            max_delay: Duration::from_millis(env.parsed("RETRY_MAX_DELAY_MS")?.unwrap_or(30_000)),
        };

        let defaults = SystemConfig::default();
        let system = SystemConfig {
            worker_concurrency: env
                .positive("WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker_concurrency),
            reconcile_interval: env
                .secs("RECONCILE_INTERVAL_SECS")?
                .unwrap_or(Duration::from_secs(30)),
            orphan_grace: env.secs("ORPHAN_GRACE_SECS")?.unwrap_or(Duration::from_secs(120)),
            stale_running_after: env
                .secs("STALE_RUNNING_SECS")?
                .unwrap_or(defaults.stale_running_after),
            reconcile_batch_size: env
                .positive("RECONCILE_BATCH_SIZE")?
                .unwrap_or(defaults.reconcile_batch_size),
            work_queue: queue(WORK_QUEUE)?,
            events_queue: queue(EVENTS_QUEUE)?,
            state_dir: env.string("QUEUE_STATE_DIR").map(PathBuf::from),
            message_inline_limit_bytes: env
                .parsed("MESSAGE_INLINE_LIMIT_BYTES")?
                .unwrap_or(64 * 1024),
            message_payload_ttl: match env.secs("MESSAGE_PAYLOAD_TTL_SECS")? {
                Some(ttl) if ttl.is_zero() => None,
                Some(ttl) => Some(ttl),
                None => defaults.message_payload_ttl,
            },
            worker: WorkerSettings {
                scoring_timeout: env
                    .secs("SCORING_TIMEOUT_SECS")?
                    .unwrap_or(Duration::from_secs(30)),
                retry,
                result_inline_limit_bytes: env
                    .parsed("RESULT_INLINE_LIMIT_BYTES")?
                    .unwrap_or(64 * 1024),
                progress_every: env.positive("PROGRESS_EVERY")?.unwrap_or(10),
            },
            ..defaults
        };

        let lock = system.work_queue.lock_duration;
        if system.worker.scoring_timeout >= lock {
            return Err(ConfigError::Invalid {
                var: "SCORING_TIMEOUT_SECS",
                value: system.worker.scoring_timeout.as_secs().to_string(),
                reason: format!(
                    "must be shorter than QUEUE_LOCK_DURATION_SECS ({}s)",
                    lock.as_secs()
                ),
            });
        }

        let producer = ProducerSettings {
            inline_payload_limit_bytes: env
                .parsed("INLINE_PAYLOAD_LIMIT_BYTES")?
                .unwrap_or(256 * 1024),
            idempotency_ttl: env
                .secs("IDEMPOTENCY_TTL_SECS")?
                .unwrap_or(Duration::from_secs(24 * 60 * 60)),
        };

        Ok(Self {
            bind_addr,
            db,
            system,
            producer,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn positive<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + Default + PartialEq + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        match self.parsed::<T>(var)? {
            Some(v) if v == T::default() => Err(ConfigError::Invalid {
                var,
                value: v.to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn secs(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(var)?.map(Duration::from_secs))
    }

    fn boolean(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.string(var) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Ok(Some(true)),
            "0" | "false" | "no" | "n" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected true/false".to_string(),
            }),
        }
    }
}
