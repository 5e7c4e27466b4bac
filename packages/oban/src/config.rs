//! Engine configuration loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use uuid::Uuid;

/// Engine configuration.
///
/// `queues` maps queue name to its concurrency budget; a node with an empty
/// map runs no producers and acts purely as a coordinator (leader plugins
/// still run when it holds the lease).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Stable identifier for this node, recorded in `attempted_by` and the
    /// producer heartbeat rows.
    pub node: String,
    pub queues: HashMap<String, usize>,
    /// Zone applied to cron evaluation unless a worker overrides it.
    pub timezone: Tz,
    /// Cadence of the staging sweep.
    pub stage_interval: Duration,
    /// How long producers wait for in-flight jobs on shutdown before
    /// abandoning them to the lifeline.
    pub shutdown_grace: Duration,
    pub pruner: PrunerConfig,
    pub lifeline: LifelineConfig,
    pub leader: LeaderConfig,
}

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    /// Terminal rows older than this are deleted.
    pub max_age: Duration,
    /// Soft cap on rows deleted per run.
    pub limit: i64,
    pub interval: Duration,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86_400),
            limit: 10_000,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifelineConfig {
    pub interval: Duration,
}

impl Default for LifelineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease: Duration,
}

impl LeaderConfig {
    /// Renewal cadence, half the lease so a healthy leader never expires.
    pub fn renew_interval(&self) -> Duration {
        self.lease / 2
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create a configuration with defaults for everything but the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            node: default_node(),
            queues: HashMap::new(),
            timezone: Tz::UTC,
            stage_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(15),
            pruner: PrunerConfig::default(),
            lifeline: LifelineConfig::default(),
            leader: LeaderConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = Self::new(
            env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
        );

        if let Ok(node) = env::var("OBAN_NODE") {
            config.node = node;
        }
        if let Ok(queues) = env::var("OBAN_QUEUES") {
            config.queues = parse_queues(&queues)
                .context("OBAN_QUEUES must look like \"default=10,mailers=20\"")?;
        }
        if let Ok(zone) = env::var("OBAN_TIMEZONE") {
            config.timezone = zone
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("OBAN_TIMEZONE must be an IANA zone name")?;
        }
        if let Some(secs) = env_secs("OBAN_PRUNER_MAX_AGE")? {
            config.pruner.max_age = secs;
        }
        if let Ok(limit) = env::var("OBAN_PRUNER_LIMIT") {
            config.pruner.limit = limit
                .parse()
                .context("OBAN_PRUNER_LIMIT must be a number of rows")?;
        }
        if let Some(secs) = env_secs("OBAN_LIFELINE_INTERVAL")? {
            config.lifeline.interval = secs;
        }
        if let Some(secs) = env_secs("OBAN_LEADER_LEASE")? {
            config.leader.lease = secs;
        }

        Ok(config)
    }
}

fn default_node() -> String {
    format!("oban-{}", Uuid::new_v4())
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be a number of seconds"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Parse a `name=limit` comma list into a queue map.
fn parse_queues(raw: &str) -> Result<HashMap<String, usize>> {
    let mut queues = HashMap::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (name, limit) = entry
            .split_once('=')
            .with_context(|| format!("queue entry {entry:?} is missing '='"))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("queue entry {entry:?} has an empty name");
        }
        let limit: usize = limit
            .trim()
            .parse()
            .with_context(|| format!("queue entry {entry:?} has a bad limit"))?;
        if limit == 0 {
            anyhow::bail!("queue {name:?} must have a limit of at least 1");
        }
        queues.insert(name.to_string(), limit);
    }
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_queues_splits_entries() {
        let queues = parse_queues("default=10, mailers=20").unwrap();
        assert_eq!(queues.get("default"), Some(&10));
        assert_eq!(queues.get("mailers"), Some(&20));
    }

    #[test]
    fn parse_queues_rejects_zero_limit() {
        assert!(parse_queues("default=0").is_err());
    }

    #[test]
    fn parse_queues_rejects_missing_limit() {
        assert!(parse_queues("default").is_err());
    }

    #[test]
    fn parse_queues_accepts_empty() {
        assert!(parse_queues("").unwrap().is_empty());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::new("postgres://localhost/oban");
        assert_eq!(config.pruner.max_age, Duration::from_secs(86_400));
        assert_eq!(config.pruner.limit, 10_000);
        assert_eq!(config.lifeline.interval, Duration::from_secs(60));
        assert_eq!(config.leader.lease, Duration::from_secs(30));
        assert_eq!(config.timezone, Tz::UTC);
    }

    #[test]
    fn leader_renewal_is_half_the_lease() {
        let leader = LeaderConfig {
            lease: Duration::from_secs(30),
        };
        assert_eq!(leader.renew_interval(), Duration::from_secs(15));
    }
}
