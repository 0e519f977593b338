use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Parse { var, value }),
        Err(_) => Ok(default),
    }
}

/// Process-level settings: where to listen, where to keep data.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let metrics_port = match std::env::var("INTERVIEWD_METRICS_PORT") {
            Ok(value) => Some(value.parse().map_err(|_| ConfigError::Parse {
                var: "INTERVIEWD_METRICS_PORT",
                value,
            })?),
            Err(_) => None,
        };
        Ok(Self {
            port: env_or("INTERVIEWD_PORT", 5480)?,
            bind: env_or("INTERVIEWD_BIND", "0.0.0.0".to_string())?,
            data_dir: env_or("INTERVIEWD_DATA_DIR", PathBuf::from("./data"))?,
            max_connections: env_or("INTERVIEWD_MAX_CONNECTIONS", 256)?,
            compact_threshold: env_or("INTERVIEWD_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("interviewd.wal")
    }
}

/// Scheduling policy shared by the engine and the wire layer.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Zone in which weekly rules are interpreted and days are grouped.
    pub zone: Tz,
    /// Length of a bookable slot, and the shortest free block an interviewer reports.
    pub slot_minutes: u32,
    /// Shortest window kept when free blocks are unioned across interviewers.
    pub coverage_minutes: u32,
    /// Candidates can book from tomorrow at this local hour onward.
    pub booking_cutoff_hour: u32,
    /// How far ahead availability is offered.
    pub window_days: u32,
    pub max_booking_attempts: u32,
    /// Bound on waiting for an interviewer's exclusive lock during commit.
    pub commit_timeout: Duration,
    /// Concurrent per-interviewer availability computations.
    pub availability_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            zone: chrono_tz::America::Santiago,
            slot_minutes: 30,
            coverage_minutes: 15,
            booking_cutoff_hour: 10,
            window_days: 8,
            max_booking_attempts: 2,
            commit_timeout: Duration::from_millis(5000),
            availability_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let zone_name = env_or("INTERVIEWD_TIMEZONE", d.zone.name().to_string())?;
        let zone: Tz = zone_name
            .parse()
            .map_err(|_| ConfigError::Parse { var: "INTERVIEWD_TIMEZONE", value: zone_name })?;
        let config = Self {
            zone,
            slot_minutes: env_or("INTERVIEWD_SLOT_MINUTES", d.slot_minutes)?,
            coverage_minutes: env_or("INTERVIEWD_COVERAGE_MINUTES", d.coverage_minutes)?,
            booking_cutoff_hour: env_or("INTERVIEWD_CUTOFF_HOUR", d.booking_cutoff_hour)?,
            window_days: env_or("INTERVIEWD_WINDOW_DAYS", d.window_days)?,
            max_booking_attempts: env_or("INTERVIEWD_MAX_BOOKING_ATTEMPTS", d.max_booking_attempts)?,
            commit_timeout: Duration::from_millis(env_or(
                "INTERVIEWD_COMMIT_TIMEOUT_MS",
                d.commit_timeout.as_millis() as u64,
            )?),
            availability_workers: env_or("INTERVIEWD_AVAILABILITY_WORKERS", d.availability_workers)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_minutes == 0 || self.slot_minutes > 24 * 60 {
            return Err(ConfigError::Invalid("slot_minutes must be 1..=1440".into()));
        }
        if self.coverage_minutes == 0 || self.coverage_minutes > 24 * 60 {
            return Err(ConfigError::Invalid("coverage_minutes must be 1..=1440".into()));
        }
        if self.booking_cutoff_hour > 23 {
            return Err(ConfigError::Invalid("cutoff hour must be 0..=23".into()));
        }
        if self.window_days == 0 || i64::from(self.window_days) > crate::limits::MAX_QUERY_WINDOW_DAYS {
            return Err(ConfigError::Invalid("window_days out of range".into()));
        }
        if self.max_booking_attempts == 0 {
            return Err(ConfigError::Invalid("max_booking_attempts must be at least 1".into()));
        }
        if self.availability_workers == 0 {
            return Err(ConfigError::Invalid("availability_workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn slot_len(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.slot_minutes.into())
    }

    pub fn coverage(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.coverage_minutes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = SchedulerConfig::default();
        c.validate().unwrap();
        assert_eq!(c.slot_len(), chrono::Duration::minutes(30));
        assert_eq!(c.coverage(), chrono::Duration::minutes(15));
        assert_eq!(c.zone, chrono_tz::America::Santiago);
    }

    #[test]
    fn rejects_zero_attempts() {
        let c = SchedulerConfig { max_booking_attempts: 0, ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_cutoff() {
        let c = SchedulerConfig { booking_cutoff_hour: 24, ..Default::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_slot() {
        let c = SchedulerConfig { slot_minutes: 0, ..Default::default() };
        assert!(c.validate().is_err());
    }
}
