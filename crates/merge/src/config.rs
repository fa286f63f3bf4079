//! Merge engine configuration.
//!
//! All settings deserialize with per-field defaults, so a partial document
//! (or an empty one) is a valid configuration. [`MergeSettings`] is the
//! command line and environment form; [`MergeConfig::from_env`] reads
//! `HELIOS_MERGE_*` variables on top of the defaults.

use std::ffi::OsString;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};

use crate::merge::{ImmutabilityPolicy, MergeMode};

/// Top-level configuration for [`MergeEngine`](crate::engine::MergeEngine).
///
/// # Examples
///
/// ```
/// use helios_merge::config::MergeConfig;
///
/// let config: MergeConfig = serde_json::from_str(r#"{
///     "default_authority": "clinic",
///     "retry": { "max_attempts": 5, "initial_delay": "20ms" }
/// }"#).unwrap();
///
/// assert_eq!(config.retry.max_attempts, 5);
/// assert_eq!(config.deferred.max_attempts, 3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Authority used when a payload carries no authority tag.
    #[serde(default)]
    pub default_authority: Option<String>,

    /// Generate a logical id for payloads without one.
    #[serde(default)]
    pub generate_missing_ids: bool,

    /// How payloads combine with stored documents.
    #[serde(default)]
    pub merge_mode: MergeMode,

    /// Fields that may not change once set.
    #[serde(default = "ImmutabilityPolicy::clinical_defaults")]
    pub immutability: ImmutabilityPolicy,

    /// Compare-and-swap retry settings.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Post-commit task settings.
    #[serde(default)]
    pub deferred: DeferredTaskConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            default_authority: None,
            generate_missing_ids: false,
            merge_mode: MergeMode::default(),
            immutability: ImmutabilityPolicy::clinical_defaults(),
            retry: RetryPolicy::default(),
            deferred: DeferredTaskConfig::default(),
        }
    }
}

/// Retry settings for the concurrency writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Compare-and-swap attempts per item before a version conflict is reported.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retries after a storage fault before the fault is surfaced.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_write_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            write_retries: default_write_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Settings for the post-commit processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredTaskConfig {
    /// Attempts per task before it is dropped with an error record.
    #[serde(default = "default_task_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts of a failing task.
    #[serde(with = "humantime_serde", default = "default_task_retry_delay")]
    pub retry_delay: Duration,

    /// How long request teardown waits for a request's tasks.
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub wait_timeout: Duration,

    /// Record an AuditEvent for every created or updated resource.
    #[serde(default = "default_true")]
    pub audit_events: bool,
}

fn default_task_attempts() -> u32 {
    3
}

fn default_task_retry_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

impl Default for DeferredTaskConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_task_attempts(),
            retry_delay: default_task_retry_delay(),
            wait_timeout: default_wait_timeout(),
            audit_events: true,
        }
    }
}

impl MergeConfig {
    /// Builds a configuration from `HELIOS_MERGE_*` environment variables.
    ///
    /// Unset variables keep their defaults. Process arguments are not read.
    pub fn from_env() -> Result<Self, Vec<String>> {
        Self::from_args(["helios-merge"])
    }

    /// Builds a configuration from command line style arguments, falling
    /// back to `HELIOS_MERGE_*` variables and then to defaults.
    pub fn from_args<I, T>(args: I) -> Result<Self, Vec<String>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let settings = MergeSettings::try_parse_from(args).map_err(|e| vec![e.to_string()])?;
        let config = settings.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Returns a list of validation errors, or `Ok(())` if valid.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.retry.max_attempts == 0 {
            errors.push("Retry max attempts cannot be 0".to_string());
        }

        if self.retry.initial_delay > self.retry.max_delay {
            errors.push("Retry initial delay cannot exceed max delay".to_string());
        }

        if self.retry.backoff_multiplier < 1.0 {
            errors.push("Backoff multiplier must be at least 1.0".to_string());
        }

        if self.deferred.max_attempts == 0 {
            errors.push("Deferred task max attempts cannot be 0".to_string());
        }

        if self.deferred.wait_timeout.is_zero() {
            errors.push("Deferred task wait timeout cannot be 0".to_string());
        }

        if self
            .default_authority
            .as_deref()
            .is_some_and(|a| a.trim().is_empty())
        {
            errors.push("Default authority cannot be blank".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates a configuration suitable for testing: no retry delays and a
    /// short task timeout.
    pub fn for_testing() -> Self {
        Self {
            default_authority: None,
            generate_missing_ids: false,
            merge_mode: MergeMode::Smart,
            immutability: ImmutabilityPolicy::clinical_defaults(),
            retry: RetryPolicy {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            deferred: DeferredTaskConfig {
                retry_delay: Duration::ZERO,
                wait_timeout: Duration::from_secs(5),
                ..DeferredTaskConfig::default()
            },
        }
    }
}

/// Engine settings read from the command line or `HELIOS_MERGE_*` variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "helios-merge")]
#[command(about = "FHIR $merge engine settings")]
pub struct MergeSettings {
    /// Authority used when a payload carries no authority tag.
    #[arg(long, env = "HELIOS_MERGE_DEFAULT_AUTHORITY")]
    pub default_authority: Option<String>,

    /// Generate a logical id for payloads without one.
    #[arg(long, env = "HELIOS_MERGE_GENERATE_IDS", default_value = "false", action = ArgAction::Set)]
    pub generate_ids: bool,

    /// How payloads combine with stored documents (smart, replace).
    #[arg(long, env = "HELIOS_MERGE_MODE", value_enum, default_value = "smart", ignore_case = true)]
    pub merge_mode: MergeMode,

    /// Immutable fields as a JSON map of resource type to JSON pointers.
    #[arg(long, env = "HELIOS_MERGE_IMMUTABLE_FIELDS", value_parser = parse_policy)]
    pub immutable_fields: Option<ImmutabilityPolicy>,

    /// Compare-and-swap attempts per item.
    #[arg(long, env = "HELIOS_MERGE_MAX_ATTEMPTS", default_value = "10")]
    pub max_attempts: u32,

    /// Retries after a storage fault.
    #[arg(long, env = "HELIOS_MERGE_WRITE_RETRIES", default_value = "3")]
    pub write_retries: u32,

    /// Delay before the first retry (e.g. `10ms`).
    #[arg(long, env = "HELIOS_MERGE_INITIAL_DELAY", default_value = "10ms", value_parser = humantime::parse_duration)]
    pub initial_delay: Duration,

    /// Upper bound on any single retry delay.
    #[arg(long, env = "HELIOS_MERGE_MAX_DELAY", default_value = "1s", value_parser = humantime::parse_duration)]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[arg(long, env = "HELIOS_MERGE_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub backoff_multiplier: f64,

    /// Attempts per post-commit task.
    #[arg(long, env = "HELIOS_MERGE_TASK_ATTEMPTS", default_value = "3")]
    pub task_attempts: u32,

    /// Delay between attempts of a failing post-commit task.
    #[arg(long, env = "HELIOS_MERGE_TASK_RETRY_DELAY", default_value = "50ms", value_parser = humantime::parse_duration)]
    pub task_retry_delay: Duration,

    /// How long request teardown waits for post-commit tasks.
    #[arg(long, env = "HELIOS_MERGE_TASK_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub task_timeout: Duration,

    /// Record an AuditEvent for every created or updated resource.
    #[arg(long, env = "HELIOS_MERGE_AUDIT_EVENTS", default_value = "true", action = ArgAction::Set)]
    pub audit_events: bool,
}

impl MergeSettings {
    /// Converts the settings into an engine configuration.
    pub fn into_config(self) -> MergeConfig {
        MergeConfig {
            default_authority: self.default_authority,
            generate_missing_ids: self.generate_ids,
            merge_mode: self.merge_mode,
            immutability: self
                .immutable_fields
                .unwrap_or_else(ImmutabilityPolicy::clinical_defaults),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                write_retries: self.write_retries,
                initial_delay: self.initial_delay,
                max_delay: self.max_delay,
                backoff_multiplier: self.backoff_multiplier,
            },
            deferred: DeferredTaskConfig {
                max_attempts: self.task_attempts,
                retry_delay: self.task_retry_delay,
                wait_timeout: self.task_timeout,
                audit_events: self.audit_events,
            },
        }
    }
}

fn parse_policy(value: &str) -> Result<ImmutabilityPolicy, serde_json::Error> {
    serde_json::from_str(value)
}

/// Serde module for Duration with humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
