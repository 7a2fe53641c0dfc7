//! Configuration loaded from TOML and overridden from the environment.
//!
//! ```toml
//! database_url = "postgres://app@localhost/app"
//! lock_timeout = "5s"
//!
//! [prioritize]
//! interval_ms = 1000
//! action = "terminate"
//! filters = ["blocking_activity__duration__gte=5 minutes"]
//!
//! [locks.nightly_report]
//! id = "nightly-report"
//! timeout = 0
//! side_effect = "skip_on_failure"
//! ```
//!
//! Lock ids and timeouts stay as raw TOML values until used, so a value of the
//! wrong type surfaces as [`PgLockError::InvalidType`] at the call site that
//! needs it.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::path::Path;
use std::time::Duration;

use pglock_error::{PgLockError, Result};
use pglock_types::{LockKey, SideEffect, TimeoutValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::advisory::AdvisoryLock;
use crate::prioritize::{Prioritize, PrioritizeAction};
use crate::snapshot::FilterSpec;

pub const ENV_DATABASE_URL: &str = "PGLOCK_DATABASE_URL";
pub const ENV_APPLICATION_NAME: &str = "PGLOCK_APPLICATION_NAME";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PgLockConfig {
    pub database_url: Option<String>,
    pub application_name: Option<String>,
    /// Ambient default for lock operations that do not name their own.
    pub lock_timeout: Option<toml::Value>,
    pub prioritize: PrioritizeConfig,
    pub locks: BTreeMap<String, LockConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Terminate,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrioritizeConfig {
    pub interval_ms: u64,
    pub periodic: bool,
    pub action: ActionKind,
    pub filters: Vec<String>,
    pub timeout: Option<toml::Value>,
}

impl Default for PrioritizeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            periodic: true,
            action: ActionKind::Terminate,
            filters: Vec::new(),
            timeout: None,
        }
    }
}

/// A named advisory lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    pub id: toml::Value,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub xact: bool,
    #[serde(default)]
    pub timeout: Option<toml::Value>,
    #[serde(default)]
    pub side_effect: Option<SideEffect>,
}

impl PgLockConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| PgLockError::config(format!("invalid pglock config: {err}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            PgLockError::config(format!("cannot read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), locks = config.locks.len(), "pglock config loaded");
        Ok(config)
    }

    /// Apply `PGLOCK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        let env: HashMap<String, String> = std::env::vars().collect();
        self.apply_env_from(&env)
    }

    /// Apply overrides from `env`, returning the keys that were used.
    pub fn apply_env_from<S: BuildHasher>(&mut self, env: &HashMap<String, String, S>) -> Vec<String> {
        let mut keys_used = Vec::new();
        if let Some(value) = env.get(ENV_DATABASE_URL) {
            self.database_url = Some(value.clone());
            keys_used.push(ENV_DATABASE_URL.to_owned());
        }
        if let Some(value) = env.get(ENV_APPLICATION_NAME) {
            self.application_name = Some(value.clone());
            keys_used.push(ENV_APPLICATION_NAME.to_owned());
        }
        if !keys_used.is_empty() {
            debug!(keys = ?keys_used, "pglock config overridden from environment");
        }
        keys_used
    }

    pub fn lock_timeout(&self) -> Result<Option<TimeoutValue>> {
        self.lock_timeout.as_ref().map(timeout_from_value).transpose()
    }

    /// Build the named advisory lock.
    pub fn advisory_lock(&self, name: &str) -> Result<AdvisoryLock> {
        let entry = self
            .locks
            .get(name)
            .ok_or_else(|| PgLockError::config(format!("no lock named {name:?} is configured")))?;
        let mut lock = AdvisoryLock::new(lock_key_from_value(&entry.id)?)
            .shared(entry.shared)
            .xact(entry.xact);
        let timeout = match &entry.timeout {
            Some(value) => Some(timeout_from_value(value)?),
            None => self.lock_timeout()?,
        };
        if let Some(timeout) = timeout {
            lock = lock.timeout(timeout);
        }
        if let Some(side_effect) = entry.side_effect {
            lock = lock.side_effect(side_effect);
        }
        Ok(lock)
    }

    /// The `[prioritize]` section as a validated [`Prioritize`].
    pub fn prioritize(&self) -> Result<Prioritize> {
        let section = &self.prioritize;
        let filters: Vec<FilterSpec> = section.filters.iter().cloned().map(FilterSpec::from).collect();
        let action = match section.action {
            ActionKind::Terminate => PrioritizeAction::Terminate(filters),
            ActionKind::Cancel => PrioritizeAction::Cancel(filters),
        };
        let mut config = Prioritize::new()
            .interval(Duration::from_millis(section.interval_ms))
            .periodic(section.periodic)
            .action(action);
        if let Some(value) = &section.timeout {
            config = config.timeout(timeout_from_value(value)?);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Integers are milliseconds, floats fractional milliseconds, strings go
/// through [`TimeoutValue`]'s parser.
pub fn timeout_from_value(value: &toml::Value) -> Result<TimeoutValue> {
    match value {
        toml::Value::Integer(ms) => u64::try_from(*ms)
            .map(TimeoutValue::from_millis)
            .map_err(|_| PgLockError::usage(format!("timeout must be non-negative (got {ms})"))),
        toml::Value::Float(ms) => TimeoutValue::from_secs_f64(ms / 1_000.0),
        toml::Value::String(text) => text.parse(),
        other => Err(PgLockError::invalid_type(format!(
            "timeout must be a number or a string, not {}",
            other.type_str()
        ))),
    }
}

pub fn lock_key_from_value(value: &toml::Value) -> Result<LockKey> {
    match value {
        toml::Value::Integer(id) => Ok(LockKey::from(*id)),
        toml::Value::String(name) => Ok(LockKey::from(name.as_str())),
        other => Err(PgLockError::invalid_type(format!(
            "lock id must be an integer or a string, not {}",
            other.type_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
database_url = "postgres://app@localhost/app"
lock_timeout = "5s"

[prioritize]
interval_ms = 250
periodic = false
action = "cancel"
filters = ["rel_name=users"]
timeout = 2000

[locks.report]
id = "nightly-report"
timeout = 0
side_effect = "skip_on_failure"

[locks.numbered]
id = 42
shared = true
"#;

    #[test]
    fn parses_every_section() {
        let config = PgLockConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://app@localhost/app"));
        assert_eq!(
            config.lock_timeout().unwrap(),
            Some(TimeoutValue::from_millis(5_000))
        );
        assert_eq!(config.prioritize.action, ActionKind::Cancel);

        let prioritize = config.prioritize().unwrap();
        assert_eq!(prioritize.get_interval(), Duration::from_millis(250));
        assert!(!prioritize.is_periodic());
        assert_eq!(prioritize.get_timeout(), Some(TimeoutValue::from_millis(2_000)));
        assert!(matches!(prioritize.get_action(), PrioritizeAction::Cancel(f) if f.len() == 1));
    }

    #[test]
    fn named_locks_resolve_keys_and_defaults() {
        let config = PgLockConfig::from_toml_str(SAMPLE).unwrap();
        let report = config.advisory_lock("report").unwrap();
        assert_eq!(report.key(), &LockKey::from("nightly-report"));
        let numbered = config.advisory_lock("numbered").unwrap();
        assert_eq!(numbered.lock_id(), 42);
        assert!(config.advisory_lock("missing").is_err());
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = PgLockConfig::from_toml_str("").unwrap();
        assert_eq!(config, PgLockConfig::default());
        let prioritize = config.prioritize().unwrap();
        assert_eq!(prioritize.get_interval(), Duration::from_secs(1));
        assert!(prioritize.is_periodic());
        assert!(matches!(prioritize.get_action(), PrioritizeAction::Terminate(f) if f.is_empty()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PgLockConfig::from_toml_str("lock_timeot = 5").unwrap_err();
        assert!(matches!(err, PgLockError::Config(_)), "{err}");
    }

    #[test]
    fn wrongly_typed_dynamic_values() {
        let err = lock_key_from_value(&toml::Value::Boolean(true)).unwrap_err();
        assert!(matches!(err, PgLockError::InvalidType(_)), "{err}");
        let err = lock_key_from_value(&toml::Value::Float(1.5)).unwrap_err();
        assert!(matches!(err, PgLockError::InvalidType(_)), "{err}");

        let config = PgLockConfig::from_toml_str("lock_timeout = [1, 2]").unwrap();
        let err = config.lock_timeout().unwrap_err();
        assert!(matches!(err, PgLockError::InvalidType(_)), "{err}");
    }

    #[test]
    fn timeout_values() {
        assert_eq!(
            timeout_from_value(&toml::Value::Integer(0)).unwrap(),
            TimeoutValue::Immediate
        );
        assert_eq!(
            timeout_from_value(&toml::Value::Float(0.25)).unwrap(),
            TimeoutValue::Immediate
        );
        assert_eq!(
            timeout_from_value(&toml::Value::Float(1500.0)).unwrap(),
            TimeoutValue::from_millis(1_500)
        );
        assert_eq!(
            timeout_from_value(&toml::Value::String("infinite".into())).unwrap(),
            TimeoutValue::Infinite
        );
        assert!(timeout_from_value(&toml::Value::Integer(-1)).unwrap_err().is_usage());
    }

    #[test]
    fn zero_interval_fails_validation() {
        let config = PgLockConfig::from_toml_str("[prioritize]\ninterval_ms = 0").unwrap();
        assert!(config.prioritize().unwrap_err().is_usage());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = PgLockConfig::from_toml_str(SAMPLE).unwrap();
        let env = HashMap::from([
            (ENV_DATABASE_URL.to_owned(), "postgres://other/db".to_owned()),
            ("UNRELATED".to_owned(), "x".to_owned()),
        ]);
        let used = config.apply_env_from(&env);
        assert_eq!(used, vec![ENV_DATABASE_URL.to_owned()]);
        assert_eq!(config.database_url.as_deref(), Some("postgres://other/db"));
        assert_eq!(config.application_name, None);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = PgLockConfig::load(file.path()).unwrap();
        assert_eq!(config.locks.len(), 2);

        let missing = file.path().with_extension("absent");
        assert!(matches!(
            PgLockConfig::load(missing).unwrap_err(),
            PgLockError::Config(_)
        ));
    }

    #[test]
    fn serializes_back_to_json() {
        let config = PgLockConfig::from_toml_str(SAMPLE).unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["prioritize"]["action"], "cancel");
        assert_eq!(value["locks"]["numbered"]["id"], 42);
    }
}
