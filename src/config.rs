//! Commands service configuration

use std::time::Duration;

use courier_shared::defaults;
use thiserror::Error;

use crate::command::BindingPolicy;

/// Which handler wins when a tag has both a local executor and a remote destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    /// Run the local executor, never touch the transport
    #[default]
    LocalFirst,
    /// Always delegate to the remote destination
    RemoteFirst,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Configuration for the commands service
#[derive(Debug, Clone)]
pub struct CommandsConfig {
    /// Application name, used for command queue addressing
    pub app_name: String,
    /// Unique id of this process among instances of the app
    pub app_instance_id: String,
    /// Wait bound for remote calls without an explicit timeout
    pub default_timeout: Duration,
    /// Disable remote delegation entirely
    pub local_only: bool,
    /// Application that receives commands without a local executor
    pub default_target: Option<String>,
    /// Local vs remote precedence
    pub precedence: Precedence,
    /// Rebinding policy of the executor registry
    pub executor_policy: BindingPolicy,
    /// Inbound commands executed concurrently
    pub concurrent_consumers: usize,
    /// How often overdue pending slots are swept
    pub sweep_interval: Duration,
    /// Pending slot count above which a leak warning is logged
    pub pending_warn_threshold: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            app_name: "courier".into(),
            app_instance_id: uuid::Uuid::new_v4().simple().to_string(),
            default_timeout: Duration::from_millis(defaults::COMMAND_TIMEOUT_MS),
            local_only: false,
            default_target: None,
            precedence: Precedence::LocalFirst,
            executor_policy: BindingPolicy::Replace,
            concurrent_consumers: defaults::CONCURRENT_CONSUMERS,
            sweep_interval: Duration::from_millis(defaults::SWEEP_INTERVAL_MS),
            pending_warn_threshold: defaults::PENDING_WARN_THRESHOLD,
        }
    }
}

impl CommandsConfig {
    /// Config for `app_name` with every other field defaulted
    pub fn for_app(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Read `COURIER_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("COURIER_APP_NAME") {
            config.app_name = name;
        }
        if let Some(id) = lookup("COURIER_APP_INSTANCE_ID") {
            config.app_instance_id = id;
        }
        if let Some(raw) = lookup("COURIER_TIMEOUT_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "COURIER_TIMEOUT_MS",
                expected: "a number of milliseconds",
                value: raw.clone(),
            })?;
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("COURIER_LOCAL_ONLY") {
            config.local_only = parse_bool("COURIER_LOCAL_ONLY", &raw)?;
        }
        if let Some(target) = lookup("COURIER_DEFAULT_TARGET") {
            let target = target.trim();
            config.default_target = (!target.is_empty()).then(|| target.to_string());
        }
        if let Some(raw) = lookup("COURIER_PRECEDENCE") {
            config.precedence = match raw.trim().to_ascii_lowercase().as_str() {
                "local" | "local-first" => Precedence::LocalFirst,
                "remote" | "remote-first" => Precedence::RemoteFirst,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "COURIER_PRECEDENCE",
                        expected: "`local` or `remote`",
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = lookup("COURIER_CONSUMERS") {
            config.concurrent_consumers = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "COURIER_CONSUMERS",
                        expected: "a positive integer",
                        value: raw,
                    })
                }
            };
        }

        Ok(config)
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            expected: "a boolean",
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CommandsConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert!(!config.local_only);
        assert_eq!(config.precedence, Precedence::LocalFirst);
        assert_eq!(config.concurrent_consumers, 4);
        assert!(!config.app_instance_id.is_empty());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CommandsConfig::from_lookup(lookup(&[
            ("COURIER_APP_NAME", "billing"),
            ("COURIER_APP_INSTANCE_ID", "billing-1"),
            ("COURIER_TIMEOUT_MS", "1500"),
            ("COURIER_LOCAL_ONLY", "true"),
            ("COURIER_DEFAULT_TARGET", "ledger"),
            ("COURIER_PRECEDENCE", "remote"),
            ("COURIER_CONSUMERS", "8"),
        ]))
        .expect("valid config");

        assert_eq!(config.app_name, "billing");
        assert_eq!(config.app_instance_id, "billing-1");
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert!(config.local_only);
        assert_eq!(config.default_target.as_deref(), Some("ledger"));
        assert_eq!(config.precedence, Precedence::RemoteFirst);
        assert_eq!(config.concurrent_consumers, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = CommandsConfig::from_lookup(lookup(&[("COURIER_TIMEOUT_MS", "soon")]))
            .expect_err("timeout must be numeric");
        assert!(err.to_string().contains("COURIER_TIMEOUT_MS"));

        assert!(CommandsConfig::from_lookup(lookup(&[("COURIER_CONSUMERS", "0")])).is_err());
        assert!(CommandsConfig::from_lookup(lookup(&[("COURIER_LOCAL_ONLY", "maybe")])).is_err());
    }

    #[test]
    fn test_blank_default_target_means_none() {
        let config = CommandsConfig::from_lookup(lookup(&[("COURIER_DEFAULT_TARGET", "  ")]))
            .expect("valid config");
        assert_eq!(config.default_target, None);
    }
}
