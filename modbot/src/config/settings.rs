//! Process settings read from the environment.

use std::path::PathBuf;

use tracing::warn;

use super::defaults::GlobalDefaults;
use crate::nanny::NannyLimit;

pub const DEFAULT_LOG_DIR: &str = "logs";

/// Environment overrides for the global defaults.
///
/// Supported env vars:
/// - `MODBOT_LOG_DIR`
/// - `MODBOT_QUEUE_CONCURRENCY`
/// - `MODBOT_NANNY_HARD_LIMIT` / `MODBOT_NANNY_SOFT_LIMIT` (remaining budget)
/// - `MODBOT_DRY_RUN`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub queue_concurrency: Option<usize>,
    pub nanny_hard_limit: Option<u32>,
    pub nanny_soft_limit: Option<u32>,
    pub dry_run: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            queue_concurrency: None,
            nanny_hard_limit: None,
            nanny_soft_limit: None,
            dry_run: None,
        }
    }
}

impl Settings {
    /// Load a `.env` file if present, then read the process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(dir) = lookup("MODBOT_LOG_DIR")
            && !dir.trim().is_empty()
        {
            settings.log_dir = PathBuf::from(dir);
        }
        settings.queue_concurrency = parse_var(&lookup, "MODBOT_QUEUE_CONCURRENCY");
        settings.nanny_hard_limit = parse_var(&lookup, "MODBOT_NANNY_HARD_LIMIT");
        settings.nanny_soft_limit = parse_var(&lookup, "MODBOT_NANNY_SOFT_LIMIT");
        settings.dry_run = lookup("MODBOT_DRY_RUN").and_then(|raw| parse_bool(&raw));

        settings
    }

    /// Layer these settings over `defaults`.
    pub fn apply(&self, mut defaults: GlobalDefaults) -> GlobalDefaults {
        if let Some(concurrency) = self.queue_concurrency {
            defaults.queue_concurrency = concurrency;
        }
        if let Some(limit) = self.nanny_hard_limit {
            defaults.nanny.hard_limit = Some(NannyLimit::Remaining(limit));
        }
        if let Some(limit) = self.nanny_soft_limit {
            defaults.nanny.soft_limit = Some(NannyLimit::Remaining(limit));
        }
        if let Some(dry_run) = self.dry_run {
            defaults.dry_run = dry_run;
        }
        defaults
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = Settings::from_lookup(lookup(&[]));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("MODBOT_LOG_DIR", "/var/log/modbot"),
            ("MODBOT_QUEUE_CONCURRENCY", "3"),
            ("MODBOT_NANNY_HARD_LIMIT", "100"),
            ("MODBOT_NANNY_SOFT_LIMIT", "not-a-number"),
            ("MODBOT_DRY_RUN", "yes"),
        ]));
        assert_eq!(settings.log_dir, PathBuf::from("/var/log/modbot"));
        assert_eq!(settings.nanny_soft_limit, None);

        let defaults = settings.apply(GlobalDefaults::default());
        assert_eq!(defaults.queue_concurrency, 3);
        assert!(defaults.dry_run);
        assert_eq!(defaults.nanny.hard_limit, Some(NannyLimit::Remaining(100)));
        assert_eq!(
            defaults.nanny.soft_limit,
            GlobalDefaults::default().nanny.soft_limit
        );
    }
}
