// ABOUTME: Reads ENVFORGE_* variables with typed fallbacks
// ABOUTME: Rejected or unparseable values are logged and replaced by the default

use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Parse `var_name`, keeping `default` when it is unset or `accept` rejects it
pub fn env_or_default<T, F>(var_name: &str, default: T, accept: F) -> T
where
    T: FromStr + Display,
    F: Fn(&T) -> bool,
{
    let Ok(raw) = std::env::var(var_name) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if accept(&value) => value,
        Ok(_) => {
            warn!("{} is out of range ('{}'), using {}", var_name, raw, default);
            default
        }
        Err(_) => {
            warn!("{} is not a valid value ('{}'), using {}", var_name, raw, default);
            default
        }
    }
}

/// Counts, timeouts and ports, where zero means misconfigured
pub fn positive_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr + Display + PartialOrd + Default,
{
    env_or_default(var_name, default, |v| *v > T::default())
}

/// Read a string variable, treating an empty or whitespace-only value as unset
pub fn string_env_or_default(var_name: &str, default: &str) -> String {
    match std::env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}
