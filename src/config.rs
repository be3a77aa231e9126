//! Configuration management for the FoD client.
//!
//! Settings come from environment variables, optionally seeded from a `.env`
//! file in the local data directory:
//!
//! - Linux: `~/.local/share/fodcli/.env`
//! - macOS: `~/Library/Application Support/fodcli/.env`
//! - Windows: `%LOCALAPPDATA%/fodcli/.env`
//!
//! Variables already present in the environment take precedence over the file.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use tracing::debug;

use crate::{
    error::{Error, Result},
    fod::{Backoff, RetryPolicy, retry},
};

/// Release the samples run against when `FOD_RELEASE` is not set.
pub const DEFAULT_RELEASE: &str = "WebGoat:5.0";

/// Loads the `.env` file from the local data directory, if there is one.
///
/// # Errors
///
/// Returns an error if the data directory cannot be created or the file
/// exists but cannot be parsed.
pub async fn load_env() -> Result<()> {
    let path = env_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if !path.is_file() {
        debug!(path = %path.display(), "no .env file, using process environment only");
        return Ok(());
    }

    dotenv::from_path(&path).map_err(|e| {
        Error::Configuration(format!("cannot load {}: {e}", path.display()))
    })?;
    Ok(())
}

pub fn env_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("fodcli/.env");
    path
}

/// Connection string of the FoD instance (`FOD_URL`).
///
/// # Errors
///
/// [`Error::Configuration`] if the variable is not set.
pub fn fod_url() -> Result<String> {
    env::var("FOD_URL").map_err(|_| {
        Error::Configuration(
            "FOD_URL must be set to http(s)://<user>:<password>@host:port/".into(),
        )
    })
}

/// Release the samples use (`FOD_RELEASE`), `application:release` or an id.
pub fn fod_release() -> String {
    env::var("FOD_RELEASE").unwrap_or_else(|_| DEFAULT_RELEASE.to_string())
}

/// Attempts per request while rate limited (`FOD_MAX_ATTEMPTS`).
pub fn max_attempts() -> Result<u32> {
    parse_var("FOD_MAX_ATTEMPTS", retry::DEFAULT_MAX_ATTEMPTS)
}

/// Base delay of the exponential backoff (`FOD_RETRY_DELAY_MS`).
pub fn retry_delay() -> Result<Duration> {
    parse_var(
        "FOD_RETRY_DELAY_MS",
        retry::DEFAULT_BASE_DELAY.as_millis() as u64,
    )
    .map(Duration::from_millis)
}

/// Per-request deadline (`FOD_REQUEST_TIMEOUT_SECS`); none when unset.
pub fn request_timeout() -> Result<Option<Duration>> {
    match env::var("FOD_REQUEST_TIMEOUT_SECS") {
        Ok(_) => parse_var("FOD_REQUEST_TIMEOUT_SECS", 0u64)
            .map(|secs| Some(Duration::from_secs(secs)).filter(|d| !d.is_zero())),
        Err(_) => Ok(None),
    }
}

/// Page size for queries (`FOD_PAGE_SIZE`).
pub fn page_size() -> Result<usize> {
    parse_var("FOD_PAGE_SIZE", crate::fod::query::DEFAULT_PAGE_SIZE)
}

/// Retry policy assembled from `FOD_MAX_ATTEMPTS` and `FOD_RETRY_DELAY_MS`.
pub fn retry_policy() -> Result<RetryPolicy> {
    Ok(RetryPolicy::new(
        max_attempts()?,
        Backoff::Exponential(retry_delay()?),
    ))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Configuration(format!("{name}='{raw}' is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
