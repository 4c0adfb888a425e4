use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

use crate::consumer::{bypass, concurrency, Consumer};
use crate::core::{Action, Output};

/// Dispatch boundary options, loadable from the environment or any serde source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Keep emit handles valid after their producer finished.
    pub loose: bool,
    /// Run at most this many producers at once. `None` runs everything
    /// immediately.
    pub max_concurrency: Option<usize>,
}

impl DispatchConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let loose = match lookup("MANAGED_DISPATCH_LOOSE") {
            Some(raw) => parse_flag(&raw)
                .context("MANAGED_DISPATCH_LOOSE must be true/false, 1/0 or yes/no")?,
            None => false,
        };

        let max_concurrency = match lookup("MANAGED_DISPATCH_MAX_CONCURRENCY") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => {
                let limit: usize = raw
                    .trim()
                    .parse()
                    .context("MANAGED_DISPATCH_MAX_CONCURRENCY must be a valid number")?;
                anyhow::ensure!(limit > 0, "MANAGED_DISPATCH_MAX_CONCURRENCY must be at least 1");
                Some(limit)
            }
            None => None,
        };

        Ok(Self {
            loose,
            max_concurrency,
        })
    }

    /// The consumer these options describe: `concurrency(n)` or `bypass`.
    pub fn consumer<A, S, T>(&self) -> Box<dyn Consumer<A, S, T>>
    where
        A: Action,
        S: 'static,
        T: Output,
    {
        match self.max_concurrency {
            Some(limit) => Box::new(concurrency(limit.max(1))),
            None => Box::new(bypass()),
        }
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("unrecognized flag value {other:?}"),
    }
}
