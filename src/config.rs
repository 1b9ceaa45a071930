//! Configuration loading from the environment.

use std::env;

use anyhow::{Context, Result};

/// Runtime settings for the HTTP listener.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind host, e.g. `0.0.0.0`.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Settings {
    /// Load settings from `HOST` and `PORT`, reading a `.env` file when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = match env::var("PORT") {
            Ok(v) => v.parse().context("parsing PORT")?,
            Err(_) => 7447,
        };
        Ok(Self { host, port })
    }
}
