use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Base URL of the downstream mirror store. `None` disables mirroring.
    pub mirror_base_url: Option<String>,
    pub mirror_api_key: String,
    /// Physical deployment shape used by the simulators. The pipeline itself
    /// accepts any positive floor/room from the routing key.
    pub floors: i64,
    pub rooms_per_floor: i64,
    pub simulators_enabled: bool,
    /// Publish interval of each simulator, in seconds.
    pub sim_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            mirror_base_url: std::env::var("MIRROR_BASE_URL").ok().filter(|s| !s.is_empty()),
            mirror_api_key: optional("MIRROR_API_KEY", ""),
            floors: optional("FLOORS", "3")
                .parse()
                .context("FLOORS must be a positive integer")?,
            rooms_per_floor: optional("ROOMS_PER_FLOOR", "5")
                .parse()
                .context("ROOMS_PER_FLOOR must be a positive integer")?,
            simulators_enabled: parse_bool(&optional("SIMULATORS_ENABLED", "true"))?,
            sim_interval_secs: optional("SIM_INTERVAL_SECS", "5")
                .parse()
                .context("SIM_INTERVAL_SECS must be a positive integer")?,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(anyhow::anyhow!("expected true/false, got: {other:?}")),
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
