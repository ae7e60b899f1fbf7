use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub max_connections: u32,
    pub sweep_interval: Duration,
    pub chat_buffer: usize,
}

impl Config {
    /// Reads the environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();

        Ok(Config {
            database_url: var_or("DATABASE_URL", "sqlite://ridesession.db".to_owned())?,
            bind_addr: var_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            max_connections: var_or("MAX_CONNECTIONS", 16)?,
            sweep_interval: Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", 30)?),
            chat_buffer: var_or("CHAT_BUFFER", 64)?,
        })
    }
}

fn var_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("malformed {name}={value:?}")),
        Err(_) => Ok(default),
    }
}
