//! Server configuration module
//! Handles the configurable parameters of the chat server

use crate::constants::{
    DEFAULT_ADDRESS, DEFAULT_CLIENT_IO_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
};
use crate::error::{ChatError, Result};
use crate::net::numeric_address;
use std::env;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Numeric IPv4/IPv6 address to bind
    pub address: String,
    pub port: u16,
    /// Maximum number of simultaneously connected clients
    pub max_connections: usize,
    /// Read/write timeout applied to every client socket
    pub client_io_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_PORT)
    }
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            client_io_timeout: Duration::from_secs(DEFAULT_CLIENT_IO_TIMEOUT_SECS),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_client_io_timeout(mut self, timeout: Duration) -> Self {
        self.client_io_timeout = timeout;
        self
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let address = env::var("RUSTY_CHAT_ADDRESS").unwrap_or(DEFAULT_ADDRESS.to_string());

        let port = parse_var("RUSTY_CHAT_PORT")?.unwrap_or(DEFAULT_PORT);

        let max_connections =
            parse_var("RUSTY_CHAT_MAX_CONN")?.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let timeout_secs =
            parse_var("RUSTY_CHAT_IO_TIMEOUT")?.unwrap_or(DEFAULT_CLIENT_IO_TIMEOUT_SECS);

        let config = Self {
            address,
            port,
            max_connections,
            client_io_timeout: Duration::from_secs(timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used to start a server
    pub fn validate(&self) -> Result<()> {
        numeric_address(&self.address, self.port).map_err(|_| {
            ChatError::ConfigError(format!(
                "address '{}' must be a numeric IPv4/IPv6 address",
                self.address
            ))
        })?;

        if self.max_connections == 0 {
            return Err(ChatError::ConfigError(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.client_io_timeout.is_zero() {
            return Err(ChatError::ConfigError(
                "client I/O timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ChatError::ConfigError(format!("{} has an invalid value '{}'", name, value))
            }),
        Err(_) => Ok(None),
    }
}
