//! Benchmark configuration.
//!
//! Every knob of a run is explicit configuration; the binaries fill it
//! from flags and, optionally, a TOML file.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::rdma::qp::QpCaps;

/// Default server address.
pub const DEFAULT_SERVER: &str = "192.168.0.27";

/// Default server port.
pub const DEFAULT_PORT: u16 = 9002;

/// Configuration of a benchmark run.
///
/// The defaults reproduce the classic single-round-trip setup: one 24-byte
/// message filled with `0x01`, a depth-1 queue pair, and 16 bytes of
/// requested inline capability.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Server address to connect to.
    pub server: String,

    /// Server port.
    pub port: u16,

    /// Message length in bytes.
    pub msg_len: usize,

    /// Byte value the send buffer is filled with.
    pub fill: u8,

    /// Number of sends to post. `1` selects the timed single round trip;
    /// anything larger selects the repeated-post mode.
    pub iters: usize,

    /// Requested maximum outstanding send work requests.
    pub max_send_wr: u32,

    /// Requested maximum outstanding receive work requests.
    pub max_recv_wr: u32,

    /// Requested scatter/gather elements per work request.
    pub max_sge: u32,

    /// Requested inline-send capability in bytes.
    pub max_inline_data: u32,

    /// Whether every posted send generates a completion entry.
    pub sq_sig_all: bool,

    /// Bound on every completion wait, in milliseconds. `0` spins without
    /// bound.
    pub poll_timeout_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            server: DEFAULT_SERVER.to_owned(),
            port: DEFAULT_PORT,
            msg_len: 24,
            fill: 1,
            iters: 1,
            max_send_wr: 1,
            max_recv_wr: 1,
            max_sge: 1,
            max_inline_data: 16,
            sq_sig_all: true,
            poll_timeout_ms: 5000,
        }
    }
}

impl BenchConfig {
    /// Load a configuration from a TOML file. Missing keys keep their
    /// defaults.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut file = File::open(path)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// The requested queue pair capabilities.
    pub fn caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: self.max_sge,
            max_recv_sge: self.max_sge,
            max_inline_data: self.max_inline_data,
        }
    }

    /// The port as the service string address resolution expects.
    pub fn service(&self) -> String {
        self.port.to_string()
    }

    /// The completion-wait bound, `None` for an unbounded spin.
    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_ms != 0).then(|| Duration::from_millis(self.poll_timeout_ms))
    }
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Io(#[from] io::Error),

    #[error("malformed config file")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_the_classic_setup() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.server, DEFAULT_SERVER);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.msg_len, 24);
        assert_eq!(cfg.fill, 1);
        assert_eq!(cfg.iters, 1);
        assert_eq!(cfg.max_inline_data, 16);
        assert!(cfg.sq_sig_all);
        assert_eq!(cfg.service(), "9002");
        assert_eq!(cfg.poll_timeout(), Some(Duration::from_secs(5)));

        let caps = cfg.caps();
        assert_eq!(caps.max_send_wr, 1);
        assert_eq!(caps.max_send_sge, 1);
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let cfg = BenchConfig::from_toml_str(
            r#"
            server = "10.0.0.2"
            iters = 856
            max_send_wr = 300
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server, "10.0.0.2");
        assert_eq!(cfg.iters, 856);
        assert_eq!(cfg.max_send_wr, 300);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.msg_len, 24);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            BenchConfig::from_toml_str("serverr = \"oops\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let cfg = BenchConfig::from_toml_str("poll_timeout_ms = 0").unwrap();
        assert_eq!(cfg.poll_timeout(), None);
    }
}
