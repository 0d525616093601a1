//! Command line configuration for the server binary

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Realtime session server speaking JSON envelopes over WebSocket
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,
    /// Tokio worker threads
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,
    /// Maximum number of concurrent connections
    #[arg(short, long, default_value_t = 1024)]
    pub max_connections: usize,
    /// Delivery drain period in milliseconds
    #[arg(long, default_value_t = 17)]
    pub drain_interval_ms: u64,
    /// Heartbeat period for logged in sessions, in seconds
    #[arg(long, default_value_t = 15)]
    pub heartbeat_secs: u64,
    /// Player cache flush period in seconds
    #[arg(long, default_value_t = 3)]
    pub flush_interval_secs: u64,
    /// Inbound text frames larger than this are dropped
    #[arg(long, default_value_t = 8192)]
    pub max_frame_bytes: usize,
    /// Connections silent for this long are closed
    #[arg(long, default_value_t = 600)]
    pub idle_timeout_secs: u64,
    /// Directory for player records; kept in memory when absent
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
    /// Shared login secret; generated at startup when absent
    #[arg(short, long)]
    pub secret: Option<String>,
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["server"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.address(), "127.0.0.1:8080");
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.drain_interval(), Duration::from_millis(17));
        assert_eq!(config.heartbeat(), Duration::from_secs(15));
        assert_eq!(config.flush_interval(), Duration::from_secs(3));
        assert_eq!(config.max_frame_bytes, 8192);
        assert_eq!(config.idle_timeout(), Duration::from_secs(600));
        assert!(config.data_dir.is_none());
        assert!(config.secret.is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse_from([
            "server",
            "-H",
            "0.0.0.0",
            "--port",
            "9001",
            "--secret",
            "abc",
            "--data-dir",
            "/tmp/players",
            "--drain-interval-ms",
            "0",
        ]);

        assert_eq!(config.address(), "0.0.0.0:9001");
        assert_eq!(config.secret.as_deref(), Some("abc"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/players")));
        assert_eq!(config.drain_interval(), Duration::from_millis(1));
    }
}
