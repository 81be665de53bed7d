//! Proxy configuration from environment variables.
//!
//! Every option is a `PROXY_*` environment variable with a default suitable
//! for running next to a single origin on the same host. Values are read and
//! validated once at startup; a malformed port or duration fails the boot
//! with `ConfigInvalid`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Which state backend variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerKind {
    /// In-process maps, single proxy instance.
    Memory,
    /// Shared Redis store, multiple proxy instances.
    Redis,
}

/// Proxy configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// RTMP media server port (TCP).
    pub rtmp_server: u16,
    /// HTTP web server port (TCP), for HTTP-FLV/HLS/TS.
    pub http_server: u16,
    /// HTTP API server port (TCP), for WHIP/WHEP and the origin API.
    pub http_api: u16,
    /// WebRTC media server port (UDP).
    pub webrtc_server: u16,
    /// SRT media server port (UDP).
    pub srt_server: u16,
    /// System API port (TCP), where origins register themselves.
    pub system_api: u16,
    /// Optional static files directory for the web server.
    pub static_files: Option<PathBuf>,
    /// State backend variant.
    pub load_balancer: LoadBalancerKind,
    /// Redis connection, used when `load_balancer` is `Redis`.
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub redis_db: u32,
    /// Synthetic default backend, for debugging only.
    pub default_backend_enabled: bool,
    pub default_backend_ip: String,
    pub default_backend_rtmp: String,
    pub default_backend_http: String,
    pub default_backend_api: String,
    pub default_backend_rtc: String,
    pub default_backend_srt: String,
    /// Window for draining tasks after a shutdown signal.
    pub grace_quit_timeout: Duration,
    /// Watchdog that force-exits the process if shutdown wedges.
    pub force_quit_timeout: Duration,
}

impl Config {
    /// Read the configuration from the environment, applying defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            rtmp_server: env_port("PROXY_RTMP_SERVER", 11935)?,
            http_server: env_port("PROXY_HTTP_SERVER", 18080)?,
            http_api: env_port("PROXY_HTTP_API", 11985)?,
            webrtc_server: env_port("PROXY_WEBRTC_SERVER", 18000)?,
            srt_server: env_port("PROXY_SRT_SERVER", 20080)?,
            system_api: env_port("PROXY_SYSTEM_API", 12025)?,
            static_files: std::env::var("PROXY_STATIC_FILES")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            load_balancer: match env_or("PROXY_LOAD_BALANCER_TYPE", "memory").as_str() {
                "redis" => LoadBalancerKind::Redis,
                _ => LoadBalancerKind::Memory,
            },
            redis_host: env_or("PROXY_REDIS_HOST", "127.0.0.1"),
            redis_port: env_port("PROXY_REDIS_PORT", 6379)?,
            redis_password: env_or("PROXY_REDIS_PASSWORD", ""),
            redis_db: env_parse("PROXY_REDIS_DB", 0)?,
            default_backend_enabled: env_or("PROXY_DEFAULT_BACKEND_ENABLED", "off") == "on",
            default_backend_ip: env_or("PROXY_DEFAULT_BACKEND_IP", "127.0.0.1"),
            default_backend_rtmp: env_or("PROXY_DEFAULT_BACKEND_RTMP", "1935"),
            default_backend_http: env_or("PROXY_DEFAULT_BACKEND_HTTP", ""),
            default_backend_api: env_or("PROXY_DEFAULT_BACKEND_API", "1985"),
            default_backend_rtc: env_or("PROXY_DEFAULT_BACKEND_RTC", "8000"),
            default_backend_srt: env_or("PROXY_DEFAULT_BACKEND_SRT", "10080"),
            grace_quit_timeout: env_duration("PROXY_GRACE_QUIT_TIMEOUT", Duration::from_secs(20))?,
            force_quit_timeout: env_duration("PROXY_FORCE_QUIT_TIMEOUT", Duration::from_secs(30))?,
        })
    }

    /// Redis connection URL for the shared state backend.
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            )
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_password, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_port(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ProxyError::ConfigInvalid(format!("bad port {key}={v}"))),
        _ => Ok(default),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ProxyError::ConfigInvalid(format!("bad value {key}={v}"))),
        _ => Ok(default),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => parse_duration(&v)
            .ok_or_else(|| ProxyError::ConfigInvalid(format!("bad duration {key}={v}"))),
        _ => Ok(default),
    }
}

/// Parse a duration like `20s`, `500ms`, `2m` or `1h`.
fn parse_duration(s: &str) -> Option<Duration> {
    let (value, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("20s"), Some(Duration::from_secs(20)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("s"), None);
    }
}
