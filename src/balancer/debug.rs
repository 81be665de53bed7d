//! Synthetic default backend, for development against a single origin.
//!
//! When enabled, a descriptor is built from configuration at startup and
//! re-registered every 30 seconds until shutdown, standing in for an origin
//! that does not register itself.

use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{generate_context_id, BackendServer};
use crate::config::Config;
use crate::error::{ProxyError, Result};

use super::{LoadBalancer, DEFAULT_BACKEND_KEEPALIVE};

/// Build the default backend descriptor, or `None` when disabled.
///
/// An enabled default backend must carry an IP and an RTMP endpoint; a
/// partial configuration is rejected.
pub fn default_backend_for_debugging(config: &Config) -> Result<Option<BackendServer>> {
    if !config.default_backend_enabled {
        return Ok(None);
    }

    if config.default_backend_ip.is_empty() {
        return Err(ProxyError::ConfigInvalid("empty default backend ip".into()));
    }
    if config.default_backend_rtmp.is_empty() {
        return Err(ProxyError::ConfigInvalid("empty default backend rtmp".into()));
    }

    let optional = |value: &str| {
        if value.is_empty() {
            vec![]
        } else {
            vec![value.to_string()]
        }
    };

    Ok(Some(BackendServer {
        server_id: format!("default-{}", generate_context_id()),
        service_id: generate_context_id(),
        pid: std::process::id().to_string(),
        ip: config.default_backend_ip.clone(),
        device_id: None,
        rtmp: vec![config.default_backend_rtmp.clone()],
        http: optional(&config.default_backend_http),
        api: optional(&config.default_backend_api),
        rtc: optional(&config.default_backend_rtc),
        srt: optional(&config.default_backend_srt),
        updated_at: SystemTime::now(),
    }))
}

/// Re-register `server` every 30 seconds until cancelled.
pub(super) fn spawn_keepalive(
    lb: impl LoadBalancer + 'static,
    server: BackendServer,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(DEFAULT_BACKEND_KEEPALIVE) => {
                    if let Err(e) = lb.update(&server).await {
                        warn!(id = %server.id(), error = %e, "default backend keepalive failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_default_backend() -> Config {
        let mut config = base_config();
        config.default_backend_enabled = true;
        config
    }

    fn base_config() -> Config {
        Config {
            rtmp_server: 11935,
            http_server: 18080,
            http_api: 11985,
            webrtc_server: 18000,
            srt_server: 20080,
            system_api: 12025,
            static_files: None,
            load_balancer: crate::config::LoadBalancerKind::Memory,
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
            redis_password: String::new(),
            redis_db: 0,
            default_backend_enabled: false,
            default_backend_ip: "127.0.0.1".into(),
            default_backend_rtmp: "1935".into(),
            default_backend_http: String::new(),
            default_backend_api: "1985".into(),
            default_backend_rtc: "8000".into(),
            default_backend_srt: "10080".into(),
            grace_quit_timeout: std::time::Duration::from_secs(20),
            force_quit_timeout: std::time::Duration::from_secs(30),
        }
    }

    #[test]
    fn disabled_yields_none() {
        assert!(default_backend_for_debugging(&base_config()).unwrap().is_none());
    }

    #[test]
    fn enabled_builds_descriptor() {
        let server = default_backend_for_debugging(&config_with_default_backend())
            .unwrap()
            .unwrap();
        assert!(server.server_id.starts_with("default-"));
        assert_eq!(server.ip, "127.0.0.1");
        assert_eq!(server.rtmp, vec!["1935".to_string()]);
        assert_eq!(server.api, vec!["1985".to_string()]);
        assert!(server.http.is_empty());
    }

    #[test]
    fn partial_configuration_is_rejected() {
        let mut config = config_with_default_backend();
        config.default_backend_ip = String::new();
        assert!(matches!(
            default_backend_for_debugging(&config).unwrap_err(),
            ProxyError::ConfigInvalid(_)
        ));

        let mut config = config_with_default_backend();
        config.default_backend_rtmp = String::new();
        assert!(matches!(
            default_backend_for_debugging(&config).unwrap_err(),
            ProxyError::ConfigInvalid(_)
        ));
    }
}
