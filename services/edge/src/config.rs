//! Edge settings.
//!
//! Settings are read from the environment once at startup, validated, and
//! then shared read-only (`Arc<Settings>`) by every component.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Default local port for plaintext HTTP.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default local port for HTTPS.
pub const DEFAULT_HTTPS_PORT: u16 = 4433;

/// Number of listening sockets the supervisor must hand us.
pub const SUPERVISED_LISTENER_COUNT: usize = 2;

/// How the process receives its public listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Listening sockets are inherited from the process supervisor and
    /// tunneled onto the local ports.
    Supervised,
    /// Only the local ports are bound. Used for development.
    Standalone,
}

/// PEM files used to terminate TLS on the secure local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Validated, immutable process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Backend A hostname. Default target for all traffic.
    pub host_a: String,

    /// Backend B hostname.
    pub host_b: String,

    /// Local plaintext port (tunnel target for descriptor 0).
    pub http_port: u16,

    /// Local secure port (tunnel target for descriptor 1).
    pub https_port: u16,

    /// Skip certificate validation on backend connections.
    pub ignore_backend_tls_errors: bool,

    /// Supervised or standalone.
    pub mode: RunMode,

    /// Admin API key, compared against the `Authorization` header.
    pub api_key: String,

    /// SQLite rule database.
    pub rules_db: PathBuf,

    /// Certificate and key for the secure port.
    pub tls: Option<TlsFiles>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup("SPLITGATE_MODE").as_deref() {
            None | Some("") | Some("supervised") => RunMode::Supervised,
            Some("standalone") => RunMode::Standalone,
            Some(other) => bail!(
                "invalid SPLITGATE_MODE value {other:?}; expected supervised or standalone"
            ),
        };

        if mode == RunMode::Supervised {
            let listen_fds: usize = lookup("LISTEN_FDS")
                .context("LISTEN_FDS not set; run under the supervisor or set SPLITGATE_MODE=standalone")?
                .parse()
                .context("LISTEN_FDS must be an integer")?;
            if listen_fds != SUPERVISED_LISTENER_COUNT {
                bail!(
                    "two listening sockets are required (http and https), but got {listen_fds}"
                );
            }
        }

        let host_a = required(&lookup, "SPLITGATE_HOST_A")?;
        let host_b = required(&lookup, "SPLITGATE_HOST_B")?;
        let api_key = required(&lookup, "SPLITGATE_API_KEY")?;

        let http_port = port(&lookup, "SPLITGATE_HTTP_PORT", DEFAULT_HTTP_PORT)?;
        let https_port = port(&lookup, "SPLITGATE_HTTPS_PORT", DEFAULT_HTTPS_PORT)?;
        if http_port == https_port {
            bail!("SPLITGATE_HTTP_PORT and SPLITGATE_HTTPS_PORT must differ (both {http_port})");
        }

        let ignore_backend_tls_errors = match lookup("SPLITGATE_IGNORE_TLS").as_deref() {
            None | Some("") | Some("false") => false,
            Some("true") => true,
            Some(other) => bail!("invalid SPLITGATE_IGNORE_TLS value {other:?}"),
        };

        let tls = match (lookup("SPLITGATE_TLS_CERT"), lookup("SPLITGATE_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => bail!("SPLITGATE_TLS_CERT and SPLITGATE_TLS_KEY must be set together"),
        };
        if mode == RunMode::Supervised && tls.is_none() {
            bail!("supervised mode terminates TLS; set SPLITGATE_TLS_CERT and SPLITGATE_TLS_KEY");
        }

        let rules_db = lookup("SPLITGATE_RULES_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./splitgate.sqlite"));

        let log_level = lookup("SPLITGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host_a,
            host_b,
            http_port,
            https_port,
            ignore_backend_tls_errors,
            mode,
            api_key,
            rules_db,
            tls,
            log_level,
        })
    }

    /// Whether listening sockets come from the supervisor.
    pub fn is_supervised(&self) -> bool {
        self.mode == RunMode::Supervised
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{key} not specified"),
    }
}

fn port<F>(lookup: &F, key: &str, default: u16) -> Result<u16>
where
    F: Fn(&str) -> Option<String>,
{
    let port = lookup(key)
        .map(|v| v.parse::<u16>())
        .transpose()
        .with_context(|| format!("{key} must be a port number"))?
        .unwrap_or(default);
    if port == 0 {
        bail!("{key} must not be 0");
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn standalone() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SPLITGATE_MODE", "standalone"),
            ("SPLITGATE_HOST_A", "a.internal"),
            ("SPLITGATE_HOST_B", "b.internal"),
            ("SPLITGATE_API_KEY", "secret"),
        ]
    }

    #[test]
    fn test_standalone_defaults() {
        let settings = Settings::from_lookup(env(&standalone())).unwrap();
        assert_eq!(settings.mode, RunMode::Standalone);
        assert_eq!(settings.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(settings.https_port, DEFAULT_HTTPS_PORT);
        assert!(!settings.ignore_backend_tls_errors);
        assert!(settings.tls.is_none());
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_supervised_requires_two_descriptors() {
        let mut vars = standalone();
        vars.retain(|(k, _)| *k != "SPLITGATE_MODE");
        vars.push(("SPLITGATE_TLS_CERT", "/etc/splitgate/cert.pem"));
        vars.push(("SPLITGATE_TLS_KEY", "/etc/splitgate/key.pem"));

        assert!(Settings::from_lookup(env(&vars)).is_err());

        vars.push(("LISTEN_FDS", "1"));
        let err = Settings::from_lookup(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("got 1"));

        vars.retain(|(k, _)| *k != "LISTEN_FDS");
        vars.push(("LISTEN_FDS", "2"));
        let settings = Settings::from_lookup(env(&vars)).unwrap();
        assert!(settings.is_supervised());
    }

    #[test]
    fn test_supervised_requires_tls_files() {
        let mut vars = standalone();
        vars.retain(|(k, _)| *k != "SPLITGATE_MODE");
        vars.push(("LISTEN_FDS", "2"));
        assert!(Settings::from_lookup(env(&vars)).is_err());
    }

    #[test]
    fn test_missing_hosts_rejected() {
        let mut vars = standalone();
        vars.retain(|(k, _)| *k != "SPLITGATE_HOST_B");
        let err = Settings::from_lookup(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("SPLITGATE_HOST_B"));
    }

    #[test]
    fn test_ignore_tls_values() {
        let mut vars = standalone();
        vars.push(("SPLITGATE_IGNORE_TLS", "true"));
        assert!(
            Settings::from_lookup(env(&vars))
                .unwrap()
                .ignore_backend_tls_errors
        );

        let mut vars = standalone();
        vars.push(("SPLITGATE_IGNORE_TLS", "yes"));
        assert!(Settings::from_lookup(env(&vars)).is_err());
    }

    #[test]
    fn test_port_overrides() {
        let mut vars = standalone();
        vars.push(("SPLITGATE_HTTP_PORT", "9080"));
        vars.push(("SPLITGATE_HTTPS_PORT", "9443"));
        let settings = Settings::from_lookup(env(&vars)).unwrap();
        assert_eq!(settings.http_port, 9080);
        assert_eq!(settings.https_port, 9443);

        let mut vars = standalone();
        vars.push(("SPLITGATE_HTTP_PORT", "http"));
        assert!(Settings::from_lookup(env(&vars)).is_err());
    }

    #[test]
    fn test_tls_files_must_be_paired() {
        let mut vars = standalone();
        vars.push(("SPLITGATE_TLS_CERT", "/tmp/cert.pem"));
        assert!(Settings::from_lookup(env(&vars)).is_err());
    }
}
