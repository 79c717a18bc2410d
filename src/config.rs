//! Gateway and daemon configuration
//!
//! Defaults, environment overrides and validation of the shell manifest.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::http::REQUEST_TIMEOUT;
use crate::store::disk::default_root;

/// Default cache version (namespace name)
pub const DEFAULT_VERSION: &str = "shell-v1";

/// Default offline-fallback document
pub const DEFAULT_OFFLINE_PATH: &str = "/offline.html";

/// Default shell manifest; every path must be served by the origin
pub const DEFAULT_SHELL: [&str; 5] = [
    "/",
    "/index.html",
    DEFAULT_OFFLINE_PATH,
    "/manifest.webmanifest",
    "/favicon.ico",
];

/// Socket path for request sources
pub const SOCKET_PATH: &str = "/tmp/shellcache.sock";

/// Install attempts before the daemon gives up
pub const DEFAULT_INSTALL_ATTEMPTS: u32 = 3;

/// How long cutover waits for a superseded version's cache writes
pub const RETIRE_GRACE: Duration = Duration::from_secs(5);

/// Longest command line accepted from a request source
pub const MAX_COMMAND_BYTES: usize = 8 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("Origin must be an http(s) URL, got {0}")]
    UnsupportedOrigin(String),

    #[error("Cache version must not be empty")]
    EmptyVersion,

    #[error("Shell manifest is empty")]
    EmptyShell,

    #[error("Offline document {0} is not part of the shell manifest")]
    OfflineNotInShell(String),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

/// Settings for one gateway version
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Origin that serves the application
    pub origin: Url,
    /// Cache version; also the namespace name
    pub version: String,
    /// Offline-fallback document (always a shell entry)
    pub offline_url: Url,
    /// Shell manifest in install order, without duplicates
    pub shell: Vec<Url>,
}

impl GatewayConfig {
    /// Default version and shell for `origin`
    pub fn new(origin: &str) -> Result<Self, ConfigError> {
        Self::build(origin, DEFAULT_VERSION, &DEFAULT_SHELL, DEFAULT_OFFLINE_PATH)
    }

    /// Build and validate a configuration
    ///
    /// Shell and offline paths are resolved against the origin.
    pub fn build<S: AsRef<str>>(
        origin: &str,
        version: &str,
        shell: &[S],
        offline_path: &str,
    ) -> Result<Self, ConfigError> {
        let origin =
            Url::parse(origin).map_err(|e| ConfigError::InvalidUrl(origin.to_string(), e))?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedOrigin(origin.to_string()));
        }

        if version.trim().is_empty() {
            return Err(ConfigError::EmptyVersion);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(shell.len());
        for path in shell {
            let url = resolve(&origin, path.as_ref())?;
            if seen.insert(url.to_string()) {
                resolved.push(url);
            }
        }
        if resolved.is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        let offline_url = resolve(&origin, offline_path)?;
        if !resolved.contains(&offline_url) {
            return Err(ConfigError::OfflineNotInShell(offline_url.to_string()));
        }

        Ok(Self {
            origin,
            version: version.to_string(),
            offline_url,
            shell: resolved,
        })
    }

    /// Same shell under a different version
    pub fn with_version(&self, version: &str) -> Result<Self, ConfigError> {
        if version.trim().is_empty() {
            return Err(ConfigError::EmptyVersion);
        }
        Ok(Self {
            version: version.to_string(),
            ..self.clone()
        })
    }

    /// Resolve a path or absolute URL against the origin
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, ConfigError> {
        resolve(&self.origin, path_or_url)
    }
}

fn resolve(origin: &Url, path_or_url: &str) -> Result<Url, ConfigError> {
    origin
        .join(path_or_url)
        .map_err(|e| ConfigError::InvalidUrl(path_or_url.to_string(), e))
}

/// Daemon settings around the gateway
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub gateway: GatewayConfig,
    /// Root of the on-disk cache store
    pub cache_dir: PathBuf,
    /// Unix socket request sources connect to
    pub socket_path: PathBuf,
    /// Transport timeout; bounds every network race
    pub request_timeout: Duration,
    /// Keep the cache in memory only
    pub memory_only: bool,
    /// Whole-install attempts before giving up
    pub install_attempts: u32,
    /// Cutover wait for the previous version's writes
    pub retire_grace: Duration,
    /// Longest accepted socket command line
    pub max_command_bytes: usize,
}

impl DaemonConfig {
    /// Read settings from the process environment
    pub fn from_env(origin: Option<&str>) -> Result<Self, ConfigError> {
        Self::from_lookup(origin, |name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`; `origin` overrides SHELLCACHE_ORIGIN
    pub fn from_lookup<F>(origin: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = match origin {
            Some(origin) => origin.to_string(),
            None => lookup("SHELLCACHE_ORIGIN").ok_or(ConfigError::Missing("SHELLCACHE_ORIGIN"))?,
        };

        let version = lookup("SHELLCACHE_VERSION").unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let offline_path =
            lookup("SHELLCACHE_OFFLINE_PATH").unwrap_or_else(|| DEFAULT_OFFLINE_PATH.to_string());
        let shell: Vec<String> = match lookup("SHELLCACHE_SHELL") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
        };

        let gateway = GatewayConfig::build(&origin, &version, &shell, &offline_path)?;

        let request_timeout = match lookup("SHELLCACHE_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>().ok() {
                Some(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidValue("SHELLCACHE_TIMEOUT_SECS", raw)),
            },
            None => REQUEST_TIMEOUT,
        };

        let memory_only = match lookup("SHELLCACHE_MEMORY").as_deref().map(str::trim) {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue("SHELLCACHE_MEMORY", other.to_string()))
            }
        };

        let install_attempts = match lookup("SHELLCACHE_INSTALL_ATTEMPTS") {
            Some(raw) => match raw.trim().parse::<u32>().ok() {
                Some(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue("SHELLCACHE_INSTALL_ATTEMPTS", raw)),
            },
            None => DEFAULT_INSTALL_ATTEMPTS,
        };

        let retire_grace = match lookup("SHELLCACHE_RETIRE_GRACE_MS") {
            Some(raw) => match raw.trim().parse::<u64>().ok() {
                Some(ms) => Duration::from_millis(ms),
                None => return Err(ConfigError::InvalidValue("SHELLCACHE_RETIRE_GRACE_MS", raw)),
            },
            None => RETIRE_GRACE,
        };

        let max_command_bytes = match lookup("SHELLCACHE_MAX_COMMAND_BYTES") {
            Some(raw) => match raw.trim().parse::<usize>().ok() {
                Some(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue("SHELLCACHE_MAX_COMMAND_BYTES", raw)),
            },
            None => MAX_COMMAND_BYTES,
        };

        Ok(Self {
            gateway,
            cache_dir: lookup("SHELLCACHE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_root),
            socket_path: lookup("SHELLCACHE_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(SOCKET_PATH)),
            request_timeout,
            memory_only,
            install_attempts,
            retire_grace,
            max_command_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_shell() {
        let config = GatewayConfig::new("https://app.test").unwrap();
        let shell: Vec<&str> = config.shell.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            shell,
            vec![
                "https://app.test/",
                "https://app.test/index.html",
                "https://app.test/offline.html",
                "https://app.test/manifest.webmanifest",
                "https://app.test/favicon.ico",
            ]
        );
        assert_eq!(config.offline_url.as_str(), "https://app.test/offline.html");
        assert_eq!(config.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_duplicates_removed_in_order() {
        let config = GatewayConfig::build(
            "https://app.test",
            "v1",
            &["/offline.html", "/", "/offline.html"],
            "/offline.html",
        )
        .unwrap();
        assert_eq!(config.shell.len(), 2);
        assert_eq!(config.shell[0].path(), "/offline.html");
    }

    #[test]
    fn test_offline_must_be_in_shell() {
        let err = GatewayConfig::build("https://app.test", "v1", &["/"], "/offline.html").unwrap_err();
        assert!(matches!(err, ConfigError::OfflineNotInShell(_)));
    }

    #[test]
    fn test_rejects_bad_origin_and_version() {
        assert!(matches!(
            GatewayConfig::new("not a url"),
            Err(ConfigError::InvalidUrl(..))
        ));
        assert!(matches!(
            GatewayConfig::new("ftp://app.test"),
            Err(ConfigError::UnsupportedOrigin(_))
        ));
        assert!(matches!(
            GatewayConfig::build("https://app.test", " ", &DEFAULT_SHELL, DEFAULT_OFFLINE_PATH),
            Err(ConfigError::EmptyVersion)
        ));
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let config = GatewayConfig::new("https://app.test/").unwrap();
        assert_eq!(
            config.resolve("/styles.css").unwrap().as_str(),
            "https://app.test/styles.css"
        );
        assert_eq!(
            config.resolve("https://cdn.test/lib.js").unwrap().as_str(),
            "https://cdn.test/lib.js"
        );
    }

    #[test]
    fn test_daemon_config_from_lookup() {
        let config = DaemonConfig::from_lookup(
            None,
            lookup(&[
                ("SHELLCACHE_ORIGIN", "http://127.0.0.1:8080"),
                ("SHELLCACHE_VERSION", "footy-v2"),
                ("SHELLCACHE_SHELL", "/, /offline.html"),
                ("SHELLCACHE_TIMEOUT_SECS", "5"),
                ("SHELLCACHE_MEMORY", "true"),
                ("SHELLCACHE_SOCKET", "/tmp/test.sock"),
                ("SHELLCACHE_RETIRE_GRACE_MS", "250"),
            ]),
        )
        .unwrap();

        assert_eq!(config.gateway.version, "footy-v2");
        assert_eq!(config.gateway.shell.len(), 2);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.memory_only);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.install_attempts, DEFAULT_INSTALL_ATTEMPTS);
        assert_eq!(config.retire_grace, Duration::from_millis(250));
        assert_eq!(config.max_command_bytes, MAX_COMMAND_BYTES);
    }

    #[test]
    fn test_daemon_config_requires_origin() {
        let err = DaemonConfig::from_lookup(None, lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SHELLCACHE_ORIGIN")));

        let config = DaemonConfig::from_lookup(Some("https://app.test"), lookup(&[])).unwrap();
        assert_eq!(config.gateway.origin.as_str(), "https://app.test/");
    }

    #[test]
    fn test_daemon_config_rejects_bad_numbers() {
        let err = DaemonConfig::from_lookup(
            Some("https://app.test"),
            lookup(&[("SHELLCACHE_TIMEOUT_SECS", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("SHELLCACHE_TIMEOUT_SECS", _)));

        let err = DaemonConfig::from_lookup(
            Some("https://app.test"),
            lookup(&[("SHELLCACHE_MAX_COMMAND_BYTES", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("SHELLCACHE_MAX_COMMAND_BYTES", _)));
    }
}
