//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
//!
//! Configuration is assembled in two layers. A YAML document is read first,
//! either inline from `EMITTER_CONFIG` or from a file on disk, and then the
//! well-known environment variables are laid over the top of it. Both layers
//! are optional but the combined result must pass [`Config::validate`].
use std::{
    env, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use http::{Uri, uri::Scheme};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable holding an inline YAML configuration document.
pub const CONFIG_ENV: &str = "EMITTER_CONFIG";

const ADDR_ENV: &str = "ADDR";
const LOG_CACHE_ADDR_ENV: &str = "LOG_CACHE_ADDR";
const CA_PATH_ENV: &str = "CA_PATH";
const CERT_PATH_ENV: &str = "CERT_PATH";
const KEY_PATH_ENV: &str = "KEY_PATH";
const SERVER_NAME_ENV: &str = "LOG_CACHE_SERVER_NAME";
const INSECURE_PLAINTEXT_ENV: &str = "LOG_CACHE_INSECURE_PLAINTEXT";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for a socket address [`std::net::SocketAddr`].
    #[error("Failed to convert {var} to valid SocketAddr: {source}")]
    SocketAddr {
        /// The environment variable holding the bad value
        var: &'static str,
        /// Underlying parse error
        #[source]
        source: std::net::AddrParseError,
    },
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The ingestion address was never supplied.
    #[error("log_cache_addr is required, set it in the config or with LOG_CACHE_ADDR")]
    MissingLogCacheAddr,
    /// The ingestion address does not parse as a URI.
    #[error("log_cache_addr {addr:?} is not a valid address: {source}")]
    InvalidLogCacheAddr {
        /// The offending address
        addr: String,
        /// Underlying parse error
        #[source]
        source: http::uri::InvalidUri,
    },
    /// A boolean environment variable holds something other than
    /// `true` or `false`.
    #[error("Failed to convert {var} to a boolean: {source}")]
    ParseBool {
        /// The environment variable holding the bad value
        var: &'static str,
        /// Underlying parse error
        #[source]
        source: std::str::ParseBoolError,
    },
    /// No TLS material was supplied and plaintext was not asked for.
    #[error(
        "TLS material is required, set CA_PATH, CERT_PATH and KEY_PATH or opt in to insecure_plaintext"
    )]
    MissingTls,
    /// TLS material was supplied alongside a request for plaintext.
    #[error("insecure_plaintext is set but TLS material is configured")]
    InsecureWithTls,
    /// The address names `http` while TLS material is configured.
    #[error("log_cache_addr {0} uses http but TLS material is configured, use https")]
    HttpWithTls(Uri),
    /// The address names `https` while no TLS material is configured.
    #[error("log_cache_addr {0} uses https but no TLS material is configured")]
    HttpsWithoutTls(Uri),
    /// Only some of the TLS paths were supplied.
    #[error("TLS configuration is incomplete, {missing} is not set")]
    PartialTls {
        /// Name of the first missing setting
        missing: &'static str,
    },
    /// The connection limit must allow at least one connection.
    #[error("concurrent_requests_max must be greater than zero")]
    ZeroConcurrency,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_concurrent_requests_max() -> usize {
    100
}

fn default_server_name() -> String {
    "log-cache".to_string()
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address -- IP plus port -- the HTTP trigger listens on
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    /// Address of the Log Cache ingress, `host:port` or a full URI
    #[serde(default)]
    pub log_cache_addr: Option<String>,
    /// Mutual TLS material used to authenticate to Log Cache
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Connect to Log Cache without TLS. For local use only, must not be
    /// combined with `tls`.
    #[serde(default)]
    pub insecure_plaintext: bool,
    /// Number of concurrent HTTP connections to allow
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
    /// The method by which to express internal telemetry, if any
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            log_cache_addr: None,
            tls: None,
            insecure_plaintext: false,
            concurrent_requests_max: default_concurrent_requests_max(),
            telemetry: None,
        }
    }
}

/// Paths to the PEM encoded TLS material for the Log Cache connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// CA certificate used to verify Log Cache
    pub ca_path: PathBuf,
    /// Client certificate presented to Log Cache
    pub cert_path: PathBuf,
    /// Private key for `cert_path`
    pub key_path: PathBuf,
    /// Name expected on the Log Cache server certificate
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

/// Defines the manner of internal telemetry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// In prometheus mode the emitter will expose its counters on a polling
    /// HTTP endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

/// The TLS paths as found in the environment, before they are known to be
/// complete.
#[derive(Debug, Default)]
struct TlsOverrides {
    ca_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    server_name: Option<String>,
}

impl TlsOverrides {
    fn is_empty(&self) -> bool {
        self.ca_path.is_none()
            && self.cert_path.is_none()
            && self.key_path.is_none()
            && self.server_name.is_none()
    }

    fn apply(self, base: Option<TlsConfig>) -> Result<Option<TlsConfig>, Error> {
        if self.is_empty() {
            return Ok(base);
        }
        let (ca_path, cert_path, key_path, server_name) = match base {
            Some(tls) => (
                Some(tls.ca_path),
                Some(tls.cert_path),
                Some(tls.key_path),
                tls.server_name,
            ),
            None => (None, None, None, default_server_name()),
        };
        let ca_path = self.ca_path.or(ca_path);
        let cert_path = self.cert_path.or(cert_path);
        let key_path = self.key_path.or(key_path);
        let server_name = self.server_name.unwrap_or(server_name);

        match (ca_path, cert_path, key_path) {
            (Some(ca_path), Some(cert_path), Some(key_path)) => Ok(Some(TlsConfig {
                ca_path,
                cert_path,
                key_path,
                server_name,
            })),
            (None, _, _) => Err(Error::PartialTls {
                missing: CA_PATH_ENV,
            }),
            (_, None, _) => Err(Error::PartialTls {
                missing: CERT_PATH_ENV,
            }),
            (_, _, None) => Err(Error::PartialTls {
                missing: KEY_PATH_ENV,
            }),
        }
    }
}

impl Config {
    /// Load the configuration from `EMITTER_CONFIG` or `path`, then apply
    /// environment overrides and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or parsed, if an
    /// environment override is malformed or if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        Self::load_with(path, |key| env::var(key).ok())
    }

    /// As [`Config::load`] but reading variables through `lookup`.
    pub(crate) fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if let Some(contents) = lookup(CONFIG_ENV) {
            debug!("Using config from env var '{CONFIG_ENV}'");
            Self::parse(&contents)?
        } else if let Some(path) = path {
            debug!("Attempting to open configuration file at: {}", path.display());
            let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };

        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML or names unknown
    /// fields.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ADDR_ENV) {
            self.addr = addr.parse().map_err(|source| Error::SocketAddr {
                var: ADDR_ENV,
                source,
            })?;
        }
        if let Some(addr) = lookup(LOG_CACHE_ADDR_ENV) {
            self.log_cache_addr = Some(addr);
        }
        if let Some(insecure) = lookup(INSECURE_PLAINTEXT_ENV) {
            self.insecure_plaintext =
                insecure.trim().parse().map_err(|source| Error::ParseBool {
                    var: INSECURE_PLAINTEXT_ENV,
                    source,
                })?;
        }

        let overrides = TlsOverrides {
            ca_path: lookup(CA_PATH_ENV).map(PathBuf::from),
            cert_path: lookup(CERT_PATH_ENV).map(PathBuf::from),
            key_path: lookup(KEY_PATH_ENV).map(PathBuf::from),
            server_name: lookup(SERVER_NAME_ENV),
        };
        self.tls = overrides.apply(self.tls.take())?;
        Ok(())
    }

    /// Check the assembled configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is zero, if the Log Cache
    /// address is missing or malformed or if the transport settings do not
    /// agree with each other.
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrent_requests_max == 0 {
            return Err(Error::ZeroConcurrency);
        }
        self.log_cache_uri()?;
        match (&self.tls, self.insecure_plaintext) {
            (None, false) => Err(Error::MissingTls),
            (Some(_), true) => Err(Error::InsecureWithTls),
            _ => Ok(()),
        }
    }

    /// The Log Cache address as a URI. Bare `host:port` addresses take the
    /// `https` scheme when TLS is configured and `http` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is missing or does not parse, or if
    /// its scheme disagrees with the TLS settings.
    pub fn log_cache_uri(&self) -> Result<Uri, Error> {
        let addr = self
            .log_cache_addr
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .ok_or(Error::MissingLogCacheAddr)?;

        let full = if addr.contains("://") {
            addr.to_string()
        } else if self.tls.is_some() {
            format!("https://{addr}")
        } else {
            format!("http://{addr}")
        };

        let uri = full
            .parse::<Uri>()
            .map_err(|source| Error::InvalidLogCacheAddr {
                addr: addr.to_string(),
                source,
            })?;

        // tonic only applies TLS to https URIs.
        match (&self.tls, uri.scheme() == Some(&Scheme::HTTPS)) {
            (Some(_), false) => Err(Error::HttpWithTls(uri)),
            (None, true) => Err(Error::HttpsWithoutTls(uri)),
            _ => Ok(uri),
        }
    }

    /// Log every setting once. Paths to key material are logged, the material
    /// itself never is.
    pub fn report(&self) {
        info!(addr = %self.addr, "config");
        info!(
            log_cache_addr = self.log_cache_addr.as_deref().unwrap_or_default(),
            "config"
        );
        info!(
            concurrent_requests_max = self.concurrent_requests_max,
            "config"
        );
        match &self.tls {
            Some(tls) => info!(
                ca_path = %tls.ca_path.display(),
                cert_path = %tls.cert_path.display(),
                key_path = %tls.key_path.display(),
                server_name = %tls.server_name,
                "config"
            ),
            None => info!(
                tls = "disabled",
                insecure_plaintext = self.insecure_plaintext,
                "config"
            ),
        }
        match &self.telemetry {
            Some(Telemetry::Prometheus { addr, .. }) => {
                info!(prometheus_addr = %addr, "config");
            }
            None => info!(telemetry = "disabled", "config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_deserializes() {
        let contents = r#"
addr: "127.0.0.1:9000"
log_cache_addr: "log-cache.service.internal:8080"
concurrent_requests_max: 8
tls:
  ca_path: /etc/certs/ca.crt
  cert_path: /etc/certs/client.crt
  key_path: /etc/certs/client.key
telemetry:
  prometheus:
    addr: "0.0.0.0:9090"
"#;
        let config = Config::parse(contents).expect("Failed to parse config");
        assert_eq!(
            config,
            Config {
                addr: "127.0.0.1:9000".parse().unwrap(),
                log_cache_addr: Some("log-cache.service.internal:8080".to_string()),
                tls: Some(TlsConfig {
                    ca_path: PathBuf::from("/etc/certs/ca.crt"),
                    cert_path: PathBuf::from("/etc/certs/client.crt"),
                    key_path: PathBuf::from("/etc/certs/client.key"),
                    server_name: "log-cache".to_string(),
                }),
                insecure_plaintext: false,
                concurrent_requests_max: 8,
                telemetry: Some(Telemetry::Prometheus {
                    addr: "0.0.0.0:9090".parse().unwrap(),
                    global_labels: FxHashMap::default(),
                }),
            }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = r#"
log_cache_addr: "localhost:8080"
rate_limit: 10
"#;
        assert!(matches!(
            Config::parse(contents),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn environment_alone_is_sufficient() {
        let config = Config::load_with(
            None,
            vars(&[
                ("ADDR", "127.0.0.1:8081"),
                ("LOG_CACHE_ADDR", "10.0.0.4:8080"),
                ("CA_PATH", "/certs/ca.crt"),
                ("CERT_PATH", "/certs/client.crt"),
                ("KEY_PATH", "/certs/client.key"),
            ]),
        )
        .expect("config should load");

        assert_eq!(config.addr, "127.0.0.1:8081".parse().unwrap());
        let tls = config.tls.as_ref().expect("tls should be set");
        assert_eq!(tls.server_name, "log-cache");
        assert_eq!(tls.key_path, PathBuf::from("/certs/client.key"));
        assert_eq!(
            config.log_cache_uri().unwrap().to_string(),
            "https://10.0.0.4:8080/"
        );
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
addr: "127.0.0.1:9000"
log_cache_addr: "from-file:8080"
"#
        )
        .expect("write config");

        let config = Config::load_with(
            Some(file.path()),
            vars(&[
                ("LOG_CACHE_ADDR", "from-env:8080"),
                ("LOG_CACHE_INSECURE_PLAINTEXT", "true"),
            ]),
        )
        .expect("config should load");

        assert_eq!(config.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_cache_addr.as_deref(), Some("from-env:8080"));
        assert!(config.tls.is_none());
        assert!(config.insecure_plaintext);
        assert_eq!(
            config.log_cache_uri().unwrap().to_string(),
            "http://from-env:8080/"
        );
    }

    #[test]
    fn inline_config_wins_over_file() {
        let config = Config::load_with(
            Some(Path::new("/does/not/exist.yaml")),
            vars(&[(
                CONFIG_ENV,
                "log_cache_addr: \"inline:8080\"\ninsecure_plaintext: true",
            )]),
        )
        .expect("config should load");
        assert_eq!(config.log_cache_addr.as_deref(), Some("inline:8080"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let res = Config::load_with(Some(Path::new("/does/not/exist.yaml")), vars(&[]));
        assert!(matches!(res, Err(Error::ReadFile { .. })));
    }

    #[test]
    fn missing_log_cache_addr_is_fatal() {
        let res = Config::load_with(None, vars(&[]));
        assert!(matches!(res, Err(Error::MissingLogCacheAddr)));
    }

    #[test]
    fn malformed_listen_addr_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[("ADDR", "not-an-addr"), ("LOG_CACHE_ADDR", "localhost:8080")]),
        );
        assert!(matches!(res, Err(Error::SocketAddr { var: "ADDR", .. })));
    }

    #[test]
    fn partial_tls_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "localhost:8080"),
                ("CA_PATH", "/certs/ca.crt"),
                ("CERT_PATH", "/certs/client.crt"),
            ]),
        );
        assert!(matches!(
            res,
            Err(Error::PartialTls {
                missing: "KEY_PATH"
            })
        ));
    }

    #[test]
    fn zero_concurrency_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[(
                CONFIG_ENV,
                "log_cache_addr: \"localhost:8080\"\nconcurrent_requests_max: 0",
            )]),
        );
        assert!(matches!(res, Err(Error::ZeroConcurrency)));
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let config = Config {
            log_cache_addr: Some("http://127.0.0.1:8080".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.log_cache_uri().unwrap().to_string(),
            "http://127.0.0.1:8080/"
        );
    }

    #[test]
    fn missing_tls_is_fatal() {
        let res = Config::load_with(None, vars(&[("LOG_CACHE_ADDR", "localhost:8080")]));
        assert!(matches!(res, Err(Error::MissingTls)));
    }

    #[test]
    fn http_scheme_with_tls_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "http://127.0.0.1:8080"),
                ("CA_PATH", "/certs/ca.crt"),
                ("CERT_PATH", "/certs/client.crt"),
                ("KEY_PATH", "/certs/client.key"),
            ]),
        );
        assert!(matches!(res, Err(Error::HttpWithTls(_))));
    }

    #[test]
    fn https_scheme_without_tls_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "https://127.0.0.1:8080"),
                ("LOG_CACHE_INSECURE_PLAINTEXT", "true"),
            ]),
        );
        assert!(matches!(res, Err(Error::HttpsWithoutTls(_))));
    }

    #[test]
    fn insecure_plaintext_with_tls_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "127.0.0.1:8080"),
                ("LOG_CACHE_INSECURE_PLAINTEXT", "true"),
                ("CA_PATH", "/certs/ca.crt"),
                ("CERT_PATH", "/certs/client.crt"),
                ("KEY_PATH", "/certs/client.key"),
            ]),
        );
        assert!(matches!(res, Err(Error::InsecureWithTls)));
    }

    #[test]
    fn malformed_insecure_plaintext_is_fatal() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "127.0.0.1:8080"),
                ("LOG_CACHE_INSECURE_PLAINTEXT", "yes"),
            ]),
        );
        assert!(matches!(
            res,
            Err(Error::ParseBool {
                var: "LOG_CACHE_INSECURE_PLAINTEXT",
                ..
            })
        ));
    }

    #[test]
    fn server_name_without_paths_is_partial_tls() {
        let res = Config::load_with(
            None,
            vars(&[
                ("LOG_CACHE_ADDR", "localhost:8080"),
                ("LOG_CACHE_SERVER_NAME", "log-cache.internal"),
            ]),
        );
        assert!(matches!(
            res,
            Err(Error::PartialTls {
                missing: "CA_PATH"
            })
        ));
    }

    #[test]
    fn server_name_overrides_file_tls() {
        let config = Config::load_with(
            None,
            vars(&[
                (
                    CONFIG_ENV,
                    "log_cache_addr: \"localhost:8080\"\ntls:\n  ca_path: /c/ca.crt\n  cert_path: /c/client.crt\n  key_path: /c/client.key",
                ),
                ("LOG_CACHE_SERVER_NAME", "log-cache.internal"),
            ]),
        )
        .expect("config should load");
        let tls = config.tls.expect("tls should be set");
        assert_eq!(tls.server_name, "log-cache.internal");
        assert_eq!(tls.ca_path, PathBuf::from("/c/ca.crt"));
    }
}
