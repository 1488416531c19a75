use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{Engine, Term};
use crate::error::{ProximaError, Result};
use crate::proxy::{DispatcherConfig, HandshakeTimeouts};

/// Listen address used when neither the environment nor the rules name one.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address override
    pub listen: Option<String>,
    /// Rule files, loaded in order after the baseline program
    pub rules: Vec<PathBuf>,
    /// Proxy timeouts
    pub proxy: ProxyConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Time allowed to dial a candidate
    pub connect_timeout: Duration,
    /// Time allowed for the CONNECT exchange with a candidate
    pub handshake_timeout: Duration,
    /// Time allowed for one `probe/4` request
    pub probe_timeout: Duration,
    /// Relay idle timeout, disabled when unset
    pub relay_idle_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            timeouts: HandshakeTimeouts {
                connect: self.connect_timeout,
                exchange: self.handshake_timeout,
            },
            relay_idle_timeout: self.relay_idle_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let listen = env::var("PROXIMA_LISTEN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let rules = get_env_or("PROXIMA_RULES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        let idle = seconds("PROXIMA_RELAY_IDLE_TIMEOUT", 0)?;

        Ok(Config {
            listen,
            rules,
            proxy: ProxyConfig {
                connect_timeout: Duration::from_secs(seconds("PROXIMA_CONNECT_TIMEOUT", 10)?),
                handshake_timeout: Duration::from_secs(seconds("PROXIMA_HANDSHAKE_TIMEOUT", 30)?),
                probe_timeout: Duration::from_secs(seconds("PROXIMA_PROBE_TIMEOUT", 30)?),
                relay_idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: match get_env_or("LOG_FORMAT", "pretty").to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    other => {
                        return Err(ProximaError::InvalidConfig(format!(
                            "LOG_FORMAT must be json or pretty, got {}",
                            other
                        )))
                    }
                },
            },
        })
    }

    /// Append rule files given on the command line.
    pub fn with_rule_files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.rules.extend(files);
        self
    }

    /// The address to listen on: `PROXIMA_LISTEN`, else the first `listen(Addr)`
    /// solution of the loaded rules, else [`DEFAULT_LISTEN`].
    pub fn listen_addr(&self, engine: &Engine) -> Result<String> {
        if let Some(listen) = &self.listen {
            return Ok(listen.clone());
        }
        match engine.query_str("listen(Addr)")?.next() {
            Some(Ok(solution)) => match solution.get("Addr") {
                Some(Term::Atom(addr)) => Ok(addr.to_string()),
                other => Err(ProximaError::InvalidConfig(format!(
                    "listen/1 must give an atom, got {}",
                    other.map(Term::to_string).unwrap_or_default()
                ))),
            },
            Some(Err(e)) => Err(ProximaError::EngineFailure(e)),
            None => Ok(DEFAULT_LISTEN.to_string()),
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn seconds(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            ProximaError::InvalidConfig(format!("{} must be a whole number of seconds", key))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXIMA_LISTEN",
        "PROXIMA_RULES",
        "PROXIMA_CONNECT_TIMEOUT",
        "PROXIMA_HANDSHAKE_TIMEOUT",
        "PROXIMA_PROBE_TIMEOUT",
        "PROXIMA_RELAY_IDLE_TIMEOUT",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn engine(source: &str) -> Engine {
        let mut builder = Engine::builder().unwrap();
        builder.consult_str("test", source).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert!(config.listen.is_none());
        assert!(config.rules.is_empty());
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.proxy.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.proxy.probe_timeout, Duration::from_secs(30));
        assert_eq!(config.proxy.relay_idle_timeout, None);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXIMA_LISTEN", "0.0.0.0:3128");
        env::set_var("PROXIMA_RULES", "base.pl, site.pl,");
        env::set_var("PROXIMA_CONNECT_TIMEOUT", "3");
        env::set_var("PROXIMA_RELAY_IDLE_TIMEOUT", "600");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env()
            .unwrap()
            .with_rule_files(vec![PathBuf::from("cli.pl")]);

        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:3128"));
        assert_eq!(
            config.rules,
            vec![
                PathBuf::from("base.pl"),
                PathBuf::from("site.pl"),
                PathBuf::from("cli.pl")
            ]
        );
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(3));
        assert_eq!(
            config.proxy.relay_idle_timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.log.format, LogFormat::Json);

        let dispatcher = config.proxy.dispatcher();
        assert_eq!(dispatcher.timeouts.connect, Duration::from_secs(3));
        assert_eq!(dispatcher.timeouts.exchange, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_env_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXIMA_HANDSHAKE_TIMEOUT", "soon");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProximaError::InvalidConfig(_)));

        env::remove_var("PROXIMA_HANDSHAKE_TIMEOUT");
        env::set_var("LOG_FORMAT", "xml");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProximaError::InvalidConfig(_)));
    }

    #[test]
    fn test_listen_addr_resolution() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let mut config = Config::from_env().unwrap();
        assert_eq!(config.listen_addr(&engine("")).unwrap(), DEFAULT_LISTEN);

        let rules = engine("listen('0.0.0.0:9000').\nlisten('0.0.0.0:9001').");
        assert_eq!(config.listen_addr(&rules).unwrap(), "0.0.0.0:9000");

        let err = config.listen_addr(&engine("listen(9000).")).unwrap_err();
        assert!(matches!(err, ProximaError::InvalidConfig(_)));

        config.listen = Some("127.0.0.1:1080".into());
        assert_eq!(config.listen_addr(&rules).unwrap(), "127.0.0.1:1080");
    }
}
