//! Configuration parsing and validation.
//!
//! Options are constructed programmatically, deserialized via serde, or
//! parsed from the compact option-string form
//! `"host:port[,host:port...][,option=value...]"`. Option names in the
//! string form are matched case-insensitively against the canonical
//! camelCase names.

use crate::core::error::{BraidError, BraidResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which RESP protocol to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolChoice {
    /// Force RESP2: never issue `HELLO`.
    Resp2,
    /// Force RESP3: a failed `HELLO 3` is a handshake failure.
    Resp3,
    /// Try `HELLO 3`, fall back to RESP2 on `-ERR unknown command`.
    #[default]
    Auto,
}

/// Admission policy for messages submitted while a bridge is not yet
/// established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BacklogPolicy {
    /// Admit up to the backlog capacity, then reject.
    #[default]
    Default,
    /// Reject immediately while disconnected.
    FailFast,
}

/// Minimum TLS version accepted for `ssl=true` endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersionMin {
    /// TLS 1.2 or newer.
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// Delay schedule for bridge reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The same delay every attempt.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Delay grows linearly with the attempt number.
    Linear {
        /// Per-attempt increment in milliseconds.
        increment_ms: u64,
        /// Upper bound in milliseconds.
        max_ms: u64,
    },
    /// Delay doubles each attempt, capped.
    Exponential {
        /// First-attempt delay in milliseconds.
        base_ms: u64,
        /// Upper bound in milliseconds.
        max_ms: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 250,
            max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given reconnect attempt (0-based), with ±20% jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_ms = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear {
                increment_ms,
                max_ms,
            } => increment_ms
                .saturating_mul(u64::from(attempt) + 1)
                .min(max_ms),
            Self::Exponential { base_ms, max_ms } => base_ms
                .saturating_mul(1u64.checked_shl(attempt.min(24)).unwrap_or(u64::MAX))
                .min(max_ms),
        };
        let jitter = base_ms / 5;
        let ms = if jitter > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter * 2);
            base_ms - jitter + offset
        } else {
            base_ms
        };
        Duration::from_millis(ms)
    }
}

/// Client configuration.
///
/// Field defaults match the canonical option-string defaults; see each field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Server endpoints as `host:port` strings. At least one is required.
    pub endpoints: Vec<String>,

    /// RESP protocol selection.
    pub protocol: ProtocolChoice,

    /// ACL username for `AUTH`/`HELLO AUTH`.
    pub user: Option<String>,

    /// Password for `AUTH`/`HELLO AUTH`.
    pub password: Option<String>,

    /// Connection name sent via `CLIENT SETNAME` / `HELLO SETNAME`.
    pub client_name: Option<String>,

    /// Database selected after handshake (0..15).
    pub default_database: u32,

    /// Fail `connect` if no endpoint is reachable, instead of retrying in
    /// the background.
    pub abort_connect: bool,

    /// Permit admin commands through this multiplexer.
    pub allow_admin: bool,

    /// Socket establishment timeout, milliseconds.
    pub connect_timeout: u64,

    /// Synchronous-path timeout (heartbeat overdue threshold), milliseconds.
    pub sync_timeout: u64,

    /// Default await timeout for executed operations, milliseconds.
    pub async_timeout: u64,

    /// TCP keep-alive, seconds. Zero disables.
    pub keep_alive: u64,

    /// Use TLS for all endpoints.
    pub ssl: bool,

    /// Host name for certificate validation when it differs from the
    /// endpoint address.
    pub ssl_host: Option<String>,

    /// Minimum accepted TLS version.
    pub ssl_protocols: TlsVersionMin,

    /// PEM file with additional trust anchors (private CAs).
    pub ssl_ca_file: Option<String>,

    /// Check certificate revocation during the TLS handshake.
    pub check_certificate_revocation: bool,

    /// Key written and read to disambiguate competing primaries.
    pub tiebreaker: String,

    /// Channel broadcasting primary changes; subscribing to it nudges
    /// reconfiguration.
    pub config_channel: String,

    /// Sentinel master name; presence enables sentinel topology handling.
    pub service_name: Option<String>,

    /// Bound on redirect/connect retries per message.
    pub connect_retry: u32,

    /// Reconnect delay schedule.
    pub reconnect_retry_policy: RetryPolicy,

    /// Backlog admission policy while disconnected.
    pub backlog_policy: BacklogPolicy,

    /// Render counters and endpoint strings in error text.
    pub include_detail_in_exceptions: bool,

    /// Heartbeat interval, milliseconds.
    pub heartbeat_interval: u64,

    /// Scheduled reconfiguration interval, seconds. Zero disables.
    pub config_check_seconds: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            protocol: ProtocolChoice::default(),
            user: None,
            password: None,
            client_name: None,
            default_database: 0,
            abort_connect: true,
            allow_admin: false,
            connect_timeout: 5_000,
            sync_timeout: 5_000,
            async_timeout: 5_000,
            keep_alive: 60,
            ssl: false,
            ssl_host: None,
            ssl_protocols: TlsVersionMin::default(),
            ssl_ca_file: None,
            check_certificate_revocation: true,
            tiebreaker: "__Booksleeve_TieBreak".to_string(),
            config_channel: "__Booksleeve_MasterChanged".to_string(),
            service_name: None,
            connect_retry: 3,
            reconnect_retry_policy: RetryPolicy::default(),
            backlog_policy: BacklogPolicy::default(),
            include_detail_in_exceptions: true,
            heartbeat_interval: 1_000,
            config_check_seconds: 60,
        }
    }
}

impl Options {
    /// Build options for a single endpoint with defaults everywhere else.
    pub fn single(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Self::default()
        }
    }

    /// Parse the compact option-string form.
    ///
    /// Comma-separated entries without `=` are endpoints; entries with `=`
    /// are options. Unknown option names are configuration errors.
    pub fn parse(spec: &str) -> BraidResult<Self> {
        let mut options = Self::default();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                None => options.endpoints.push(entry.to_string()),
                Some((name, value)) => options.apply(name.trim(), value.trim())?,
            }
        }
        options.validate()?;
        Ok(options)
    }

    fn apply(&mut self, name: &str, value: &str) -> BraidResult<()> {
        let bad = |what: &str| {
            BraidError::configuration(format!("invalid value '{}' for option '{}'", what, name))
        };
        match name.to_ascii_lowercase().as_str() {
            "protocol" => {
                self.protocol = match value.to_ascii_lowercase().as_str() {
                    "resp2" | "2" => ProtocolChoice::Resp2,
                    "resp3" | "3" => ProtocolChoice::Resp3,
                    "auto" => ProtocolChoice::Auto,
                    _ => return Err(bad(value)),
                }
            }
            "user" => self.user = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "clientname" => self.client_name = Some(value.to_string()),
            "defaultdatabase" => {
                self.default_database = value.parse().map_err(|_| bad(value))?;
            }
            "abortconnect" => self.abort_connect = parse_bool(value).ok_or_else(|| bad(value))?,
            "allowadmin" => self.allow_admin = parse_bool(value).ok_or_else(|| bad(value))?,
            "connecttimeout" => self.connect_timeout = value.parse().map_err(|_| bad(value))?,
            "synctimeout" => self.sync_timeout = value.parse().map_err(|_| bad(value))?,
            "asynctimeout" => self.async_timeout = value.parse().map_err(|_| bad(value))?,
            "keepalive" => self.keep_alive = value.parse().map_err(|_| bad(value))?,
            "ssl" => self.ssl = parse_bool(value).ok_or_else(|| bad(value))?,
            "sslhost" => self.ssl_host = Some(value.to_string()),
            "sslprotocols" => {
                self.ssl_protocols = match value.to_ascii_lowercase().as_str() {
                    "tls12" | "tls1.2" => TlsVersionMin::Tls12,
                    "tls13" | "tls1.3" => TlsVersionMin::Tls13,
                    _ => return Err(bad(value)),
                }
            }
            "sslcafile" => self.ssl_ca_file = Some(value.to_string()),
            "checkcertificaterevocation" => {
                self.check_certificate_revocation = parse_bool(value).ok_or_else(|| bad(value))?
            }
            "tiebreaker" => self.tiebreaker = value.to_string(),
            "configchannel" => self.config_channel = value.to_string(),
            "servicename" => self.service_name = Some(value.to_string()),
            "connectretry" => self.connect_retry = value.parse().map_err(|_| bad(value))?,
            "reconnectretrypolicy" => {
                self.reconnect_retry_policy = match value.to_ascii_lowercase().as_str() {
                    "linear" => RetryPolicy::Linear {
                        increment_ms: 250,
                        max_ms: 10_000,
                    },
                    "exponential" => RetryPolicy::default(),
                    "fixed" => RetryPolicy::Fixed { delay_ms: 1_000 },
                    _ => return Err(bad(value)),
                }
            }
            "backlogpolicy" => {
                self.backlog_policy = match value.to_ascii_lowercase().as_str() {
                    "default" => BacklogPolicy::Default,
                    "failfast" => BacklogPolicy::FailFast,
                    _ => return Err(bad(value)),
                }
            }
            "includedetailinexceptions" => {
                self.include_detail_in_exceptions = parse_bool(value).ok_or_else(|| bad(value))?
            }
            "heartbeatinterval" => {
                self.heartbeat_interval = value.parse().map_err(|_| bad(value))?
            }
            "configcheckseconds" => {
                self.config_check_seconds = value.parse().map_err(|_| bad(value))?
            }
            _ => {
                return Err(BraidError::configuration(format!(
                    "unknown option '{}'",
                    name
                )))
            }
        }
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> BraidResult<()> {
        if self.endpoints.is_empty() {
            return Err(BraidError::configuration("at least one endpoint required"));
        }
        for endpoint in &self.endpoints {
            let (host, port) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| {
                    BraidError::configuration(format!(
                        "endpoint '{}' is not host:port",
                        endpoint
                    ))
                })?;
            if host.is_empty() {
                return Err(BraidError::configuration(format!(
                    "endpoint '{}' has an empty host",
                    endpoint
                )));
            }
            port.parse::<u16>().map_err(|_| {
                BraidError::configuration(format!("endpoint '{}' has a bad port", endpoint))
            })?;
        }
        if self.default_database > 15 {
            return Err(BraidError::configuration(format!(
                "defaultDatabase {} out of range 0..15",
                self.default_database
            )));
        }
        if self.user.is_some() && self.password.is_none() {
            return Err(BraidError::configuration(
                "user requires a password to be set",
            ));
        }
        if self.heartbeat_interval == 0 {
            return Err(BraidError::configuration(
                "heartbeatInterval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Socket establishment timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Heartbeat-overdue threshold.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout)
    }

    /// Default operation await timeout.
    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// TCP keep-alive period, if enabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoints_and_options() {
        let options = Options::parse(
            "10.0.0.1:6379,10.0.0.2:6380,password=hunter2,defaultDatabase=2,ssl=true,protocol=Resp3",
        )
        .unwrap();
        assert_eq!(options.endpoints.len(), 2);
        assert_eq!(options.password.as_deref(), Some("hunter2"));
        assert_eq!(options.default_database, 2);
        assert!(options.ssl);
        assert_eq!(options.protocol, ProtocolChoice::Resp3);
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let options =
            Options::parse("localhost:6379,AbortConnect=false,SYNCTIMEOUT=250").unwrap();
        assert!(!options.abort_connect);
        assert_eq!(options.sync_timeout, 250);
    }

    #[test]
    fn unknown_option_rejected() {
        let err = Options::parse("localhost:6379,frobnicate=1").unwrap_err();
        assert!(matches!(err, BraidError::Configuration { .. }));
    }

    #[test]
    fn missing_endpoint_rejected() {
        assert!(Options::parse("password=x").is_err());
    }

    #[test]
    fn bad_endpoint_rejected() {
        assert!(Options::parse("localhost").is_err());
        assert!(Options::parse("localhost:notaport").is_err());
        assert!(Options::parse(":6379").is_err());
    }

    #[test]
    fn database_range_enforced() {
        assert!(Options::parse("localhost:6379,defaultDatabase=16").is_err());
        assert!(Options::parse("localhost:6379,defaultDatabase=15").is_ok());
    }

    #[test]
    fn defaults_match_contract() {
        let options = Options::single("localhost:6379");
        assert_eq!(options.tiebreaker, "__Booksleeve_TieBreak");
        assert_eq!(options.config_channel, "__Booksleeve_MasterChanged");
        assert_eq!(options.heartbeat_interval, 1_000);
        assert_eq!(options.config_check_seconds, 60);
        assert_eq!(options.connect_retry, 3);
    }

    #[test]
    fn retry_policy_delays() {
        let policy = RetryPolicy::Exponential {
            base_ms: 100,
            max_ms: 1_000,
        };
        for attempt in 0..10 {
            let delay = policy.next_delay(attempt).as_millis() as u64;
            assert!(delay <= 1_200, "attempt {} gave {}ms", attempt, delay);
        }
        let fixed = RetryPolicy::Fixed { delay_ms: 500 };
        let delay = fixed.next_delay(3).as_millis() as u64;
        assert!((400..=600).contains(&delay));
    }
}
