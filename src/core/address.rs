// src/core/address.rs

//! Connection parameters for a Postgres-wire server.
//!
//! An `Address` is a plain map of parameter names to string values. Only a handful
//! of keys are interpreted by the pool itself (host, port, credentials, TLS mode,
//! connect timeout); everything else is forwarded to the server in the startup packet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::warn;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";

/// Keys consumed by the client and never sent to the server as startup parameters.
const CLIENT_ONLY_KEYS: &[&str] = &[
    "host",
    "hostaddr",
    "port",
    "password",
    "sslmode",
    "connect_timeout",
];

/// How the client negotiates TLS with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SslMode {
    /// Never send an SSLRequest.
    Disable,
    /// Try TLS, fall back to plaintext if the server declines.
    #[default]
    Prefer,
    /// Fail the handshake if the server declines TLS.
    Require,
}

/// An unordered set of connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    params: BTreeMap<String, String>,
}

impl Address {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variant of `set`.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a parameter, replacing any previous value for the same key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.params.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(&key.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Splits the parameters into parallel key and value arrays.
    pub fn to_parameter_arrays(&self) -> (Vec<String>, Vec<String>) {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .unzip()
    }

    /// The host to connect to. `hostaddr` wins over `host` when both are present.
    pub fn host(&self) -> &str {
        self.get("hostaddr")
            .or_else(|| self.get("host"))
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
    }

    /// The name used for TLS server verification.
    pub fn server_name(&self) -> &str {
        self.get("host")
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.host())
    }

    pub fn port(&self) -> u16 {
        match self.get("port") {
            Some(p) => p.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid port '{}', using {}", p, DEFAULT_PORT);
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        }
    }

    pub fn user(&self) -> &str {
        self.get("user")
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_USER)
    }

    pub fn password(&self) -> Option<&str> {
        self.get("password")
    }

    /// The database name, defaulting to the user name as the server does.
    pub fn dbname(&self) -> &str {
        self.get("dbname")
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.user())
    }

    pub fn ssl_mode(&self) -> SslMode {
        match self.get("sslmode") {
            Some(mode) => SslMode::from_str(mode).unwrap_or_else(|_| {
                warn!("Unsupported sslmode '{}', falling back to 'prefer'", mode);
                SslMode::Prefer
            }),
            None => SslMode::default(),
        }
    }

    /// The per-connection handshake timeout, if one was configured. `0` means no timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        let secs: u64 = self.get("connect_timeout")?.trim().parse().ok()?;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// The `host:port` string used to open the socket.
    pub fn socket_addr(&self) -> String {
        let host = self.host();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port())
        } else {
            format!("{host}:{}", self.port())
        }
    }

    /// Parameters forwarded to the server in the startup packet.
    pub fn startup_parameters(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("user".to_string(), self.user().to_string()),
            ("database".to_string(), self.dbname().to_string()),
        ];
        for (key, value) in &self.params {
            if CLIENT_ONLY_KEYS.contains(&key.as_str()) || key == "user" || key == "dbname" {
                continue;
            }
            out.push((key.clone(), value.clone()));
        }
        out
    }

    /// Parses either a `postgres://` URI or a `key=value` connection string.
    ///
    /// Parsing never fails outright: malformed pieces are skipped, logged, and returned
    /// alongside whatever keys could be recovered.
    pub fn parse(input: &str) -> (Self, Vec<String>) {
        let trimmed = input.trim();
        let (address, problems) =
            if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
                Self::parse_uri(trimmed)
            } else {
                Self::parse_conninfo(trimmed)
            };
        for problem in &problems {
            warn!("Connection string: {}", problem);
        }
        (address, problems)
    }

    fn parse_uri(input: &str) -> (Self, Vec<String>) {
        let mut address = Address::new();
        let mut problems = Vec::new();

        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(e) => {
                problems.push(format!("malformed URI: {e}"));
                return (address, problems);
            }
        };

        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            address.set("host", host.trim_start_matches('[').trim_end_matches(']'));
        }
        if let Some(port) = url.port() {
            address.set("port", port.to_string());
        }
        if !url.username().is_empty() {
            address.set("user", decode_component(url.username(), &mut problems));
        }
        if let Some(password) = url.password() {
            address.set("password", decode_component(password, &mut problems));
        }
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            address.set("dbname", decode_component(path, &mut problems));
        }
        for (key, value) in url.query_pairs() {
            if key.is_empty() {
                problems.push(format!("query parameter with empty name (value '{value}')"));
                continue;
            }
            address.set(&key, value.into_owned());
        }

        (address, problems)
    }

    fn parse_conninfo(input: &str) -> (Self, Vec<String>) {
        let mut address = Address::new();
        let mut problems = Vec::new();
        let mut chars = input.chars().peekable();

        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.next_if_eq(&'=').is_none() {
                problems.push(format!("missing '=' after '{key}'"));
                continue;
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '\'' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    problems.push(format!("unterminated quoted value for '{key}'"));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }

            if key.is_empty() {
                problems.push(format!("value '{value}' has no parameter name"));
                continue;
            }
            address.set(&key, value);
        }

        (address, problems)
    }
}

fn decode_component(raw: &str, problems: &mut Vec<String>) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(decoded) = decoded {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| {
        problems.push(format!("'{raw}' is not valid UTF-8 after percent-decoding"));
        raw.to_string()
    })
}

impl fmt::Display for Address {
    /// Renders the address as a conninfo string with the password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if key == "password" {
                write!(f, "{key}=********")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
