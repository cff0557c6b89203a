use std::{fs, path::PathBuf, time::Duration};

use gantry_net::{
    endpoint::{Endpoint, Family, Kind},
    framing::FramingMode,
};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::control::DEFAULT_MANAGER_SOCKET;

pub const DEFAULT_MAX_PACKET_LEN: usize = 1024 * 1024;
pub const DEFAULT_HIGH_WATER: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Whole-process configuration, loaded from a JSON file by the binaries.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub core: CoreConfig,
    pub servers: Vec<ServerSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub app_name: String,
    /// Worker thread count; 0 picks the machine's parallelism.
    pub workers: usize,
    /// When set, binaries log to `<log_dir>/<app_name>.log` with reopen
    /// support; otherwise stderr.
    pub log_dir: Option<PathBuf>,
    pub hex_dump_input: bool,
    pub hex_dump_output: bool,
    /// Manager control socket; servers dial it unless started independent.
    pub manager_socket: PathBuf,
    #[serde(deserialize_with = "de_duration")]
    pub tick: Duration,
    /// Reaper stride: every connection is examined once per this interval,
    /// spread across ticks.
    #[serde(deserialize_with = "de_duration")]
    pub heartbeat_stride: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub drain_deadline: Duration,
    /// Outbound buffer high-water mark, bytes.
    pub outbound_high_water: usize,
    /// Kernel SO_SNDBUF/SO_RCVBUF for framework-owned sockets, bytes.
    /// Absent = kernel defaults.
    pub socket_buf_size: Option<usize>,
    pub script: ScriptConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "gantry".to_owned(),
            workers: 0,
            log_dir: None,
            hex_dump_input: false,
            hex_dump_output: false,
            manager_socket: PathBuf::from(DEFAULT_MANAGER_SOCKET),
            tick: Duration::from_secs(1),
            heartbeat_stride: Duration::from_secs(60),
            drain_deadline: Duration::from_secs(5),
            outbound_high_water: DEFAULT_HIGH_WATER,
            socket_buf_size: None,
            script: ScriptConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptConfig {
    /// Which host implementation the binary wires in. Embedders register
    /// their own engines; `echo` and `null` ship built-in.
    pub engine: String,
    /// Engine-specific entry point (e.g. a script path). Opaque to the core.
    pub identifier: Option<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { engine: "null".to_owned(), identifier: None }
    }
}

/// What a handler overflow (outbound buffer past high water) does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Refuse the append; the handler's reply is dropped and counted.
    #[default]
    Drop,
    /// Close the connection.
    Close,
}

/// One listener declaration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSpec {
    pub name: String,
    /// Host, bracketed v6 literal, DNS name, absolute path for local family,
    /// or empty for wildcard.
    pub host: String,
    pub port: u16,
    pub family: Family,
    pub kind: Kind,
    pub framing: FramingMode,
    /// Idle cutoff; absent or zero disables the reaper for this listener.
    #[serde(deserialize_with = "de_opt_duration")]
    pub heartbeat_ttl: Option<Duration>,
    /// Admission cap; 0 = unlimited.
    pub max_clients: usize,
    pub max_packet_len: usize,
    pub overflow: OverflowPolicy,
    pub on_connect: Option<String>,
    pub on_close: Option<String>,
    pub on_data: Option<String>,
    pub on_error: Option<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 0,
            family: Family::Any,
            kind: Kind::Stream,
            framing: FramingMode::Packet,
            heartbeat_ttl: None,
            max_clients: 0,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            overflow: OverflowPolicy::Drop,
            on_connect: None,
            on_close: None,
            on_data: None,
            on_error: None,
        }
    }
}

impl ServerSpec {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port, self.family, self.kind)
    }

    /// Datagram sockets always deliver one message per datagram, whatever
    /// the declared framing.
    pub fn effective_framing(&self) -> FramingMode {
        if self.kind == Kind::Datagram { FramingMode::Datagram } else { self.framing }
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw =
            fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for spec in &self.servers {
            if spec.name.is_empty() {
                return Err(ConfigError::Invalid("server with empty name".to_owned()));
            }
            if !names.insert(&spec.name) {
                return Err(ConfigError::Invalid(format!("duplicate server name {:?}", spec.name)));
            }
            if spec.max_packet_len < gantry_net::framing::HEADER_SIZE {
                return Err(ConfigError::Invalid(format!(
                    "server {:?}: max_packet_len below frame header size",
                    spec.name
                )));
            }
            if spec.family == Family::Local && !spec.host.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "server {:?}: local family needs an absolute path host",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Worker count after resolving the `0 = auto` default.
    pub fn worker_count(&self) -> usize {
        if self.core.workers > 0 {
            return self.core.workers;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    match raw {
        None => Ok(None),
        Some(s) => {
            let parsed = humantime::parse_duration(&s).map_err(serde::de::Error::custom)?;
            Ok((!parsed.is_zero()).then_some(parsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "core": { "app_name": "demo", "workers": 2, "tick": "500ms" },
                "servers": [
                    { "name": "game", "port": 40000, "heartbeat_ttl": "60s", "on_data": "handle" }
                ]
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.core.app_name, "demo");
        assert_eq!(config.core.tick, Duration::from_millis(500));
        assert_eq!(config.core.heartbeat_stride, Duration::from_secs(60));

        let spec = &config.servers[0];
        assert_eq!(spec.framing, FramingMode::Packet);
        assert_eq!(spec.heartbeat_ttl, Some(Duration::from_secs(60)));
        assert_eq!(spec.max_packet_len, DEFAULT_MAX_PACKET_LEN);
        assert_eq!(spec.endpoint().to_string(), "tcp://*:40000");
    }

    #[test]
    fn zero_ttl_means_disabled() {
        let spec: ServerSpec =
            serde_json::from_str(r#"{ "name": "x", "heartbeat_ttl": "0s" }"#).unwrap();
        assert_eq!(spec.heartbeat_ttl, None);
    }

    #[test]
    fn datagram_kind_forces_datagram_framing() {
        let spec: ServerSpec =
            serde_json::from_str(r#"{ "name": "x", "kind": "datagram", "framing": "packet" }"#)
                .unwrap();
        assert_eq!(spec.effective_framing(), FramingMode::Datagram);
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "servers": [ { "name": "a", "port": 1 }, { "name": "a", "port": 2 } ] }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn local_family_requires_absolute_path() {
        let config: Config = serde_json::from_str(
            r#"{ "servers": [ { "name": "ctl", "family": "local", "host": "run/x.sock" } ] }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
