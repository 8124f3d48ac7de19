//! Daemon settings.
//!
//! The recognised keys keep their historical dotted spellings and live in a
//! `[properties]` table of the TOML config file (dotted keys must be quoted).
//! An optional `[coordinator]` table seeds the in-memory primary registry
//! for deployments without an external coordination service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use twinfs_types::HostPort;

use crate::{DataNodeError, Result};

/// How storage recovery should treat the on-disk state at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupOption {
    #[default]
    Regular,
    Rollback,
}

impl StartupOption {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGULAR" => Ok(StartupOption::Regular),
            "ROLLBACK" => Ok(StartupOption::Rollback),
            other => Err(DataNodeError::Config(format!(
                "unknown startup option: {other}"
            ))),
        }
    }
}

/// Addresses of one namespace's metadata-server pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Stable label from configuration; `None` for a single unnamed namespace.
    pub nameservice_id: Option<String>,
    /// Data-protocol addresses of peer 0 and peer 1.
    pub data_addr: [HostPort; 2],
    /// Admin-protocol addresses of peer 0 and peer 1.
    pub admin_addr: [HostPort; 2],
    /// The address this namespace is registered under in the coordination
    /// service.
    pub default_addr: HostPort,
}

/// Parsed daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `host:port` this node serves block transfers on; becomes the
    /// registration name.
    pub node_name: String,
    pub info_port: u16,
    pub ipc_port: u16,
    pub namespaces: Vec<NamespaceConfig>,
    pub data_dirs: Vec<PathBuf>,
    pub simulated_storage: bool,
    pub startup: StartupOption,
    /// Seed entries for the in-memory coordinator: (default_addr, primary).
    pub coordinator_seed: Vec<(HostPort, HostPort)>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    properties: BTreeMap<String, toml::Value>,
    #[serde(default)]
    coordinator: BTreeMap<String, String>,
}

impl Settings {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DataNodeError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| DataNodeError::Config(format!("config parse error: {e}")))?;
        let props: BTreeMap<String, String> = raw
            .properties
            .into_iter()
            .map(|(k, v)| (k, toml_value_to_string(v)))
            .collect();
        let mut settings = Self::from_properties(&props)?;
        for (default_addr, primary) in raw.coordinator {
            settings
                .coordinator_seed
                .push((parse_addr(&default_addr)?, parse_addr(&primary)?));
        }
        Ok(settings)
    }

    /// Build settings from the flat key set.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let default_name = props.get("fs.default.name");
        let admin_port = props
            .get("dfs.avatarnode.port")
            .map(|s| {
                s.parse::<u16>()
                    .map_err(|_| DataNodeError::Config(format!("bad dfs.avatarnode.port: {s}")))
            })
            .transpose()?;

        // Nameservice list; absence means a single unnamed namespace.
        let service_ids: Vec<Option<String>> = match props.get("dfs.nameservices") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| Some(s.to_string()))
                .collect(),
            None => vec![None],
        };

        let mut namespaces = Vec::with_capacity(service_ids.len());
        for service_id in &service_ids {
            let key = |suffix: &str| match service_id {
                Some(id) => format!("dfs.namenode.rpc-address.{id}{suffix}"),
                None => format!("dfs.namenode.rpc-address{suffix}"),
            };
            let data0 = lookup_addr(props, &key(".0"))?;
            let data1 = lookup_addr(props, &key(".1"))?;
            let (data0, data1) = match (data0, data1) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(DataNodeError::Config(format!(
                        "namespace {}: both {} and {} must be set",
                        service_id.as_deref().unwrap_or("<default>"),
                        key(".0"),
                        key(".1"),
                    )))
                }
            };
            // The unsuffixed per-namespace address, falling back to the
            // filesystem default address.
            let default_addr = match lookup_addr(props, &key(""))? {
                Some(a) => a,
                None => match default_name {
                    Some(s) => parse_addr(s)?,
                    None => {
                        return Err(DataNodeError::Config(format!(
                            "namespace {}: no default address ({} or fs.default.name)",
                            service_id.as_deref().unwrap_or("<default>"),
                            key(""),
                        )))
                    }
                },
            };

            let admin_of = |data: &HostPort| match admin_port {
                Some(p) => data.with_port(p),
                None => data.with_port(data.port() + 1),
            };
            namespaces.push(NamespaceConfig {
                nameservice_id: service_id.clone(),
                admin_addr: [admin_of(&data0), admin_of(&data1)],
                data_addr: [data0, data1],
                default_addr,
            });
        }

        let data_dirs: Vec<PathBuf> = props
            .get("dfs.data.dir")
            .map(|list| {
                list.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let simulated_storage = props
            .get("dfs.datanode.simulateddatastorage")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let startup = props
            .get("dfs.datanode.startup")
            .map(|s| StartupOption::parse(s))
            .transpose()?
            .unwrap_or_default();

        let node_name = props
            .get("dfs.datanode.address")
            .cloned()
            .unwrap_or_else(|| "localhost:50010".to_string());
        let info_port = lookup_port(props, "dfs.datanode.info.port", 50075)?;
        let ipc_port = lookup_port(props, "dfs.datanode.ipc.port", 50020)?;

        Ok(Settings {
            node_name,
            info_port,
            ipc_port,
            namespaces,
            data_dirs,
            simulated_storage,
            startup,
            coordinator_seed: Vec::new(),
        })
    }
}

fn toml_value_to_string(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn parse_addr(s: &str) -> Result<HostPort> {
    s.parse()
        .map_err(|e| DataNodeError::Config(format!("bad address {s:?}: {e}")))
}

fn lookup_addr(props: &BTreeMap<String, String>, key: &str) -> Result<Option<HostPort>> {
    props.get(key).map(|s| parse_addr(s)).transpose()
}

fn lookup_port(props: &BTreeMap<String, String>, key: &str, default: u16) -> Result<u16> {
    props
        .get(key)
        .map(|s| {
            s.parse::<u16>()
                .map_err(|_| DataNodeError::Config(format!("bad {key}: {s}")))
        })
        .transpose()
        .map(|p| p.unwrap_or(default))
}
