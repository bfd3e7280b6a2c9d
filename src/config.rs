//! Proxy configuration: a JSON document enumerating apps, their listening
//! ports, and their backend targets.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::ProxyError;

/// Top-level configuration document
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(rename = "Apps", default)]
    pub apps: Vec<AppConfig>,
}

/// One named service: the ports it listens on and the targets it forwards to
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Ports", default)]
    pub ports: Vec<u16>,
    #[serde(rename = "Targets", default)]
    pub targets: Vec<String>,
}

impl Config {
    /// Read and parse the configuration file, then validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the structural invariants: non-empty names, valid ports that
    /// are unique across the whole document, and targets that parse as
    /// host:port.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.apps.is_empty() {
            return Err(ProxyError::Config("no apps configured".to_string()));
        }

        let mut port_owners: HashMap<u16, &str> = HashMap::new();
        for app in &self.apps {
            if app.name.is_empty() {
                return Err(ProxyError::Config("app with empty name".to_string()));
            }
            if app.ports.is_empty() {
                return Err(ProxyError::Config(format!(
                    "app {} has no ports",
                    app.name
                )));
            }
            if app.targets.is_empty() {
                return Err(ProxyError::Config(format!(
                    "app {} has no targets",
                    app.name
                )));
            }
            for &port in &app.ports {
                if port == 0 {
                    return Err(ProxyError::Config(format!(
                        "app {} has invalid port 0",
                        app.name
                    )));
                }
                if let Some(owner) = port_owners.insert(port, &app.name) {
                    return Err(ProxyError::Config(format!(
                        "port {} configured for both {} and {}",
                        port, owner, app.name
                    )));
                }
            }
            for target in &app.targets {
                split_host_port(target)?;
            }
        }
        Ok(())
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts. Purely syntactic;
/// hostname resolution happens at dial time.
pub(crate) fn split_host_port(target: &str) -> Result<(&str, u16), ProxyError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidTarget(target.to_string()))?;
    if host.is_empty() {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(target.to_string()))?;
    if port == 0 {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    }
    Ok((host, port))
}
