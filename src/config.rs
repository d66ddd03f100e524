use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

use crate::error::{DispatchError, Result};
use crate::rule::RuleEngine;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub dns: DnsConfig,
    /// Country code -> CIDR blocks.
    #[serde(default)]
    pub geoip: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub proxies: Vec<Proxy>,
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroup>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub http_modify: Vec<HttpModify>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct General {
    pub socks_interface: String,
    pub socks_port: u16,
    pub http_interface: String,
    pub http_port: u16,
    /// Address of the admin API; disabled when absent.
    pub controller: Option<String>,
    pub set_as_system_proxy: SystemProxyMode,
    /// Seconds.
    pub connect_timeout: u64,
    pub idle_timeout: u64,
    pub drain_timeout: u64,
    pub log_level: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            socks_interface: "127.0.0.1".into(),
            socks_port: 7891,
            http_interface: "127.0.0.1".into(),
            http_port: 7890,
            controller: None,
            set_as_system_proxy: SystemProxyMode::Auto,
            connect_timeout: 10,
            idle_timeout: 60,
            drain_timeout: 5,
            log_level: None,
        }
    }
}

impl General {
    pub fn socks_addr(&self) -> String {
        join_host_port(&self.socks_interface, self.socks_port)
    }

    pub fn http_addr(&self) -> String {
        join_host_port(&self.http_interface, self.http_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemProxyMode {
    /// Enable on start and reload, disable on shutdown.
    #[default]
    Auto,
    /// Leave the OS settings alone.
    Manual,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Proxy {
    #[serde(rename = "direct")]
    Direct { name: String },
    #[serde(rename = "socks5")]
    Socks5 {
        name: String,
        server: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename = "http")]
    Http {
        name: String,
        server: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename = "ss", alias = "shadowsocks")]
    Shadowsocks {
        name: String,
        server: String,
        port: u16,
        cipher: String,
        password: String,
    },
}

impl Proxy {
    pub fn name(&self) -> &str {
        match self {
            Self::Direct { name }
            | Self::Socks5 { name, .. }
            | Self::Http { name, .. }
            | Self::Shadowsocks { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum GroupType {
    #[serde(rename = "select")]
    Select,
    #[serde(rename = "fallback")]
    Fallback,
    #[serde(rename = "url-test")]
    UrlTest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub proxies: Vec<String>,
    /// Probe URL for `url-test` and `fallback`.
    #[serde(default)]
    pub url: Option<String>,
    /// Probe interval in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub max_failed_times: Option<u32>,
    /// Seconds before a dead member is probed again.
    #[serde(default)]
    pub cooldown: Option<u64>,
    /// Probe timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MitmConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpModify {
    /// Host pattern, `*.` prefix for subdomains.
    pub host: String,
    #[serde(default)]
    pub request_headers: HeaderEdits,
    #[serde(default)]
    pub response_headers: HeaderEdits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderEdits {
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DispatchError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&content)?;
        info!(
            "[Config] loaded {}: {} proxies, {} groups, {} rules",
            path.display(),
            config.proxies.len(),
            config.proxy_groups.len(),
            config.rules.len()
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| DispatchError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Cipher names are checked when the snapshot is built,
    /// against the cipher registry in use.
    pub fn validate(&self) -> Result<()> {
        let mut nodes = HashSet::new();
        for proxy in &self.proxies {
            let name = proxy.name();
            if name == DIRECT || name == REJECT {
                return Err(DispatchError::config(format!("proxy name {name} is reserved")));
            }
            if !nodes.insert(name) {
                return Err(DispatchError::config(format!("duplicate proxy {name}")));
            }
        }

        let mut groups = HashSet::new();
        for group in &self.proxy_groups {
            let name = group.name.as_str();
            if name == DIRECT || name == REJECT || nodes.contains(name) {
                return Err(DispatchError::config(format!("group name {name} clashes")));
            }
            if !groups.insert(name) {
                return Err(DispatchError::config(format!("duplicate group {name}")));
            }
            if group.proxies.is_empty() {
                return Err(DispatchError::config(format!("group {name} has no members")));
            }
            for member in &group.proxies {
                if member != DIRECT && !nodes.contains(member.as_str()) {
                    return Err(DispatchError::config(format!(
                        "group {name} references unknown proxy {member}"
                    )));
                }
            }
            if group.group_type == GroupType::UrlTest && group.url.is_none() {
                return Err(DispatchError::config(format!("url-test group {name} needs a url")));
            }
        }

        let rules = RuleEngine::parse(&self.rules)?;
        for rule in rules.rules() {
            let policy = rule.policy();
            if policy != DIRECT && policy != REJECT && !groups.contains(policy) {
                return Err(DispatchError::config(format!(
                    "rule {rule} names unknown policy {policy}"
                )));
            }
        }
        Ok(())
    }
}

/// Where configuration comes from on startup and on every reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config>;
}

#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<Config> {
        Config::load(&self.path)
    }
}
