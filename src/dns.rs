//! DNS and GeoIP collaborators consulted by IP-based rules.
//!
//! Only the lookup contracts belong to the engine; the implementations here are
//! the simple ones the binary ships with (system resolver with a static hosts
//! table, and a CIDR-to-country table taken from the config).

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use log::debug;

use crate::config::Config;
use crate::error::{DispatchError, Result};

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;
}

pub trait GeoIp: Send + Sync {
    /// ISO country code, upper-case.
    fn country_of(&self, ip: IpAddr) -> Option<String>;
}

/// `tokio::net::lookup_host` behind a static hosts table.
#[derive(Debug, Default)]
pub struct SystemResolver {
    hosts: HashMap<String, IpAddr>,
}

impl SystemResolver {
    pub fn new(hosts: HashMap<String, IpAddr>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|(name, ip)| (name.to_ascii_lowercase(), ip))
            .collect();
        Self { hosts }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.dns.hosts.clone())
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if let Some(ip) = self.hosts.get(host) {
            return Ok(*ip);
        }
        let mut addrs = tokio::net::lookup_host((host, 0)).await?;
        let addr = addrs.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        })?;
        debug!("[DNS] {} -> {}", host, addr.ip());
        Ok(addr.ip())
    }
}

/// Country lookup over a list of CIDR blocks. The most specific block wins.
#[derive(Debug, Default)]
pub struct CidrGeoIp {
    entries: Vec<(IpNet, String)>,
}

impl CidrGeoIp {
    pub fn new(table: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = Vec::new();
        for (country, blocks) in table {
            for block in blocks {
                let net: IpNet = block.parse().map_err(|e| {
                    DispatchError::config(format!("geoip {country}: bad CIDR {block:?}: {e}"))
                })?;
                entries.push((net, country.to_ascii_uppercase()));
            }
        }
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(Self { entries })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.geoip)
    }
}

impl GeoIp for CidrGeoIp {
    fn country_of(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, country)| country.clone())
    }
}
