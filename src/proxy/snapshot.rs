//! Immutable routing state. A snapshot is built from one config and shared by
//! every session dispatched while it was current.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DIRECT, General, REJECT};
use crate::dns::{CidrGeoIp, DnsResolver, GeoIp, SystemResolver};
use crate::error::{DispatchError, Result};
use crate::proxy::cipher::CipherRegistry;
use crate::proxy::mitm::{MitmPolicy, RewriteRules};
use crate::proxy::outbound::{NodeRef, Protocol};
use crate::proxy::probe::spawn_prober;
use crate::proxy::proxy_group::{Selector, SelectorOptions, Strategy};
use crate::rule::RuleEngine;

/// What a rule's policy name resolves to.
#[derive(Clone)]
pub enum Policy {
    Direct,
    Reject,
    Group(Arc<Selector>),
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str(DIRECT),
            Self::Reject => f.write_str(REJECT),
            Self::Group(g) => write!(f, "Group({})", g.name()),
        }
    }
}

pub struct EngineSnapshot {
    rules: RuleEngine,
    groups: Vec<Arc<Selector>>,
    group_index: HashMap<String, usize>,
    nodes: HashMap<String, Arc<NodeRef>>,
    general: General,
    dns: Arc<dyn DnsResolver>,
    geoip: Arc<dyn GeoIp>,
    mitm: MitmPolicy,
    rewrites: RewriteRules,
    probes: CancellationToken,
}

impl fmt::Debug for EngineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSnapshot")
            .field("rules", &self.rules.rules().len())
            .field("groups", &self.group_index.keys().collect::<Vec<_>>())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl EngineSnapshot {
    /// Builds with the resolver and GeoIP table described by the config.
    pub fn build(config: &Config, ciphers: &CipherRegistry) -> Result<Self> {
        let dns = Arc::new(SystemResolver::from_config(config));
        let geoip = Arc::new(CidrGeoIp::from_config(config)?);
        Self::build_with(config, ciphers, dns, geoip)
    }

    pub fn build_with(
        config: &Config,
        ciphers: &CipherRegistry,
        dns: Arc<dyn DnsResolver>,
        geoip: Arc<dyn GeoIp>,
    ) -> Result<Self> {
        config.validate()?;
        let rules = RuleEngine::parse(&config.rules)?;

        let mut nodes = HashMap::new();
        nodes.insert(DIRECT.to_string(), NodeRef::new(DIRECT, Protocol::Direct));
        for proxy in &config.proxies {
            let node = NodeRef::from_config(proxy, ciphers)?;
            nodes.insert(node.id().to_string(), node);
        }

        let mut groups = Vec::with_capacity(config.proxy_groups.len());
        let mut group_index = HashMap::new();
        for group in &config.proxy_groups {
            let members = group
                .proxies
                .iter()
                .map(|name| {
                    nodes.get(name).cloned().ok_or_else(|| {
                        DispatchError::config(format!("group {} references {name}", group.name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let selector = Selector::new(
                group.name.clone(),
                Strategy::from(group.group_type),
                members,
                SelectorOptions::from_config(group),
            )?;
            group_index.insert(group.name.clone(), groups.len());
            groups.push(Arc::new(selector));
        }

        Ok(Self {
            rules,
            groups,
            group_index,
            nodes,
            general: config.general.clone(),
            dns,
            geoip,
            mitm: MitmPolicy::from_config(&config.mitm),
            rewrites: RewriteRules::from_config(&config.http_modify)?,
            probes: CancellationToken::new(),
        })
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn groups(&self) -> &[Arc<Selector>] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Arc<Selector>> {
        self.group_index.get(name).map(|&i| &self.groups[i])
    }

    pub fn node(&self, id: &str) -> Option<&Arc<NodeRef>> {
        self.nodes.get(id)
    }

    pub fn policy(&self, name: &str) -> Result<Policy> {
        match name {
            DIRECT => Ok(Policy::Direct),
            REJECT => Ok(Policy::Reject),
            _ => self
                .group(name)
                .map(|g| Policy::Group(g.clone()))
                .ok_or_else(|| DispatchError::NoMatch(format!("policy {name} has no group"))),
        }
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn connect_timeout(&self) -> Duration {
        self.general.connect_timeout()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.general.idle_timeout()
    }

    pub fn dns(&self) -> &dyn DnsResolver {
        self.dns.as_ref()
    }

    pub fn geoip(&self) -> &dyn GeoIp {
        self.geoip.as_ref()
    }

    pub fn mitm(&self) -> &MitmPolicy {
        &self.mitm
    }

    pub fn rewrites(&self) -> &RewriteRules {
        &self.rewrites
    }

    /// Starts one prober per `url-test`/`fallback` group. They run until
    /// [`EngineSnapshot::retire`] is called.
    pub fn start_probes(&self) {
        let mut started = 0;
        for group in self.groups.iter().filter(|g| g.needs_probing()) {
            spawn_prober(group.clone(), self.probes.child_token());
            started += 1;
        }
        if started > 0 {
            info!("[Snapshot] started {} probe task(s)", started);
        }
    }

    /// Stops background probing. Sessions still holding the snapshot are
    /// unaffected.
    pub fn retire(&self) {
        self.probes.cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.probes.is_cancelled()
    }
}
