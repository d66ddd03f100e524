use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{self, GroupType};
use crate::error::{DispatchError, Result};
use crate::proxy::outbound::NodeRef;

pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";
const DEFAULT_MAX_FAILED_TIMES: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Manual,
    Failover,
    UrlTest,
}

impl From<GroupType> for Strategy {
    fn from(t: GroupType) -> Self {
        match t {
            GroupType::Select => Self::Manual,
            GroupType::Fallback => Self::Failover,
            GroupType::UrlTest => Self::UrlTest,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "select",
            Self::Failover => "fallback",
            Self::UrlTest => "url-test",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub max_failed_times: u32,
    /// How long a dead member waits before it is probed again.
    pub cooldown: Duration,
    pub probe_url: String,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            max_failed_times: DEFAULT_MAX_FAILED_TIMES,
            cooldown: DEFAULT_COOLDOWN,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            interval: DEFAULT_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl SelectorOptions {
    pub fn from_config(group: &config::ProxyGroup) -> Self {
        let defaults = Self::default();
        Self {
            max_failed_times: group.max_failed_times.unwrap_or(defaults.max_failed_times).max(1),
            cooldown: group.cooldown.map_or(defaults.cooldown, Duration::from_secs),
            probe_url: group.url.clone().unwrap_or(defaults.probe_url),
            interval: group.interval.map_or(defaults.interval, Duration::from_secs),
            probe_timeout: group.timeout.map_or(defaults.probe_timeout, Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct Health {
    alive: bool,
    consecutive_failures: u32,
    latency: Option<Duration>,
    dead_since: Option<Instant>,
    last_probe: Option<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            alive: true,
            consecutive_failures: 0,
            latency: None,
            dead_since: None,
            last_probe: None,
        }
    }
}

#[derive(Debug)]
struct SelectorState {
    active: usize,
    health: Vec<Health>,
}

/// Point-in-time view of one member, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub name: String,
    pub alive: bool,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub name: String,
    pub strategy: Strategy,
    pub active: Option<String>,
    pub members: Vec<MemberStatus>,
}

/// A policy group: an ordered member list and the strategy that picks one.
///
/// All health bookkeeping lives behind one mutex; nothing outside the
/// selector mutates it.
#[derive(Debug)]
pub struct Selector {
    name: String,
    strategy: Strategy,
    members: Vec<Arc<NodeRef>>,
    options: SelectorOptions,
    state: Mutex<SelectorState>,
}

impl Selector {
    pub fn new(
        name: impl Into<String>,
        strategy: Strategy,
        members: Vec<Arc<NodeRef>>,
        options: SelectorOptions,
    ) -> Result<Self> {
        let name = name.into();
        if members.is_empty() {
            return Err(DispatchError::config(format!("group {name} has no members")));
        }
        let health = vec![Health::default(); members.len()];
        Ok(Self {
            name,
            strategy,
            members,
            options,
            state: Mutex::new(SelectorState { active: 0, health }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn members(&self) -> &[Arc<NodeRef>] {
        &self.members
    }

    pub fn options(&self) -> &SelectorOptions {
        &self.options
    }

    /// Groups whose health is driven by a background probe.
    pub fn needs_probing(&self) -> bool {
        self.strategy != Strategy::Manual
    }

    pub fn pick(&self) -> Result<Arc<NodeRef>> {
        let mut state = self.state.lock();
        let chosen = match self.strategy {
            Strategy::Manual => Some(state.active),
            Strategy::Failover => state.health.iter().position(|h| h.alive),
            Strategy::UrlTest => Self::fastest(&state.health),
        };
        let Some(index) = chosen else {
            return Err(DispatchError::NoAvailableNode {
                group: self.name.clone(),
            });
        };
        if index != state.active {
            info!(
                "[Selector] {} switched {} -> {}",
                self.name,
                self.members[state.active].id(),
                self.members[index].id()
            );
            state.active = index;
        }
        Ok(self.members[index].clone())
    }

    /// Alive member with the lowest latency; unmeasured members sort after
    /// measured ones and ties go to declaration order.
    fn fastest(health: &[Health]) -> Option<usize> {
        health
            .iter()
            .enumerate()
            .filter(|(_, h)| h.alive)
            .min_by_key(|(i, h)| (h.latency.is_none(), h.latency, *i))
            .map(|(i, _)| i)
    }

    /// Records the outcome of a dial or probe through `node_id`.
    pub fn report_result(&self, node_id: &str, success: bool, latency: Option<Duration>) {
        let mut state = self.state.lock();
        let threshold = self.options.max_failed_times;
        for (member, health) in self.members.iter().zip(state.health.iter_mut()) {
            if member.id() != node_id {
                continue;
            }
            if success {
                if !health.alive {
                    info!("[Selector] {}: {} is alive again", self.name, node_id);
                }
                health.alive = true;
                health.consecutive_failures = 0;
                health.dead_since = None;
                if latency.is_some() {
                    health.latency = latency;
                }
            } else {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.alive && health.consecutive_failures >= threshold {
                    warn!(
                        "[Selector] {}: {} marked dead after {} failures",
                        self.name, node_id, health.consecutive_failures
                    );
                    health.alive = false;
                    health.dead_since = Some(Instant::now());
                }
            }
        }
    }

    /// Administrative selection; only `select` groups accept it.
    pub fn select(&self, name: &str) -> Result<()> {
        if self.strategy != Strategy::Manual {
            return Err(DispatchError::config(format!(
                "group {} is {}, not select",
                self.name, self.strategy
            )));
        }
        let index = self
            .members
            .iter()
            .position(|m| m.id() == name)
            .ok_or_else(|| {
                DispatchError::config(format!("group {} has no member {name}", self.name))
            })?;
        let mut state = self.state.lock();
        if state.active != index {
            info!("[Selector] {} selected {}", self.name, name);
            state.active = index;
        }
        Ok(())
    }

    /// Members a probe round at `now` should check, stamped as probed.
    ///
    /// `url-test` re-measures every member once per interval. `fallback`
    /// only probes dead members, once per cooldown.
    pub fn due_for_probe(&self, now: Instant) -> Vec<Arc<NodeRef>> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        for (member, health) in self.members.iter().zip(state.health.iter_mut()) {
            let ready = match self.strategy {
                Strategy::Manual => false,
                Strategy::UrlTest => health
                    .last_probe
                    .is_none_or(|at| now.duration_since(at) >= self.options.interval),
                Strategy::Failover => {
                    !health.alive
                        && health
                            .dead_since
                            .is_some_and(|at| now.duration_since(at) >= self.options.cooldown)
                        && health
                            .last_probe
                            .is_none_or(|at| now.duration_since(at) >= self.options.cooldown)
                }
            };
            if ready {
                health.last_probe = Some(now);
                due.push(member.clone());
            }
        }
        due
    }

    pub fn status(&self) -> GroupStatus {
        let state = self.state.lock();
        let active = match self.strategy {
            Strategy::Manual => Some(state.active),
            Strategy::Failover => state.health.iter().position(|h| h.alive),
            Strategy::UrlTest => Self::fastest(&state.health),
        };
        GroupStatus {
            name: self.name.clone(),
            strategy: self.strategy,
            active: active.map(|i| self.members[i].id().to_string()),
            members: self
                .members
                .iter()
                .zip(state.health.iter())
                .map(|(m, h)| MemberStatus {
                    name: m.id().to_string(),
                    alive: h.alive,
                    latency: h.latency,
                    consecutive_failures: h.consecutive_failures,
                })
                .collect(),
        }
    }
}
