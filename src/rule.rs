//! Ordered routing rules.
//!
//! Rules are written as `KIND,VALUE,POLICY[,no-resolve]` and evaluated strictly
//! in declared order; the first match decides the policy. A rule set must end
//! with exactly one `FINAL` rule so that every target resolves to a policy.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use log::debug;

use crate::dns::{DnsResolver, GeoIp};
use crate::error::{DispatchError, Result};
use crate::proxy::target::TargetDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    DomainSuffix,
    DomainKeyword,
    DomainFull,
    IpCidr,
    GeoIp,
    DstPort,
    Final,
}

impl RuleKind {
    fn parse(name: &str) -> Option<Self> {
        let kind = match name.trim().to_ascii_uppercase().as_str() {
            "DOMAIN-SUFFIX" => Self::DomainSuffix,
            "DOMAIN-KEYWORD" => Self::DomainKeyword,
            "DOMAIN" => Self::DomainFull,
            "IP-CIDR" | "IP-CIDR6" => Self::IpCidr,
            "GEOIP" => Self::GeoIp,
            "DST-PORT" => Self::DstPort,
            "FINAL" | "MATCH" => Self::Final,
            _ => return None,
        };
        Some(kind)
    }

    fn needs_ip(self) -> bool {
        matches!(self, Self::IpCidr | Self::GeoIp)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DomainSuffix => "DOMAIN-SUFFIX",
            Self::DomainKeyword => "DOMAIN-KEYWORD",
            Self::DomainFull => "DOMAIN",
            Self::IpCidr => "IP-CIDR",
            Self::GeoIp => "GEOIP",
            Self::DstPort => "DST-PORT",
            Self::Final => "FINAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Suffix(String),
    Keyword(String),
    Full(String),
    Cidr(IpNet),
    Country(String),
    Port(u16, u16),
    Any,
}

#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    value: String,
    policy: String,
    no_resolve: bool,
    cond: Condition,
}

impl Rule {
    pub fn new(kind: RuleKind, value: &str, policy: &str) -> Result<Self> {
        let value = value.trim();
        let invalid = |reason: String| DispatchError::config(format!("rule {kind},{value}: {reason}"));
        let cond = match kind {
            RuleKind::DomainSuffix => {
                Condition::Suffix(value.trim_start_matches('.').to_ascii_lowercase())
            }
            RuleKind::DomainKeyword => Condition::Keyword(value.to_ascii_lowercase()),
            RuleKind::DomainFull => Condition::Full(value.trim_end_matches('.').to_ascii_lowercase()),
            RuleKind::IpCidr => {
                let net = value
                    .parse::<IpNet>()
                    .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|e| invalid(e.to_string()))?;
                Condition::Cidr(net.trunc())
            }
            RuleKind::GeoIp => Condition::Country(value.to_ascii_uppercase()),
            RuleKind::DstPort => {
                let (lo, hi) = parse_port_range(value).ok_or_else(|| invalid("bad port".into()))?;
                Condition::Port(lo, hi)
            }
            RuleKind::Final => Condition::Any,
        };
        if policy.trim().is_empty() {
            return Err(invalid("missing policy".into()));
        }
        Ok(Self {
            kind,
            value: value.to_string(),
            policy: policy.trim().to_string(),
            no_resolve: false,
            cond,
        })
    }

    /// Parses one textual rule line.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let kind = RuleKind::parse(parts[0])
            .ok_or_else(|| DispatchError::config(format!("unknown rule type in {line:?}")))?;
        let mut rule = match (kind, parts.as_slice()) {
            (RuleKind::Final, [_, policy]) => Self::new(kind, "", policy)?,
            (RuleKind::Final, _) => {
                return Err(DispatchError::config(format!("malformed rule {line:?}")));
            }
            (_, [_, value, policy, ..]) => Self::new(kind, value, policy)?,
            _ => return Err(DispatchError::config(format!("malformed rule {line:?}"))),
        };
        if parts.len() > 3 {
            for option in &parts[3..] {
                match option.to_ascii_lowercase().as_str() {
                    "no-resolve" => rule.no_resolve = true,
                    other => {
                        return Err(DispatchError::config(format!(
                            "unknown rule option {other:?} in {line:?}"
                        )));
                    }
                }
            }
        }
        Ok(rule)
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    fn matches_host(&self, target: &TargetDescriptor) -> bool {
        if target.is_ip() {
            return false;
        }
        let host = target.host();
        match &self.cond {
            Condition::Suffix(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            Condition::Keyword(keyword) => host.contains(keyword.as_str()),
            Condition::Full(full) => host == full,
            _ => false,
        }
    }

    fn matches_ip(&self, ip: IpAddr, geoip: &dyn GeoIp) -> bool {
        match &self.cond {
            Condition::Cidr(net) => net.contains(&ip),
            Condition::Country(code) => geoip
                .country_of(ip)
                .is_some_and(|country| country.eq_ignore_ascii_case(code)),
            _ => false,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Final => write!(f, "FINAL,{}", self.policy),
            kind => write!(f, "{},{},{}", kind, self.value, self.policy),
        }
    }
}

fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (lo.trim().parse().ok()?, hi.trim().parse().ok()?);
            (lo <= hi).then_some((lo, hi))
        }
        None => value.parse().ok().map(|port| (port, port)),
    }
}

/// Outcome of evaluating a target against the rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub policy: &'a str,
    pub rule_index: usize,
    /// Set when evaluation had to resolve the target's hostname.
    pub resolved_ip: Option<IpAddr>,
}

enum IpLookup {
    Pending,
    Known(IpAddr),
    Failed,
}

/// Immutable, ordered rule list. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let final_count = rules.iter().filter(|r| r.kind == RuleKind::Final).count();
        match rules.last() {
            Some(last) if last.kind == RuleKind::Final && final_count == 1 => Ok(Self { rules }),
            _ if final_count > 1 => Err(DispatchError::config("more than one FINAL rule")),
            _ if final_count == 1 => Err(DispatchError::config("FINAL rule must be the last rule")),
            _ => Err(DispatchError::config("rule list has no FINAL rule")),
        }
    }

    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self> {
        let rules = lines
            .iter()
            .map(|line| Rule::parse(line.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Returns the policy of the first matching rule.
    ///
    /// The hostname is resolved at most once, and only when an IP-based rule
    /// without `no-resolve` is reached before any earlier rule matched. A
    /// failed lookup turns every remaining IP-based rule into a non-match.
    pub async fn match_target(
        &self,
        target: &TargetDescriptor,
        dns: &dyn DnsResolver,
        geoip: &dyn GeoIp,
    ) -> Result<RuleMatch<'_>> {
        let mut lookup = match target.resolved_ip() {
            Some(ip) => IpLookup::Known(ip),
            None => IpLookup::Pending,
        };
        let mut resolved_ip = None;

        for (index, rule) in self.rules.iter().enumerate() {
            let hit = match rule.kind {
                RuleKind::Final => true,
                RuleKind::DstPort => match rule.cond {
                    Condition::Port(lo, hi) => (lo..=hi).contains(&target.port()),
                    _ => false,
                },
                kind if kind.needs_ip() => {
                    if matches!(lookup, IpLookup::Pending) && !rule.no_resolve {
                        lookup = match dns.resolve(target.host()).await {
                            Ok(ip) => {
                                resolved_ip = Some(ip);
                                IpLookup::Known(ip)
                            }
                            Err(e) => {
                                debug!("[Rule] resolve {} failed: {}", target.host(), e);
                                IpLookup::Failed
                            }
                        };
                    }
                    match lookup {
                        IpLookup::Known(ip) => rule.matches_ip(ip, geoip),
                        _ => false,
                    }
                }
                _ => rule.matches_host(target),
            };
            if hit {
                debug!("[Rule] {} matched {} -> {}", target, rule, rule.policy);
                return Ok(RuleMatch {
                    policy: &rule.policy,
                    rule_index: index,
                    resolved_ip,
                });
            }
        }
        Err(DispatchError::NoMatch(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::CidrGeoIp;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedResolver {
        answer: Option<IpAddr>,
        calls: AtomicUsize,
    }

    impl FixedResolver {
        fn new(answer: Option<&str>) -> Self {
            Self {
                answer: answer.map(|a| a.parse().unwrap()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DnsResolver for FixedResolver {
        async fn resolve(&self, _host: &str) -> io::Result<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "nxdomain"))
        }
    }

    fn geoip() -> CidrGeoIp {
        let mut table = HashMap::new();
        table.insert("CN".to_string(), vec!["1.0.1.0/24".to_string()]);
        CidrGeoIp::new(&table).unwrap()
    }

    async fn policy_of(engine: &RuleEngine, host: &str, port: u16, dns: &FixedResolver) -> String {
        let target = TargetDescriptor::new(host, port);
        engine
            .match_target(&target, dns, &geoip())
            .await
            .unwrap()
            .policy
            .to_string()
    }

    #[test]
    fn test_parse_rules() {
        let rule = Rule::parse("DOMAIN-SUFFIX, .Google.com ,Proxy").unwrap();
        assert_eq!(rule.kind(), RuleKind::DomainSuffix);
        assert_eq!(rule.policy(), "Proxy");
        assert_eq!(rule.to_string(), "DOMAIN-SUFFIX,.Google.com,Proxy");

        let rule = Rule::parse("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve").unwrap();
        assert!(rule.no_resolve);

        assert_eq!(Rule::parse("MATCH,Proxy").unwrap().kind(), RuleKind::Final);
        assert!(Rule::parse("DOMAIN-REGEX,.*,Proxy").is_err());
        assert!(Rule::parse("DST-PORT,90-80,Proxy").is_err());
        assert!(Rule::parse("IP-CIDR,10.0.0.0/33,Proxy").is_err());
        assert!(Rule::parse("DOMAIN,example.com").is_err());
        assert!(Rule::parse("IP-CIDR,10.0.0.0/8,DIRECT,bogus").is_err());
    }

    #[test]
    fn test_final_rule_is_mandatory_and_last() {
        assert!(RuleEngine::parse(&["DOMAIN,a.com,DIRECT"]).is_err());
        assert!(RuleEngine::parse(&["FINAL,DIRECT", "DOMAIN,a.com,DIRECT"]).is_err());
        assert!(RuleEngine::parse(&["FINAL,DIRECT", "FINAL,REJECT"]).is_err());
        assert!(RuleEngine::parse::<&str>(&[]).is_err());
        assert!(RuleEngine::parse(&["DOMAIN,a.com,DIRECT", "FINAL,Proxy"]).is_ok());
    }

    #[tokio::test]
    async fn test_domain_suffix_respects_label_boundary() {
        let engine =
            RuleEngine::parse(&["DOMAIN-SUFFIX,ads.example.com,REJECT", "FINAL,ProxyGroupA"]).unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "sub.ads.example.com", 443, &dns).await, "REJECT");
        assert_eq!(policy_of(&engine, "ads.example.com", 443, &dns).await, "REJECT");
        assert_eq!(policy_of(&engine, "badads.example.com", 443, &dns).await, "ProxyGroupA");
        assert_eq!(policy_of(&engine, "example.com", 443, &dns).await, "ProxyGroupA");
    }

    #[tokio::test]
    async fn test_keyword_full_and_port() {
        let engine = RuleEngine::parse(&[
            "DOMAIN,exact.example.com,A",
            "DOMAIN-KEYWORD,tracker,B",
            "DST-PORT,8000-8999,C",
            "DST-PORT,22,D",
            "FINAL,E",
        ])
        .unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "EXACT.example.com", 80, &dns).await, "A");
        assert_eq!(policy_of(&engine, "sub.exact.example.com", 80, &dns).await, "E");
        assert_eq!(policy_of(&engine, "mytracker.net", 80, &dns).await, "B");
        assert_eq!(policy_of(&engine, "host.net", 8443, &dns).await, "C");
        assert_eq!(policy_of(&engine, "host.net", 22, &dns).await, "D");
        assert_eq!(policy_of(&engine, "host.net", 9000, &dns).await, "E");
    }

    #[tokio::test]
    async fn test_earlier_rule_wins() {
        let engine = RuleEngine::parse(&[
            "DOMAIN-KEYWORD,example,First",
            "DOMAIN-SUFFIX,example.com,Second",
            "FINAL,Third",
        ])
        .unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "www.example.com", 443, &dns).await, "First");
    }

    #[tokio::test]
    async fn test_domain_rules_skip_ip_literals() {
        let engine = RuleEngine::parse(&["DOMAIN-KEYWORD,10,Kw", "FINAL,Fallback"]).unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "10.0.0.1", 80, &dns).await, "Fallback");
    }

    #[tokio::test]
    async fn test_ip_rules_resolve_lazily_once() {
        let engine = RuleEngine::parse(&[
            "DOMAIN,direct.example.com,DIRECT",
            "IP-CIDR,192.168.0.0/16,Lan",
            "GEOIP,cn,Domestic",
            "FINAL,Proxy",
        ])
        .unwrap();

        let dns = FixedResolver::new(Some("1.0.1.7"));
        assert_eq!(policy_of(&engine, "direct.example.com", 80, &dns).await, "DIRECT");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);

        let target = TargetDescriptor::new("cdn.example.cn", 443);
        let m = engine.match_target(&target, &dns, &geoip()).await.unwrap();
        assert_eq!(m.policy, "Domestic");
        assert_eq!(m.rule_index, 2);
        assert_eq!(m.resolved_ip, Some("1.0.1.7".parse().unwrap()));
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ip_literal_matches_cidr_without_dns() {
        let engine = RuleEngine::parse(&["IP-CIDR,192.168.0.0/16,Lan", "FINAL,Proxy"]).unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "192.168.3.4", 80, &dns).await, "Lan");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_resolution_falls_through() {
        let engine = RuleEngine::parse(&["IP-CIDR,0.0.0.0/0,Any", "GEOIP,CN,Cn", "FINAL,Proxy"]).unwrap();
        let dns = FixedResolver::new(None);
        assert_eq!(policy_of(&engine, "unknown.invalid", 80, &dns).await, "Proxy");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_resolve_skips_dns() {
        let engine =
            RuleEngine::parse(&["IP-CIDR,0.0.0.0/0,Any,no-resolve", "FINAL,Proxy"]).unwrap();
        let dns = FixedResolver::new(Some("1.1.1.1"));
        assert_eq!(policy_of(&engine, "example.com", 80, &dns).await, "Proxy");
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_target_gets_a_policy() {
        let engine = RuleEngine::parse(&[
            "DOMAIN-SUFFIX,a.com,A",
            "IP-CIDR,10.0.0.0/8,B",
            "FINAL,Default",
        ])
        .unwrap();
        let dns = FixedResolver::new(None);
        for (host, port) in [("x.org", 1), ("10.1.1.1", 65535), ("::1", 0), ("a.com", 80)] {
            let target = TargetDescriptor::new(host, port);
            let m = engine.match_target(&target, &dns, &geoip()).await;
            assert!(m.is_ok(), "{host} had no policy");
        }
    }
}
