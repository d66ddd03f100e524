//! Interception boundary: which CONNECT hosts are handed to a TLS
//! interceptor, and header rewriting for plain HTTP requests.

use async_trait::async_trait;
use hyper::HeaderMap;
use hyper::header::{HeaderName, HeaderValue};

use crate::config::{HttpModify, MitmConfig};
use crate::error::{DispatchError, Result};
use crate::proxy::outbound::AnyStream;
use crate::proxy::target::TargetDescriptor;

/// Request/response header rewriting for proxied HTTP exchanges.
pub trait HttpModifier: Send + Sync {
    fn modify_request(&self, host: &str, headers: &mut HeaderMap);
    fn modify_response(&self, host: &str, headers: &mut HeaderMap);
}

/// Takes over a client stream whose CONNECT target is flagged for
/// interception. The returned stream is relayed to the upstream in place of
/// the raw client stream.
#[async_trait]
pub trait TlsInterceptor: Send + Sync {
    async fn intercept(&self, target: &TargetDescriptor, client: AnyStream) -> Result<AnyStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    Intercept,
    Tunnel,
}

/// `*` matches everything, `*.example.com` matches strict subdomains, anything
/// else is an exact, case-insensitive host.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    Subdomains(String),
    Exact(String),
}

impl HostPattern {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern == "*" {
            Self::Any
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            Self::Subdomains(suffix.to_string())
        } else {
            Self::Exact(pattern)
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => host.eq_ignore_ascii_case(exact),
            Self::Subdomains(suffix) => {
                let host = host.to_ascii_lowercase();
                host.len() > suffix.len() + 1
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MitmPolicy {
    hosts: Vec<HostPattern>,
    exclude: Vec<HostPattern>,
}

impl MitmPolicy {
    pub fn from_config(config: &MitmConfig) -> Self {
        Self {
            hosts: config.hosts.iter().map(|p| HostPattern::parse(p)).collect(),
            exclude: config.exclude.iter().map(|p| HostPattern::parse(p)).collect(),
        }
    }

    pub fn decide(&self, host: &str) -> FlowAction {
        let included = self.hosts.iter().any(|p| p.matches(host));
        let excluded = self.exclude.iter().any(|p| p.matches(host));
        if included && !excluded {
            FlowAction::Intercept
        } else {
            FlowAction::Tunnel
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HeaderRewrite {
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderRewrite {
    fn build(edits: &crate::config::HeaderEdits) -> Result<Self> {
        let add = edits
            .add
            .iter()
            .map(|(name, value)| -> Result<_> { Ok((header_name(name)?, header_value(value)?)) })
            .collect::<Result<Vec<_>>>()?;
        let remove = edits
            .remove
            .iter()
            .map(|name| header_name(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { add, remove })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.add {
            headers.insert(name.clone(), value.clone());
        }
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| DispatchError::config(format!("invalid header name {name:?}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| DispatchError::config(format!("invalid header value {value:?}")))
}

#[derive(Debug, Clone)]
struct RewriteRule {
    host: HostPattern,
    request: HeaderRewrite,
    response: HeaderRewrite,
}

/// Header rewriter driven by the `http-modify` config section. Every rule
/// whose host pattern matches is applied, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    rules: Vec<RewriteRule>,
}

impl RewriteRules {
    pub fn from_config(entries: &[HttpModify]) -> Result<Self> {
        let rules = entries
            .iter()
            .map(|entry| -> Result<_> {
                Ok(RewriteRule {
                    host: HostPattern::parse(&entry.host),
                    request: HeaderRewrite::build(&entry.request_headers)?,
                    response: HeaderRewrite::build(&entry.response_headers)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl HttpModifier for RewriteRules {
    fn modify_request(&self, host: &str, headers: &mut HeaderMap) {
        for rule in self.rules.iter().filter(|r| r.host.matches(host)) {
            rule.request.apply(headers);
        }
    }

    fn modify_response(&self, host: &str, headers: &mut HeaderMap) {
        for rule in self.rules.iter().filter(|r| r.host.matches(host)) {
            rule.response.apply(headers);
        }
    }
}
