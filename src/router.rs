//! Routing: a pure function from model name to an ordered provider chain.
//!
//! The first element of the chain is the primary connection; later elements
//! are fallbacks from the configured rules. The router holds no state and is
//! safe to call from concurrent requests.

use std::cmp::Reverse;

use crate::providers::ProviderFamily;
use crate::storage::ConnectionRecord;

/// Ordered prefix → family rules, checked first match wins.
///
/// Anything unmatched routes to the local family, which also swallows the
/// `local` alias.
#[derive(Debug, Clone)]
pub struct RoutingRules {
    rules: Vec<(String, ProviderFamily)>,
}

impl Default for RoutingRules {
    fn default() -> Self {
        Self {
            rules: vec![
                ("gpt-".to_string(), ProviderFamily::OpenAi),
                ("o1-".to_string(), ProviderFamily::OpenAi),
                ("claude".to_string(), ProviderFamily::Anthropic),
            ],
        }
    }
}

impl RoutingRules {
    /// Parse a `prefix:family,prefix:family` spec (overrides the defaults).
    pub fn from_spec(raw: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (prefix, family) = pair
                .split_once(':')
                .ok_or_else(|| format!("expected prefix:family, got '{}'", pair))?;
            let family = ProviderFamily::from_str(family)
                .ok_or_else(|| format!("unknown provider family '{}'", family))?;
            rules.push((prefix.trim().to_string(), family));
        }
        if rules.is_empty() {
            return Err("no routing rules in spec".to_string());
        }
        Ok(Self { rules })
    }

    /// Determine the provider family for an (alias-resolved) model name.
    pub fn family_for(&self, model: &str) -> ProviderFamily {
        for (prefix, family) in &self.rules {
            if model.starts_with(prefix.as_str()) {
                return *family;
            }
        }
        ProviderFamily::Ollama
    }
}

/// `src:dst` fallback pairs; order is preserved in the chain.
#[derive(Debug, Clone, Default)]
pub struct FallbackRules {
    rules: Vec<(ProviderFamily, ProviderFamily)>,
}

impl FallbackRules {
    /// Parse a `src:dst,src:dst` spec.
    pub fn from_spec(raw: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (src, dst) = pair
                .split_once(':')
                .ok_or_else(|| format!("expected src:dst, got '{}'", pair))?;
            let src = ProviderFamily::from_str(src)
                .ok_or_else(|| format!("unknown provider family '{}'", src))?;
            let dst = ProviderFamily::from_str(dst)
                .ok_or_else(|| format!("unknown provider family '{}'", dst))?;
            rules.push((src, dst));
        }
        Ok(Self { rules })
    }

    /// Fallback families for a primary, in rule order.
    pub fn targets_for(&self, primary: ProviderFamily) -> Vec<ProviderFamily> {
        self.rules
            .iter()
            .filter(|(src, _)| *src == primary)
            .map(|(_, dst)| *dst)
            .collect()
    }
}

/// One routed hop: a family plus the connection that serves it.
#[derive(Debug, Clone)]
pub struct Route {
    pub family: ProviderFamily,
    pub connection: ConnectionRecord,
}

/// Best enabled connection for a family.
///
/// Priority: explicit default flag, then most-recently-updated, then lowest
/// id (ascending id also breaks exact ties deterministically).
fn best_connection(
    connections: &[ConnectionRecord],
    family: ProviderFamily,
) -> Option<&ConnectionRecord> {
    connections
        .iter()
        .filter(|c| c.enabled && c.service == family)
        .max_by_key(|c| (c.is_default, c.updated_at, Reverse(c.id)))
}

/// Resolve the ordered provider chain for a model.
///
/// Returns an empty chain when no enabled connection serves the primary
/// family; the pipeline turns that into `provider_not_configured`. Fallback
/// hops that resolve to the primary connection itself are dropped.
pub fn plan(
    model: &str,
    connections: &[ConnectionRecord],
    routing: &RoutingRules,
    fallback: &FallbackRules,
) -> Vec<Route> {
    let primary_family = routing.family_for(model);

    let primary = match best_connection(connections, primary_family) {
        Some(connection) => connection,
        None => return Vec::new(),
    };

    let mut chain = vec![Route {
        family: primary_family,
        connection: primary.clone(),
    }];

    for target in fallback.targets_for(primary_family) {
        if let Some(connection) = best_connection(connections, target) {
            if connection.id == primary.id {
                continue;
            }
            chain.push(Route {
                family: target,
                connection: connection.clone(),
            });
        }
    }

    chain
}
