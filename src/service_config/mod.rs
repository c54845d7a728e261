//! Parsing of the JSON "service config" document a name resolver may attach
//! to a [`ResolverData`](crate::client::name_resolution::ResolverData).
//!
//! Only the fields the channel core itself consumes are modeled here: the
//! per-method table (timeout, wait-for-ready, a retry policy placeholder)
//! and the channel-global LB policy selection. Concrete filter
//! configuration (retry backoff tuning, compression, ...) is out of scope
//! here and is carried through only far enough to let a filter above the
//! core read it back out via `raw_lb_config`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// A parsed service config. Construct via [`ServiceConfig::parse`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    method_config: Vec<MethodConfigEntry>,
    /// The LB policy config block, e.g. `[{"round_robin": {}}]`, kept as raw
    /// JSON since LB policies parse their own config.
    pub load_balancing_config: Option<serde_json::Value>,
    /// The deprecated single-string LB policy name field, consulted only if
    /// `load_balancing_config` is absent.
    pub load_balancing_policy: Option<String>,
}

#[derive(Debug, Clone)]
struct MethodConfigEntry {
    names: Vec<MethodName>,
    config: MethodConfig,
}

#[derive(Debug, Clone, Default)]
pub struct MethodName {
    pub service: Option<String>,
    pub method: Option<String>,
}

/// Per-method configuration resolved for a single call.
#[derive(Debug, Clone, Default)]
pub struct MethodConfig {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<String>,
}

// --- wire schema (matches the standard gRPC service config JSON shape) ---

#[derive(Deserialize)]
struct WireServiceConfig {
    #[serde(default, rename = "methodConfig")]
    method_config: Vec<WireMethodConfigEntry>,
    #[serde(default, rename = "loadBalancingConfig")]
    load_balancing_config: Option<serde_json::Value>,
    #[serde(default, rename = "loadBalancingPolicy")]
    load_balancing_policy: Option<String>,
}

#[derive(Deserialize)]
struct WireMethodConfigEntry {
    #[serde(default)]
    name: Vec<WireMethodName>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default, rename = "waitForReady")]
    wait_for_ready: Option<bool>,
    #[serde(default, rename = "retryPolicy")]
    retry_policy: Option<WireRetryPolicy>,
}

#[derive(Deserialize)]
struct WireMethodName {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
struct WireRetryPolicy {
    #[serde(rename = "maxAttempts")]
    max_attempts: u32,
    #[serde(rename = "initialBackoff")]
    initial_backoff: String,
    #[serde(rename = "maxBackoff")]
    max_backoff: String,
    #[serde(rename = "backoffMultiplier")]
    backoff_multiplier: f64,
    #[serde(rename = "retryableStatusCodes", default)]
    retryable_status_codes: Vec<String>,
}

/// Parses a gRPC duration string such as `"1.5s"` into a [`Duration`].
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.strip_suffix('s').ok_or_else(|| format!("duration {s:?} missing trailing 's'"))?;
    let secs: f64 = s.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    if secs < 0.0 {
        return Err(format!("negative duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

impl ServiceConfig {
    /// Parses `json` into a `ServiceConfig`. Parse failures are reported to
    /// the caller so it can fall back to the last-known-good config instead
    /// of applying a broken one.
    pub fn parse(json: &str) -> Result<Self, String> {
        let wire: WireServiceConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid service config JSON: {e}"))?;
        let mut method_config = Vec::with_capacity(wire.method_config.len());
        for entry in wire.method_config {
            let retry_policy = match entry.retry_policy {
                Some(rp) => Some(RetryPolicy {
                    max_attempts: rp.max_attempts,
                    initial_backoff: parse_duration(&rp.initial_backoff)?,
                    max_backoff: parse_duration(&rp.max_backoff)?,
                    backoff_multiplier: rp.backoff_multiplier,
                    retryable_status_codes: rp.retryable_status_codes,
                }),
                None => None,
            };
            let config = MethodConfig {
                timeout: entry.timeout.as_deref().map(parse_duration).transpose()?,
                wait_for_ready: entry.wait_for_ready,
                retry_policy,
            };
            let names = entry
                .name
                .into_iter()
                .map(|n| MethodName {
                    service: n.service,
                    method: n.method,
                })
                .collect();
            method_config.push(MethodConfigEntry { names, config });
        }
        Ok(ServiceConfig {
            method_config,
            load_balancing_config: wire.load_balancing_config,
            load_balancing_policy: wire.load_balancing_policy,
        })
    }

    /// Returns an empty config: no method overrides, no LB preference. Used
    /// as the channel's default-of-last-resort.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves the `MethodConfig` for `path` (`"/service/method"`),
    /// preferring an exact method match, then a service-level wildcard
    /// (method omitted), matching the standard gRPC lookup order.
    pub fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let (service, method) = split_path(path)?;
        let mut wildcard: Option<&MethodConfig> = None;
        for entry in &self.method_config {
            for name in &entry.names {
                let Some(entry_service) = name.service.as_deref() else {
                    continue;
                };
                if entry_service != service {
                    continue;
                }
                match name.method.as_deref() {
                    Some(m) if m == method => return Some(&entry.config),
                    None => wildcard = Some(&entry.config),
                    _ => {}
                }
            }
        }
        wildcard
    }
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    rest.split_once('/')
}

/// Merges a freshly-parsed per-call config into `HashMap`-keyed attributes a
/// `ConfigSelector` may want to attach (affinity keys, etc). Exposed for
/// `ConfigSelector` implementations outside this crate; the core itself
/// never constructs one directly.
pub type CallAttributes = HashMap<&'static str, String>;

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "methodConfig": [
            {
                "name": [{"service": "foo.Bar"}],
                "timeout": "1.500s",
                "waitForReady": true
            },
            {
                "name": [{"service": "foo.Bar", "method": "Baz"}],
                "timeout": "0.25s"
            }
        ],
        "loadBalancingConfig": [{"round_robin": {}}]
    }"#;

    #[test]
    fn exact_method_beats_service_wildcard() {
        let sc = ServiceConfig::parse(JSON).unwrap();
        let mc = sc.method_config("/foo.Bar/Baz").unwrap();
        assert_eq!(mc.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn falls_back_to_service_wildcard() {
        let sc = ServiceConfig::parse(JSON).unwrap();
        let mc = sc.method_config("/foo.Bar/Other").unwrap();
        assert_eq!(mc.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(mc.wait_for_ready, Some(true));
    }

    #[test]
    fn unknown_service_has_no_config() {
        let sc = ServiceConfig::parse(JSON).unwrap();
        assert!(sc.method_config("/other.Service/Method").is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(ServiceConfig::parse("not json").is_err());
    }

    #[test]
    fn empty_config_has_no_methods() {
        let sc = ServiceConfig::empty();
        assert!(sc.method_config("/foo.Bar/Baz").is_none());
    }
}
