//! Validation-only configuration data types: the sandbox policy shape and its
//! provider-default/user-override merge rule. Loading these from YAML is an
//! external concern; this module only defines and validates the structs the
//! loader populates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub denied_domains: Vec<String>,
    #[serde(default)]
    pub allow_local_binding: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unix_sockets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_all_unix_sockets: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    #[serde(default)]
    pub allow_write: Vec<String>,
    #[serde(default)]
    pub deny_read: Vec<String>,
    #[serde(default)]
    pub deny_write: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenialBackoffPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
}

/// `runtime/sandbox.json`'s shape: provider defaults merged with per-agent
/// user overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
    pub denial_backoff: DenialBackoffPolicy,
}

fn union_dedup(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for entry in base.iter().chain(overrides.iter()) {
        if seen.insert(entry.clone()) {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Merge provider-default and user-override policies: list fields union with
/// dedup, preserving order of first appearance; scalar fields take the
/// override's value when present, else the base's.
pub fn merge_sandbox_policy(base: &SandboxPolicy, overrides: &SandboxPolicy) -> SandboxPolicy {
    SandboxPolicy {
        network: NetworkPolicy {
            allowed_domains: union_dedup(&base.network.allowed_domains, &overrides.network.allowed_domains),
            denied_domains: union_dedup(&base.network.denied_domains, &overrides.network.denied_domains),
            allow_local_binding: overrides.network.allow_local_binding || base.network.allow_local_binding,
            allow_unix_sockets: overrides
                .network
                .allow_unix_sockets
                .clone()
                .or_else(|| base.network.allow_unix_sockets.clone()),
            allow_all_unix_sockets: overrides
                .network
                .allow_all_unix_sockets
                .or(base.network.allow_all_unix_sockets),
        },
        filesystem: FilesystemPolicy {
            allow_write: union_dedup(&base.filesystem.allow_write, &overrides.filesystem.allow_write),
            deny_read: union_dedup(&base.filesystem.deny_read, &overrides.filesystem.deny_read),
            deny_write: union_dedup(&base.filesystem.deny_write, &overrides.filesystem.deny_write),
        },
        denial_backoff: DenialBackoffPolicy {
            enabled: overrides.denial_backoff.enabled || base.denial_backoff.enabled,
            warning_threshold: overrides
                .denial_backoff
                .warning_threshold
                .or(base.denial_backoff.warning_threshold),
            delay_threshold: overrides
                .denial_backoff
                .delay_threshold
                .or(base.denial_backoff.delay_threshold),
            delay_ms: overrides.denial_backoff.delay_ms.or(base.denial_backoff.delay_ms),
            fail_fast_threshold: overrides
                .denial_backoff
                .fail_fast_threshold
                .or(base.denial_backoff.fail_fast_threshold),
            window_ms: overrides.denial_backoff.window_ms.or(base.denial_backoff.window_ms),
        },
    }
}

/// Validate a requested parallelism value against an agent count, per the
/// scheduler's boundary rules: non-positive requests are a validation error;
/// requests above the agent count clamp down to it.
pub fn effective_max_parallel(requested: Option<i64>, agent_count: usize) -> anyhow::Result<usize> {
    use crate::error::{RunError, RunErrorKind};

    let requested = match requested {
        None => agent_count,
        Some(n) if n <= 0 => {
            return Err(RunError::err(
                RunErrorKind::Validation,
                format!("maxParallel must be a positive integer, got {n}"),
            ));
        }
        Some(n) => n as usize,
    };
    Ok(requested.min(agent_count.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sandbox_policy_unions_lists_preserving_order() {
        let base = SandboxPolicy {
            network: NetworkPolicy {
                allowed_domains: vec!["a.com".to_string(), "b.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = SandboxPolicy {
            network: NetworkPolicy {
                allowed_domains: vec!["b.com".to_string(), "c.com".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge_sandbox_policy(&base, &overrides);
        assert_eq!(merged.network.allowed_domains, vec!["a.com", "b.com", "c.com"]);
    }

    #[test]
    fn merge_sandbox_policy_prefers_override_scalar_when_present() {
        let base = SandboxPolicy {
            denial_backoff: DenialBackoffPolicy {
                delay_ms: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = SandboxPolicy {
            denial_backoff: DenialBackoffPolicy {
                delay_ms: Some(500),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merge_sandbox_policy(&base, &overrides);
        assert_eq!(merged.denial_backoff.delay_ms, Some(500));
    }

    #[test]
    fn merge_sandbox_policy_falls_back_to_base_scalar() {
        let base = SandboxPolicy {
            denial_backoff: DenialBackoffPolicy {
                delay_ms: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = SandboxPolicy::default();
        let merged = merge_sandbox_policy(&base, &overrides);
        assert_eq!(merged.denial_backoff.delay_ms, Some(100));
    }

    #[test]
    fn effective_max_parallel_rejects_non_positive_requests() {
        assert!(effective_max_parallel(Some(0), 5).is_err());
        assert!(effective_max_parallel(Some(-1), 5).is_err());
    }

    #[test]
    fn effective_max_parallel_clamps_to_agent_count() {
        assert_eq!(effective_max_parallel(Some(10), 3).unwrap(), 3);
        assert_eq!(effective_max_parallel(None, 3).unwrap(), 3);
        assert_eq!(effective_max_parallel(Some(2), 3).unwrap(), 2);
    }

    fn policy_with_allowed_domains(domains: Vec<String>) -> SandboxPolicy {
        SandboxPolicy {
            network: NetworkPolicy {
                allowed_domains: domains,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    proptest::proptest! {
        #[test]
        fn merge_sandbox_policy_list_union_has_no_duplicates(
            base in proptest::collection::vec("[a-z]{1,6}\\.com", 0..5),
            overrides in proptest::collection::vec("[a-z]{1,6}\\.com", 0..5),
        ) {
            let merged = merge_sandbox_policy(
                &policy_with_allowed_domains(base),
                &policy_with_allowed_domains(overrides),
            );
            let unique: std::collections::HashSet<&String> =
                merged.network.allowed_domains.iter().collect();
            proptest::prop_assert_eq!(merged.network.allowed_domains.len(), unique.len());
        }

        #[test]
        fn merge_sandbox_policy_is_idempotent_when_reapplying_same_overrides(
            base in proptest::collection::vec("[a-z]{1,6}\\.com", 0..5),
            overrides in proptest::collection::vec("[a-z]{1,6}\\.com", 0..5),
        ) {
            let base_policy = policy_with_allowed_domains(base);
            let overrides_policy = policy_with_allowed_domains(overrides);
            let once = merge_sandbox_policy(&base_policy, &overrides_policy);
            let twice = merge_sandbox_policy(&once, &overrides_policy);
            proptest::prop_assert_eq!(once.network.allowed_domains, twice.network.allowed_domains);
        }
    }
}
