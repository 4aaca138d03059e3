//! Sanitized environment construction.
//!
//! The environment handed to a backend is built once, at `create()`, from the
//! effective [`EnvironmentPolicy`] and a snapshot of the host environment.
//! Nothing here reads the host environment lazily; the result is the only
//! source of variables the backend ever sees.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::config::EnvironmentPolicy;

/// Environment produced for one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedEnv {
    pub vars: BTreeMap<String, String>,
    /// Names that were requested but dropped because they are blocked.
    pub skipped: Vec<String>,
}

/// Build the sandbox environment.
///
/// Order: inherited host vars (if `inherit_all`), then passthrough names,
/// then explicit `set` values. A blocked name is dropped at every phase and
/// removed once more at the end, so no combination of layers can leak it.
pub fn sanitize(policy: &EnvironmentPolicy, host_env: &BTreeMap<String, String>) -> SanitizedEnv {
    let blocked = &policy.blocked;
    let mut vars = BTreeMap::new();
    let mut skipped = Vec::new();

    if policy.inherit_all {
        for (name, value) in host_env {
            if blocked.contains(name) {
                debug!(name = %name, "not inheriting blocked variable");
                continue;
            }
            vars.insert(name.clone(), value.clone());
        }
    }

    for name in &policy.passthrough {
        if blocked.contains(name) {
            warn!(name = %name, "passthrough variable is blocked, skipping");
            skipped.push(name.clone());
            continue;
        }
        if let Some(value) = host_env.get(name) {
            vars.insert(name.clone(), value.clone());
        }
    }

    for (name, value) in &policy.set {
        if blocked.contains(name) {
            warn!(name = %name, "explicitly set variable is blocked, skipping");
            skipped.push(name.clone());
            continue;
        }
        vars.insert(name.clone(), value.clone());
    }

    vars.retain(|name, _| !blocked.contains(name));

    SanitizedEnv { vars, skipped }
}

/// Drop blocked names from a per-command environment.
pub fn filter_blocked(
    env: &BTreeMap<String, String>,
    blocked: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(name, _)| {
            let keep = !blocked.contains(*name);
            if !keep {
                warn!(name = %name, "per-command variable is blocked, skipping");
            }
            keep
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Snapshot of the host environment. Non-UTF-8 entries are skipped.
pub fn host_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}
