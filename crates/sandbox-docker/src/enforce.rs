//! Translate a resolved policy into engine arguments.
//!
//! Limits are enforced by the engine's cgroup and network configuration;
//! nothing here is advisory. Caller-supplied extra arguments are vetted so
//! they cannot widen the isolation the generated ones establish.

use sandbox::{NetworkMode, SandboxConfig, SandboxError};

use crate::config::DockerConfig;

pub const EGRESS_HOSTS_LABEL: &str = "sandbox.egress.hosts";
pub const EGRESS_PORTS_LABEL: &str = "sandbox.egress.ports";

/// Flags that would undo the generated isolation. Matched as `--flag` and `--flag=value`.
const DENIED_FLAGS: &[&str] = &[
    "--privileged",
    "--cap-add",
    "--security-opt",
    "--device",
    "--volume",
    "--mount",
    "--volumes-from",
];

/// Flags generated from the policy. A repeat would replace the policy value
/// (the engine keeps the last one) or attach a second network.
const POLICY_FLAGS: &[&str] = &[
    "--memory",
    "--memory-swap",
    "--memory-reservation",
    "--kernel-memory",
    "--cpus",
    "--cpu-quota",
    "--cpu-period",
    "--cpu-shares",
    "--pids-limit",
    "--storage-opt",
    "--network",
    "--net",
];

/// Labels read by the egress filter.
const POLICY_LABEL_PREFIX: &str = "sandbox.";

/// Namespace flags rejected only when they ask for the host namespace.
const NAMESPACE_FLAGS: &[&str] = &["--pid", "--ipc", "--uts", "--userns", "--cgroupns"];

/// Resource and network arguments for `docker create`.
pub fn runtime_args(config: &SandboxConfig, docker: &DockerConfig) -> Vec<String> {
    let r = &config.resources;
    let mut args = vec![
        "--memory".to_string(),
        format!("{}m", r.memory_mb),
        // Equal swap ceiling disables swap on top of the memory limit.
        "--memory-swap".to_string(),
        format!("{}m", r.memory_mb),
        "--cpus".to_string(),
        r.cpus.to_string(),
        "--pids-limit".to_string(),
        r.pids_limit.to_string(),
    ];
    if docker.enforce_disk_quota {
        args.push("--storage-opt".to_string());
        args.push(format!("size={}m", r.disk_mb));
    }

    let network = &config.network;
    match network.mode {
        NetworkMode::None => {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        NetworkMode::Restricted => {
            args.push("--network".to_string());
            args.push(docker.restricted_network.clone());
            args.push("--label".to_string());
            args.push(format!("{EGRESS_HOSTS_LABEL}={}", network.allowed_hosts.join(",")));
            let ports: Vec<String> = network.allowed_ports.iter().map(u16::to_string).collect();
            args.push("--label".to_string());
            args.push(format!("{EGRESS_PORTS_LABEL}={}", ports.join(",")));
        }
        NetworkMode::Full => {
            args.push("--network".to_string());
            args.push("bridge".to_string());
        }
    }
    args
}

/// Reject caller arguments that would escalate privileges, join host
/// namespaces, mount host paths or restate a policy-derived limit.
///
/// Resource ceilings and the network come only from the resolved policy;
/// a caller changes them through the override, not through raw flags.
pub fn vet_runtime_args(args: &[String]) -> Result<(), SandboxError> {
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        // `-v`/`-m` in the forms `-v SPEC`, `-v=SPEC` and `-vSPEC`
        if arg.starts_with("-v") || arg.starts_with("-m") {
            return Err(denied(arg));
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (arg.as_str(), None),
        };
        if DENIED_FLAGS.contains(&flag) || POLICY_FLAGS.contains(&flag) {
            return Err(denied(arg));
        }
        let value = match inline {
            Some(value) => Some(value),
            None => iter.peek().map(|next| next.as_str()),
        };
        if (flag == "--label" || flag == "-l")
            && let Some(label) = value
            && label.starts_with(POLICY_LABEL_PREFIX)
        {
            return Err(denied(&format!("{flag} {label}")));
        }
        if NAMESPACE_FLAGS.contains(&flag)
            && let Some(value) = value
            && (value == "host" || value.starts_with("container:"))
        {
            return Err(denied(&format!("{flag} {value}")));
        }
    }
    Ok(())
}

fn denied(arg: &str) -> SandboxError {
    SandboxError::InvalidConfig(format!("runtime argument not allowed: {arg}"))
}
