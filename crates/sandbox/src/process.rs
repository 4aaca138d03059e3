use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

/// Send `signal` to the process group led by `pid`.
///
/// Requires the process to have been spawned with `process_group(0)` so that
/// its PGID equals its PID. Returns `false` if the group is gone or the PID
/// cannot be represented as `i32`.
pub fn signal_process_group(pid: u32, signal: Signal) -> bool {
    match i32::try_from(pid) {
        Ok(pid) => killpg(Pid::from_raw(pid), signal).is_ok(),
        Err(_) => false,
    }
}

/// Kill the entire process group led by `pid` via `killpg(SIGKILL)`.
pub fn kill_process_group(pid: u32) {
    let _ = signal_process_group(pid, Signal::SIGKILL);
}
