//! Parsers for `docker stats` and `du` output.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Live counters from one `docker stats --no-stream --format '{{json .}}'` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub pids: u32,
}

pub fn parse_stats(line: &str) -> Option<EngineStats> {
    let stats: StatsLine = serde_json::from_str(line.trim()).ok()?;
    let used = stats.mem_usage.split('/').next()?.trim();
    Some(EngineStats {
        memory_mb: parse_size_mb(used)?,
        cpu_percent: stats.cpu_perc.trim().trim_end_matches('%').parse().ok()?,
        pids: stats.pids.trim().parse().unwrap_or(0),
    })
}

/// `12.5MiB`, `1.2GB`, `512kB`, `0B` to megabytes.
pub fn parse_size_mb(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor = match unit.trim() {
        "B" | "" => 1.0 / (1024.0 * 1024.0),
        "kB" | "KB" | "KiB" => 1.0 / 1024.0,
        "MB" | "MiB" => 1.0,
        "GB" | "GiB" => 1024.0,
        "TB" | "TiB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(number * factor)
}

/// First field of `du -sm` output.
pub fn parse_du_mb(output: &str) -> Option<f64> {
    output.split_whitespace().next()?.parse().ok()
}
