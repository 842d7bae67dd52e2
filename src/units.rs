use anyhow::{bail, Result};
use std::time::Duration;

const SI_SUFFIXES: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// Parses a human readable byte quantity such as `512KB`, `10B`, `1.5 MiB` or `2048`.
///
/// SI units (`k`, `kb`, `m`, `mb`, ...) are powers of 1000, IEC units (`ki`, `kib`, ...)
/// powers of 1024. Units are case-insensitive.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number = number.replace(',', "");
    if number.is_empty() {
        bail!("invalid byte quantity '{}': missing number", input);
    }
    let value: f64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid byte quantity '{}'", input))?;

    let multiplier: u64 = match unit.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "ki" | "kib" => 1 << 10,
        "m" | "mb" => 1_000_000,
        "mi" | "mib" => 1 << 20,
        "g" | "gb" => 1_000_000_000,
        "gi" | "gib" => 1 << 30,
        "t" | "tb" => 1_000_000_000_000,
        "ti" | "tib" => 1 << 40,
        "p" | "pb" => 1_000_000_000_000_000,
        "pi" | "pib" => 1 << 50,
        "e" | "eb" => 1_000_000_000_000_000_000,
        "ei" | "eib" => 1 << 60,
        other => bail!("invalid byte quantity '{}': unknown unit '{}'", input, other),
    };

    let bytes = value * multiplier as f64;
    if bytes >= u64::MAX as f64 {
        bail!("byte quantity '{}' is too large", input);
    }
    Ok(bytes as u64)
}

/// Formats a byte count with SI units, e.g. `10 B`, `1.0 kB`, `512 kB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 10 {
        return format!("{} B", bytes);
    }
    let mut exp = 0;
    let mut scale: u64 = 1;
    while exp + 1 < SI_SUFFIXES.len() && bytes / scale >= 1000 {
        scale *= 1000;
        exp += 1;
    }
    let value = (bytes as f64 / scale as f64 * 10.0 + 0.5).floor() / 10.0;
    if value < 10.0 {
        format!("{:.1} {}", value, SI_SUFFIXES[exp])
    } else {
        format!("{:.0} {}", value, SI_SUFFIXES[exp])
    }
}

/// Parses retention style durations: `30s`, `5min`, `12h`, `1d`, `2w`, `1m` (30.5 days).
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.starts_with('-') {
        bail!("{}: negative values are not supported", input);
    }
    // "min" before "m" so that minutes are not read as months
    const UNITS: [(&str, u64); 6] = [
        ("min", 60),
        ("s", 1),
        ("h", 3_600),
        ("d", 86_400),
        ("w", 7 * 86_400),
        ("m", 30 * 86_400 + 12 * 3_600),
    ];
    for (unit, secs) in UNITS {
        if let Some(value) = s.strip_suffix(unit) {
            let value: u64 = value
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid duration value: {}", input))?;
            return Ok(Duration::from_secs(value * secs));
        }
    }
    bail!("{}: invalid duration format or unsupported unit", input)
}
