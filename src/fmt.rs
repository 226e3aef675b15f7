//! Provides parsing and formatting helpers for durations, timeouts and byte sizes.
//!
//! These are mainly used by the [config](crate::config) module to read cache settings and by
//! the statistics reports of the [CacheManager](crate::manager::CacheManager).
use std::fmt::Write;
use std::time::Duration;

use crate::mnode::Timeout;

const MILLIS_PER_SECOND: u64 = 1000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// A value without suffix is treated as milliseconds. Returns an **Err** if either a
/// non-integer value is given or if an unknown suffix was provided.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(distcache::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(distcache::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(distcache::fmt::parse_duration("12 s").unwrap(), Duration::from_secs(12));
/// assert_eq!(distcache::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(distcache::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(distcache::fmt::parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
///
/// // An invalid suffix results in an error...
/// assert_eq!(distcache::fmt::parse_duration("3 Y").is_err(), true);
///
/// // Decimal or negative numbers result in an error...
/// assert_eq!(distcache::fmt::parse_duration("1.2s").is_err(), true);
/// assert_eq!(distcache::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let captures = NUMBER_AND_UNIT.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1]
        .parse::<u64>()
        .map_err(|error| anyhow::anyhow!("Cannot parse '{}': {}", str.as_ref(), error))?;
    let factor = match captures[2].to_ascii_lowercase().as_str() {
        "s" => MILLIS_PER_SECOND,
        "m" => MILLIS_PER_MINUTE,
        "h" => MILLIS_PER_HOUR,
        "d" => MILLIS_PER_DAY,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .map(Duration::from_millis)
        .ok_or_else(|| anyhow::anyhow!("The duration '{}' is too large.", str.as_ref()))
}

/// Parses a timeout which is either a duration or **infinite**.
///
/// # Examples
///
/// ```
/// # use distcache::mnode::Timeout;
/// assert_eq!(distcache::fmt::parse_timeout("infinite").unwrap(), Timeout::Infinite);
/// assert_eq!(distcache::fmt::parse_timeout(" Infinite ").unwrap(), Timeout::Infinite);
/// assert_eq!(distcache::fmt::parse_timeout("2m").unwrap(), Timeout::Millis(120_000));
/// assert_eq!(distcache::fmt::parse_timeout("soon").is_err(), true);
/// ```
pub fn parse_timeout(str: impl AsRef<str>) -> anyhow::Result<Timeout> {
    if str.as_ref().trim().eq_ignore_ascii_case("infinite") {
        Ok(Timeout::Infinite)
    } else {
        parse_duration(str).map(Timeout::from)
    }
}

/// Formats a duration into a string like "5d 3h 17m 2s 12ms".
///
/// Units which are zero are skipped. A zero duration is rendered as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(distcache::fmt::format_duration(Duration::from_millis(0)), "0ms");
/// assert_eq!(distcache::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(distcache::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(distcache::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(distcache::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut remaining = duration.as_millis() as u64;
    if remaining == 0 {
        return "0ms".to_owned();
    }

    let mut result = String::new();
    for (unit, millis) in [
        ("d", MILLIS_PER_DAY),
        ("h", MILLIS_PER_HOUR),
        ("m", MILLIS_PER_MINUTE),
        ("s", MILLIS_PER_SECOND),
        ("ms", 1),
    ] {
        let amount = remaining / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            remaining %= millis;
        }
    }

    result
}

/// Formats a timeout, using **infinite** for timeouts which never elapse.
///
/// # Examples
///
/// ```
/// # use distcache::mnode::Timeout;
/// assert_eq!(distcache::fmt::format_timeout(Timeout::Infinite), "infinite");
/// assert_eq!(distcache::fmt::format_timeout(Timeout::Millis(90_000)), "1m 30s");
/// ```
pub fn format_timeout(timeout: Timeout) -> String {
    match timeout {
        Timeout::Infinite => "infinite".to_owned(),
        Timeout::Millis(millis) => format_duration(Duration::from_millis(millis)),
    }
}

/// Formats a given size in bytes using binary units.
///
/// # Examples
///
/// ```
/// assert_eq!(distcache::fmt::format_size(1), "1 byte");
/// assert_eq!(distcache::fmt::format_size(100), "100 bytes");
/// assert_eq!(distcache::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(distcache::fmt::format_size(87_340_000), "83.3 MiB");
/// assert_eq!(distcache::fmt::format_size(873_400_000_000), "813 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    match size_in_bytes {
        1 => return "1 byte".to_owned(),
        size if size < 1024 => return format!("{} bytes", size),
        _ => (),
    }

    let units = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = size_in_bytes as f64 / 1024.;
    let mut unit = 0;
    while size > 1024. && unit < units.len() - 1 {
        size /= 1024.;
        unit += 1;
    }

    if size <= 10. {
        format!("{:.2} {}", size, units[unit])
    } else if size <= 100. {
        format!("{:.1} {}", size, units[unit])
    } else {
        format!("{:.0} {}", size, units[unit])
    }
}
