use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration for table access and maintenance.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub lock: LockConfig,
    pub bucket: BucketConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long acquisition waits before failing (default: 60s)
    pub timeout: Duration,

    /// Lifetime of a lock before it is considered stale unless renewed
    /// (default: 5m)
    pub period: Duration,

    /// First retry delay while waiting for a lock (default: 10ms)
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay (default: 1s)
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            period: Duration::from_secs(5 * 60),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Pack policy for bucketization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackLevel {
    /// Only unbucketed entries, always into fresh buckets.
    #[default]
    NoPacking,
    /// Top up under-full buckets with unbucketed entries, keeping each
    /// under-full bucket's members together.
    Consolidate,
    /// Regroup unbucketed entries and members of under-full buckets freely.
    Full,
}

impl std::str::FromStr for PackLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "nopacking" | "none" => Ok(PackLevel::NoPacking),
            "consolidate" => Ok(PackLevel::Consolidate),
            "full" | "fullpacking" => Ok(PackLevel::Full),
            other => Err(Error::InvalidConfig(format!("unknown pack level '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Maximum entries per bucket (default: 100)
    pub bucket_size: usize,

    /// Groups smaller than this wait for a later run, except under
    /// `PackLevel::Full` (default: 1)
    pub min_bucket_size: usize,

    /// Buckets written per run, 0 for unlimited (default: 0)
    pub max_new_buckets: usize,

    pub pack_level: PackLevel,

    /// Directories new buckets are written to, round-robin. Relative paths
    /// resolve against the table directory (default: `buckets`)
    pub bucket_dirs: Vec<PathBuf>,

    /// Unreferenced bucket files younger than this are kept (default: 1h)
    pub orphan_grace: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket_size: 100,
            min_bucket_size: 1,
            max_new_buckets: 0,
            pack_level: PackLevel::NoPacking,
            bucket_dirs: vec![PathBuf::from("buckets")],
            orphan_grace: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the bucketize task checks its tables (default: 10m)
    pub bucketize_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bucketize_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(mut self, config: LockConfig) -> Self {
        self.lock = config;
        self
    }

    pub fn bucket(mut self, config: BucketConfig) -> Self {
        self.bucket = config;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock.period.is_zero() {
            return Err(Error::InvalidConfig("lock period must be positive".into()));
        }
        if self.lock.initial_backoff.is_zero() || self.lock.initial_backoff > self.lock.max_backoff {
            return Err(Error::InvalidConfig(
                "lock backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.bucket.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket size must be positive".into()));
        }
        if self.bucket.min_bucket_size > self.bucket.bucket_size {
            return Err(Error::InvalidConfig(format!(
                "min bucket size {} exceeds bucket size {}",
                self.bucket.min_bucket_size, self.bucket.bucket_size
            )));
        }
        if self.bucket.bucket_dirs.is_empty() {
            return Err(Error::InvalidConfig("no bucket directories configured".into()));
        }
        if self.scheduler.bucketize_interval.is_zero() {
            return Err(Error::InvalidConfig("bucketize interval must be positive".into()));
        }
        Ok(())
    }
}

impl LockConfig {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

impl BucketConfig {
    pub fn bucket_size(mut self, size: usize) -> Self {
        self.bucket_size = size;
        self
    }

    pub fn min_bucket_size(mut self, size: usize) -> Self {
        self.min_bucket_size = size;
        self
    }

    pub fn max_new_buckets(mut self, max: usize) -> Self {
        self.max_new_buckets = max;
        self
    }

    pub fn pack_level(mut self, level: PackLevel) -> Self {
        self.pack_level = level;
        self
    }

    pub fn bucket_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.bucket_dirs = dirs;
        self
    }

    pub fn orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }
}

impl SchedulerConfig {
    pub fn bucketize_interval(mut self, interval: Duration) -> Self {
        self.bucketize_interval = interval;
        self
    }
}

/// Parses `"<n><unit>"` (unit optional, defaults to milliseconds) or an
/// ISO-8601 duration such as `PT1M30S`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`, `d`, and the long forms
/// `nanos`, `micros`, `millis`, `seconds`, `minutes`, `hours`, `days` with
/// optional plural `s`. Units are case sensitive.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let invalid = || Error::InvalidConfig(format!("invalid duration '{}'", input));

    if let Some(iso) = input.strip_prefix('+').unwrap_or(input).strip_prefix('P') {
        return parse_iso_duration(iso).ok_or_else(invalid);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;

    let duration = match unit.trim() {
        "" | "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => {
            Duration::from_millis(value)
        }
        "ns" | "nano" | "nanos" | "nanosecond" | "nanoseconds" => Duration::from_nanos(value),
        "us" | "µs" | "micro" | "micros" | "microsecond" | "microseconds" => {
            Duration::from_micros(value)
        }
        "s" | "second" | "seconds" => Duration::from_secs(value),
        "m" | "minute" | "minutes" => Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
        "h" | "hour" | "hours" => Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
        "d" | "day" | "days" => Duration::from_secs(value.checked_mul(86_400).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

/// Parses the part after `P`: `[nD][T[nH][nM][n[.f]S]]`.
fn parse_iso_duration(s: &str) -> Option<Duration> {
    let (date, time) = match s.split_once(['T', 't']) {
        Some((date, time)) => (date, Some(time)),
        None => (s, None),
    };
    if date.is_empty() && time.map_or(true, str::is_empty) {
        return None;
    }

    let mut total = Duration::ZERO;
    if !date.is_empty() {
        let days: u64 = date.strip_suffix(['D', 'd'])?.parse().ok()?;
        total += Duration::from_secs(days.checked_mul(86_400)?);
    }

    let mut rest = time.unwrap_or("");
    while !rest.is_empty() {
        let end = rest.find(|c: char| c.is_ascii_alphabetic())?;
        let (number, tail) = rest.split_at(end);
        let unit = tail.chars().next()?.to_ascii_uppercase();
        rest = &tail[1..];
        let part = match unit {
            'H' => Duration::from_secs(number.parse::<u64>().ok()?.checked_mul(3600)?),
            'M' => Duration::from_secs(number.parse::<u64>().ok()?.checked_mul(60)?),
            'S' => Duration::try_from_secs_f64(number.parse::<f64>().ok()?).ok()?,
            _ => return None,
        };
        total += part;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.bucket.bucket_size, 100);
        assert_eq!(config.bucket.pack_level, PackLevel::NoPacking);
        assert_eq!(config.lock.timeout, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::new()
            .lock(LockConfig::default().timeout(Duration::from_millis(200)))
            .bucket(
                BucketConfig::default()
                    .bucket_size(3)
                    .min_bucket_size(2)
                    .pack_level(PackLevel::Consolidate),
            );
        assert_eq!(config.lock.timeout, Duration::from_millis(200));
        assert_eq!(config.bucket.bucket_size, 3);
        assert_eq!(config.bucket.pack_level, PackLevel::Consolidate);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let config = EngineConfig::new().bucket(BucketConfig::default().bucket_size(0));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config =
            EngineConfig::new().bucket(BucketConfig::default().bucket_size(2).min_bucket_size(3));
        assert!(config.validate().is_err());

        let config = EngineConfig::new().bucket(BucketConfig::default().bucket_dirs(vec![]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("5us").unwrap(), Duration::from_micros(5));
        assert_eq!(parse_duration("7nanos").unwrap(), Duration::from_nanos(7));
        assert_eq!(parse_duration("4 seconds").unwrap(), Duration::from_secs(4));
        assert!(parse_duration("5S").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten").is_err());
    }

    #[test]
    fn test_parse_iso_duration() {
        assert_eq!(parse_duration("PT1M30S").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("P1DT1H").unwrap(), Duration::from_secs(90_000));
        assert_eq!(parse_duration("+PT2H").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("P").is_err());
    }

    #[test]
    fn test_pack_level_from_str() {
        assert_eq!("consolidate".parse::<PackLevel>().unwrap(), PackLevel::Consolidate);
        assert_eq!("NO_PACKING".parse::<PackLevel>().unwrap(), PackLevel::NoPacking);
        assert_eq!("full".parse::<PackLevel>().unwrap(), PackLevel::Full);
        assert!("dense".parse::<PackLevel>().is_err());
    }
}
