//! Cache freshness evaluation
//!
//! A cached copy is fresh when its length equals the remote length and its
//! modification time is within one second of the remote modification time.
//! Remote values come from the `CachedLength` / `CachedLastModified`
//! metadata when present and parseable, otherwise from the store's own
//! length and last-modified properties.

use crate::cache::CacheDir;
use crate::config::TimestampFormat;
use crate::error::BlobdirResult;
use crate::store::{metadata, ObjectProperties};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;

/// Largest modification-time gap still treated as the same version
pub const SKEW_TOLERANCE_MS: i64 = 1000;

/// 100ns ticks between 0001-01-01 and the Unix epoch
const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
const TICKS_PER_MICRO: i64 = 10;

/// Convert 100ns ticks since 0001-01-01 UTC to a timestamp
pub fn ticks_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    let micros = ticks.checked_sub(TICKS_AT_UNIX_EPOCH)? / TICKS_PER_MICRO;
    Utc.timestamp_micros(micros).single()
}

/// Convert a timestamp to 100ns ticks since 0001-01-01 UTC
pub fn utc_to_ticks(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() * TICKS_PER_MICRO + TICKS_AT_UNIX_EPOCH
        + i64::from(time.timestamp_subsec_nanos() % 1000) / 100
}

/// Encode a last-modified value for the metadata field
pub fn encode_last_modified(time: DateTime<Utc>, format: TimestampFormat) -> String {
    match format {
        TimestampFormat::DotnetTicks => utc_to_ticks(time).to_string(),
        TimestampFormat::UnixMillis => time.timestamp_millis().to_string(),
    }
}

/// Decode a last-modified metadata value; `None` if it does not parse
pub fn decode_last_modified(raw: &str, format: TimestampFormat) -> Option<DateTime<Utc>> {
    let value: i64 = raw.trim().parse().ok()?;
    match format {
        TimestampFormat::DotnetTicks => ticks_to_utc(value),
        TimestampFormat::UnixMillis => Utc.timestamp_millis_opt(value).single(),
    }
}

/// Remote length, preferring the uncompressed length from metadata
pub fn remote_length(props: &ObjectProperties) -> u64 {
    props
        .metadata
        .get(metadata::CACHED_LENGTH)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(props.length)
}

/// Remote modification time, preferring the cached value from metadata
pub fn remote_last_modified(props: &ObjectProperties, format: TimestampFormat) -> DateTime<Utc> {
    props
        .metadata
        .get(metadata::CACHED_LAST_MODIFIED)
        .and_then(|raw| decode_last_modified(raw, format))
        .unwrap_or(props.last_modified)
}

/// Comparison basis for one cached object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessMetadata {
    pub cached_length: u64,
    pub remote_length: u64,
    pub cached_last_modified: DateTime<Utc>,
    pub remote_last_modified: DateTime<Utc>,
}

impl FreshnessMetadata {
    pub fn new(
        cached_length: u64,
        cached_modified_millis: i64,
        remote: &ObjectProperties,
        format: TimestampFormat,
    ) -> Self {
        Self {
            cached_length,
            remote_length: remote_length(remote),
            cached_last_modified: Utc
                .timestamp_millis_opt(cached_modified_millis)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            remote_last_modified: remote_last_modified(remote, format),
        }
    }

    /// Absolute gap between the two modification times
    pub fn skew(&self) -> Duration {
        (self.remote_last_modified - self.cached_last_modified).abs()
    }

    pub fn evaluate(&self) -> Freshness {
        if self.cached_length != self.remote_length {
            return Freshness::Stale(StaleReason::LengthMismatch {
                cached: self.cached_length,
                remote: self.remote_length,
            });
        }
        let skew_ms = self.skew().num_milliseconds();
        if skew_ms > SKEW_TOLERANCE_MS {
            return Freshness::Stale(StaleReason::ModifiedSkew { millis: skew_ms });
        }
        Freshness::Fresh
    }
}

/// Why a cached copy must be refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// No local copy exists
    NotCached,
    /// The remote object does not exist
    RemoteMissing,
    LengthMismatch { cached: u64, remote: u64 },
    ModifiedSkew { millis: i64 },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCached => write!(f, "not cached"),
            Self::RemoteMissing => write!(f, "remote object missing"),
            Self::LengthMismatch { cached, remote } => {
                write!(f, "length {} != remote {}", cached, remote)
            }
            Self::ModifiedSkew { millis } => write!(f, "modified {}ms apart", millis),
        }
    }
}

/// Outcome of a freshness evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale(reason) => write!(f, "stale ({})", reason),
        }
    }
}

/// Compare the cached copy of `name` against already-fetched remote
/// properties (`None` when the remote object does not exist)
pub async fn evaluate(
    cache: &CacheDir,
    name: &str,
    remote: Option<&ObjectProperties>,
    format: TimestampFormat,
) -> BlobdirResult<Freshness> {
    if !cache.file_exists(name).await? {
        return Ok(Freshness::Stale(StaleReason::NotCached));
    }
    let Some(remote) = remote else {
        return Ok(Freshness::Stale(StaleReason::RemoteMissing));
    };

    let cached_length = cache.file_length(name).await?;
    let cached_modified = cache.file_modified_millis(name).await?;
    Ok(FreshnessMetadata::new(cached_length, cached_modified, remote, format).evaluate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn props(length: u64, last_modified: DateTime<Utc>, meta: &[(&str, String)]) -> ObjectProperties {
        ObjectProperties {
            length,
            last_modified,
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn ticks_roundtrip_through_known_value() {
        // 2020-01-01T00:00:00Z
        let ticks = 637_134_336_000_000_000;
        let time = ticks_to_utc(ticks).unwrap();
        assert_eq!(time, at("2020-01-01T00:00:00Z"));
        assert_eq!(utc_to_ticks(time), ticks);
    }

    #[test]
    fn ticks_keep_sub_microsecond_precision() {
        let time = at("2021-06-01T10:00:00.1234567Z");
        assert_eq!(utc_to_ticks(time) % 10_000_000, 1_234_567);
    }

    #[test]
    fn metadata_overrides_native_properties() {
        let native = at("2024-01-01T00:00:00Z");
        let cached = at("2023-06-01T08:30:00Z");
        let remote = props(
            40,
            native,
            &[
                (metadata::CACHED_LENGTH, "100".to_string()),
                (
                    metadata::CACHED_LAST_MODIFIED,
                    utc_to_ticks(cached).to_string(),
                ),
            ],
        );

        assert_eq!(remote_length(&remote), 100);
        assert_eq!(
            remote_last_modified(&remote, TimestampFormat::DotnetTicks),
            cached
        );
    }

    #[test]
    fn unparseable_metadata_falls_back() {
        let native = at("2024-01-01T00:00:00Z");
        let remote = props(
            40,
            native,
            &[
                (metadata::CACHED_LENGTH, "forty".to_string()),
                (metadata::CACHED_LAST_MODIFIED, "".to_string()),
            ],
        );

        assert_eq!(remote_length(&remote), 40);
        assert_eq!(
            remote_last_modified(&remote, TimestampFormat::DotnetTicks),
            native
        );
    }

    #[test]
    fn unix_millis_format() {
        let time = at("2024-02-02T02:02:02.500Z");
        let raw = encode_last_modified(time, TimestampFormat::UnixMillis);
        assert_eq!(raw, time.timestamp_millis().to_string());
        assert_eq!(
            decode_last_modified(&raw, TimestampFormat::UnixMillis),
            Some(time)
        );
    }

    #[test]
    fn fresh_iff_same_length_and_within_a_second() {
        let base = at("2024-05-05T05:05:05Z");
        let cases = [
            (100, 100, 0, true),
            (100, 100, 999, true),
            (100, 100, 1000, true),
            (100, 100, -1000, true),
            (100, 100, 1001, false),
            (100, 100, -1500, false),
            (100, 99, 0, false),
            (0, 1, 0, false),
        ];

        for (cached_len, remote_len, offset_ms, expected) in cases {
            let remote = props(remote_len, base + Duration::milliseconds(offset_ms), &[]);
            let meta = FreshnessMetadata::new(
                cached_len,
                base.timestamp_millis(),
                &remote,
                TimestampFormat::DotnetTicks,
            );
            assert_eq!(
                meta.evaluate().is_fresh(),
                expected,
                "cached {cached_len} remote {remote_len} offset {offset_ms}ms"
            );
        }
    }

    #[test]
    fn stale_reason_is_reported() {
        let base = at("2024-05-05T05:05:05Z");
        let remote = props(10, base, &[]);
        let meta = FreshnessMetadata::new(9, base.timestamp_millis(), &remote, TimestampFormat::DotnetTicks);
        assert_eq!(
            meta.evaluate(),
            Freshness::Stale(StaleReason::LengthMismatch {
                cached: 9,
                remote: 10
            })
        );
    }

    #[tokio::test]
    async fn missing_local_copy_is_stale_without_remote() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = CacheDir::open(temp.path()).await.unwrap();

        let freshness = evaluate(&cache, "segments.gen", None, TimestampFormat::DotnetTicks)
            .await
            .unwrap();
        assert_eq!(freshness, Freshness::Stale(StaleReason::NotCached));
    }
}
