//! Utilities for telling and mocking time
//!
//! Token lifetimes in the `authkeep` crates are tracked in whole seconds
//! since the Unix epoch. The types here make that arithmetic explicit and
//! allow the current time to be injected, so that expiry and refresh
//! decisions can be tested deterministically.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt, ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time
///
/// Unix time as represented by the number of seconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl UnixTime {
    /// The time `duration` after this one, saturating at the maximum
    #[inline]
    pub const fn saturating_add(self, duration: DurationSecs) -> Self {
        Self(self.0.saturating_add(duration.0))
    }

    /// The time `duration` before this one, saturating at the epoch
    #[inline]
    pub const fn saturating_sub(self, duration: DurationSecs) -> Self {
        Self(self.0.saturating_sub(duration.0))
    }

    /// The time elapsed between `earlier` and this time, or zero if
    /// `earlier` is actually later
    #[inline]
    pub const fn duration_since(self, earlier: UnixTime) -> DurationSecs {
        DurationSecs(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        UnixTime(time)
    }
}

impl From<UnixTime> for SystemTime {
    #[inline]
    fn from(t: UnixTime) -> Self {
        SystemTime::UNIX_EPOCH + Duration::from_secs(t.0)
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl ops::AddAssign<DurationSecs> for UnixTime {
    #[inline]
    fn add_assign(&mut self, rhs: DurationSecs) {
        *self = *self + rhs;
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl ops::Sub<UnixTime> for UnixTime {
    type Output = DurationSecs;

    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        self.duration_since(rhs)
    }
}

/// A duration in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl DurationSecs {
    /// A duration of zero seconds
    pub const ZERO: DurationSecs = DurationSecs(0);

    /// Half of this duration, rounded down
    #[inline]
    pub const fn half(self) -> Self {
        Self(self.0 / 2)
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl From<Duration> for DurationSecs {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationSecs(d.as_secs())
    }
}

impl ops::Add for DurationSecs {
    type Output = DurationSecs;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        DurationSecs(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub for DurationSecs {
    type Output = DurationSecs;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationSecs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationSecs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Serde helpers for seconds written as decimal strings
///
/// Persisted token caches store times as `"1700000000"` rather than as JSON
/// numbers, and some token endpoints send lifetimes such as `"3599"`.
/// Deserialization accepts either form. The module-level functions handle
/// [`UnixTime`]; [`duration`][string_secs::duration] handles
/// [`DurationSecs`].
#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
pub mod string_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{DurationSecs, UnixTime};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::Number(n) => Ok(n),
            StringOrNumber::String(s) => s.trim().parse().map_err(|_| {
                de::Error::invalid_value(de::Unexpected::Str(&s), &"a number of seconds")
            }),
        }
    }

    /// Serializes a [`UnixTime`] as a decimal string
    pub fn serialize<S: Serializer>(time: &UnixTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.0)
    }

    /// Deserializes a [`UnixTime`] from a decimal string or a number
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixTime, D::Error> {
        secs(deserializer).map(UnixTime)
    }

    /// The same encoding for optional timestamps
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::UnixTime;

        /// Serializes an optional [`UnixTime`] as a decimal string
        pub fn serialize<S: Serializer>(
            time: &Option<UnixTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => super::serialize(t, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserializes an optional [`UnixTime`] from a decimal string or a number
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<UnixTime>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(deserialize_with = "super::deserialize")] UnixTime);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
        }
    }

    /// The same encoding for durations
    pub mod duration {
        use serde::{Deserializer, Serializer};

        use super::DurationSecs;

        /// Serializes a [`DurationSecs`] as a decimal string
        pub fn serialize<S: Serializer>(
            duration: &DurationSecs,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.collect_str(&duration.0)
        }

        /// Deserializes a [`DurationSecs`] from a decimal string or a number
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<DurationSecs, D::Error> {
            super::secs(deserializer).map(DurationSecs)
        }

        /// The same encoding for optional durations
        pub mod option {
            use serde::{Deserialize, Deserializer};

            use super::DurationSecs;

            /// Deserializes an optional [`DurationSecs`] from a decimal string
            /// or a number
            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Option<DurationSecs>, D::Error> {
                #[derive(Deserialize)]
                struct Wrapper(#[serde(deserialize_with = "super::deserialize")] DurationSecs);

                Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
            }
        }
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A manually driven clock
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the code under test and advance another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a new manual clock starting at `time`
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.0.store(val.0, Ordering::SeqCst);
    }

    /// Moves the clock's current time forward by `inc`
    pub fn advance(&self, inc: DurationSecs) {
        self.0.fetch_add(inc.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtracting_a_later_time_saturates_at_zero() {
        assert_eq!(UnixTime(10) - UnixTime(20), DurationSecs::ZERO);
        assert_eq!(UnixTime(20) - UnixTime(10), DurationSecs(10));
    }

    #[test]
    fn subtracting_past_the_epoch_saturates() {
        assert_eq!(UnixTime(5) - DurationSecs(10), UnixTime(0));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(UnixTime(100));
        let observer = clock.clone();

        clock.advance(DurationSecs(25));
        assert_eq!(observer.now(), UnixTime(125));

        observer.set(UnixTime(7));
        assert_eq!(clock.now(), UnixTime(7));
    }

    #[test]
    fn round_trips_through_system_time() {
        let t = UnixTime(1_700_000_000);
        assert_eq!(UnixTime::from(SystemTime::from(t)), t);
    }

    #[cfg(feature = "serde")]
    mod string_encoding {
        use serde::{Deserialize, Serialize};

        use super::*;

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Stamp {
            #[serde(with = "crate::string_secs")]
            at: UnixTime,
            #[serde(
                default,
                with = "crate::string_secs::option",
                skip_serializing_if = "Option::is_none"
            )]
            maybe: Option<UnixTime>,
        }

        #[test]
        fn writes_decimal_strings() {
            let json = serde_json::to_string(&Stamp {
                at: UnixTime(42),
                maybe: None,
            })
            .unwrap();
            assert_eq!(json, r#"{"at":"42"}"#);
        }

        #[test]
        fn accepts_numbers_and_strings() {
            let stamp: Stamp = serde_json::from_str(r#"{"at":42,"maybe":"43"}"#).unwrap();
            assert_eq!(stamp.at, UnixTime(42));
            assert_eq!(stamp.maybe, Some(UnixTime(43)));
        }

        #[test]
        fn rejects_non_numeric_strings() {
            assert!(serde_json::from_str::<Stamp>(r#"{"at":"soon"}"#).is_err());
        }

        #[derive(Debug, Deserialize)]
        struct Lifetime {
            #[serde(deserialize_with = "crate::string_secs::duration::deserialize")]
            expires_in: DurationSecs,
            #[serde(
                default,
                deserialize_with = "crate::string_secs::duration::option::deserialize"
            )]
            refresh_in: Option<DurationSecs>,
        }

        #[test]
        fn durations_accept_numbers_and_strings() {
            let lifetime: Lifetime =
                serde_json::from_str(r#"{"expires_in":"3599","refresh_in":1800}"#).unwrap();
            assert_eq!(lifetime.expires_in, DurationSecs(3599));
            assert_eq!(lifetime.refresh_in, Some(DurationSecs(1800)));

            let lifetime: Lifetime = serde_json::from_str(r#"{"expires_in":60}"#).unwrap();
            assert_eq!(lifetime.refresh_in, None);
        }
    }
}
