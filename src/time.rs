/// An error that can be thrown when converting to [`NtTime`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NtTimeError {
    /// The source time predates the NT epoch.
    Negative,
    /// The source time does not fit in 64 bits of 100 ns ticks.
    Overflow,
}

/// A Windows file time: 100 ns ticks since 1601-01-01 UTC.
///
/// This is the timestamp representation of the 7z archive format. It
/// converts to and from [`std::time::SystemTime`] and plain Unix epoch
/// seconds.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NtTime(pub(crate) u64);

impl NtTime {
    const TICKS_PER_SEC: u64 = 10_000_000;
    /// Ticks between 1601-01-01 and 1970-01-01.
    const UNIX_EPOCH_TICKS: u64 = 134774 * 86400 * Self::TICKS_PER_SEC;

    /// The [`NtTime`] of the Unix epoch (1970-01-01).
    pub const UNIX_EPOCH: NtTime = NtTime::new(Self::UNIX_EPOCH_TICKS);

    /// Creates a new [`NtTime`] with the given raw tick count.
    #[must_use]
    #[inline]
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Returns the raw tick count.
    #[inline]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Returns the current system time as an [`NtTime`].
    #[must_use]
    pub fn now() -> Self {
        std::time::SystemTime::now()
            .try_into()
            .expect("the current date and time is not a valid NtTime")
    }

    /// Converts Unix epoch seconds to an [`NtTime`].
    pub const fn from_unix_seconds(secs: u64) -> Self {
        Self(Self::UNIX_EPOCH_TICKS + secs * Self::TICKS_PER_SEC)
    }

    /// Returns whole Unix epoch seconds, or `None` for pre-1970 times.
    pub const fn to_unix_seconds(self) -> Option<u64> {
        if self.0 < Self::UNIX_EPOCH_TICKS {
            return None;
        }
        Some((self.0 - Self::UNIX_EPOCH_TICKS) / Self::TICKS_PER_SEC)
    }
}

impl From<u64> for NtTime {
    #[inline]
    fn from(ticks: u64) -> Self {
        Self::new(ticks)
    }
}

impl From<NtTime> for u64 {
    #[inline]
    fn from(time: NtTime) -> Self {
        time.0
    }
}

impl From<NtTime> for std::time::SystemTime {
    fn from(time: NtTime) -> Self {
        let duration = std::time::Duration::new(
            time.0 / NtTime::TICKS_PER_SEC,
            ((time.0 % NtTime::TICKS_PER_SEC) * 100) as u32,
        );
        let nt_epoch = std::time::SystemTime::UNIX_EPOCH
            - std::time::Duration::from_secs(NtTime::UNIX_EPOCH_TICKS / NtTime::TICKS_PER_SEC);
        nt_epoch + duration
    }
}

impl TryFrom<std::time::SystemTime> for NtTime {
    type Error = NtTimeError;

    fn try_from(st: std::time::SystemTime) -> Result<Self, Self::Error> {
        let nt_epoch = std::time::SystemTime::UNIX_EPOCH
            - std::time::Duration::from_secs(NtTime::UNIX_EPOCH_TICKS / NtTime::TICKS_PER_SEC);
        let elapsed = st
            .duration_since(nt_epoch)
            .map_err(|_| NtTimeError::Negative)?
            .as_nanos();
        let ticks = u64::try_from(elapsed / 100).map_err(|_| NtTimeError::Overflow)?;
        Ok(Self::new(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_round_trip() {
        assert_eq!(NtTime::UNIX_EPOCH.to_unix_seconds(), Some(0));
        assert_eq!(
            NtTime::from_unix_seconds(1_700_000_000).to_unix_seconds(),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn system_time_round_trip() {
        let now = NtTime::now();
        let st: std::time::SystemTime = now.into();
        let back = NtTime::try_from(st).unwrap();
        assert_eq!(now, back);
    }

    #[test]
    fn pre_unix_times_have_no_epoch_seconds() {
        assert_eq!(NtTime::new(0).to_unix_seconds(), None);
    }
}
