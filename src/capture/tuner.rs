//! Tuning delegate consumed by a capture device.

use std::fmt;

use crate::error::DctResult;

/// Copy-protection indicator reported for the tuned channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyProtection {
    None,
    CopyFreely,
    CopyOnce,
    CopyNever,
    #[default]
    Unknown,
}

impl CopyProtection {
    /// Whether a recording of this channel can be kept.
    pub fn is_recordable(self) -> bool {
        matches!(self, Self::None | Self::CopyFreely)
    }

    /// Whether the tuner has not reported anything definite yet.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::None | Self::Unknown)
    }
}

impl fmt::Display for CopyProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::CopyFreely => "COPY_FREELY",
            Self::CopyOnce => "COPY_ONCE",
            Self::CopyNever => "COPY_NEVER",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Hardware-specific channel control.
///
/// Implementations talk to the tuner itself (HTTP status pages, vendor
/// control protocols). The capture device only needs these four answers.
pub trait Tuner: Send + Sync {
    fn tune(&self, channel: &str) -> DctResult<()>;

    fn copy_protection(&self) -> CopyProtection {
        CopyProtection::Unknown
    }

    fn signal_strength(&self) -> i32 {
        0
    }

    /// Whether the device can accept a tuning request right now.
    fn is_ready(&self) -> bool {
        true
    }
}

/// A tuner for sources that carry a single fixed stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTuner;

impl Tuner for PassthroughTuner {
    fn tune(&self, _channel: &str) -> DctResult<()> {
        Ok(())
    }

    fn copy_protection(&self) -> CopyProtection {
        CopyProtection::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_protection_states() {
        assert!(CopyProtection::None.is_recordable());
        assert!(CopyProtection::CopyFreely.is_recordable());
        assert!(!CopyProtection::CopyOnce.is_recordable());
        assert!(!CopyProtection::Unknown.is_settled());
        assert!(CopyProtection::CopyNever.is_settled());
        assert_eq!(CopyProtection::CopyOnce.to_string(), "COPY_ONCE");
    }

    #[test]
    fn test_passthrough_accepts_any_channel() {
        let tuner = PassthroughTuner;
        assert!(tuner.tune("5-1").is_ok());
        assert!(tuner.is_ready());
        assert_eq!(tuner.copy_protection(), CopyProtection::None);
    }
}
