//! Lifecycle state stored in an atomic.

use std::fmt;

/// `Inactive -> Active -> (Healthy | Degraded) -> Inactive`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// No pool connections. Next acquire initializes.
    Inactive = 0,
    /// Initialized, not yet health-checked.
    Active = 1,
    Healthy = 2,
    /// Stale or failed to reconnect. Next acquire reinitializes.
    Degraded = 3,
}

impl LifecycleState {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Healthy,
            3 => Self::Degraded,
            _ => Self::Inactive,
        }
    }

    /// Whether an acquire has to (re)initialize the pool.
    #[inline]
    pub const fn needs_init(&self) -> bool {
        matches!(self, Self::Inactive | Self::Degraded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_conversion() {
        for state in [
            LifecycleState::Inactive,
            LifecycleState::Active,
            LifecycleState::Healthy,
            LifecycleState::Degraded,
        ] {
            assert_eq!(LifecycleState::from_u8(state.as_u8()), state);
        }
        assert_eq!(LifecycleState::from_u8(99), LifecycleState::Inactive);
    }

    #[test]
    fn test_needs_init() {
        assert!(LifecycleState::Inactive.needs_init());
        assert!(LifecycleState::Degraded.needs_init());
        assert!(!LifecycleState::Healthy.needs_init());
    }
}
