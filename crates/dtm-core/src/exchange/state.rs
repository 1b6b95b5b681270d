//! Exchange states and dual-channel progress tracking.
//!
//! The handshake runs two channels:
//!
//! ```text
//! Auth channel:    [Negotiate] -> Connect -> Init -> PreAuth -> AuthEx -> Auth
//! Primary channel:                Sync -> PrimeEx -> Primary -> Established
//! ```
//!
//! Each channel records its last completed state. Progress is strictly
//! monotonic per channel; the Primary channel cannot start until the Auth
//! channel has completed `Auth`, and only a resync rewinds it.

use crate::error::{DtmError, PacketError, Result};
use std::borrow::Cow;

/// Exchange states, carried as the `option_flag` of Exchange packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i64)]
pub enum ExchangeState {
    /// Optional pre-exchange of security minimums
    Negotiate = 0,
    /// Protocol version and public id
    Connect = 1,
    /// Full public identity
    Init = 2,
    /// Auth-stage KEM public keys
    PreAuth = 3,
    /// Auth-stage KEM ciphertexts
    AuthEx = 4,
    /// Secret ids under the Auth cipher
    Auth = 5,
    /// Primary parameter agreement
    Sync = 6,
    /// Primary-stage KEM public keys
    PrimeEx = 7,
    /// Primary-stage KEM ciphertexts
    Primary = 8,
    /// Both channels complete
    Established = 9,
}

impl ExchangeState {
    /// Raw wire value
    #[must_use]
    pub fn value(self) -> i64 {
        self as i64
    }

    /// Check if this state belongs to the Auth channel
    #[must_use]
    pub fn is_auth_channel(self) -> bool {
        self <= Self::Auth
    }
}

impl TryFrom<i64> for ExchangeState {
    type Error = PacketError;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Negotiate,
            1 => Self::Connect,
            2 => Self::Init,
            3 => Self::PreAuth,
            4 => Self::AuthEx,
            5 => Self::Auth,
            6 => Self::Sync,
            7 => Self::PrimeEx,
            8 => Self::Primary,
            9 => Self::Established,
            _ => {
                return Err(PacketError::InvalidFlag {
                    field: "exchange",
                    value,
                });
            }
        })
    }
}

/// Check whether the Primary channel may take its next step.
///
/// True iff the Auth channel has completed `Auth` and the Primary channel
/// has not yet reached `Established`.
#[must_use]
pub fn can_advance_primary(auth: Option<ExchangeState>, primary: Option<ExchangeState>) -> bool {
    auth == Some(ExchangeState::Auth) && primary != Some(ExchangeState::Established)
}

/// Last completed state of each channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelProgress {
    auth: Option<ExchangeState>,
    primary: Option<ExchangeState>,
}

impl ChannelProgress {
    /// Fresh progress, nothing completed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last completed Auth-channel state
    #[must_use]
    pub fn auth(&self) -> Option<ExchangeState> {
        self.auth
    }

    /// Last completed Primary-channel state
    #[must_use]
    pub fn primary(&self) -> Option<ExchangeState> {
        self.primary
    }

    /// Check if the Auth channel is complete
    #[must_use]
    pub fn auth_complete(&self) -> bool {
        self.auth == Some(ExchangeState::Auth)
    }

    /// Check if both channels are complete
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.primary == Some(ExchangeState::Established)
    }

    /// Most advanced completed state across both channels
    #[must_use]
    pub fn current(&self) -> Option<ExchangeState> {
        self.primary.or(self.auth)
    }

    /// Next state to complete, or `None` once established.
    ///
    /// `Negotiate` is never returned; it is only accepted as the very first
    /// step via [`ChannelProgress::accepts`].
    #[must_use]
    pub fn next(&self) -> Option<ExchangeState> {
        use ExchangeState::*;
        match (self.auth, self.primary) {
            (None | Some(Negotiate), _) => Some(Connect),
            (Some(Connect), _) => Some(Init),
            (Some(Init), _) => Some(PreAuth),
            (Some(PreAuth), _) => Some(AuthEx),
            (Some(AuthEx), _) => Some(Auth),
            (Some(Auth), None) => Some(Sync),
            (Some(Auth), Some(Sync)) => Some(PrimeEx),
            (Some(Auth), Some(PrimeEx)) => Some(Primary),
            (Some(Auth), Some(Primary)) => Some(Established),
            (Some(Auth), Some(_)) => None,
            _ => None,
        }
    }

    /// Check whether `state` is the next valid step
    #[must_use]
    pub fn accepts(&self, state: ExchangeState) -> bool {
        (state == ExchangeState::Negotiate && self.auth.is_none()) || self.next() == Some(state)
    }

    /// Record `state` as completed.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::UnexpectedState`] if `state` is not the next
    /// valid step for its channel.
    pub fn complete(&mut self, state: ExchangeState) -> Result<()> {
        if !self.accepts(state) {
            return Err(DtmError::UnexpectedState(Cow::Owned(format!(
                "{state:?} after {:?}",
                self.current()
            ))));
        }

        if state.is_auth_channel() {
            self.auth = Some(state);
        } else {
            if !can_advance_primary(self.auth, self.primary) {
                return Err(DtmError::UnexpectedState(Cow::Borrowed(
                    "primary channel before auth completed",
                )));
            }
            self.primary = Some(state);
        }

        tracing::debug!("Exchange progress: {:?} completed", state);
        Ok(())
    }

    /// Rewind the Primary channel for a resync. Auth progress is kept.
    pub fn resync(&mut self) {
        tracing::debug!("Exchange progress: primary channel reset from {:?}", self.primary);
        self.primary = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExchangeState::*;

    const FULL_PATH: [ExchangeState; 9] =
        [Connect, Init, PreAuth, AuthEx, Auth, Sync, PrimeEx, Primary, Established];

    #[test]
    fn test_state_values() {
        for value in 0..=9 {
            assert_eq!(ExchangeState::try_from(value).unwrap().value(), value);
        }
        assert!(ExchangeState::try_from(10).is_err());
        assert!(ExchangeState::try_from(-1).is_err());
    }

    #[test]
    fn test_channel_membership() {
        assert!(Negotiate.is_auth_channel());
        assert!(Auth.is_auth_channel());
        assert!(!Sync.is_auth_channel());
    }

    #[test]
    fn test_can_advance_primary() {
        assert!(!can_advance_primary(None, None));
        assert!(!can_advance_primary(Some(AuthEx), None));
        assert!(can_advance_primary(Some(Auth), None));
        assert!(can_advance_primary(Some(Auth), Some(Primary)));
        assert!(!can_advance_primary(Some(Auth), Some(Established)));
    }

    #[test]
    fn test_full_progression() {
        let mut progress = ChannelProgress::new();
        for state in FULL_PATH {
            assert_eq!(progress.next(), Some(state));
            progress.complete(state).unwrap();
        }
        assert!(progress.is_established());
        assert_eq!(progress.next(), None);
    }

    #[test]
    fn test_negotiate_only_first() {
        let mut progress = ChannelProgress::new();
        progress.complete(Negotiate).unwrap();
        assert!(progress.complete(Negotiate).is_err());
        progress.complete(Connect).unwrap();
        assert!(!progress.accepts(Negotiate));
    }

    #[test]
    fn test_rejects_skips_and_regressions() {
        let mut progress = ChannelProgress::new();
        assert!(matches!(
            progress.complete(Init),
            Err(DtmError::UnexpectedState(_))
        ));
        progress.complete(Connect).unwrap();
        progress.complete(Init).unwrap();
        assert!(progress.complete(Connect).is_err());
        assert!(progress.complete(Sync).is_err());
        assert_eq!(progress.current(), Some(Init));
    }

    #[test]
    fn test_resync_keeps_auth() {
        let mut progress = ChannelProgress::new();
        for state in &FULL_PATH[..7] {
            progress.complete(*state).unwrap();
        }
        assert_eq!(progress.primary(), Some(PrimeEx));

        progress.resync();
        assert!(progress.auth_complete());
        assert_eq!(progress.primary(), None);
        assert_eq!(progress.next(), Some(Sync));
    }
}
