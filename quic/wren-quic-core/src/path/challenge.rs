// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::path_challenge::DATA_LEN,
    path::MAX_CHALLENGE_ATTEMPTS,
    time::{timer, Timer, Timestamp},
};
use core::time::Duration;
use subtle::ConstantTimeEq;

pub type Data = [u8; DATA_LEN];

/// The path validation state machine for one address pair
///
/// A pending challenge retransmits on its own timer rather than through
/// loss recovery; PATH_CHALLENGE frames are never queued for
/// retransmission.
#[derive(Clone, Debug, Default)]
pub enum Challenge {
    /// No validation in progress
    #[default]
    None,
    Pending(State),
    /// Validation gave up after the attempt limit
    Failed,
}

#[derive(Clone, Debug)]
pub struct State {
    data: Data,
    attempts: u8,
    transmit_needed: bool,
    retransmit_timer: Timer,
}

impl Challenge {
    /// Starts a validation round with fresh challenge data
    pub fn new(data: Data) -> Self {
        Self::Pending(State {
            data,
            attempts: 0,
            transmit_needed: true,
            retransmit_timer: Timer::default(),
        })
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// The challenge data to write, if a transmission is due
    #[inline]
    pub fn transmission_data(&self) -> Option<Data> {
        match self {
            Self::Pending(state) if state.transmit_needed => Some(state.data),
            _ => None,
        }
    }

    /// Called after a PATH_CHALLENGE frame was written to a packet
    pub fn on_transmit(&mut self, now: Timestamp, retransmit_period: Duration) {
        if let Self::Pending(state) = self {
            state.attempts += 1;
            state.transmit_needed = false;
            state.retransmit_timer.set(now + retransmit_period);
        }
    }

    /// Drives the retransmit timer; a challenge that exhausted its attempts
    /// fails.
    pub fn on_timeout(&mut self, now: Timestamp) {
        if let Self::Pending(state) = self {
            if state.retransmit_timer.poll_expiration(now).is_ready() {
                if state.attempts >= MAX_CHALLENGE_ATTEMPTS {
                    *self = Self::Failed;
                } else {
                    state.transmit_needed = true;
                }
            }
        }
    }

    /// Checks a PATH_RESPONSE payload; on a match the challenge completes
    /// and `true` is returned.
    pub fn on_response(&mut self, response: &[u8]) -> bool {
        if let Self::Pending(state) = self {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.3
            //# A PATH_RESPONSE frame received on any network path validates the
            //# path on which the PATH_CHALLENGE was sent.
            if state.data.ct_eq(response).unwrap_u8() == 1 {
                *self = Self::None;
                return true;
            }
        }
        false
    }

    /// Abandons the round entirely (path replaced or connection closing)
    #[inline]
    pub fn abandon(&mut self) {
        *self = Self::None;
    }
}

impl timer::Provider for Challenge {
    #[inline]
    fn timers<Q: timer::Query>(&self, query: &mut Q) -> timer::Result {
        if let Self::Pending(state) = self {
            state.retransmit_timer.timers(query)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    const PERIOD: Duration = Duration::from_millis(100);

    #[test]
    fn challenge_success_test() {
        let mut challenge = Challenge::new([7; 8]);

        assert!(challenge.is_pending());
        assert_eq!(challenge.transmission_data(), Some([7; 8]));

        let now = NoopClock.get_time();
        challenge.on_transmit(now, PERIOD);
        assert_eq!(challenge.transmission_data(), None);

        // a mismatched response changes nothing
        assert!(!challenge.on_response(&[8; 8]));
        assert!(challenge.is_pending());

        assert!(challenge.on_response(&[7; 8]));
        assert!(!challenge.is_pending());
        assert!(!challenge.is_failed());
    }

    #[test]
    fn challenge_retransmit_and_fail_test() {
        let mut now = NoopClock.get_time();
        let mut challenge = Challenge::new([1; 8]);

        for attempt in 0..MAX_CHALLENGE_ATTEMPTS {
            assert!(
                challenge.transmission_data().is_some(),
                "attempt {attempt} should retransmit"
            );
            challenge.on_transmit(now, PERIOD);

            now = now + PERIOD;
            challenge.on_timeout(now);
        }

        assert!(challenge.is_failed());
        assert!(!challenge.on_response(&[1; 8]));
    }
}
