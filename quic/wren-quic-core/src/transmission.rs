// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transmission interest and constraint model
//!
//! Components report what they would like to send (`Interest`), the
//! connection reports what the path currently allows (`Constraint`), and the
//! packet assembly loop combines both.

/// What a component wants to transmit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interest {
    #[default]
    None,
    NewData,
    LostData,
    /// Transmission must happen regardless of congestion limits (probes,
    /// close frames)
    Forced,
}

impl Interest {
    #[inline]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn merge(&mut self, other: Self) {
        *self = (*self).max(other);
    }

    #[inline]
    pub fn can_transmit(self, constraint: Constraint) -> bool {
        match (self, constraint) {
            // nothing passes the anti-amplification limit
            (_, Constraint::AmplificationLimited) => false,
            (Self::Forced, _) => true,
            (Self::LostData, _) => constraint.can_retransmit(),
            (Self::NewData, _) => constraint.can_transmit(),
            (Self::None, _) => false,
        }
    }
}

/// What the path and congestion state currently allow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constraint {
    /// Server pre-validation anti-amplification limit
    AmplificationLimited,
    /// Congestion window is full
    CongestionLimited,
    /// Only lost data may be retransmitted (fast retransmission)
    RetransmissionOnly,
    /// No constraints
    None,
}

impl Constraint {
    #[inline]
    pub fn is_amplification_limited(self) -> bool {
        matches!(self, Self::AmplificationLimited)
    }

    #[inline]
    pub fn is_congestion_limited(self) -> bool {
        matches!(self, Self::CongestionLimited)
    }

    #[inline]
    pub fn can_transmit(self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn can_retransmit(self) -> bool {
        matches!(self, Self::None | Self::RetransmissionOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_constraint_matrix_test() {
        for (interest, constraint, expected) in [
            (Interest::None, Constraint::None, false),
            (Interest::NewData, Constraint::None, true),
            (Interest::NewData, Constraint::CongestionLimited, false),
            (Interest::NewData, Constraint::RetransmissionOnly, false),
            (Interest::LostData, Constraint::RetransmissionOnly, true),
            (Interest::LostData, Constraint::CongestionLimited, false),
            (Interest::Forced, Constraint::CongestionLimited, true),
            (Interest::Forced, Constraint::AmplificationLimited, false),
            (Interest::NewData, Constraint::AmplificationLimited, false),
        ] {
            assert_eq!(
                interest.can_transmit(constraint),
                expected,
                "{interest:?} vs {constraint:?}"
            );
        }
    }

    #[test]
    fn merge_test() {
        let mut interest = Interest::None;
        interest.merge(Interest::NewData);
        assert_eq!(interest, Interest::NewData);
        interest.merge(Interest::None);
        assert_eq!(interest, Interest::NewData);
        interest.merge(Interest::Forced);
        assert_eq!(interest, Interest::Forced);
    }
}
