// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{packet::number::PacketNumberSpace, time::Timestamp};
use core::{
    cmp::{max, min},
    time::Duration,
};

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// The lowest RTT value the estimator tracks
pub const MIN_RTT: Duration = Duration::from_micros(1);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the timer granularity (kGranularity) is 1 millisecond.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.1
//# The RECOMMENDED value for kPersistentCongestionThreshold is 3
const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEstimator {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    /// The peer's max_ack_delay transport parameter, once known
    max_ack_delay: Duration,
    first_rtt_sample: Option<Timestamp>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

impl RttEstimator {
    #[inline]
    pub fn new(initial_rtt: Duration) -> Self {
        let initial_rtt = initial_rtt.max(MIN_RTT);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = kInitialRtt
        //# rttvar = kInitialRtt / 2
        Self {
            latest_rtt: initial_rtt,
            min_rtt: initial_rtt,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            max_ack_delay: Duration::ZERO,
            first_rtt_sample: None,
        }
    }

    /// Creates an estimator for a new path, preserving `max_ack_delay`
    pub fn for_new_path(&self, initial_rtt: Duration) -> Self {
        Self {
            max_ack_delay: self.max_ack_delay,
            ..Self::new(initial_rtt)
        }
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    #[inline]
    pub fn first_rtt_sample(&self) -> Option<Timestamp> {
        self.first_rtt_sample
    }

    /// Called when the peer's max_ack_delay transport parameter arrives
    pub fn on_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    #[inline]
    pub fn pto_period(&self, pto_backoff: u32, space: PacketNumberSpace) -> Duration {
        let mut period = self.smoothed_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO period MUST be at least kGranularity, to avoid the timer
        //# expiring immediately.
        period += max(self.rttvar * 4, K_GRANULARITY);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# When the PTO is armed for Initial or Handshake packet number spaces,
        //# the max_ack_delay in the PTO period computation is set to 0
        if space.is_application_data() {
            period += self.max_ack_delay;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# Even when there are ack-eliciting packets in flight in multiple
        //# packet number spaces, the exponential increase in PTO occurs across
        //# all spaces to prevent excess load on the network.
        period * pto_backoff
    }

    /// Updates the estimate with a new sample
    #[inline]
    pub fn update_rtt(
        &mut self,
        mut ack_delay: Duration,
        rtt_sample: Duration,
        timestamp: Timestamp,
        is_handshake_confirmed: bool,
        space: PacketNumberSpace,
    ) {
        self.latest_rtt = rtt_sample.max(MIN_RTT);

        if self.first_rtt_sample.is_none() {
            self.first_rtt_sample = Some(timestamp);
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
            //# min_rtt MUST be set to the latest_rtt on the first RTT sample.
            self.min_rtt = self.latest_rtt;
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# smoothed_rtt = latest_rtt
            //# rttvar = latest_rtt / 2
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
        //# min_rtt MUST be set to the lesser of min_rtt and latest_rtt
        //# (Section 5.1) on all other samples.
        self.min_rtt = min(self.min_rtt, self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MAY ignore the acknowledgment delay for Initial packets, since
        //#    these acknowledgments are not delayed by the peer (Section 13.2.1
        //#    of [QUIC-TRANSPORT]);
        if space.is_initial() {
            ack_delay = Duration::ZERO;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST use the lesser of the acknowledgment delay and the peer's
        //#    max_ack_delay after the handshake is confirmed; and
        if is_handshake_confirmed {
            ack_delay = min(ack_delay, self.max_ack_delay);
        }

        let mut adjusted_rtt = self.latest_rtt;

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST NOT subtract the acknowledgment delay from the RTT sample if
        //#    the resulting value is smaller than the min_rtt.
        if self.min_rtt + ack_delay < self.latest_rtt {
            adjusted_rtt -= ack_delay;
        } else if !is_handshake_confirmed {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# Therefore, prior to handshake
            //# confirmation, an endpoint MAY ignore RTT samples if adjusting the
            //# RTT sample for acknowledgment delay causes the sample to be less
            //# than the min_rtt.
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = abs_difference(self.smoothed_rtt, adjusted_rtt);
        self.rttvar = weighted_average(self.rttvar, rttvar_sample, 4);
        self.smoothed_rtt = weighted_average(self.smoothed_rtt, adjusted_rtt, 8);
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.1
    //# The persistent congestion duration is computed as follows:
    //#
    //# (smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay) *
    //#     kPersistentCongestionThreshold
    #[inline]
    pub fn persistent_congestion_threshold(&self) -> Duration {
        (self.smoothed_rtt + max(self.rttvar * 4, K_GRANULARITY) + self.max_ack_delay)
            * K_PERSISTENT_CONGESTION_THRESHOLD
    }
}

#[inline]
fn abs_difference(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// `(prev * (weight - 1) + sample) / weight`
#[inline]
fn weighted_average(prev: Duration, sample: Duration, weight: u32) -> Duration {
    (prev * (weight - 1) + sample) / weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    #[test]
    fn first_sample_test() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();

        assert_eq!(estimator.smoothed_rtt(), DEFAULT_INITIAL_RTT);

        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now,
            false,
            PacketNumberSpace::Initial,
        );

        assert_eq!(estimator.latest_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.min_rtt(), Duration::from_millis(100));
        assert_eq!(estimator.rttvar(), Duration::from_millis(50));
    }

    #[test]
    fn ack_delay_adjustment_test() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(25));

        estimator.update_rtt(
            Duration::ZERO,
            Duration::from_millis(100),
            now,
            true,
            PacketNumberSpace::ApplicationData,
        );

        // the second sample subtracts the reported delay
        estimator.update_rtt(
            Duration::from_millis(10),
            Duration::from_millis(200),
            now,
            true,
            PacketNumberSpace::ApplicationData,
        );

        // adjusted = 190ms, smoothed = 7/8*100 + 1/8*190
        assert_eq!(estimator.latest_rtt(), Duration::from_millis(200));
        assert_eq!(
            estimator.smoothed_rtt(),
            Duration::from_micros(111_250)
        );
    }

    #[test]
    fn pto_period_test() {
        let estimator = RttEstimator::new(Duration::from_millis(100));

        // initial: smoothed=100ms rttvar=50ms
        let period = estimator.pto_period(1, PacketNumberSpace::Initial);
        assert_eq!(period, Duration::from_millis(300));

        // backoff doubles the period
        let period = estimator.pto_period(2, PacketNumberSpace::Initial);
        assert_eq!(period, Duration::from_millis(600));
    }

    #[test]
    fn pto_includes_max_ack_delay_in_application_space_test() {
        let mut estimator = RttEstimator::new(Duration::from_millis(100));
        estimator.on_max_ack_delay(Duration::from_millis(25));

        assert_eq!(
            estimator.pto_period(1, PacketNumberSpace::ApplicationData),
            Duration::from_millis(325)
        );
        assert_eq!(
            estimator.pto_period(1, PacketNumberSpace::Handshake),
            Duration::from_millis(300)
        );
    }
}
