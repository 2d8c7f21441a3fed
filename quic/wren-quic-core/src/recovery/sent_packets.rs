// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    packet::number::{PacketNumber, PacketNumberRange, PacketNumberSpace},
    time::Timestamp,
};
use std::collections::BTreeMap;

/// The record kept for every packet until it is acknowledged or declared
/// lost
///
/// `Data` is supplied by the transport and retains whatever is needed to
/// reconstruct the packet's frames on loss (stream id + offset + length,
/// crypto offsets, owned control frames).
#[derive(Clone, Debug, PartialEq)]
pub struct SentPacketInfo<Data> {
    pub time_sent: Timestamp,
    pub sent_bytes: u16,
    /// The packet contained frames other than ACK, PADDING and
    /// CONNECTION_CLOSE
    pub ack_eliciting: bool,
    /// The packet counts toward bytes in flight
    pub in_flight: bool,
    pub data: Data,
}

/// The in-flight packet store for one packet-number space
#[derive(Clone, Debug)]
pub struct SentPackets<Data> {
    space: PacketNumberSpace,
    packets: BTreeMap<u64, SentPacketInfo<Data>>,
}

impl<Data> SentPackets<Data> {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            packets: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn insert(&mut self, packet_number: PacketNumber, info: SentPacketInfo<Data>) {
        self.space.assert_eq(packet_number.space());
        let prev = self.packets.insert(packet_number.as_u64(), info);
        debug_assert!(prev.is_none(), "packet numbers are never reused");
    }

    #[inline]
    pub fn remove(&mut self, packet_number: PacketNumber) -> Option<SentPacketInfo<Data>> {
        self.space.assert_eq(packet_number.space());
        self.packets.remove(&packet_number.as_u64())
    }

    #[inline]
    pub fn get(&self, packet_number: PacketNumber) -> Option<&SentPacketInfo<Data>> {
        self.packets.get(&packet_number.as_u64())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Iterates all records in packet-number order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (PacketNumber, &SentPacketInfo<Data>)> {
        let space = self.space;
        self.packets.iter().map(move |(pn, info)| {
            (
                space.new_packet_number(unsafe { crate::varint::VarInt::new_unchecked(*pn) }),
                info,
            )
        })
    }

    /// Removes and returns all records covered by `range`, in order
    #[inline]
    pub fn remove_range(
        &mut self,
        range: PacketNumberRange,
    ) -> Vec<(PacketNumber, SentPacketInfo<Data>)> {
        let space = self.space;
        let keys: Vec<u64> = self
            .packets
            .range(range.start().as_u64()..=range.end().as_u64())
            .map(|(pn, _)| *pn)
            .collect();

        keys.into_iter()
            .map(|pn| {
                let info = self.packets.remove(&pn).expect("key was just listed");
                (
                    space.new_packet_number(unsafe { crate::varint::VarInt::new_unchecked(pn) }),
                    info,
                )
            })
            .collect()
    }

    /// The send time of the oldest ack-eliciting in-flight packet
    #[inline]
    pub fn earliest_ack_eliciting_time_sent(&self) -> Option<Timestamp> {
        self.packets
            .values()
            .filter(|info| info.ack_eliciting)
            .map(|info| info.time_sent)
            .min()
    }

    /// True if any record is ack-eliciting
    #[inline]
    pub fn has_ack_eliciting(&self) -> bool {
        self.packets.values().any(|info| info.ack_eliciting)
    }

    /// Drains every record, as on key discard
    #[inline]
    pub fn drain(&mut self) -> impl Iterator<Item = SentPacketInfo<Data>> {
        let packets = core::mem::take(&mut self.packets);
        packets.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        time::{Clock, NoopClock},
        varint::VarInt,
    };

    fn pn(value: u32) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
    }

    fn info(ack_eliciting: bool) -> SentPacketInfo<()> {
        SentPacketInfo {
            time_sent: NoopClock.get_time(),
            sent_bytes: 1200,
            ack_eliciting,
            in_flight: true,
            data: (),
        }
    }

    #[test]
    fn insert_remove_test() {
        let mut sent = SentPackets::new(PacketNumberSpace::ApplicationData);

        for value in [1, 2, 5, 9] {
            sent.insert(pn(value), info(true));
        }
        assert_eq!(sent.len(), 4);

        let removed = sent.remove_range(PacketNumberRange::new(pn(2), pn(6)));
        let removed: Vec<u64> = removed.iter().map(|(pn, _)| pn.as_u64()).collect();
        assert_eq!(removed, vec![2, 5]);
        assert_eq!(sent.len(), 2);

        assert!(sent.remove(pn(2)).is_none());
        assert!(sent.remove(pn(1)).is_some());

        assert!(sent.has_ack_eliciting());
        assert_eq!(sent.drain().count(), 1);
        assert!(sent.is_empty());
    }
}
