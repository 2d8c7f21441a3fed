// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The sending half of a stream

use crate::sync::{Flag, ValueSync};
use wren_quic_core::{
    connection,
    interval::IntervalSet,
    stream::{state::Sender, StreamId},
    transmission,
    varint::VarInt,
};

/// Bytes buffered per stream before the application is pushed back
const SEND_BUFFER_LIMIT: usize = 256 * 1024;

/// A chunk of stream data scheduled into a packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transmission {
    pub offset: u64,
    pub len: usize,
    pub is_fin: bool,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,
    state: Sender,

    /// Buffered bytes awaiting acknowledgment; `buffer[0]` is stream offset
    /// `buffer_offset`
    buffer: Vec<u8>,
    buffer_offset: u64,

    /// Total bytes accepted from the application
    bytes_written: u64,
    /// Ranges awaiting (re)transmission
    pending: IntervalSet,
    /// Ranges acknowledged by the peer
    acked: IntervalSet,

    /// The highest offset transmitted at least once; data beyond it
    /// consumes stream and connection credit when sent
    bytes_sent_high: u64,

    /// The peer's MAX_STREAM_DATA limit
    max_stream_data: VarInt,
    blocked_sync: ValueSync,

    fin_requested: bool,
    fin_needs_transmission: bool,
    fin_acked: bool,

    reset_error: Option<VarInt>,
    reset_sync: Flag,
}

impl SendStream {
    pub fn new(id: StreamId, max_stream_data: VarInt) -> Self {
        Self {
            id,
            state: Sender::default(),
            buffer: Vec::new(),
            buffer_offset: 0,
            bytes_written: 0,
            bytes_sent_high: 0,
            pending: IntervalSet::new(),
            acked: IntervalSet::new(),
            max_stream_data,
            blocked_sync: ValueSync::new(VarInt::ZERO),
            fin_requested: false,
            fin_needs_transmission: false,
            fin_acked: false,
            reset_error: None,
            reset_sync: Flag::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> &Sender {
        &self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// True while the application may still write to the stream
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.reset_error.is_none() && !self.fin_requested && !self.state.is_terminal()
    }

    /// Appends application data, optionally closing the stream.
    ///
    /// Returns the bytes accepted; zero with unbuffered data left means the
    /// caller should wait for acknowledgments to drain the buffer.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<usize, connection::Error> {
        if self.reset_error.is_some() || self.fin_requested {
            return Err(connection::Error::InvalidArgument);
        }
        if self.state.is_terminal() {
            return Err(connection::Error::InvalidArgument);
        }

        let capacity = SEND_BUFFER_LIMIT.saturating_sub(self.buffer.len());
        let accepted = data.len().min(capacity);
        if accepted < data.len() && accepted == 0 && !data.is_empty() {
            return Err(connection::Error::WouldBlock);
        }

        self.buffer.extend_from_slice(&data[..accepted]);
        if accepted > 0 {
            self.pending
                .insert(self.bytes_written..=self.bytes_written + accepted as u64 - 1);
            self.bytes_written += accepted as u64;
            let _ = self.state.on_send();
        }

        // only close once every byte was accepted
        if fin && accepted == data.len() {
            self.fin_requested = true;
            self.fin_needs_transmission = true;
            let _ = self.state.on_send_fin();
        }

        Ok(accepted)
    }

    /// The stream's final size, once the application closed it
    #[inline]
    pub fn final_size(&self) -> Option<u64> {
        self.fin_requested.then_some(self.bytes_written)
    }

    /// Resets the stream with an application error code
    //= https://www.rfc-editor.org/rfc/rfc9000#section-2.4
    //# A sender can abandon transmission of stream
    //# data by sending a RESET_STREAM frame
    pub fn reset(&mut self, error_code: VarInt) {
        if self.state.on_reset().is_err() {
            return;
        }
        self.reset_error = Some(error_code);
        self.reset_sync.request_delivery();
        // abandoned data is never retransmitted
        self.pending.clear();
        self.buffer.clear();
        self.fin_needs_transmission = false;
    }

    /// Called when the peer asks us to stop sending
    //= https://www.rfc-editor.org/rfc/rfc9000#section-3.5
    //# An endpoint that receives a STOP_SENDING frame MUST send a
    //# RESET_STREAM frame if the stream is in the "Ready" or "Send" state.
    pub fn on_stop_sending(&mut self, error_code: VarInt) {
        self.reset(error_code);
    }

    /// The RESET_STREAM frame to transmit, if one is due
    pub fn reset_transmission(&mut self) -> Option<(VarInt, u64)> {
        if self.reset_sync.needs_transmission() {
            let code = self.reset_error.expect("reset code set with the flag");
            Some((code, self.bytes_written))
        } else {
            None
        }
    }

    #[inline]
    pub fn reset_sync(&mut self) -> &mut Flag {
        &mut self.reset_sync
    }

    #[inline]
    pub fn blocked_sync(&mut self) -> &mut ValueSync {
        &mut self.blocked_sync
    }

    pub fn on_max_stream_data(&mut self, maximum: VarInt) {
        self.max_stream_data = self.max_stream_data.max(maximum);
    }

    /// Picks the next chunk to send, bounded by `max_len` and the
    /// connection credit `connection_budget`.
    ///
    /// Stream credit limits the highest offset; only retransmissions may
    /// proceed past a shrunken budget since they claimed credit when first
    /// sent.
    pub fn next_transmission(&mut self, max_len: usize, connection_budget: u64) -> Option<Transmission> {
        if self.reset_error.is_some() {
            return None;
        }

        let limit = self.max_stream_data.as_u64();

        if let Some(interval) = self.pending.intervals().next() {
            let offset = interval.start();
            let mut end = interval.end() + 1;

            // new data (past the transmitted high-water mark) consumes
            // stream and connection credit; retransmissions claimed theirs
            // when first sent
            if end > self.bytes_sent_high {
                let budget_end = self
                    .bytes_sent_high
                    .max(offset)
                    .saturating_add(connection_budget);
                // the limit never moves backwards, so the already-sent
                // prefix is always within it
                end = end.min(budget_end).min(limit);
                if end <= offset {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
                    //# A sender SHOULD send a
                    //# STREAM_DATA_BLOCKED or DATA_BLOCKED frame to indicate to the
                    //# receiver that it has data to send but is blocked by flow control
                    //# limits.
                    if offset >= limit {
                        self.blocked_sync
                            .request_delivery(self.max_stream_data);
                    }
                    return None;
                }
            }

            let len = ((end - offset) as usize).min(max_len);
            if len == 0 {
                return None;
            }

            let is_fin = self.fin_requested && offset + len as u64 == self.bytes_written;
            return Some(Transmission {
                offset,
                len,
                is_fin,
            });
        }

        if self.fin_needs_transmission {
            // an empty frame carrying only the FIN bit
            return Some(Transmission {
                offset: self.bytes_written,
                len: 0,
                is_fin: true,
            });
        }

        None
    }

    /// The data for a scheduled transmission
    #[inline]
    pub fn data(&self, offset: u64, len: usize) -> &[u8] {
        let at = (offset - self.buffer_offset) as usize;
        &self.buffer[at..at + len]
    }

    /// Marks a chunk as in flight; returns the bytes of new connection
    /// credit the transmission consumed
    pub fn on_transmit(&mut self, transmission: Transmission) -> u64 {
        if transmission.len > 0 {
            self.pending.remove(
                transmission.offset..=transmission.offset + transmission.len as u64 - 1,
            );
        }
        if transmission.is_fin {
            self.fin_needs_transmission = false;
        }

        let end = transmission.offset + transmission.len as u64;
        let new_bytes = end.saturating_sub(self.bytes_sent_high);
        self.bytes_sent_high = self.bytes_sent_high.max(end);
        new_bytes
    }

    /// Called when a STREAM frame for this stream is acknowledged
    pub fn on_frame_ack(&mut self, offset: u64, len: usize, is_fin: bool) {
        if self.reset_error.is_some() {
            return;
        }

        if len > 0 {
            self.acked.insert(offset..=offset + len as u64 - 1);
        }
        if is_fin {
            self.fin_acked = true;
        }

        // drop the acknowledged prefix of the buffer
        if let Some(interval) = self.acked.intervals().next() {
            if interval.start() <= self.buffer_offset {
                let new_offset = interval.end() + 1;
                if new_offset > self.buffer_offset {
                    let drop = (new_offset - self.buffer_offset) as usize;
                    self.buffer.drain(..drop.min(self.buffer.len()));
                    self.buffer_offset = new_offset;
                }
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
        //# Once all stream data has been successfully acknowledged, the sending
        //# part of the stream enters the "Data Recvd" state
        if self.fin_acked && self.acked_everything() {
            let _ = self.state.on_all_data_acked();
        }
    }

    fn acked_everything(&self) -> bool {
        if self.bytes_written == 0 {
            return true;
        }
        match self.acked.intervals().next() {
            Some(interval) => interval.start() == 0 && interval.end() + 1 >= self.bytes_written,
            None => false,
        }
    }

    /// Called when a STREAM frame for this stream is declared lost
    pub fn on_frame_loss(&mut self, offset: u64, len: usize, is_fin: bool) {
        if self.reset_error.is_some() {
            return;
        }

        if len > 0 {
            let mut lost = IntervalSet::new();
            lost.insert(offset..=offset + len as u64 - 1);
            // bytes acked through other packets need no retransmission
            for interval in self.acked.intervals() {
                lost.remove(interval.into());
            }
            for interval in lost.intervals() {
                self.pending.insert(interval.into());
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.3
        //# *  Application data sent in STREAM frames is retransmitted in new
        //#    STREAM frames unless the endpoint has sent a RESET_STREAM for that
        //#    stream.
        if is_fin && !self.fin_acked {
            self.fin_needs_transmission = true;
        }
    }

    /// Called when the RESET_STREAM frame is acknowledged
    pub fn on_reset_ack(&mut self) {
        let _ = self.state.on_reset_acked();
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        if self.reset_sync.needs_transmission() {
            interest.merge(transmission::Interest::LostData);
        }
        if self.reset_error.is_some() {
            return;
        }
        if self.fin_needs_transmission {
            interest.merge(transmission::Interest::LostData);
        }
        if let Some(interval) = self.pending.intervals().next() {
            // retransmissions may proceed under tighter constraints
            if interval.start() < self.bytes_sent_high {
                interest.merge(transmission::Interest::LostData);
            } else {
                interest.merge(transmission::Interest::NewData);
            }
        }
        self.blocked_sync.transmission_interest(interest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::{endpoint, stream::StreamType};

    fn stream() -> SendStream {
        let id = StreamId::initial(endpoint::Type::Client, StreamType::Bidirectional);
        SendStream::new(id, VarInt::from_u32(10_000))
    }

    #[test]
    fn write_and_send_test() {
        let mut stream = stream();

        assert_eq!(stream.write(b"hello world", false).unwrap(), 11);
        assert!(stream.state().is_sending());

        let tx = stream.next_transmission(5, u64::MAX).unwrap();
        assert_eq!(tx, Transmission { offset: 0, len: 5, is_fin: false });
        assert_eq!(stream.data(tx.offset, tx.len), b"hello");
        stream.on_transmit(tx);

        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert_eq!(tx.offset, 5);
        assert_eq!(tx.len, 6);
        stream.on_transmit(tx);

        assert!(stream.next_transmission(100, u64::MAX).is_none());
    }

    #[test]
    fn fin_lifecycle_test() {
        let mut stream = stream();
        stream.write(b"data", true).unwrap();
        assert!(stream.state().is_data_sent());

        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert!(tx.is_fin);
        stream.on_transmit(tx);

        stream.on_frame_ack(0, 4, true);
        assert!(stream.state().is_terminal());
        assert!(stream.is_terminal());
    }

    #[test]
    fn empty_fin_test() {
        let mut stream = stream();
        stream.write(b"", true).unwrap();

        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert_eq!(tx, Transmission { offset: 0, len: 0, is_fin: true });
        stream.on_transmit(tx);

        stream.on_frame_ack(0, 0, true);
        assert!(stream.is_terminal());
    }

    #[test]
    fn loss_requeues_test() {
        let mut stream = stream();
        stream.write(b"abcdefgh", false).unwrap();

        let tx = stream.next_transmission(8, u64::MAX).unwrap();
        stream.on_transmit(tx);
        assert!(stream.next_transmission(8, u64::MAX).is_none());

        // part of the range was acked through another packet
        stream.on_frame_ack(0, 2, false);
        stream.on_frame_loss(0, 8, false);

        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert_eq!(tx.offset, 2);
        assert_eq!(tx.len, 6);
    }

    #[test]
    fn stream_credit_limits_test() {
        let id = StreamId::initial(endpoint::Type::Client, StreamType::Bidirectional);
        let mut stream = SendStream::new(id, VarInt::from_u32(4));
        stream.write(b"abcdefgh", false).unwrap();

        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert_eq!(tx.len, 4, "stream credit caps the transmission");
        stream.on_transmit(tx);

        // fully blocked now; a STREAM_DATA_BLOCKED is scheduled
        assert!(stream.next_transmission(100, u64::MAX).is_none());
        assert!(stream.blocked_sync().transmission_value().is_some());

        stream.on_max_stream_data(VarInt::from_u32(8));
        let tx = stream.next_transmission(100, u64::MAX).unwrap();
        assert_eq!(tx.offset, 4);
        assert_eq!(tx.len, 4);
    }

    #[test]
    fn connection_credit_limits_test() {
        let mut stream = stream();
        stream.write(b"abcdefgh", false).unwrap();

        let tx = stream.next_transmission(100, 3).unwrap();
        assert_eq!(tx.len, 3, "connection credit caps the transmission");
    }

    #[test]
    fn reset_test() {
        let mut stream = stream();
        stream.write(b"abc", false).unwrap();
        stream.reset(VarInt::from_u32(9));

        assert!(stream.next_transmission(100, u64::MAX).is_none());
        let (code, final_size) = stream.reset_transmission().unwrap();
        assert_eq!(code, VarInt::from_u32(9));
        assert_eq!(final_size, 3);

        stream.reset_sync().on_transmit(
            wren_quic_core::packet::number::PacketNumberSpace::ApplicationData
                .new_packet_number(VarInt::from_u8(1)),
        );
        stream.reset_sync().on_packet_ack(
            wren_quic_core::packet::number::PacketNumberSpace::ApplicationData
                .new_packet_number(VarInt::from_u8(1)),
        );
        stream.on_reset_ack();
        assert!(stream.is_terminal());
    }
}
