// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receiving half of a stream

use crate::sync::{Flag, IncomingFlowController, ValueSync};
use wren_quic_core::{
    buffer::{self, Reassembler},
    connection,
    event::{Event, StreamUpdateKind},
    frame,
    stream::{state::Receiver, StreamId},
    transmission,
    transport,
    transport_error,
    varint::VarInt,
};

#[derive(Debug)]
pub struct ReceiveStream {
    id: StreamId,
    state: Receiver,
    buffer: Reassembler,

    /// The highest offset seen on the stream
    highest_received: VarInt,
    /// The final size, once a FIN or RESET_STREAM pinned it
    final_size: Option<VarInt>,

    /// Stream-level credit granted to the peer
    max_stream_data_sync: ValueSync,
    window: VarInt,

    /// The application asked the peer to stop transmitting
    stop_sending: Option<VarInt>,
    stop_sending_sync: Flag,

    /// Error code of a peer reset
    reset_error: Option<VarInt>,
}

/// What a processed frame produced for the application
#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<Event>,
    /// New in-order data became readable
    pub readable: bool,
}

impl ReceiveStream {
    pub fn new(id: StreamId, initial_max_stream_data: VarInt) -> Self {
        Self {
            id,
            state: Receiver::default(),
            buffer: Reassembler::new(),
            highest_received: VarInt::ZERO,
            final_size: None,
            max_stream_data_sync: ValueSync::new(initial_max_stream_data),
            window: initial_max_stream_data,
            stop_sending: None,
            stop_sending_sync: Flag::default(),
            reset_error: None,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> &Receiver {
        &self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffer.buffered_len()
    }

    /// True if a read would make progress (data, a FIN, or a reset)
    pub fn is_readable(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.reset_error.is_some() {
            return true;
        }
        if self.buffer.is_data_available() {
            return true;
        }
        // a FIN with every byte consumed still needs one read to observe
        // the end of stream
        self.final_size
            .map_or(false, |final_size| {
                self.buffer.consumed_offset() == final_size.as_u64()
                    && self.state.is_data_received()
            })
    }

    /// Processes a STREAM frame for this stream
    pub fn on_stream_frame(
        &mut self,
        frame: &frame::Stream<&[u8]>,
        connection_flow: &mut IncomingFlowController,
    ) -> Result<Outcome, transport::Error> {
        let mut outcome = Outcome::default();

        if self.state.is_reset() || self.state.is_terminal() {
            // data for an abandoned stream is dropped on the floor
            return Ok(outcome);
        }

        let offset = frame.offset;
        let len = frame.data.len();
        let end = offset
            .checked_add_usize(len)
            .ok_or_else(|| transport_error!(FLOW_CONTROL_ERROR, "stream offset overflow"))?;

        if let Some(final_size) = self.final_size {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
            //# Once a final size for a stream is known, it cannot change.  If a
            //# RESET_STREAM or STREAM frame is received indicating a change in the
            //# final size for the stream, an endpoint SHOULD respond with an error
            //# of type FINAL_SIZE_ERROR
            if end > final_size || (frame.is_fin && end != final_size) {
                return Err(transport_error!(FINAL_SIZE_ERROR, "data beyond final size"));
            }
        }

        if frame.is_fin && end < self.highest_received {
            return Err(transport_error!(
                FINAL_SIZE_ERROR,
                "final size below received data"
            ));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised connection
        //# or stream data limits
        if end > self.max_stream_data_sync.value() {
            return Err(transport_error!(
                FLOW_CONTROL_ERROR,
                "peer exceeded stream data limit"
            ));
        }

        // connection credit covers the growth of the highest offset
        if end > self.highest_received {
            connection_flow.on_data_received(end - self.highest_received)?;
            self.highest_received = end;
        }

        let was_available = self.buffer.is_data_available();
        let first_data = self.buffer.consumed_offset() == 0 && self.buffer.buffered_len() == 0;

        match self.buffer.write_at(offset.as_u64(), frame.data) {
            Ok(_) => {}
            Err(buffer::Error::MismatchedData) => {
                return Err(transport_error!(
                    PROTOCOL_VIOLATION,
                    "overlapping stream data did not match"
                ));
            }
        }

        if first_data && (len > 0 || frame.is_fin) {
            outcome.events.push(Event::StreamUpdate {
                id: self.id,
                kind: StreamUpdateKind::Opened,
            });
        }

        if frame.is_fin && self.final_size.is_none() {
            self.final_size = Some(end);
            let _ = self.state.on_receive_fin();
            outcome.events.push(Event::StreamUpdate {
                id: self.id,
                kind: StreamUpdateKind::SizeKnown,
            });
        }

        if let Some(final_size) = self.final_size {
            if self.state.is_size_known() && self.buffer.is_complete_up_to(final_size.as_u64()) {
                let _ = self.state.on_receive_all_data();
                outcome.events.push(Event::StreamUpdate {
                    id: self.id,
                    kind: StreamUpdateKind::DataReceived,
                });
            }
        }

        outcome.readable = !was_available && self.buffer.is_data_available();
        Ok(outcome)
    }

    /// Processes a RESET_STREAM frame
    pub fn on_reset(
        &mut self,
        frame: &frame::ResetStream,
        connection_flow: &mut IncomingFlowController,
    ) -> Result<Outcome, transport::Error> {
        let mut outcome = Outcome::default();

        if let Some(final_size) = self.final_size {
            if final_size != frame.final_size {
                return Err(transport_error!(
                    FINAL_SIZE_ERROR,
                    "reset changed the final size"
                ));
            }
        }
        if frame.final_size < self.highest_received {
            return Err(transport_error!(
                FINAL_SIZE_ERROR,
                "reset below received data"
            ));
        }

        if self.state.on_reset().is_err() {
            // already reset or fully received; nothing changes
            return Ok(outcome);
        }

        // the unreceived tail still consumes connection credit
        connection_flow.on_data_received(frame.final_size - self.highest_received)?;
        self.highest_received = frame.final_size;
        self.final_size = Some(frame.final_size);
        self.reset_error = Some(frame.application_error_code);
        self.buffer.reset();

        outcome.events.push(Event::StreamUpdate {
            id: self.id,
            kind: StreamUpdateKind::ResetReceived {
                error_code: frame.application_error_code,
            },
        });
        outcome.readable = true;
        Ok(outcome)
    }

    /// Reads in-order data into `buf`; the bool reports end of stream
    pub fn read(
        &mut self,
        buf: &mut [u8],
        connection_flow: &mut IncomingFlowController,
    ) -> Result<(usize, bool), connection::Error> {
        if let Some(error_code) = self.reset_error {
            let _ = self.state.on_app_read_reset();
            return Err(connection::Error::StreamReset(error_code));
        }

        let copied = self.buffer.read(buf);
        if copied > 0 {
            let len = VarInt::try_from(copied).map_err(|_| connection::Error::InvalidArgument)?;
            connection_flow.on_data_consumed(len);
            self.release_stream_credit(len);
        }

        let at_end = self
            .final_size
            .map_or(false, |final_size| self.buffer.consumed_offset() == final_size.as_u64());

        if at_end && self.state.is_data_received() {
            let _ = self.state.on_app_read_all_data();
        }

        if copied == 0 && !at_end {
            return Err(connection::Error::WouldBlock);
        }

        Ok((copied, at_end))
    }

    fn release_stream_credit(&mut self, len: VarInt) {
        // no point growing the window once the size is known
        if self.final_size.is_some() {
            let _ = len;
            return;
        }

        let consumed = VarInt::new(self.buffer.consumed_offset()).expect("offset is a varint");
        let target = consumed.saturating_add(self.window);
        let unannounced = target.saturating_sub(self.max_stream_data_sync.value());
        if unannounced.as_u64() * 2 >= self.window.as_u64() {
            self.max_stream_data_sync.request_delivery(target);
        }
    }

    /// Asks the peer to stop sending
    pub fn stop_sending(&mut self, error_code: VarInt) {
        if self.state.is_terminal() || self.state.is_reset() || self.final_size.is_some() {
            return;
        }
        if self.stop_sending.is_none() {
            self.stop_sending = Some(error_code);
            self.stop_sending_sync.request_delivery();
        }
    }

    /// The STOP_SENDING frame to transmit, if one is due
    pub fn stop_sending_transmission(&mut self) -> Option<VarInt> {
        if self.stop_sending_sync.needs_transmission() {
            self.stop_sending
        } else {
            None
        }
    }

    #[inline]
    pub fn stop_sending_sync(&mut self) -> &mut Flag {
        &mut self.stop_sending_sync
    }

    #[inline]
    pub fn max_stream_data_sync(&mut self) -> &mut ValueSync {
        &mut self.max_stream_data_sync
    }

    pub fn transmission_interest(&self, interest: &mut transmission::Interest) {
        self.max_stream_data_sync.transmission_interest(interest);
        self.stop_sending_sync.transmission_interest(interest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::{endpoint, stream::StreamType};

    fn stream() -> (ReceiveStream, IncomingFlowController) {
        let id = StreamId::initial(endpoint::Type::Server, StreamType::Bidirectional);
        (
            ReceiveStream::new(id, VarInt::from_u32(1000)),
            IncomingFlowController::new(VarInt::from_u32(10_000)),
        )
    }

    fn stream_frame(offset: u32, data: &[u8], is_fin: bool) -> frame::Stream<&[u8]> {
        frame::Stream {
            stream_id: VarInt::from_u8(1),
            offset: VarInt::from_u32(offset),
            is_last_frame: false,
            is_fin,
            data,
        }
    }

    #[test]
    fn reordered_frames_test() {
        let (mut stream, mut fc) = stream();

        // offsets 0/10/5, lengths 5/5/5, FIN on the last chunk
        let outcome = stream
            .on_stream_frame(&stream_frame(10, b"CCCCC", true), &mut fc)
            .unwrap();
        assert!(!outcome.readable);
        assert!(stream.state().is_size_known());

        stream
            .on_stream_frame(&stream_frame(0, b"AAAAA", false), &mut fc)
            .unwrap();
        let outcome = stream
            .on_stream_frame(&stream_frame(5, b"BBBBB", false), &mut fc)
            .unwrap();
        assert!(stream.state().is_data_received());
        assert!(outcome
            .events
            .iter()
            .any(|event| matches!(event, Event::StreamUpdate { kind: StreamUpdateKind::DataReceived, .. })));

        let mut buf = [0u8; 32];
        let (len, is_fin) = stream.read(&mut buf, &mut fc).unwrap();
        assert_eq!(&buf[..len], b"AAAAABBBBBCCCCC");
        assert!(is_fin);
        assert!(stream.is_terminal());
    }

    #[test]
    fn flow_control_violation_test() {
        let id = StreamId::initial(endpoint::Type::Server, StreamType::Bidirectional);
        let mut stream = ReceiveStream::new(id, VarInt::from_u32(10));
        let mut fc = IncomingFlowController::new(VarInt::from_u32(10_000));

        let error = stream
            .on_stream_frame(&stream_frame(8, b"abc", false), &mut fc)
            .unwrap_err();
        assert_eq!(error.code, transport::Error::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn final_size_violation_test() {
        let (mut stream, mut fc) = stream();

        stream
            .on_stream_frame(&stream_frame(0, b"abcde", true), &mut fc)
            .unwrap();

        let error = stream
            .on_stream_frame(&stream_frame(5, b"x", false), &mut fc)
            .unwrap_err();
        assert_eq!(error.code, transport::Error::FINAL_SIZE_ERROR);
    }

    #[test]
    fn credit_replenish_test() {
        let id = StreamId::initial(endpoint::Type::Server, StreamType::Bidirectional);
        let mut stream = ReceiveStream::new(id, VarInt::from_u32(100));
        let mut fc = IncomingFlowController::new(VarInt::from_u32(10_000));

        stream
            .on_stream_frame(&stream_frame(0, &[0x61; 80], false), &mut fc)
            .unwrap();

        let mut buf = [0u8; 80];
        let error = stream.read(&mut buf, &mut fc);
        assert!(matches!(error, Ok((80, false))));

        // consuming over half the window schedules MAX_STREAM_DATA
        let value = stream.max_stream_data_sync().transmission_value().unwrap();
        assert_eq!(value, VarInt::from_u32(180));
    }

    #[test]
    fn reset_test() {
        let (mut stream, mut fc) = stream();

        stream
            .on_stream_frame(&stream_frame(0, b"abc", false), &mut fc)
            .unwrap();

        let frame = frame::ResetStream {
            stream_id: VarInt::from_u8(1),
            application_error_code: VarInt::from_u32(7),
            final_size: VarInt::from_u32(100),
        };
        let outcome = stream.on_reset(&frame, &mut fc).unwrap();
        assert!(outcome.readable);

        let mut buf = [0u8; 8];
        let error = stream.read(&mut buf, &mut fc).unwrap_err();
        assert_eq!(error, connection::Error::StreamReset(VarInt::from_u32(7)));
        assert!(stream.is_terminal());

        // duplicate resets are no-ops
        assert!(stream.on_reset(&frame, &mut fc).unwrap().events.is_empty());
    }

    #[test]
    fn mismatched_retransmission_test() {
        let (mut stream, mut fc) = stream();

        stream
            .on_stream_frame(&stream_frame(0, b"abc", false), &mut fc)
            .unwrap();
        let error = stream
            .on_stream_frame(&stream_frame(0, b"abX", false), &mut fc)
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION);
    }
}
