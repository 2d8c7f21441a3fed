// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::state::{event, is};

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
//#        o
//#        | Create Stream (Sending)
//#        | Peer Creates Bidirectional Stream
//#        v
//#    +-------+
//#    | Ready | Send RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM /             |
//#        |      STREAM_DATA_BLOCKED  |
//#        v                           |
//#    +-------+                       |
//#    | Send  | Send RESET_STREAM     |
//#    |       |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM + FIN         |
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  | Send RESET_STREAM | Reset |
//#    | Sent  |------------------>| Sent  |
//#    +-------+                   +-------+
//#        |                           |
//#        | Recv All ACKs             | Recv ACK
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Recvd |                   | Recvd |
//#    +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sender {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl Sender {
    is!(is_ready, Ready);
    is!(is_sending, Send);
    is!(is_data_sent, DataSent);
    is!(is_reset, ResetSent | ResetRecvd);
    is!(is_terminal, DataRecvd | ResetRecvd);

    event! {
        on_send(Ready => Send);
        on_send_fin(Ready | Send => DataSent);
        on_all_data_acked(DataSent => DataRecvd);

        on_reset(Ready | Send | DataSent => ResetSent);
        on_reset_acked(ResetSent => ResetRecvd);
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
//#        o
//#        | Recv STREAM / STREAM_DATA_BLOCKED / RESET_STREAM
//#        | Create Bidirectional Stream (Sending)
//#        v
//#    +-------+
//#    | Recv  | Recv RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Recv STREAM + FIN         |
//#        v                           |
//#    +-------+                       |
//#    | Size  | Recv RESET_STREAM     |
//#    | Known |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Recv All Data             |
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Recvd |                   | Recvd |
//#    +-------+                   +-------+
//#        |                           |
//#        | App Read All Data         | App Read Reset
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Read  |                   | Read  |
//#    +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Receiver {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl Receiver {
    is!(is_receiving, Recv);
    is!(is_size_known, SizeKnown);
    is!(is_data_received, DataRecvd);
    is!(is_reset, ResetRecvd | ResetRead);
    is!(is_terminal, DataRead | ResetRead);

    event! {
        on_receive_fin(Recv => SizeKnown);
        on_receive_all_data(SizeKnown => DataRecvd);
        on_app_read_all_data(DataRecvd => DataRead);

        on_reset(Recv | SizeKnown => ResetRecvd);
        on_app_read_reset(ResetRecvd => ResetRead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_happy_path_test() {
        let mut sender = Sender::default();
        assert!(sender.is_ready());

        sender.on_send().unwrap();
        assert!(sender.is_sending());

        sender.on_send_fin().unwrap();
        assert!(sender.is_data_sent());

        sender.on_all_data_acked().unwrap();
        assert!(sender.is_terminal());

        // no transitions out of a terminal state
        assert!(sender.on_send().is_err());
        assert!(sender.on_reset().is_err());
    }

    #[test]
    fn sender_reset_test() {
        let mut sender = Sender::default();
        sender.on_send().unwrap();
        sender.on_reset().unwrap();
        assert!(sender.is_reset());

        assert!(sender.on_send_fin().is_err());

        sender.on_reset_acked().unwrap();
        assert!(sender.is_terminal());
    }

    #[test]
    fn receiver_happy_path_test() {
        let mut receiver = Receiver::default();
        assert!(receiver.is_receiving());

        receiver.on_receive_fin().unwrap();
        assert!(receiver.is_size_known());

        receiver.on_receive_all_data().unwrap();
        assert!(receiver.is_data_received());

        receiver.on_app_read_all_data().unwrap();
        assert!(receiver.is_terminal());
    }

    #[test]
    fn receiver_reset_test() {
        let mut receiver = Receiver::default();
        receiver.on_reset().unwrap();
        assert!(receiver.is_reset());
        assert!(!receiver.is_terminal());

        receiver.on_app_read_reset().unwrap();
        assert!(receiver.is_terminal());
    }
}
