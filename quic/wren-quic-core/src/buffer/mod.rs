// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

mod reassembler;

pub use reassembler::{Error, Reassembler};
