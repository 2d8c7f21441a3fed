// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ordered reassembly of stream and crypto data
//!
//! Fragments arrive at arbitrary offsets; the application only ever
//! observes a gap-free prefix. Out-of-order fragments are buffered in an
//! ordered set and coalesced with their neighbors.

use bytes::Bytes;
use core::fmt;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-2.2
    //# An endpoint could receive data for a stream at the
    //# same stream offset multiple times.  Data that has already been
    //# received can be discarded.  The data at a given offset MUST NOT
    //# change if it is sent multiple times; an endpoint MAY treat receipt
    //# of different data at the same offset within a stream as a connection
    //# error of type PROTOCOL_VIOLATION.
    MismatchedData,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MismatchedData => write!(f, "overlapping fragments carried different data"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Default)]
pub struct Reassembler {
    /// Offset of the first byte not yet handed to the reader
    start_offset: u64,
    /// Pending fragments keyed by their start offset; pairwise disjoint and
    /// non-adjacent
    fragments: BTreeMap<u64, Vec<u8>>,
    buffered: usize,
}

impl fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reassembler")
            .field("start_offset", &self.start_offset)
            .field("fragments", &self.fragments.len())
            .field("buffered", &self.buffered)
            .finish()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The offset up to which every byte was delivered to the reader
    #[inline]
    pub fn consumed_offset(&self) -> u64 {
        self.start_offset
    }

    /// The number of bytes currently buffered out of order or undelivered
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffered
    }

    /// True if the next in-order chunk is ready
    #[inline]
    pub fn is_data_available(&self) -> bool {
        self.fragments
            .first_key_value()
            .map_or(false, |(offset, _)| *offset == self.start_offset)
    }

    /// True if every byte up to `final_size` was delivered or is buffered
    /// contiguously
    pub fn is_complete_up_to(&self, final_size: u64) -> bool {
        let mut reach = self.start_offset;
        for (offset, data) in &self.fragments {
            if *offset > reach {
                return false;
            }
            reach = reach.max(offset + data.len() as u64);
        }
        reach >= final_size
    }

    /// Writes a fragment, verifying overlapping bytes match what was
    /// previously received.
    ///
    /// Returns `true` if new in-order data became available.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<bool, Error> {
        let mut offset = offset;
        let mut data = data;

        // trim bytes that were already delivered; their content can no
        // longer be verified
        if offset < self.start_offset {
            let skip = (self.start_offset - offset).min(data.len() as u64) as usize;
            data = &data[skip..];
            offset = self.start_offset;
        }

        if data.is_empty() {
            return Ok(false);
        }
        let end = offset + data.len() as u64;

        // collect every stored fragment touching [offset, end]
        let mut merged_start = offset;
        let mut merged_end = end;
        let mut to_merge = vec![];
        for (frag_offset, frag) in self.fragments.range(..end.saturating_add(1)) {
            let frag_end = frag_offset + frag.len() as u64;
            if frag_end < offset {
                continue;
            }
            // verify the intersection carries identical bytes
            let overlap_start = offset.max(*frag_offset);
            let overlap_end = end.min(frag_end);
            if overlap_start < overlap_end {
                let new = &data[(overlap_start - offset) as usize..(overlap_end - offset) as usize];
                let old = &frag[(overlap_start - frag_offset) as usize
                    ..(overlap_end - frag_offset) as usize];
                if new != old {
                    return Err(Error::MismatchedData);
                }
            }
            merged_start = merged_start.min(*frag_offset);
            merged_end = merged_end.max(frag_end);
            to_merge.push(*frag_offset);
        }

        if to_merge.len() == 1 {
            let frag_offset = to_merge[0];
            let frag_len = self.fragments[&frag_offset].len() as u64;
            if frag_offset <= offset && end <= frag_offset + frag_len {
                // fully duplicate data
                return Ok(false);
            }
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        merged[(offset - merged_start) as usize..(end - merged_start) as usize]
            .copy_from_slice(data);
        for frag_offset in to_merge {
            let frag = self
                .fragments
                .remove(&frag_offset)
                .expect("fragment was just listed");
            self.buffered -= frag.len();
            let at = (frag_offset - merged_start) as usize;
            merged[at..at + frag.len()].copy_from_slice(&frag);
        }

        self.buffered += merged.len();
        self.fragments.insert(merged_start, merged);

        Ok(merged_start == self.start_offset)
    }

    /// Removes and returns the next in-order chunk, if any
    pub fn pop(&mut self) -> Option<Bytes> {
        let (offset, _) = self.fragments.first_key_value()?;
        if *offset != self.start_offset {
            return None;
        }

        let (offset, data) = self.fragments.pop_first().expect("checked above");
        self.start_offset = offset + data.len() as u64;
        self.buffered -= data.len();
        Some(data.into())
    }

    /// Reads up to `buf.len()` in-order bytes, returning the amount copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some((offset, data)) = self.fragments.first_key_value() else {
                break;
            };
            if *offset != self.start_offset {
                break;
            }

            let take = data.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&data[..take]);
            copied += take;

            if take == data.len() {
                let (offset, data) = self.fragments.pop_first().expect("checked above");
                self.start_offset = offset + data.len() as u64;
                self.buffered -= data.len();
            } else {
                // split the fragment; the tail stays buffered
                let (offset, mut data) = self.fragments.pop_first().expect("checked above");
                let tail = data.split_off(take);
                self.buffered -= take;
                self.start_offset = offset + take as u64;
                self.fragments.insert(self.start_offset, tail);
            }
        }
        copied
    }

    /// Discards all buffered data, as after RESET_STREAM
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_test() {
        let mut buffer = Reassembler::new();

        assert!(buffer.write_at(0, b"hello").unwrap());
        assert!(buffer.is_data_available());
        assert_eq!(buffer.pop().unwrap(), &b"hello"[..]);
        assert_eq!(buffer.consumed_offset(), 5);
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn reorder_test() {
        let mut buffer = Reassembler::new();

        // offsets 0/10/5, lengths 5/5/5, delivered out of order
        assert!(!buffer.write_at(10, b"CCCCC").unwrap());
        assert!(buffer.write_at(0, b"AAAAA").unwrap());
        assert!(!buffer.is_complete_up_to(15));
        assert!(buffer.write_at(5, b"BBBBB").unwrap());
        assert!(buffer.is_complete_up_to(15));

        let mut out = vec![];
        while let Some(chunk) = buffer.pop() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"AAAAABBBBBCCCCC");
    }

    #[test]
    fn duplicate_and_overlap_test() {
        let mut buffer = Reassembler::new();

        buffer.write_at(0, b"abcdef").unwrap();

        // exact duplicates are dropped
        assert!(!buffer.write_at(0, b"abcdef").unwrap());

        // a matching overlap extends the buffer
        buffer.write_at(4, b"efgh").unwrap();
        assert_eq!(buffer.pop().unwrap(), &b"abcdefgh"[..]);

        // bytes already delivered are ignored, whatever they claim
        assert!(!buffer.write_at(0, b"zzzzzzzz").unwrap());
    }

    #[test]
    fn mismatched_overlap_test() {
        let mut buffer = Reassembler::new();

        buffer.write_at(10, b"world").unwrap();
        assert_eq!(
            buffer.write_at(10, b"wersld"),
            Err(Error::MismatchedData)
        );
    }

    #[test]
    fn read_split_test() {
        let mut buffer = Reassembler::new();
        buffer.write_at(0, b"hello world").unwrap();

        let mut out = [0u8; 5];
        assert_eq!(buffer.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(buffer.consumed_offset(), 5);

        let mut out = [0u8; 32];
        assert_eq!(buffer.read(&mut out), 6);
        assert_eq!(&out[..6], b" world");
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn gap_coalescing_test() {
        let mut buffer = Reassembler::new();

        buffer.write_at(2, b"c").unwrap();
        buffer.write_at(6, b"g").unwrap();
        buffer.write_at(4, b"e").unwrap();
        // one write bridging every gap
        assert!(buffer.write_at(0, b"abcdefgh").unwrap());

        assert_eq!(buffer.pop().unwrap(), &b"abcdefgh"[..]);
    }
}
