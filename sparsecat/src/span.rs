// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Queue of pending output spans shared by the encoder and decoder.
//!
//! Instead of chaining nested readers, each session keeps an explicit queue of
//! what it still has to emit: in-memory bytes (frame headers or prefetched
//! data), runs of zeros (holes), and bounded pass-through copies from the
//! underlying reader. The queue is drained front to back by [`SpanQueue::read`].

use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected {expected} bytes of section data, but reached EOF after {actual} bytes")]
    Truncated { expected: u64, actual: u64 },
    #[error("Failed to read section data")]
    DataRead(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, PartialEq, Eq)]
pub enum Span {
    /// In-memory bytes. `pos` is the number of bytes already emitted.
    Bytes { data: Vec<u8>, pos: usize },
    /// A run of zero bytes.
    Zeros { remain: u64 },
    /// Bytes passed through from the underlying reader. `length` is the total
    /// size of the span and is only kept for error reporting.
    Copy { length: u64, remain: u64 },
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes { data, pos } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("pos", pos)
                .finish(),
            Self::Zeros { remain } => f.debug_struct("Zeros").field("remain", remain).finish(),
            Self::Copy { length, remain } => f
                .debug_struct("Copy")
                .field("length", length)
                .field("remain", remain)
                .finish(),
        }
    }
}

impl Span {
    /// Number of bytes left to emit.
    pub fn remaining(&self) -> u64 {
        match self {
            Self::Bytes { data, pos } => (data.len() - pos) as u64,
            Self::Zeros { remain } | Self::Copy { remain, .. } => *remain,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpanQueue {
    spans: VecDeque<Span>,
}

impl SpanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.spans.push_back(Span::Bytes { data, pos: 0 });
        }
    }

    pub fn push_zeros(&mut self, size: u64) {
        if size != 0 {
            self.spans.push_back(Span::Zeros { remain: size });
        }
    }

    pub fn push_copy(&mut self, size: u64) {
        if size != 0 {
            self.spans.push_back(Span::Copy {
                length: size,
                remain: size,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter()
    }

    /// Total number of bytes left to emit across all spans.
    pub fn remaining(&self) -> u64 {
        self.spans
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.remaining()))
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    /// Emit bytes from the front span into `buf`, reading from `inner` for
    /// pass-through spans. At most one span contributes to a single call.
    /// Returns 0 only when `buf` is empty or the queue is exhausted. If
    /// `inner` reaches EOF before a pass-through span is satisfied,
    /// [`Error::Truncated`] is returned.
    pub fn read(&mut self, mut inner: impl Read, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while let Some(span) = self.spans.front_mut() {
            let n = match span {
                Span::Bytes { data, pos } => {
                    let n = (data.len() - *pos).min(buf.len());
                    buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                    *pos += n;
                    n
                }
                Span::Zeros { remain } => {
                    let n = (*remain).min(buf.len() as u64) as usize;
                    buf[..n].fill(0);
                    *remain -= n as u64;
                    n
                }
                Span::Copy { length, remain } => {
                    let to_read = (*remain).min(buf.len() as u64) as usize;

                    let n = loop {
                        match inner.read(&mut buf[..to_read]) {
                            Ok(n) => break n,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(Error::DataRead(e)),
                        }
                    };

                    if n == 0 {
                        return Err(Error::Truncated {
                            expected: *length,
                            actual: *length - *remain,
                        });
                    }

                    *remain -= n as u64;
                    n
                }
            };

            if span.remaining() == 0 {
                self.spans.pop_front();
            }

            if n != 0 {
                return Ok(n);
            }
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn drain(queue: &mut SpanQueue, mut inner: impl Read, buf_size: usize) -> Result<Vec<u8>> {
        let mut result = vec![];
        let mut buf = vec![0u8; buf_size];

        loop {
            let n = queue.read(&mut inner, &mut buf)?;
            if n == 0 {
                break;
            }

            result.extend_from_slice(&buf[..n]);
        }

        Ok(result)
    }

    #[test]
    fn empty_spans_are_skipped() {
        let mut queue = SpanQueue::new();
        queue.push_bytes(vec![]);
        queue.push_zeros(0);
        queue.push_copy(0);

        assert!(queue.is_empty());
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn drain_in_order() {
        for buf_size in [1, 2, 3, 7, 64] {
            let mut queue = SpanQueue::new();
            queue.push_bytes(b"hdr".to_vec());
            queue.push_zeros(4);
            queue.push_copy(5);
            queue.push_bytes(b"!".to_vec());
            assert_eq!(queue.len(), 4);
            assert_eq!(queue.remaining(), 13);

            let data = drain(&mut queue, Cursor::new(b"abcdefgh"), buf_size).unwrap();
            assert_eq!(data, b"hdr\0\0\0\0abcde!");
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn single_span_per_read() {
        let mut queue = SpanQueue::new();
        queue.push_bytes(b"ab".to_vec());
        queue.push_zeros(2);

        let mut buf = [0xffu8; 8];
        assert_eq!(queue.read(io::empty(), &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_matches!(queue.iter().next(), Some(Span::Zeros { remain: 2 }));

        assert_eq!(queue.read(io::empty(), &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"\0\0");
        assert_eq!(queue.read(io::empty(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncated_copy() {
        let mut queue = SpanQueue::new();
        queue.push_copy(10);

        let err = drain(&mut queue, Cursor::new(b"abcd"), 3).unwrap_err();
        assert_matches!(
            err,
            Error::Truncated {
                expected: 10,
                actual: 4
            }
        );
    }
}
