// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Reconstruction of a file from a framed stream.
//!
//! A [`Decoder`] has two output modes sharing one parsing state machine:
//!
//! * Generic mode ([`Read`] and [`Decoder::copy_to`]) produces every byte of
//!   the logical file, with holes materialized as zeros.
//! * Direct mode ([`Decoder::write_sparse`]) resizes a [`SparseTarget`] to
//!   the declared size and writes only the data frames at their offsets.

use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    format::{self, Format, SectionHeader, Segment},
    hole::{self, SparseTarget},
    span::{self, SpanQueue},
    stream::{self, ReadDiscardExt},
    util::NumBytes,
};

const COPY_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse stream")]
    Format(#[from] format::Error),
    #[error("Empty segment at offset {offset}")]
    EmptySegment { offset: u64 },
    #[error("Segment {segment:?} starts before current offset {cursor}")]
    SegmentBeforeCursor { segment: Segment, cursor: u64 },
    #[error("Segment {segment:?} extends beyond file size {size}")]
    SegmentBeyondSize { segment: Segment, size: u64 },
    #[error("Decoder session has already started")]
    NotFresh,
    #[error("Decoder session already failed")]
    Failed,
    #[error("Failed to read section data")]
    Span(#[from] span::Error),
    #[error("Failed to query output file")]
    Metadata(#[source] io::Error),
    #[error("Failed to resize output to {size} bytes")]
    Resize {
        size: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to seek output to offset {offset}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write output at offset {offset}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Decoding was cancelled")]
    Cancelled(#[source] io::Error),
}

impl Error {
    /// Whether the stream ended before it was complete.
    pub fn is_truncated(&self) -> bool {
        match self {
            Self::Format(e) => e.is_truncated(),
            Self::Span(span::Error::Truncated { .. }) => true,
            _ => false,
        }
    }

    /// Whether the stream is malformed.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Format(format::Error::MissingSizeFrame { .. })
                | Self::Format(format::Error::InvalidSectionTag(_))
                | Self::EmptySegment { .. }
                | Self::SegmentBeforeCursor { .. }
                | Self::SegmentBeyondSize { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = if e.is_truncated() {
            io::ErrorKind::UnexpectedEof
        } else if e.is_protocol() {
            io::ErrorKind::InvalidData
        } else {
            match &e {
                Error::Format(format::Error::DataRead(_, source))
                | Error::Span(span::Error::DataRead(source))
                | Error::Write { source, .. }
                | Error::Cancelled(source) => source.kind(),
                _ => io::ErrorKind::Other,
            }
        };

        Self::new(kind, e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The size frame has not been read yet.
    Start,
    /// Awaiting the next section header or inside a section.
    Sections,
    /// The end frame has been read.
    Done,
    /// A previous operation failed. The stream position is unknown.
    Failed,
}

/// Size and layout of a stream, as reported by [`Decoder::inspect`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub size: u64,
    pub segments: Vec<Segment>,
}

impl StreamInfo {
    /// Total number of payload bytes.
    pub fn data_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.length).sum()
    }
}

/// Parses a framed stream.
pub struct Decoder<R> {
    reader: R,
    format: &'static dyn Format,
    state: State,
    /// Only valid after the size frame has been read.
    size: u64,
    /// Logical offset up to which output has been queued.
    cursor: u64,
    spans: SpanQueue,
    segments: u64,
    data_bytes: u64,
}

impl<R> fmt::Debug for Decoder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("format", &self.format.name())
            .field("state", &self.state)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .field("spans", &self.spans)
            .field("segments", &self.segments)
            .field("data_bytes", &self.data_bytes)
            .finish_non_exhaustive()
    }
}

impl<R: Read> Decoder<R> {
    /// Create a decoder. Nothing is read until the first operation.
    pub fn new(reader: R, format: &'static dyn Format) -> Self {
        Self {
            reader,
            format,
            state: State::Start,
            size: 0,
            cursor: 0,
            spans: SpanQueue::new(),
            segments: 0,
            data_bytes: 0,
        }
    }

    /// Number of data frames read so far.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Number of payload bytes declared by the data frames read so far.
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done && self.spans.is_empty()
    }

    /// Nothing besides the size frame has been consumed.
    fn is_fresh(&self) -> bool {
        match self.state {
            State::Start => true,
            State::Sections => self.segments == 0 && self.spans.is_empty(),
            State::Done | State::Failed => false,
        }
    }

    /// Run `f` and poison the session if it fails.
    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.state == State::Failed {
            return Err(Error::Failed);
        }

        let result = f(self);
        if result.is_err() {
            self.state = State::Failed;
            self.spans.clear();
        }

        result
    }

    fn read_size(&mut self) -> Result<u64> {
        if self.state == State::Start {
            self.size = self.format.read_file_size(&mut self.reader)?;
            self.state = State::Sections;

            debug!("Stream declares file size of {}", NumBytes(self.size));
        }

        Ok(self.size)
    }

    /// Logical size of the file. The size frame is read if it hasn't been
    /// already.
    pub fn file_size(&mut self) -> Result<u64> {
        self.guard(Self::read_size)
    }

    /// Read and validate the next section header. On success, the cursor is
    /// moved to the end of the segment and the caller is responsible for
    /// consuming exactly [`Segment::length`] payload bytes.
    fn next_segment(&mut self) -> Result<Option<Segment>> {
        let segment = match self.format.read_section_header(&mut self.reader)? {
            SectionHeader::Data(segment) => segment,
            SectionHeader::End => {
                debug!(
                    "Decoded {} sections containing {}",
                    self.segments,
                    NumBytes(self.data_bytes),
                );

                self.state = State::Done;
                return Ok(None);
            }
        };

        if segment.is_empty() {
            return Err(Error::EmptySegment {
                offset: segment.offset,
            });
        } else if segment.offset < self.cursor {
            return Err(Error::SegmentBeforeCursor {
                segment,
                cursor: self.cursor,
            });
        }

        let end = match segment.end() {
            Some(end) if end <= self.size => end,
            _ => {
                return Err(Error::SegmentBeyondSize {
                    segment,
                    size: self.size,
                });
            }
        };

        trace!("Received section: {segment:?}");

        self.cursor = end;
        self.segments += 1;
        self.data_bytes += segment.length;

        Ok(Some(segment))
    }

    fn read_generic(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.spans.is_empty() {
                return Ok(self.spans.read(&mut self.reader, buf)?);
            }

            match self.state {
                State::Start => {
                    self.read_size()?;
                }
                State::Sections => {
                    let prev = self.cursor;

                    match self.next_segment()? {
                        Some(segment) => {
                            self.spans.push_zeros(segment.offset - prev);
                            self.spans.push_copy(segment.length);
                        }
                        None => {
                            self.spans.push_zeros(self.size - prev);
                            self.cursor = self.size;
                        }
                    }
                }
                State::Done => return Ok(0),
                State::Failed => return Err(Error::Failed),
            }
        }
    }

    /// Generic mode: write the entire logical file to `writer`, including the
    /// zeros of the holes. Returns the number of bytes written, which is
    /// always the declared file size.
    pub fn copy_to(&mut self, mut writer: impl Write, cancel_signal: &AtomicBool) -> Result<u64> {
        self.guard(|this| {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut written = 0;

            loop {
                stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

                let n = this.read_generic(&mut buf)?;
                if n == 0 {
                    break;
                }

                writer
                    .write_all(&buf[..n])
                    .map_err(|e| Error::Write {
                        offset: written,
                        source: e,
                    })?;

                written += n as u64;
            }

            writer.flush().map_err(|e| Error::Write {
                offset: written,
                source: e,
            })?;

            Ok(written)
        })
    }

    /// Direct mode: resize `target` to the declared file size and write only
    /// the data frames at their offsets. Holes are never written. Returns the
    /// number of payload bytes written.
    ///
    /// This must be called before anything past the size frame is consumed.
    pub fn write_sparse(
        &mut self,
        mut target: impl SparseTarget,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        if self.state == State::Failed {
            return Err(Error::Failed);
        } else if !self.is_fresh() {
            return Err(Error::NotFresh);
        }

        self.guard(|this| {
            let size = this.read_size()?;

            target
                .sparse_resize(size)
                .map_err(|e| Error::Resize { size, source: e })?;

            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut written = 0;

            while let Some(segment) = this.next_segment()? {
                stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

                target
                    .seek(SeekFrom::Start(segment.offset))
                    .map_err(|e| Error::Seek {
                        offset: segment.offset,
                        source: e,
                    })?;

                this.spans.push_copy(segment.length);

                let mut offset = segment.offset;

                while !this.spans.is_empty() {
                    stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

                    let n = this.spans.read(&mut this.reader, &mut buf)?;

                    target
                        .write_all(&buf[..n])
                        .map_err(|e| Error::Write { offset, source: e })?;

                    offset += n as u64;
                }

                written += segment.length;
            }

            target.flush().map_err(|e| Error::Write {
                offset: size,
                source: e,
            })?;

            Ok(written)
        })
    }

    /// Walk the rest of the stream without reconstructing the file, skipping
    /// over the payloads. This must be called on a fresh session.
    pub fn inspect(&mut self) -> Result<StreamInfo> {
        if self.state == State::Failed {
            return Err(Error::Failed);
        } else if !self.is_fresh() {
            return Err(Error::NotFresh);
        }

        self.guard(|this| {
            let size = this.read_size()?;
            let mut segments = vec![];

            while let Some(segment) = this.next_segment()? {
                let n = this
                    .reader
                    .read_discard(segment.length)
                    .map_err(span::Error::DataRead)?;
                if n != segment.length {
                    return Err(span::Error::Truncated {
                        expected: segment.length,
                        actual: n,
                    }
                    .into());
                }

                segments.push(segment);
            }

            Ok(StreamInfo { size, segments })
        })
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.guard(|this| this.read_generic(buf))
            .map_err(io::Error::from)
    }
}

/// How a decoded stream is written to its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Direct,
    Generic,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Generic => f.write_str("generic"),
        }
    }
}

/// Direct mode is used only if permitted and if `file` is a regular file not
/// opened for appending. Anything else silently uses generic mode.
pub fn select_output_mode(file: &File, allow_direct: bool) -> io::Result<OutputMode> {
    if allow_direct && hole::is_direct_capable(file)? {
        Ok(OutputMode::Direct)
    } else {
        Ok(OutputMode::Generic)
    }
}

/// Decode the entire stream into `file` using the mode chosen by
/// [`select_output_mode`].
pub fn decode_to_file<R: Read>(
    decoder: &mut Decoder<R>,
    file: &mut File,
    allow_direct: bool,
    cancel_signal: &AtomicBool,
) -> Result<OutputMode> {
    let mode = select_output_mode(file, allow_direct).map_err(Error::Metadata)?;
    debug!("Writing output in {mode} mode");

    match mode {
        OutputMode::Direct => {
            decoder.write_sparse(&mut *file, cancel_signal)?;
        }
        OutputMode::Generic => {
            decoder.copy_to(&mut *file, cancel_signal)?;
        }
    }

    Ok(mode)
}
