// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Lazy generation of a framed stream from a seekable source.
//!
//! The [`Encoder`] implements [`Read`]. Each call emits at most one pending
//! span: the size frame, a data frame header, a data payload, or the end
//! frame. Data regions are discovered only once the previous one has been
//! fully emitted, so nothing beyond one frame header and one prefetched
//! buffer is held in memory.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    format::{Format, Segment},
    hole::{self, DataRegion, DetectMode, HoleDetector},
    span::{self, SpanQueue},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Detector reported empty segment at offset {offset}")]
    EmptySegment { offset: u64 },
    #[error("Detector reported segment {segment:?} before end of previous segment {prev_end}")]
    RegressingSegment { segment: Segment, prev_end: u64 },
    #[error("Detector reported segment {segment:?} beyond file size {size}")]
    SegmentOutOfBounds { segment: Segment, size: u64 },
    #[error("Encoder session already failed")]
    Failed,
    #[error("Failed to probe source file")]
    Probe(#[source] hole::Error),
    #[error("Failed to find data after offset {offset}")]
    Detect {
        offset: u64,
        #[source]
        source: hole::Error,
    },
    #[error("Failed to seek source to offset {offset}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read section data")]
    Span(#[from] span::Error),
}

impl Error {
    /// Whether this error indicates a defect in the hole detector.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::EmptySegment { .. }
                | Self::RegressingSegment { .. }
                | Self::SegmentOutOfBounds { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Span(span::Error::Truncated { .. }) => io::ErrorKind::UnexpectedEof,
            Error::Span(span::Error::DataRead(source)) | Error::Seek { source, .. } => {
                source.kind()
            }
            _ => io::ErrorKind::Other,
        };

        Self::new(kind, e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The size frame has not been queued yet.
    Start,
    /// Between or inside data frames.
    Sections,
    /// The end frame has been queued.
    Done,
    /// A previous read failed. The stream is unusable.
    Failed,
}

/// Produces the framed stream for a source file.
pub struct Encoder<F> {
    file: F,
    size: u64,
    format: &'static dyn Format,
    detector: Box<dyn HoleDetector<F>>,
    max_section_size: Option<u64>,
    state: State,
    /// End of the last emitted segment.
    offset: u64,
    /// Remainder of a region that was split by `max_section_size`.
    pending: Option<DataRegion>,
    spans: SpanQueue,
    segments: u64,
    data_bytes: u64,
}

impl<F> std::fmt::Debug for Encoder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("size", &self.size)
            .field("format", &self.format.name())
            .field("detector", &self.detector.name())
            .field("max_section_size", &self.max_section_size)
            .field("state", &self.state)
            .field("offset", &self.offset)
            .field("pending", &self.pending)
            .field("spans", &self.spans)
            .field("segments", &self.segments)
            .field("data_bytes", &self.data_bytes)
            .finish_non_exhaustive()
    }
}

impl Encoder<File> {
    /// Create an encoder for a file or block device. The logical size and the
    /// hole detector are determined by probing the handle.
    pub fn new(file: File, format: &'static dyn Format, mode: DetectMode) -> Result<Self> {
        let info = hole::probe_source(&file, mode).map_err(Error::Probe)?;

        Ok(Self::with_detector(file, info.size, format, info.detector))
    }
}

impl<F: Read + Seek> Encoder<F> {
    /// Create an encoder with an explicit logical size and detector. Every
    /// region reported by `detector` is validated against `size`.
    pub fn with_detector(
        file: F,
        size: u64,
        format: &'static dyn Format,
        detector: Box<dyn HoleDetector<F>>,
    ) -> Self {
        debug!(
            "Encoding {} with {} detection as {}",
            NumBytes(size),
            detector.name(),
            format.name(),
        );

        Self {
            file,
            size,
            format,
            detector,
            max_section_size: None,
            state: State::Start,
            offset: 0,
            pending: None,
            spans: SpanQueue::new(),
            segments: 0,
            data_bytes: 0,
        }
    }

    /// Split data regions larger than `size` into multiple frames. [`None`]
    /// or `Some(0)` removes the limit.
    pub fn set_max_section_size(&mut self, size: Option<u64>) {
        self.max_section_size = size.filter(|s| *s != 0);
    }

    pub fn max_section_size(&self) -> Option<u64> {
        self.max_section_size
    }

    /// Logical size of the source, as written in the size frame.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Number of data frames emitted so far.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Number of payload bytes queued so far.
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done && self.spans.is_empty()
    }

    /// Restart the stream from the beginning. This also clears a previous
    /// failure.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.offset = 0;
        self.pending = None;
        self.spans.clear();
        self.segments = 0;
        self.data_bytes = 0;
    }

    fn validate(&self, segment: Segment) -> Result<()> {
        if segment.is_empty() {
            return Err(Error::EmptySegment {
                offset: segment.offset,
            });
        } else if segment.offset < self.offset {
            return Err(Error::RegressingSegment {
                segment,
                prev_end: self.offset,
            });
        }

        match segment.end() {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::SegmentOutOfBounds {
                segment,
                size: self.size,
            }),
        }
    }

    /// Queue the next data frame or the end frame.
    fn next_section(&mut self) -> Result<()> {
        let mut region = match self.pending.take() {
            Some(r) => r,
            None => {
                let region = self
                    .detector
                    .next_data_region(&mut self.file, self.offset)
                    .map_err(|e| Error::Detect {
                        offset: self.offset,
                        source: e,
                    })?;

                let Some(region) = region else {
                    debug!(
                        "Encoded {} sections containing {}",
                        self.segments,
                        NumBytes(self.data_bytes),
                    );

                    self.spans.push_bytes(self.format.end_frame());
                    self.state = State::Done;
                    return Ok(());
                };

                self.validate(region.segment)?;
                region
            }
        };

        if let Some(max) = self.max_section_size {
            self.pending = region.split_off(max);
        }

        let segment = region.segment;
        trace!("Emitting section: {segment:?}");

        let header = self.format.section_frame_header(segment);
        self.spans.push_bytes(header);

        match region.prefetched {
            Some(data) => self.spans.push_bytes(data),
            None => {
                self.file
                    .seek(SeekFrom::Start(segment.offset))
                    .map_err(|e| Error::Seek {
                        offset: segment.offset,
                        source: e,
                    })?;
                self.spans.push_copy(segment.length);
            }
        }

        // Cannot overflow because the segment was validated.
        self.offset = segment.offset + segment.length;
        self.segments += 1;
        self.data_bytes += segment.length;

        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.spans.is_empty() {
                return Ok(self.spans.read(&mut self.file, buf)?);
            }

            match self.state {
                State::Start => {
                    self.spans.push_bytes(self.format.size_frame(self.size));
                    self.state = State::Sections;
                }
                State::Sections => self.next_section()?,
                State::Done => return Ok(0),
                State::Failed => return Err(Error::Failed),
            }
        }
    }
}

impl<F: Read + Seek> Read for Encoder<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_stream(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                if !matches!(e, Error::Failed) {
                    self.state = State::Failed;
                    self.spans.clear();
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        format::FormatKind,
        hole::{ScanningDetector, WholeFileDetector},
    };

    /// Reports a fixed list of regions regardless of the file contents.
    struct FixedDetector(Vec<Segment>);

    impl<F> HoleDetector<F> for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn next_data_region(
            &mut self,
            _file: &mut F,
            _offset: u64,
        ) -> hole::Result<Option<DataRegion>> {
            if self.0.is_empty() {
                Ok(None)
            } else {
                Ok(Some(DataRegion::new(self.0.remove(0))))
            }
        }
    }

    fn encode_with<'a>(
        data: &'a [u8],
        detector: Box<dyn HoleDetector<Cursor<&'a [u8]>>>,
        max_section_size: Option<u64>,
    ) -> io::Result<Vec<u8>> {
        let mut encoder = Encoder::with_detector(
            Cursor::new(data),
            data.len() as u64,
            FormatKind::RbdDiffV1.format(),
            detector,
        );
        encoder.set_max_section_size(max_section_size);

        let mut result = vec![];
        encoder.read_to_end(&mut result)?;

        Ok(result)
    }

    fn v1_data_frame(offset: u64, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![b'w'];
        frame.extend_from_slice(&offset.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u64).to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    fn v1_size_frame(size: u64) -> Vec<u8> {
        let mut frame = vec![b's'];
        frame.extend_from_slice(&size.to_le_bytes());
        frame
    }

    #[test]
    fn split_large_regions() {
        let data = b"\0\0abcdefg\0";

        let stream = encode_with(data, Box::new(ScanningDetector::with_buffer_size(16)), Some(3))
            .unwrap();

        // The scanner reports the whole buffer, including zeros.
        let mut expected = v1_size_frame(10);
        expected.extend(v1_data_frame(0, b"\0\0a"));
        expected.extend(v1_data_frame(3, b"bcd"));
        expected.extend(v1_data_frame(6, b"efg"));
        expected.extend(v1_data_frame(9, b"\0"));
        expected.push(b'e');

        assert_eq!(stream, expected);
    }

    #[test]
    fn split_pass_through_regions() {
        let data = b"abcde";

        let stream = encode_with(data, Box::new(WholeFileDetector::new(5)), Some(2)).unwrap();

        let mut expected = v1_size_frame(5);
        expected.extend(v1_data_frame(0, b"ab"));
        expected.extend(v1_data_frame(2, b"cd"));
        expected.extend(v1_data_frame(4, b"e"));
        expected.push(b'e');

        assert_eq!(stream, expected);
    }

    #[test]
    fn reject_bad_detector_output() {
        let data = [1u8; 16];

        let cases = [
            vec![Segment::new(4, 0)],
            vec![Segment::new(4, 4), Segment::new(6, 4)],
            vec![Segment::new(10, 10)],
            vec![Segment::new(u64::MAX, 1)],
        ];

        for segments in cases {
            let err = encode_with(&data, Box::new(FixedDetector(segments)), None).unwrap_err();
            let inner = err.into_inner().unwrap().downcast::<Error>().unwrap();
            assert!(inner.is_internal(), "{inner:?}");
        }
    }

    #[test]
    fn failed_session_stays_failed() {
        let data = [1u8; 4];
        let mut encoder = Encoder::with_detector(
            Cursor::new(&data[..]),
            4,
            FormatKind::RbdDiffV1.format(),
            Box::new(FixedDetector(vec![Segment::new(0, 0)])),
        );

        let mut buf = [0u8; 64];
        // Size frame.
        assert_eq!(encoder.read(&mut buf).unwrap(), 9);
        assert!(encoder.read(&mut buf).is_err());

        let err = encoder.read(&mut buf).unwrap_err();
        let inner = err.into_inner().unwrap().downcast::<Error>().unwrap();
        assert_matches!(*inner, Error::Failed);
    }

    #[test]
    fn truncated_source() {
        // The detector claims more data than the source has.
        let mut encoder = Encoder::with_detector(
            Cursor::new(&b"abc"[..]),
            8,
            FormatKind::RbdDiffV1.format(),
            Box::new(FixedDetector(vec![Segment::new(0, 8)])),
        );

        let err = encoder.read_to_end(&mut vec![]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reset_restarts_stream() {
        let data = b"\0\0\0\0data";
        let mut encoder = Encoder::with_detector(
            Cursor::new(&data[..]),
            data.len() as u64,
            FormatKind::RbdDiffV2.format(),
            Box::new(ScanningDetector::with_buffer_size(4)),
        );

        let mut first = vec![];
        encoder.read_to_end(&mut first).unwrap();
        assert!(encoder.is_done());
        assert_eq!(encoder.segments(), 1);
        assert_eq!(encoder.data_bytes(), 4);

        encoder.reset();

        let mut second = vec![];
        encoder.read_to_end(&mut second).unwrap();

        assert_eq!(first, second);
        assert_eq!(encoder.segments(), 1);
    }
}
