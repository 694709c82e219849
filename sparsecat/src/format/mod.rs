// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Wire formats for framing a sparse file as a stream of bytes.
//!
//! A stream consists of exactly one size frame, zero or more data frames in
//! ascending offset order, and exactly one end frame. The formats themselves
//! are stateless. All of the session state lives in the
//! [`crate::encoder::Encoder`] and [`crate::decoder::Decoder`].

pub mod rbd;

use std::{
    fmt,
    io::{self, Read},
    str::FromStr,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag byte for the size frame.
pub const SIZE_TAG: u8 = b's';
/// Tag byte for a data frame.
pub const DATA_TAG: u8 = b'w';
/// Tag byte for the end frame.
pub const END_TAG: u8 = b'e';

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected size frame tag {expected:#04x}, but have {tag:#04x}", expected = SIZE_TAG)]
    MissingSizeFrame { tag: u8 },
    #[error("Invalid section tag: {0:#04x}")]
    InvalidSectionTag(u8),
    #[error("Stream ended inside {0}")]
    Truncated(&'static str, #[source] io::Error),
    #[error("Failed to read {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Unknown format: {0:?}")]
    UnknownFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error that occurred while reading `field`. Hitting EOF is
    /// reported separately because it means the stream was cut off.
    pub(crate) fn read(field: &'static str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated(field, e)
        } else {
            Self::DataRead(field, e)
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated(..))
    }
}

/// A contiguous run of non-hole bytes in the logical file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.offset.saturating_add(self.length))
    }
}

impl Segment {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, or [`None`] if it does not fit in a [`u64`].
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Result of parsing one section header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionHeader {
    /// A data frame. Exactly [`Segment::length`] payload bytes follow.
    Data(Segment),
    /// The end frame. Nothing follows.
    End,
}

/// Encoding and decoding of the three frame kinds. Parsing functions consume
/// exactly the bytes of the frame they parse. Encoding functions only produce
/// headers; the payload of a data frame is appended by the caller.
pub trait Format: fmt::Debug + Send + Sync {
    /// Identifier used to select this format at runtime.
    fn name(&self) -> &'static str;

    /// Read the size frame, which must be the first frame in the stream.
    fn read_file_size(&self, reader: &mut dyn Read) -> Result<u64>;

    /// Read the next data frame header or the end frame.
    fn read_section_header(&self, reader: &mut dyn Read) -> Result<SectionHeader>;

    fn size_frame(&self, size: u64) -> Vec<u8>;

    /// Header of a data frame, not including the payload.
    fn section_frame_header(&self, segment: Segment) -> Vec<u8>;

    fn end_frame(&self) -> Vec<u8>;
}

/// Runtime selector for the supported formats.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize,
)]
pub enum FormatKind {
    #[default]
    #[value(name = "rbd-diff-v1")]
    #[serde(rename = "rbd-diff-v1")]
    RbdDiffV1,
    #[value(name = "rbd-diff-v2")]
    #[serde(rename = "rbd-diff-v2")]
    RbdDiffV2,
}

impl FormatKind {
    pub const ALL: [Self; 2] = [Self::RbdDiffV1, Self::RbdDiffV2];

    pub fn format(self) -> &'static dyn Format {
        match self {
            Self::RbdDiffV1 => &rbd::RbdDiffV1,
            Self::RbdDiffV2 => &rbd::RbdDiffV2,
        }
    }

    pub fn name(self) -> &'static str {
        self.format().name()
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::UnknownFormat(s.to_owned()))
    }
}

/// Look up a format by its identifier.
pub fn by_name(name: &str) -> Option<&'static dyn Format> {
    name.parse::<FormatKind>().ok().map(FormatKind::format)
}
