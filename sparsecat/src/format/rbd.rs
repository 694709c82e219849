// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! The subset of Ceph's `rbd export-diff` formats needed to describe a sparse
//! file: the image size, updated data, and the end marker. Zeroed regions are
//! simply not transmitted. See:
//! <https://github.com/ceph/ceph/blob/main/doc/dev/rbd-diff.rst>

use std::io::{self, Read};

use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{DATA_TAG, END_TAG, Error, Format, Result, SIZE_TAG, SectionHeader, Segment},
    stream::ReadFixedSizeExt,
};

/// Raw v1 size frame, excluding the tag.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSizeV1 {
    size: little_endian::U64,
}

/// Raw v1 data frame header, excluding the tag.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawDataV1 {
    offset: little_endian::U64,
    length: little_endian::U64,
}

/// Raw v2 size frame, excluding the tag.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSizeV2 {
    /// Number of bytes in the rest of the record. Always 8.
    record_len: little_endian::U64,
    size: little_endian::U64,
}

/// Raw v2 data frame header, excluding the tag.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawDataV2 {
    /// Number of bytes in the rest of the record, including the payload.
    record_len: little_endian::U64,
    offset: little_endian::U64,
    length: little_endian::U64,
}

fn read_tag(mut reader: impl Read, field: &'static str) -> Result<u8> {
    let [tag] = reader
        .read_array_exact::<1>()
        .map_err(|e| Error::read(field, e))?;

    Ok(tag)
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(tag);
    buf.extend_from_slice(body);
    buf
}

/// Read the tag of the next section. Returns `false` for the end frame.
fn read_data_tag(reader: &mut dyn Read) -> Result<bool> {
    match read_tag(&mut *reader, "section tag")? {
        DATA_TAG => Ok(true),
        END_TAG => Ok(false),
        tag => Err(Error::InvalidSectionTag(tag)),
    }
}

fn map_io<T>(result: io::Result<T>, field: &'static str) -> Result<T> {
    result.map_err(|e| Error::read(field, e))
}

/// Version 1 of the rbd diff format.
#[derive(Clone, Copy, Debug, Default)]
pub struct RbdDiffV1;

impl Format for RbdDiffV1 {
    fn name(&self) -> &'static str {
        "rbd-diff-v1"
    }

    fn read_file_size(&self, reader: &mut dyn Read) -> Result<u64> {
        let tag = read_tag(&mut *reader, "size tag")?;
        if tag != SIZE_TAG {
            return Err(Error::MissingSizeFrame { tag });
        }

        let raw = map_io(RawSizeV1::read_from_io(&mut *reader), "size frame")?;

        Ok(raw.size.get())
    }

    fn read_section_header(&self, reader: &mut dyn Read) -> Result<SectionHeader> {
        if !read_data_tag(reader)? {
            return Ok(SectionHeader::End);
        }

        let raw = map_io(RawDataV1::read_from_io(&mut *reader), "data header")?;

        Ok(SectionHeader::Data(Segment {
            offset: raw.offset.get(),
            length: raw.length.get(),
        }))
    }

    fn size_frame(&self, size: u64) -> Vec<u8> {
        let raw = RawSizeV1 { size: size.into() };

        frame(SIZE_TAG, raw.as_bytes())
    }

    fn section_frame_header(&self, segment: Segment) -> Vec<u8> {
        let raw = RawDataV1 {
            offset: segment.offset.into(),
            length: segment.length.into(),
        };

        frame(DATA_TAG, raw.as_bytes())
    }

    fn end_frame(&self) -> Vec<u8> {
        vec![END_TAG]
    }
}

/// Version 2 of the rbd diff format. Every frame except the end frame carries
/// the length of the remainder of its record. The parser doesn't need it
/// because the frame kind determines the layout, so it is not validated.
#[derive(Clone, Copy, Debug, Default)]
pub struct RbdDiffV2;

impl Format for RbdDiffV2 {
    fn name(&self) -> &'static str {
        "rbd-diff-v2"
    }

    fn read_file_size(&self, reader: &mut dyn Read) -> Result<u64> {
        let tag = read_tag(&mut *reader, "size tag")?;
        if tag != SIZE_TAG {
            return Err(Error::MissingSizeFrame { tag });
        }

        let raw = map_io(RawSizeV2::read_from_io(&mut *reader), "size frame")?;

        Ok(raw.size.get())
    }

    fn read_section_header(&self, reader: &mut dyn Read) -> Result<SectionHeader> {
        if !read_data_tag(reader)? {
            return Ok(SectionHeader::End);
        }

        let raw = map_io(RawDataV2::read_from_io(&mut *reader), "data header")?;

        Ok(SectionHeader::Data(Segment {
            offset: raw.offset.get(),
            length: raw.length.get(),
        }))
    }

    fn size_frame(&self, size: u64) -> Vec<u8> {
        let raw = RawSizeV2 {
            record_len: (size_of::<u64>() as u64).into(),
            size: size.into(),
        };

        frame(SIZE_TAG, raw.as_bytes())
    }

    fn section_frame_header(&self, segment: Segment) -> Vec<u8> {
        // The offset and length fields are part of the record. This wraps
        // for absurd lengths, which can't be transmitted anyway.
        let record_len = (2 * size_of::<u64>() as u64).wrapping_add(segment.length);

        let raw = RawDataV2 {
            record_len: record_len.into(),
            offset: segment.offset.into(),
            length: segment.length.into(),
        };

        frame(DATA_TAG, raw.as_bytes())
    }

    fn end_frame(&self) -> Vec<u8> {
        vec![END_TAG]
    }
}
