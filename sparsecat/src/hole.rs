// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Discovery of the allocated (non-hole) regions of a source file and the
//! sparse-aware operations needed on the destination side.
//!
//! Detection strategies share the [`HoleDetector`] trait and are selected once
//! per session by [`probe_source`]:
//!
//! * [`SeekHoleDetector`]: `SEEK_DATA`/`SEEK_HOLE` on Linux and Android.
//! * [`ScanningDetector`]: reads fixed-size buffers and skips the ones that are
//!   entirely zero. Used for block devices and filesystems without native
//!   support.
//! * [`WholeFileDetector`]: reports the whole file as one data region. Used on
//!   platforms without native support.

use std::{
    fmt,
    fs::{File, Metadata},
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    format::Segment,
    stream::{FileLen, ReadFixedSizeExt},
    util,
};

/// Buffer size used by [`ScanningDetector`].
pub const SCAN_BUFFER_SIZE: usize = 4_000_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Native hole detection is not supported: {0}")]
    Unsupported(&'static str),
    #[error("Failed to seek to data after offset {offset}")]
    SeekData {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to seek to hole after offset {offset}")]
    SeekHole {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read source at offset {offset}")]
    DataRead {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Offset too large for the platform: {0}")]
    OffsetTooLarge(u64),
    #[error("Failed to query file metadata")]
    Metadata(#[source] io::Error),
    #[error("Failed to query device size")]
    DeviceSize(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A region of the source that contains data.
#[derive(Clone, PartialEq, Eq)]
pub struct DataRegion {
    pub segment: Segment,
    /// Contents of the region if the detector had to read them already. When
    /// present, the length always matches [`Segment::length`].
    pub prefetched: Option<Vec<u8>>,
}

impl fmt::Debug for DataRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRegion")
            .field("segment", &self.segment)
            .field("prefetched", &self.prefetched.is_some())
            .finish()
    }
}

impl DataRegion {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            prefetched: None,
        }
    }

    pub fn with_data(offset: u64, data: Vec<u8>) -> Self {
        Self {
            segment: Segment::new(offset, data.len() as u64),
            prefetched: Some(data),
        }
    }

    /// Shrink this region to the first `length` bytes and return the rest, if
    /// anything remains.
    pub fn split_off(&mut self, length: u64) -> Option<Self> {
        if length >= self.segment.length {
            return None;
        }

        let tail = Segment::new(
            self.segment.offset + length,
            self.segment.length - length,
        );
        self.segment.length = length;

        // This cannot truncate because the prefetched data is in memory.
        let prefetched = self
            .prefetched
            .as_mut()
            .map(|data| data.split_off(length as usize));

        Some(Self {
            segment: tail,
            prefetched,
        })
    }
}

/// Strategy for finding the next data region of a file.
pub trait HoleDetector<F>: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Find the next region containing data that starts at or after `offset`.
    /// Returns [`None`] once there is no more data in the file. No guarantees
    /// are made about the file position afterwards.
    fn next_data_region(&mut self, file: &mut F, offset: u64) -> Result<Option<DataRegion>>;
}

/// Detects data regions by reading the file one buffer at a time and skipping
/// every buffer that is all zeros. The data of a non-zero buffer is returned
/// along with its bounds so that it doesn't need to be read twice.
#[derive(Clone, Debug)]
pub struct ScanningDetector {
    buf_size: usize,
}

impl Default for ScanningDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanningDetector {
    pub fn new() -> Self {
        Self::with_buffer_size(SCAN_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buf_size: usize) -> Self {
        Self {
            buf_size: buf_size.max(1),
        }
    }
}

impl<F: Read + Seek> HoleDetector<F> for ScanningDetector {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn next_data_region(&mut self, file: &mut F, mut offset: u64) -> Result<Option<DataRegion>> {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::DataRead { offset, source: e })?;

        let mut buf = vec![0u8; self.buf_size];

        loop {
            let n = file
                .read_fill(&mut buf)
                .map_err(|e| Error::DataRead { offset, source: e })?;
            if n == 0 {
                return Ok(None);
            }

            if util::is_zero(&buf[..n]) {
                offset += n as u64;
                continue;
            }

            buf.truncate(n);

            return Ok(Some(DataRegion::with_data(offset, buf)));
        }
    }
}

/// Reports everything from the requested offset to the end of the file as a
/// single data region.
#[derive(Clone, Copy, Debug)]
pub struct WholeFileDetector {
    size: u64,
}

impl WholeFileDetector {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl<F> HoleDetector<F> for WholeFileDetector {
    fn name(&self) -> &'static str {
        "none"
    }

    fn next_data_region(&mut self, _file: &mut F, offset: u64) -> Result<Option<DataRegion>> {
        if offset >= self.size {
            return Ok(None);
        }

        Ok(Some(DataRegion::new(Segment::new(
            offset,
            self.size - offset,
        ))))
    }
}

/// [Linux only] Detects data regions with `SEEK_DATA` and `SEEK_HOLE`. See
/// lseek(2) for the list of filesystems that support this.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Clone, Copy, Debug, Default)]
pub struct SeekHoleDetector;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl<F: std::os::fd::AsFd> HoleDetector<F> for SeekHoleDetector {
    fn name(&self) -> &'static str {
        "native"
    }

    fn next_data_region(&mut self, file: &mut F, offset: u64) -> Result<Option<DataRegion>> {
        use rustix::{fs::SeekFrom, io::Errno};

        let pos = SeekFrom::Data(offset.try_into().map_err(|_| Error::OffsetTooLarge(offset))?);

        let start = match rustix::fs::seek(&*file, pos) {
            Ok(start) => start,
            // No more data after the offset.
            Err(e) if e == Errno::NXIO => return Ok(None),
            Err(e) => {
                return Err(Error::SeekData {
                    offset,
                    source: e.into(),
                });
            }
        };

        let pos = SeekFrom::Hole(start.try_into().map_err(|_| Error::OffsetTooLarge(start))?);

        let end = match rustix::fs::seek(&*file, pos) {
            Ok(end) => end,
            // The file shrank in between the two calls.
            Err(e) if e == Errno::NXIO => return Ok(None),
            Err(e) => {
                return Err(Error::SeekHole {
                    offset: start,
                    source: e.into(),
                });
            }
        };

        Ok(Some(DataRegion::new(Segment::new(
            start,
            end.saturating_sub(start),
        ))))
    }
}

/// Check if the handle supports `SEEK_DATA`. This is a property of both the
/// platform and the filesystem.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn supports_native(file: &File) -> Result<bool> {
    use rustix::fs::SeekFrom;

    classify_seek_data(rustix::fs::seek(file, SeekFrom::Data(0)))
}

/// Interpret the result of the `SEEK_DATA` capability probe.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn classify_seek_data(result: rustix::io::Result<u64>) -> Result<bool> {
    use rustix::io::Errno;

    match result {
        Ok(_) => Ok(true),
        // The file has no data at all.
        Err(e) if e == Errno::NXIO => Ok(true),
        Err(e) if e == Errno::INVAL || e == Errno::OPNOTSUPP || e == Errno::SPIPE => Ok(false),
        Err(e) => Err(Error::SeekData {
            offset: 0,
            source: e.into(),
        }),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn supports_native(_file: &File) -> Result<bool> {
    Ok(false)
}

/// Which [`HoleDetector`] to use for a source file.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// Native detection if supported by the handle, otherwise a fallback.
    #[default]
    Auto,
    /// Native detection only. Fails if unsupported.
    Native,
    /// Scan for all-zero buffers.
    Scan,
    /// Treat the entire file as data.
    None,
}

/// Result of probing a source file.
pub struct SourceInfo {
    /// Logical size of the file.
    pub size: u64,
    pub is_block_device: bool,
    pub detector: Box<dyn HoleDetector<File>>,
}

impl fmt::Debug for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceInfo")
            .field("size", &self.size)
            .field("is_block_device", &self.is_block_device)
            .field("detector", &self.detector.name())
            .finish()
    }
}

#[cfg(unix)]
pub fn is_block_device(metadata: &Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;

    metadata.file_type().is_block_device()
}

#[cfg(not(unix))]
pub fn is_block_device(_metadata: &Metadata) -> bool {
    false
}

/// Query the addressable size of a block device. The metadata of a block
/// device does not report a useful size, but seeking to the end does.
pub fn raw_device_size(file: &File) -> Result<u64> {
    file.file_len().map_err(Error::DeviceSize)
}

/// Determine the logical size of the source and the detector to use for it.
///
/// In [`DetectMode::Auto`] mode, block devices always use the scanning
/// fallback. Native detection on a block device reports the whole device as
/// data, which defeats the purpose. Regular files use native detection when
/// the handle supports it. Otherwise, the scanning fallback is used on
/// platforms that have native detection (because the filesystem lacks it) and
/// the whole-file fallback is used everywhere else.
pub fn probe_source(file: &File, mode: DetectMode) -> Result<SourceInfo> {
    let metadata = file.metadata().map_err(Error::Metadata)?;
    let block_device = is_block_device(&metadata);

    let size = if block_device {
        raw_device_size(file)?
    } else {
        metadata.len()
    };

    let detector: Box<dyn HoleDetector<File>> = match mode {
        DetectMode::Scan => Box::new(ScanningDetector::new()),
        DetectMode::None => Box::new(WholeFileDetector::new(size)),
        DetectMode::Native => {
            if !supports_native(file)? {
                return Err(Error::Unsupported("handle does not support SEEK_DATA"));
            }

            native_detector()
        }
        DetectMode::Auto => {
            if block_device {
                Box::new(ScanningDetector::new())
            } else if supports_native(file)? {
                native_detector()
            } else if cfg!(any(target_os = "linux", target_os = "android")) {
                Box::new(ScanningDetector::new())
            } else {
                Box::new(WholeFileDetector::new(size))
            }
        }
    };

    debug!(
        "Probed source: size={size}, block_device={block_device}, detector={}",
        detector.name(),
    );

    Ok(SourceInfo {
        size,
        is_block_device: block_device,
        detector,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn native_detector() -> Box<dyn HoleDetector<File>> {
    Box::new(SeekHoleDetector)
}

/// Only reachable after [`supports_native`] returned true, which never
/// happens on these platforms.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn native_detector() -> Box<dyn HoleDetector<File>> {
    Box::new(ScanningDetector::new())
}

/// Whether the destination can be written in direct mode. Only regular files
/// can be resized and written at arbitrary offsets. Pipes, sockets, and
/// devices cannot. Neither can append-mode handles, where every write lands at
/// the end of the file regardless of the seek position.
pub fn is_direct_capable(file: &File) -> io::Result<bool> {
    if !file.metadata()?.is_file() {
        return Ok(false);
    }

    Ok(!is_append_mode(file)?)
}

#[cfg(unix)]
fn is_append_mode(file: &File) -> io::Result<bool> {
    use rustix::fs::OFlags;

    let flags = rustix::fs::fcntl_getfl(file)?;
    Ok(flags.contains(OFlags::APPEND))
}

/// std offers no way to query the access mode of an open handle here.
#[cfg(not(unix))]
fn is_append_mode(_file: &File) -> io::Result<bool> {
    Ok(false)
}

/// Resize `file` to exactly `size` bytes where every byte reads back as zero
/// until written. The file is emptied first so that no stale data remains in
/// the regions that will become holes. Newly extended regions are not
/// allocated on filesystems that support sparse files.
pub fn sparse_resize(file: &File, size: u64) -> io::Result<()> {
    file.set_len(0)?;
    file.set_len(size)
}

/// A destination that supports direct mode writes.
pub trait SparseTarget: Write + Seek {
    /// Resize the target to exactly `size` bytes, all of which read back as
    /// zero until written.
    fn sparse_resize(&mut self, size: u64) -> io::Result<()>;
}

impl SparseTarget for File {
    fn sparse_resize(&mut self, size: u64) -> io::Result<()> {
        sparse_resize(self, size)
    }
}

/// In-memory target. Resizing discards all previous contents.
impl SparseTarget for Cursor<Vec<u8>> {
    fn sparse_resize(&mut self, size: u64) -> io::Result<()> {
        let size = usize::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::OutOfMemory, format!("Size too large: {size}"))
        })?;

        let data = self.get_mut();
        data.clear();
        data.resize(size, 0);

        Ok(())
    }
}

impl<T: SparseTarget + ?Sized> SparseTarget for &mut T {
    fn sparse_resize(&mut self, size: u64) -> io::Result<()> {
        (**self).sparse_resize(size)
    }
}
