// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use sparsecat::{
    decoder::{self, Decoder, OutputMode},
    encoder::Encoder,
    format::{FormatKind, Segment},
    hole::{self, DetectMode, ScanningDetector},
    pipe,
};

const DETECT_MODES: [DetectMode; 3] = [DetectMode::Auto, DetectMode::Scan, DetectMode::None];

struct Layout {
    size: u64,
    regions: Vec<(u64, Vec<u8>)>,
}

impl Layout {
    fn new(size: u64, regions: &[(u64, usize)]) -> Self {
        let regions = regions
            .iter()
            .map(|&(offset, len)| (offset, pattern(offset, len)))
            .collect();

        Self { size, regions }
    }

    fn contents(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.size as usize];

        for (offset, region) in &self.regions {
            let start = *offset as usize;
            data[start..start + region.len()].copy_from_slice(region);
        }

        data
    }

    fn create_file(&self) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(self.size).unwrap();

        for (offset, region) in &self.regions {
            file.seek(SeekFrom::Start(*offset)).unwrap();
            file.write_all(region).unwrap();
        }

        file.rewind().unwrap();
        file
    }
}

/// Non-zero bytes that differ between regions.
fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((offset as usize + i) % 251) as u8 | 1)
        .collect()
}

fn layouts() -> Vec<Layout> {
    vec![
        Layout::new(0, &[]),
        Layout::new(10, &[]),
        Layout::new(4096, &[(100, 100)]),
        Layout::new(3 * 65536, &[(65536, 65536)]),
        Layout::new(
            1024 * 1024,
            &[(0, 5000), (200_000, 70_000), (1024 * 1024 - 10, 10)],
        ),
    ]
}

fn encode(
    file: &File,
    format: FormatKind,
    mode: DetectMode,
    max_section_size: Option<u64>,
) -> Vec<u8> {
    let mut encoder = Encoder::new(file.try_clone().unwrap(), format.format(), mode).unwrap();
    encoder.set_max_section_size(max_section_size);

    let mut stream = vec![];
    encoder.read_to_end(&mut stream).unwrap();
    assert!(encoder.is_done());

    stream
}

/// Encode with a scanner that has a small buffer so that segment boundaries
/// are predictable.
fn encode_scan(file: File, format: FormatKind, buf_size: usize) -> Vec<u8> {
    let size = file.metadata().unwrap().len();
    let mut encoder = Encoder::with_detector(
        file,
        size,
        format.format(),
        Box::new(ScanningDetector::with_buffer_size(buf_size)),
    );

    let mut stream = vec![];
    encoder.read_to_end(&mut stream).unwrap();

    stream
}

fn decode_generic(stream: &[u8], format: FormatKind) -> Vec<u8> {
    let mut decoder = Decoder::new(stream, format.format());

    let mut data = vec![];
    decoder.read_to_end(&mut data).unwrap();
    assert!(decoder.is_done());

    data
}

fn decode_direct(stream: &[u8], format: FormatKind) -> Vec<u8> {
    let cancel_signal = AtomicBool::new(false);
    let mut file = tempfile::tempfile().unwrap();
    // Leftover data must not survive.
    file.write_all(&[0xffu8; 8192]).unwrap();

    let mut decoder = Decoder::new(stream, format.format());
    let mode = decoder::decode_to_file(&mut decoder, &mut file, true, &cancel_signal).unwrap();
    assert_eq!(mode, OutputMode::Direct);

    let mut data = vec![];
    file.rewind().unwrap();
    file.read_to_end(&mut data).unwrap();

    data
}

fn size_frame(format: FormatKind, size: u64) -> Vec<u8> {
    let mut frame = vec![b's'];
    if format == FormatKind::RbdDiffV2 {
        frame.extend_from_slice(&8u64.to_le_bytes());
    }
    frame.extend_from_slice(&size.to_le_bytes());
    frame
}

#[test]
fn round_trip() {
    for layout in layouts() {
        let file = layout.create_file();
        let expected = layout.contents();

        for format in FormatKind::ALL {
            for mode in DETECT_MODES {
                let stream = encode(&file, format, mode, None);

                assert_eq!(decode_generic(&stream, format), expected, "{format} {mode:?}");
                assert_eq!(decode_direct(&stream, format), expected, "{format} {mode:?}");
            }
        }
    }
}

#[test]
fn round_trip_split_sections() {
    for layout in layouts() {
        let file = layout.create_file();
        let expected = layout.contents();

        for format in FormatKind::ALL {
            for mode in DETECT_MODES {
                let stream = encode(&file, format, mode, Some(4000));

                let info = Decoder::new(&stream[..], format.format()).inspect().unwrap();
                assert!(info.segments.iter().all(|s| s.length <= 4000));

                assert_eq!(decode_generic(&stream, format), expected, "{format} {mode:?}");
                assert_eq!(decode_direct(&stream, format), expected, "{format} {mode:?}");
            }
        }
    }
}

#[test]
fn round_trip_through_pipe() {
    let layouts = layouts();
    let layout = &layouts[4];
    let file = layout.create_file();

    for format in FormatKind::ALL {
        let encoder =
            Encoder::new(file.try_clone().unwrap(), format.format(), DetectMode::Scan).unwrap();
        let (reader, handle) = pipe::spawn_producer(encoder, 2).unwrap();

        let mut decoder = Decoder::new(reader, format.format());
        let mut data = vec![];
        decoder.read_to_end(&mut data).unwrap();

        let encoder = handle.join().unwrap();
        assert!(encoder.is_done());
        assert_eq!(data, layout.contents());
    }
}

#[test]
fn idempotent_encoding() {
    for layout in layouts() {
        let file = layout.create_file();

        for format in FormatKind::ALL {
            for mode in DETECT_MODES {
                let first = encode(&file, format, mode, None);
                let second = encode(&file, format, mode, None);
                assert_eq!(first, second, "{format} {mode:?}");
            }
        }
    }
}

#[test]
fn generic_size_matches_size_frame() {
    for layout in layouts() {
        let file = layout.create_file();

        for format in FormatKind::ALL {
            let stream = encode(&file, format, DetectMode::Auto, Some(1000));

            let mut decoder = Decoder::new(&stream[..], format.format());
            let declared = decoder.file_size().unwrap();
            let decoded = io::copy(&mut decoder, &mut io::sink()).unwrap();

            assert_eq!(declared, layout.size);
            assert_eq!(decoded, declared);
        }
    }
}

#[test]
fn scenario_empty_file() {
    let file = Layout::new(0, &[]).create_file();

    for format in FormatKind::ALL {
        for mode in DETECT_MODES {
            let stream = encode(&file, format, mode, None);

            let mut expected = size_frame(format, 0);
            expected.push(b'e');
            assert_eq!(stream, expected);

            assert!(decode_generic(&stream, format).is_empty());
            assert!(decode_direct(&stream, format).is_empty());
        }
    }
}

#[test]
fn scenario_all_zero_file() {
    let mut file = tempfile::tempfile().unwrap();
    // Allocated zeros, not a hole.
    file.write_all(&[0u8; 10]).unwrap();

    for format in FormatKind::ALL {
        let stream = encode(&file, format, DetectMode::Scan, None);

        let mut expected = size_frame(format, 10);
        expected.push(b'e');
        assert_eq!(stream, expected);

        assert_eq!(decode_generic(&stream, format), [0u8; 10]);

        let cancel_signal = AtomicBool::new(false);
        let mut output = tempfile::tempfile().unwrap();
        let written = Decoder::new(&stream[..], format.format())
            .write_sparse(&mut output, &cancel_signal)
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(output.metadata().unwrap().len(), 10);
    }
}

#[test]
fn scenario_v1_layout() {
    let layout = Layout::new(4096, &[(100, 100)]);
    let stream = encode_scan(layout.create_file(), FormatKind::RbdDiffV1, 100);

    let mut expected = b"s".to_vec();
    expected.extend_from_slice(&4096u64.to_le_bytes());
    expected.push(b'w');
    expected.extend_from_slice(&100u64.to_le_bytes());
    expected.extend_from_slice(&100u64.to_le_bytes());
    expected.extend_from_slice(&layout.regions[0].1);
    expected.push(b'e');

    assert_eq!(stream, expected);
    assert_eq!(decode_generic(&stream, FormatKind::RbdDiffV1), layout.contents());
    assert_eq!(decode_direct(&stream, FormatKind::RbdDiffV1), layout.contents());
}

#[test]
fn scenario_v2_layout() {
    let layout = Layout::new(4096, &[(100, 100)]);
    let stream = encode_scan(layout.create_file(), FormatKind::RbdDiffV2, 100);

    assert_eq!(stream.len(), 17 + 125 + 1);
    assert_eq!(stream[..17], size_frame(FormatKind::RbdDiffV2, 4096));

    let mut data_frame = b"w".to_vec();
    data_frame.extend_from_slice(&116u64.to_le_bytes());
    data_frame.extend_from_slice(&100u64.to_le_bytes());
    data_frame.extend_from_slice(&100u64.to_le_bytes());
    data_frame.extend_from_slice(&layout.regions[0].1);
    assert_eq!(stream[17..142], data_frame);

    assert_eq!(stream[142], b'e');
    assert_eq!(decode_direct(&stream, FormatKind::RbdDiffV2), layout.contents());
}

/// The size frame carries the raw device size and segments come from
/// scanning, as for a block device whose metadata reports no size.
#[test]
fn scenario_device_size() {
    let layout = Layout::new(65536, &[(8192, 10)]);
    let file = layout.create_file();

    let size = hole::raw_device_size(&file).unwrap();
    assert_eq!(size, 65536);

    let mut encoder = Encoder::with_detector(
        file,
        size,
        FormatKind::RbdDiffV1.format(),
        Box::new(ScanningDetector::with_buffer_size(4096)),
    );
    let mut stream = vec![];
    encoder.read_to_end(&mut stream).unwrap();

    assert_eq!(stream[..9], size_frame(FormatKind::RbdDiffV1, 65536));

    let info = Decoder::new(&stream[..], FormatKind::RbdDiffV1.format())
        .inspect()
        .unwrap();
    assert_eq!(info.size, 65536);
    assert_eq!(info.segments, [Segment::new(8192, 4096)]);
}

#[test]
fn overlapping_segments() {
    let format = FormatKind::RbdDiffV1.format();
    let mut stream = format.size_frame(100);
    stream.extend(format.section_frame_header(Segment::new(10, 20)));
    stream.extend_from_slice(&[1u8; 20]);
    stream.extend(format.section_frame_header(Segment::new(25, 5)));
    stream.extend_from_slice(&[2u8; 5]);
    stream.extend(format.end_frame());

    let cancel_signal = AtomicBool::new(false);

    let err = Decoder::new(&stream[..], format)
        .copy_to(io::sink(), &cancel_signal)
        .unwrap_err();
    assert_matches!(
        err,
        decoder::Error::SegmentBeforeCursor { cursor: 30, .. }
    );

    let err = Decoder::new(&stream[..], format)
        .write_sparse(tempfile::tempfile().unwrap(), &cancel_signal)
        .unwrap_err();
    assert_matches!(
        err,
        decoder::Error::SegmentBeforeCursor { cursor: 30, .. }
    );

    let err = Decoder::new(&stream[..], format)
        .read_to_end(&mut vec![])
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn truncated_stream() {
    let layout = Layout::new(4096, &[(100, 100)]);

    for format in FormatKind::ALL {
        let stream = encode_scan(layout.create_file(), format, 100);
        // Cut off in the middle of the payload.
        let truncated = &stream[..stream.len() - 50];
        let cancel_signal = AtomicBool::new(false);

        let err = Decoder::new(truncated, format.format())
            .copy_to(io::sink(), &cancel_signal)
            .unwrap_err();
        assert!(err.is_truncated(), "{err:?}");

        let err = Decoder::new(truncated, format.format())
            .write_sparse(tempfile::tempfile().unwrap(), &cancel_signal)
            .unwrap_err();
        assert!(err.is_truncated(), "{err:?}");

        let err = Decoder::new(truncated, format.format())
            .read_to_end(&mut vec![])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

#[test]
fn wrong_format_version() {
    let layout = Layout::new(4096, &[(100, 100)]);
    let stream = encode_scan(layout.create_file(), FormatKind::RbdDiffV2, 100);

    // The v2 record length is misread as the size, so the data frame header
    // is misaligned.
    let err = Decoder::new(&stream[..], FormatKind::RbdDiffV1.format())
        .copy_to(io::sink(), &AtomicBool::new(false))
        .unwrap_err();
    assert!(err.is_protocol(), "{err:?}");
}

#[test]
fn generic_mode_when_disabled() {
    let file = tempfile::tempfile().unwrap();

    assert_eq!(
        decoder::select_output_mode(&file, false).unwrap(),
        OutputMode::Generic
    );
    assert_eq!(
        decoder::select_output_mode(&file, true).unwrap(),
        OutputMode::Direct
    );
}

/// Writes to an append-mode handle ignore the seek position, so such a
/// destination must be written sequentially.
#[cfg(unix)]
#[test]
fn append_mode_destination() {
    let mut stream = size_frame(FormatKind::RbdDiffV1, 16);
    stream.push(b'w');
    stream.extend_from_slice(&4u64.to_le_bytes());
    stream.extend_from_slice(&4u64.to_le_bytes());
    stream.extend_from_slice(b"DATA");
    stream.push(b'e');

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.img");
    File::create(&path).unwrap();

    let mut file = File::options().append(true).open(&path).unwrap();
    assert_eq!(
        decoder::select_output_mode(&file, true).unwrap(),
        OutputMode::Generic
    );

    let cancel_signal = AtomicBool::new(false);
    let mut decoder = Decoder::new(&stream[..], FormatKind::RbdDiffV1.format());
    let mode = decoder::decode_to_file(&mut decoder, &mut file, true, &cancel_signal).unwrap();
    assert_eq!(mode, OutputMode::Generic);
    drop(file);

    assert_eq!(std::fs::read(&path).unwrap(), b"\0\0\0\0DATA\0\0\0\0\0\0\0\0");
}
