// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Transfer sparse files and block devices as a stream that omits the holes.
//!
//! The stream is compatible with the subset of Ceph's `rbd export-diff`
//! formats that describes a single image: a size frame, data frames, and an
//! end frame. [`encoder::Encoder`] produces it from a seekable source and
//! [`decoder::Decoder`] reconstructs the file, either by materializing every
//! byte or by writing only the data regions into a resized regular file.
//!
//! The semver versioning covers the CLI only. The Rust APIs can change at any
//! time.

pub mod cli;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod format;
pub mod hole;
pub mod pipe;
pub mod span;
pub mod stream;
pub mod util;
