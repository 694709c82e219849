// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli,
    config::Config,
    decoder::{Decoder, StreamInfo},
    format::{FormatKind, Segment},
    util::NumBytes,
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

struct Metadata<'a> {
    format: FormatKind,
    size: u64,
    data: u64,
    segments: &'a [Segment],
}

impl fmt::Debug for Metadata<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("format", &format_args!("{}", self.format))
            .field("size", &NumBytes(self.size))
            .field("data", &NumBytes(self.data))
            .field("segments", &CompactView(self.segments))
            .finish()
    }
}

pub fn info_main(cli: &InfoCli, config: &Config) -> Result<()> {
    let format = cli.format.unwrap_or_else(|| config.format());

    let reader = cli::open_stream_reader(&cli.input)?;
    let StreamInfo { size, segments } = Decoder::new(reader, format.format())
        .inspect()
        .with_context(|| format!("Failed to read stream: {:?}", cli.input))?;

    let metadata = Metadata {
        format,
        size,
        data: segments.iter().map(|s| s.length).sum(),
        segments: &segments,
    };

    println!("{metadata:#?}");

    Ok(())
}

/// Display the size and data regions of a sparse stream.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input stream.
    ///
    /// Use `-` for stdin.
    #[arg(short, long, value_name = "FILE", value_parser, default_value = "-")]
    pub input: PathBuf,

    /// Wire format of the stream [default: rbd-diff-v1].
    #[arg(short, long, value_name = "FORMAT", value_enum)]
    pub format: Option<FormatKind>,
}
