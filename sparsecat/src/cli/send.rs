// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, info};

use crate::{
    cli,
    config::Config,
    encoder::Encoder,
    format::FormatKind,
    hole::{self, DetectMode},
    pipe, stream,
    util::NumBytes,
};

pub fn send_main(cli: &SendCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let format = cli.format.unwrap_or_else(|| config.format());
    let detect = cli.detect.unwrap_or_else(|| config.detect());
    let max_section_size = cli.max_section_size.or(config.max_section_size);
    let pipe_depth = cli.pipe_depth.unwrap_or_else(|| config.pipe_depth());

    let file = cli::open_reader(&cli.input)?;
    let metadata = file
        .metadata()
        .with_context(|| format!("Failed to get file metadata: {:?}", cli.input))?;
    if !metadata.is_file() && !hole::is_block_device(&metadata) {
        bail!("Input is not a regular file or block device: {:?}", cli.input);
    }

    let mut encoder = Encoder::new(file, format.format(), detect)
        .with_context(|| format!("Failed to probe input: {:?}", cli.input))?;
    encoder.set_max_section_size(max_section_size);

    debug!(
        "Encoding {:?} with {} detection, max section size: {:?}",
        cli.input,
        encoder.detector_name(),
        encoder.max_section_size(),
    );

    let writer = cli::open_stream_writer(&cli.output)?;

    let encoder = if pipe_depth == 0 {
        stream::copy(&mut encoder, writer, cancel_signal)
            .with_context(|| format!("Failed to send: {:?} -> {:?}", cli.input, cli.output))?;

        encoder
    } else {
        let (reader, handle) = pipe::spawn_producer(encoder, pipe_depth)
            .context("Failed to start encoder thread")?;

        // The producer thread stops on its own once the reader is dropped.
        stream::copy(reader, writer, cancel_signal)
            .with_context(|| format!("Failed to send: {:?} -> {:?}", cli.input, cli.output))?;

        handle
            .join()
            .map_err(|_| anyhow!("Encoder thread panicked"))?
    };

    info!(
        "Sent {} as {format}: {} sections containing {}",
        NumBytes(encoder.size()),
        encoder.segments(),
        NumBytes(encoder.data_bytes()),
    );

    Ok(())
}

/// Encode a file or block device as a sparse stream.
///
/// Only the regions containing data are transmitted. Holes are detected with
/// the filesystem's hole tracking when available or by scanning for zeros.
#[derive(Debug, Parser)]
pub struct SendCli {
    /// Path to input file or block device.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output stream.
    ///
    /// Use `-` for stdout.
    #[arg(short, long, value_name = "FILE", value_parser, default_value = "-")]
    pub output: PathBuf,

    /// Wire format of the stream [default: rbd-diff-v1].
    #[arg(short, long, value_name = "FORMAT", value_enum)]
    pub format: Option<FormatKind>,

    /// Hole detection strategy [default: auto].
    #[arg(long, value_name = "MODE", value_enum)]
    pub detect: Option<DetectMode>,

    /// Split data regions into frames no larger than this.
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_section_size: Option<u64>,

    /// Number of chunks buffered between the encoder thread and the output.
    ///
    /// 0 runs the encoder on the main thread.
    #[arg(long, value_name = "CHUNKS")]
    pub pipe_depth: Option<usize>,
}
