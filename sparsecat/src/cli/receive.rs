// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::{
    cli,
    config::Config,
    decoder::{self, Decoder, OutputMode},
    format::FormatKind,
    util::NumBytes,
};

#[cfg(unix)]
fn decode_to_stdout<R: std::io::Read>(
    decoder: &mut Decoder<R>,
    allow_direct: bool,
    cancel_signal: &AtomicBool,
) -> Result<OutputMode> {
    let mut file = cli::stdout_file()?;

    Ok(decoder::decode_to_file(
        decoder,
        &mut file,
        allow_direct,
        cancel_signal,
    )?)
}

#[cfg(not(unix))]
fn decode_to_stdout<R: std::io::Read>(
    decoder: &mut Decoder<R>,
    _allow_direct: bool,
    cancel_signal: &AtomicBool,
) -> Result<OutputMode> {
    decoder.copy_to(std::io::stdout().lock(), cancel_signal)?;

    Ok(OutputMode::Generic)
}

pub fn receive_main(cli: &ReceiveCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let format = cli.format.unwrap_or_else(|| config.format());
    let allow_direct = !cli.disable_sparse_target && config.sparse_target();

    let reader = cli::open_stream_reader(&cli.input)?;
    let mut decoder = Decoder::new(reader, format.format());

    let mode = if cli::is_stdio(&cli.output) {
        decode_to_stdout(&mut decoder, allow_direct, cancel_signal)
    } else {
        let mut file = cli::open_writer(&cli.output)?;

        decoder::decode_to_file(&mut decoder, &mut file, allow_direct, cancel_signal)
            .map_err(Into::into)
    }
    .with_context(|| format!("Failed to receive: {:?} -> {:?}", cli.input, cli.output))?;

    let size = decoder
        .file_size()
        .with_context(|| format!("Failed to read stream: {:?}", cli.input))?;

    info!(
        "Received {} as {format} in {mode} mode: {} sections containing {}",
        NumBytes(size),
        decoder.segments(),
        NumBytes(decoder.data_bytes()),
    );

    Ok(())
}

/// Decode a sparse stream into a file.
///
/// If the output is a regular file, only the data regions are written and the
/// holes are left unallocated. Otherwise, every byte is written.
#[derive(Debug, Parser)]
pub struct ReceiveCli {
    /// Path to input stream.
    ///
    /// Use `-` for stdin.
    #[arg(short, long, value_name = "FILE", value_parser, default_value = "-")]
    pub input: PathBuf,

    /// Path to output file.
    ///
    /// Use `-` for stdout. If stdout is redirected to a regular file, it is
    /// written sparsely too.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Wire format of the stream [default: rbd-diff-v1].
    #[arg(short, long, value_name = "FORMAT", value_enum)]
    pub format: Option<FormatKind>,

    /// Write every byte, including holes, even if the output is a regular
    /// file.
    #[arg(long)]
    pub disable_sparse_target: bool,
}
