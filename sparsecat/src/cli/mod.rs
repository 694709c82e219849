// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod completion;
pub mod info;
pub mod receive;
pub mod send;

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::Path,
};

use anyhow::{Context, Result};

/// Path that refers to stdin or stdout.
pub(crate) fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

pub(crate) fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

pub(crate) fn open_writer(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open for writing: {path:?}"))
}

/// Open a stream for reading, with `-` meaning stdin.
pub(crate) fn open_stream_reader(path: &Path) -> Result<Box<dyn Read>> {
    if is_stdio(path) {
        Ok(Box::new(io::stdin().lock()))
    } else {
        Ok(Box::new(BufReader::new(open_reader(path)?)))
    }
}

/// Open a stream for writing, with `-` meaning stdout.
pub(crate) fn open_stream_writer(path: &Path) -> Result<Box<dyn Write>> {
    if is_stdio(path) {
        Ok(Box::new(io::stdout().lock()))
    } else {
        Ok(Box::new(open_writer(path)?))
    }
}

/// Get a [`File`] for stdout so that a redirected regular file can be written
/// in direct mode.
#[cfg(unix)]
pub(crate) fn stdout_file() -> Result<File> {
    use std::os::fd::AsFd;

    let fd = io::stdout()
        .as_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate stdout")?;

    Ok(File::from(fd))
}
