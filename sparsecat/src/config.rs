// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Defaults loaded from a TOML file. Every key is optional and command-line
//! flags take precedence over the file.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{format::FormatKind, hole::DetectMode};

/// Default number of chunks in flight between the encoder thread and the
/// output writer.
pub const DEFAULT_PIPE_DEPTH: usize = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Wire format for both sending and receiving.
    pub format: Option<FormatKind>,
    /// Hole detection strategy for sending.
    pub detect: Option<DetectMode>,
    /// Upper bound on the payload size of a single data frame.
    pub max_section_size: Option<u64>,
    /// Whether receiving may write directly into a regular file.
    pub sparse_target: Option<bool>,
    /// Number of chunks buffered between the encoder and the output. 0 runs
    /// the encoder on the calling thread.
    pub pipe_depth: Option<usize>,
}

impl Config {
    pub fn format(&self) -> FormatKind {
        self.format.unwrap_or_default()
    }

    pub fn detect(&self) -> DetectMode {
        self.detect.unwrap_or_default()
    }

    pub fn sparse_target(&self) -> bool {
        self.sparse_target.unwrap_or(true)
    }

    pub fn pipe_depth(&self) -> usize {
        self.pipe_depth.unwrap_or(DEFAULT_PIPE_DEPTH)
    }
}

pub fn parse_config(data: &str) -> Result<Config> {
    let config: Config = toml_edit::de::from_str(data)?;

    if config.max_section_size == Some(0) {
        bail!("max_section_size must be greater than 0");
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config: {path:?}"))?;

    parse_config(&contents).with_context(|| format!("Failed to parse config: {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let config = parse_config(
            r#"
            format = "rbd-diff-v2"
            detect = "scan"
            max_section_size = 16000000
            sparse_target = false
            pipe_depth = 0
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            Config {
                format: Some(FormatKind::RbdDiffV2),
                detect: Some(DetectMode::Scan),
                max_section_size: Some(16_000_000),
                sparse_target: Some(false),
                pipe_depth: Some(0),
            }
        );
    }

    #[test]
    fn defaults() {
        let config = parse_config("").unwrap();

        assert_eq!(config.format(), FormatKind::RbdDiffV1);
        assert_eq!(config.detect(), DetectMode::Auto);
        assert!(config.sparse_target());
        assert_eq!(config.pipe_depth(), DEFAULT_PIPE_DEPTH);
    }

    #[test]
    fn reject_invalid() {
        assert!(parse_config("foo = 1").is_err());
        assert!(parse_config(r#"format = "rbd-diff-v3""#).is_err());
        assert!(parse_config("max_section_size = 0").is_err());
    }
}
