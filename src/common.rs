// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;

pub const MIB: i64 = 1024 * 1024;

// Extract the parsing function for unittest.
pub fn parse_file_to_u64<R: BufRead>(reader: R) -> Result<u64> {
    let first_line = reader.lines().next().context("No content in buffer")??;
    first_line
        .trim()
        .parse()
        .with_context(|| format!("Couldn't parse \"{}\" as u64", first_line))
}

/// Get the first line in a file and parse as u64. Returns Ok(None) when the file
/// doesn't exist.
pub fn read_optional_u64<P: AsRef<Path>>(filename: P) -> Result<Option<u64>> {
    let path = filename.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    parse_file_to_u64(reader)
        .with_context(|| format!("Failed to parse {}", path.display()))
        .map(Some)
}
