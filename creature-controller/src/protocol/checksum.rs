// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame checksums.
//!
//! Outbound command frames end with `\tCS <u16>`. The checksum is the
//! unsigned 16-bit wrapping sum over every byte that precedes the literal
//! `CS`, including the tab separator in front of it. The firmware computes
//! the same sum on receipt and discards the frame on mismatch.

/// 16-bit wrapping byte sum.
pub fn sum(bytes: impl AsRef<[u8]>) -> u16 {
    bytes
        .as_ref()
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Appends the checksum suffix to a finished command line.
pub fn append(line: &str) -> String {
    let mut checked = String::with_capacity(line.len() + 10);
    checked.push_str(line);
    checked.push('\t');
    let cs = sum(checked.as_bytes());
    checked.push_str("CS ");
    checked.push_str(&cs.to_string());
    checked
}

/// Splits a checksummed line into its covered portion (everything through
/// the tab before `CS`) and the claimed checksum. Returns `None` when the
/// suffix is missing or malformed.
pub fn split(line: &str) -> Option<(&str, u16)> {
    let at = line.rfind("\tCS ")?;
    let covered = &line[..at + 1];
    let claimed = line[at + 4..].parse::<u16>().ok()?;
    Some((covered, claimed))
}

/// Whether a line's checksum suffix matches its contents.
pub fn verify(line: &str) -> bool {
    match split(line) {
        Some((covered, claimed)) => sum(covered) == claimed,
        None => false,
    }
}
