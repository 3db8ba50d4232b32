// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forgiving number parsing for wire text.
//!
//! Firmware telemetry arrives as whitespace-separated decimal fields inside
//! tab-separated tokens. These parsers never fail loudly: unsigned and
//! signed parses fall back to 0, floating point falls back to NaN, and the
//! caller decides whether that is worth a warning. Unsigned parsing accepts
//! a `0x` prefix for the occasional hex field.

/// Parses an unsigned 32-bit field. Leading whitespace is ignored, `0x`
/// selects base 16, and anything unparseable (including negative input)
/// yields 0.
pub fn to_u32(field: &str) -> u32 {
    to_u64(field) as u32
}

/// See [`to_u32`]; same rules at 64 bits.
pub fn to_u64(field: &str) -> u64 {
    let trimmed = field.trim_start();
    let (digits, radix) = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(rest) => (rest, 16),
        None => (trimmed, 10),
    };
    u64::from_str_radix(digits, radix).unwrap_or(0)
}

/// Parses a signed 32-bit field; Dynamixel load readings can legitimately
/// be negative. Unparseable input yields 0.
pub fn to_i32(field: &str) -> i32 {
    field.trim_start().parse::<i32>().unwrap_or(0)
}

/// Parses a floating point field; unparseable input yields NaN.
pub fn to_f64(field: &str) -> f64 {
    field.trim_start().parse::<f64>().unwrap_or(f64::NAN)
}

/// Splits a token into its whitespace-separated fields.
pub fn fields(token: &str) -> Vec<&str> {
    token.split_whitespace().collect()
}
