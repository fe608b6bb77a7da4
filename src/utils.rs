// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for dlproxy.
//!
//! Small helpers shared by the registry, the fetch backends and the API.

use chrono::Utc;

/// Current time as epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Current time as epoch milliseconds.
pub fn now_epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render a byte count for humans.
///
/// Divides by 1024 while the value is above 1024 and prints two decimals.
///
/// # Examples
///
/// ```
/// use dlproxy::utils::human_size;
///
/// assert_eq!(human_size(500 * 1024 * 1024), "500.00 MB");
/// assert_eq!(human_size(1024), "1024.00 B");
/// ```
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "EB"];

    let mut value = bytes as f64;
    let mut index = 0;
    while value > 1024.0 && index < UNITS.len() - 1 {
        value /= 1024.0;
        index += 1;
    }
    format!("{:.2} {}", value, UNITS[index])
}

/// Bytes per second over `elapsed` seconds, never dividing by zero.
pub fn rate(bytes: u64, elapsed: i64) -> u64 {
    bytes / elapsed.max(1) as u64
}
