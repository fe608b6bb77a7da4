// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem-safe, collision-resistant record names.
//!
//! Every name that ends up as a registry key or a path inside the download
//! directory goes through [`safe_name`]. Only ASCII word characters and dots
//! survive, so separators, query strings and control characters can never
//! reach the filesystem.
//!
//! ```
//! use dlproxy::naming::safe_name;
//!
//! assert_eq!(safe_name("http://h/a.iso?x=1", 1700000000000, 50), "a-1700000000000.iso");
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::LazyLock;

use regex::Regex;

use crate::utils::now_epoch_millis;

/// Default bound on the stem length.
pub const DEFAULT_MAX_STEM_LEN: usize = 50;

/// Used when nothing safe is left of the reference.
pub const FALLBACK_NAME: &str = "download";

/// Extensions longer than this are treated as part of the stem.
const MAX_EXT_LEN: usize = 16;

static SAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9_.]+").expect("valid safe-chars regex")
});

/// Names that look like synthetic load-test fixtures (`100MB-...`, `test1G-...`).
static TEST_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(test)?\d+[MmGg][Bb]?-").expect("valid test-file regex")
});

/// Derive a safe record name from a URL, magnet link or attachment name.
///
/// Takes the last path segment (query and fragment dropped), keeps only
/// `[A-Za-z0-9_.]`, keeps the *tail* of an over-long stem and appends
/// `-{stamp}` before the extension.
pub fn safe_name(reference: &str, stamp: i64, max_stem_len: usize) -> String {
    let without_query = reference
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(reference);
    let segment = without_query.rsplit('/').next().unwrap_or(without_query);

    let filtered: String = SAFE_CHARS
        .find_iter(segment)
        .map(|m| m.as_str())
        .collect();
    let filtered = if filtered.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        filtered
    };

    let (stem, ext) = split_extension(&filtered);
    let stem = tail(stem, max_stem_len.max(1));

    format!("{}-{}{}", stem, stamp, ext)
}

/// Whether a provisional name is refused as a synthetic test fixture.
pub fn is_test_file(name: &str) -> bool {
    TEST_FILE.is_match(name)
}

/// Split `name` into stem and extension (the extension keeps its dot).
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx <= MAX_EXT_LEN => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Last `max` characters of an ASCII string.
fn tail(s: &str, max: usize) -> &str {
    if s.len() > max {
        &s[s.len() - max..]
    } else {
        s
    }
}

/// Process-wide source of strictly increasing millisecond stamps.
///
/// Two submissions of the same reference never get the same stamp, even
/// within one millisecond.
#[derive(Debug, Default)]
pub struct NameStamper {
    last: AtomicI64,
}

impl NameStamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp: the current time in ms, or one past the last stamp.
    pub fn next(&self) -> i64 {
        let now = now_epoch_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Convenience: [`safe_name`] with a fresh stamp.
    pub fn name_for(&self, reference: &str, max_stem_len: usize) -> String {
        safe_name(reference, self.next(), max_stem_len)
    }
}
