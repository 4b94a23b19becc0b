// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Classification of FTS file failure reasons.

use regex::RegexSet;

/// Reasons meaning the source replica is gone. Such failures are never retried.
const SOURCE_MISSING_PATTERNS: &[&str] = &[
    r"(?i)source.*(file|path).*(does ?n[o']t exist|not found|no such file)",
    r"(?i)no such file or directory.*source",
    r"(?i)\[SOURCE\].*(ENOENT|No such file)",
    r"(?i)failed to get source file size",
    r"(?i)srm_invalid_path",
];

/// Matches failure reasons against the source-missing pattern set.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    source_missing: RegexSet,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(SOURCE_MISSING_PATTERNS).unwrap_or_else(|_| Self {
            source_missing: RegexSet::empty(),
        })
    }
}

impl FailureClassifier {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            source_missing: RegexSet::new(patterns)?,
        })
    }

    /// Whether the failure means the source file no longer exists.
    pub fn is_source_missing(&self, reason: &str) -> bool {
        self.source_missing.is_match(reason)
    }
}
