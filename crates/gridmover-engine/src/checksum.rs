// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File checksums.

use std::path::Path;

use gridmover_core::ChecksumType;
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::io::AsyncReadExt;

const ADLER_MOD: u32 = 65521;

/// Incremental checksum over one of the supported algorithms.
pub enum Checksummer {
    Adler32 { a: u32, b: u32 },
    Md5(Md5),
    Sha1(Sha1),
    None,
}

impl Checksummer {
    pub fn new(kind: ChecksumType) -> Self {
        match kind {
            ChecksumType::Adler32 => Self::Adler32 { a: 1, b: 0 },
            ChecksumType::Md5 => Self::Md5(Md5::new()),
            ChecksumType::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumType::None => Self::None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Adler32 { a, b } => {
                // 5552 bytes is the largest run that cannot overflow before the modulo.
                for chunk in data.chunks(5552) {
                    for byte in chunk {
                        *a += u32::from(*byte);
                        *b += *a;
                    }
                    *a %= ADLER_MOD;
                    *b %= ADLER_MOD;
                }
            }
            Self::Md5(hasher) => hasher.update(data),
            Self::Sha1(hasher) => hasher.update(data),
            Self::None => {}
        }
    }

    /// Lowercase hex digest, `None` for [`ChecksumType::None`].
    pub fn finish(self) -> Option<String> {
        match self {
            Self::Adler32 { a, b } => Some(format!("{:08x}", (b << 16) | a)),
            Self::Md5(hasher) => Some(hex(&hasher.finalize())),
            Self::Sha1(hasher) => Some(hex(&hasher.finalize())),
            Self::None => None,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Checksum of an in-memory buffer.
pub fn compute(data: &[u8], kind: ChecksumType) -> Option<String> {
    let mut checksummer = Checksummer::new(kind);
    checksummer.update(data);
    checksummer.finish()
}

/// Size and checksum of a local file, read in 64 KiB blocks.
pub async fn compute_file(path: &Path, kind: ChecksumType) -> std::io::Result<(u64, Option<String>)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut checksummer = Checksummer::new(kind);
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        size += read as u64;
        checksummer.update(&buffer[..read]);
    }
    Ok((size, checksummer.finish()))
}

/// Compare two checksums of the same algorithm.
///
/// Case-insensitive; Adler32 values also compare equal without leading zeros.
pub fn matches(expected: &str, actual: &str, kind: ChecksumType) -> bool {
    let normalise = |value: &str| {
        let value = value.trim().to_ascii_lowercase();
        if kind == ChecksumType::Adler32 {
            let stripped = value.trim_start_matches('0');
            if stripped.is_empty() { "0".to_string() } else { stripped.to_string() }
        } else {
            value
        }
    };
    normalise(expected) == normalise(actual)
}
