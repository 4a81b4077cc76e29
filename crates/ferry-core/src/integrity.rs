use md5::{Digest, Md5};

use crate::protocol::{STATUS_HASH_MISMATCH, STATUS_SAVED, STATUS_SIZE_MISMATCH};

/// Length of the MD5 digest carried in a hash frame
pub const DIGEST_LEN: usize = 16;

/// Running MD5 over file content in stream order
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Md5,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, payload: &[u8]) {
        self.inner.update(payload);
    }

    pub fn finalize(self) -> Vec<u8> {
        self.inner.finalize().to_vec()
    }
}

/// Outcome of checking a received file against its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Saved,
    SizeMismatch { declared: u64, received: u64 },
    HashMismatch { expected: Vec<u8>, actual: Vec<u8> },
}

impl Verdict {
    /// Compare what arrived with what the sender declared.
    ///
    /// Size is checked first. Digests are only compared when both sides
    /// have one.
    pub fn evaluate(
        declared: u64,
        received: u64,
        expected: Option<&[u8]>,
        actual: Option<&[u8]>,
    ) -> Self {
        if declared != received {
            return Verdict::SizeMismatch { declared, received };
        }

        match (expected, actual) {
            (Some(expected), Some(actual)) if expected != actual => Verdict::HashMismatch {
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            },
            _ => Verdict::Saved,
        }
    }

    /// Status line sent back to the client
    pub fn status(&self) -> &'static str {
        match self {
            Verdict::Saved => STATUS_SAVED,
            Verdict::SizeMismatch { .. } => STATUS_SIZE_MISMATCH,
            Verdict::HashMismatch { .. } => STATUS_HASH_MISMATCH,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, Verdict::Saved)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Saved => write!(f, "saved"),
            Verdict::SizeMismatch { declared, received } => {
                write!(f, "declared {} bytes, received {}", declared, received)
            }
            Verdict::HashMismatch { expected, actual } => write!(
                f,
                "expected digest {}, computed {}",
                hex::encode(expected),
                hex::encode(actual)
            ),
        }
    }
}
