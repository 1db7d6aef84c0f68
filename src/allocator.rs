use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{AnonymizerError, Result};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const DEFAULT_MAX_ATTEMPTS: usize = 1_000;

/// Shape of the generated pseudo-identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// Uppercase letters and digits.
    Alphanumeric { len: usize },
    /// Digits only, without a leading zero.
    Numeric { len: usize },
}

impl Default for IdFormat {
    fn default() -> Self {
        IdFormat::Alphanumeric { len: 8 }
    }
}

/// Generates pseudo-identifiers that do not collide with a given set.
pub struct IdentifierAllocator {
    format: IdFormat,
    max_attempts: usize,
    rng: StdRng,
}

impl IdentifierAllocator {
    pub fn from_entropy(format: IdFormat) -> Self {
        Self::with_rng(format, StdRng::from_entropy())
    }

    pub fn seeded(format: IdFormat, seed: u64) -> Self {
        Self::with_rng(format, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(format: IdFormat, rng: StdRng) -> Self {
        Self {
            format,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rng,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn format(&self) -> IdFormat {
        self.format
    }

    /// Returns a fresh identifier that is not a member of `existing`.
    pub fn allocate(&mut self, existing: &HashSet<String>) -> Result<String> {
        for _ in 0..self.max_attempts {
            let candidate = self.candidate();
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(AnonymizerError::ExhaustedIdentifierSpace {
            attempts: self.max_attempts,
        })
    }

    fn candidate(&mut self) -> String {
        match self.format {
            IdFormat::Alphanumeric { len } => (0..len)
                .map(|_| ALPHANUMERIC[self.rng.gen_range(0..ALPHANUMERIC.len())] as char)
                .collect(),
            IdFormat::Numeric { len } => (0..len)
                .map(|i| {
                    let low = if i == 0 { 1 } else { 0 };
                    char::from(b'0' + self.rng.gen_range(low..10u8))
                })
                .collect(),
        }
    }
}
