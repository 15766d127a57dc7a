//! Content digest of a compilation request.
//!
//! The key is taken from source text and resolved structure, before any folding or
//! ordering, so two textually different sets that lower to the same program still
//! get distinct keys.

use crate::analysis::{Analysis, ResolvedRef};
use crate::compute::bytecode::{Bindings, Mode};
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};

/// Bumped whenever the kernel source format or lowering changes meaning.
pub const FORMAT_VERSION: u32 = 2;

/// Everything that determines a compiled kernel. Expression names are deliberately absent:
/// renaming an output does not change the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInputs {
    pub version: u32,
    pub mode: Mode,
    pub expressions: Vec<String>,
    pub references: Vec<ResolvedRef>,
    /// Root, every column and label-source layout, positional checks and non-root
    /// dimension lengths the strides were computed from.
    pub bindings: Bindings,
    /// Constants as IEEE-754 bit patterns, sorted by name.
    pub constants: Vec<(String, u64)>,
}

impl DigestInputs {
    pub fn from_analysis(analysis: &Analysis, mode: Mode) -> Self {
        Self {
            version: FORMAT_VERSION,
            mode,
            expressions: analysis.normalized.clone(),
            references: analysis.references.clone(),
            bindings: analysis.bindings.clone(),
            constants: analysis.constants.clone(),
        }
    }

    /// Canonical JSON bytes. Struct fields serialize in declaration order and every
    /// collection is an ordered sequence, so equal inputs always give equal bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(|e| FlowError::Internal(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| FlowError::Internal(e.to_string()))
    }

    /// Hex-encoded BLAKE3 digest of the canonical bytes.
    pub fn digest(&self) -> Result<String> {
        let bytes = self.canonical_bytes()?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&bytes);
        Ok(hasher.finalize().to_hex().to_string())
    }
}
