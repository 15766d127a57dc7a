//! On-disk store of compiled kernels, one `<digest>.kernel.json` file per artifact.
//!
//! Writers stage into a temporary file inside the cache directory and rename it into
//! place, so a reader sees either nothing or a complete artifact. Anything unreadable
//! is reported and treated as a miss.

use super::digest::DigestInputs;
use crate::compute::bytecode::{assemble, Mode, Program};
use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub digest: String,
    pub mode: Mode,
    pub created_unix: u64,
    pub inputs: DigestInputs,
}

/// An immutable compiled kernel: the generated source and its assembled program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelArtifact {
    pub meta: ArtifactMeta,
    pub source: String,
    pub program: Program,
}

impl KernelArtifact {
    pub fn new(inputs: DigestInputs, digest: String, source: String, program: Program) -> Self {
        let created_unix = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        Self {
            meta: ArtifactMeta { digest, mode: inputs.mode, created_unix, inputs },
            source,
            program,
        }
    }

    pub fn digest(&self) -> &str {
        &self.meta.digest
    }

    pub fn mode(&self) -> Mode {
        self.meta.mode
    }

    /// Confirms the artifact is what its file name claims: the recorded inputs hash to
    /// the digest and the stored program is exactly what its source assembles to.
    fn verify(&self, expected: &str) -> std::result::Result<(), String> {
        if self.meta.digest != expected {
            return Err(format!("artifact digest {} does not match file name", self.meta.digest));
        }
        let recomputed = self.meta.inputs.digest().map_err(|e| e.to_string())?;
        if recomputed != expected {
            return Err("recorded inputs do not hash to the artifact digest".into());
        }
        let program = assemble(&self.source).map_err(|e| e.to_string())?;
        if program != self.program || program.mode != self.meta.mode {
            return Err("stored program differs from its assembled source".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KernelCache {
    dir: PathBuf,
}

impl KernelCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| FlowError::CacheIo(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.kernel.json", digest))
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.path_for(digest).is_file()
    }

    /// Loads a verified artifact. Missing files are a silent miss; unreadable, corrupt or
    /// mismatched files are logged and also treated as a miss.
    pub fn load(&self, digest: &str) -> Option<KernelArtifact> {
        let path = self.path_for(digest);
        if !path.is_file() {
            return None;
        }
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read cached kernel");
                return None;
            }
        };
        let artifact: KernelArtifact = match serde_json::from_slice(&bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cached kernel");
                return None;
            }
        };
        if let Err(reason) = artifact.verify(digest) {
            tracing::warn!(path = %path.display(), %reason, "ignoring unverifiable cached kernel");
            return None;
        }
        tracing::debug!(digest, "loaded kernel from disk cache");
        Some(artifact)
    }

    /// Publishes an artifact atomically; concurrent writers of the same digest race
    /// harmlessly since they write identical content.
    pub fn store(&self, artifact: &KernelArtifact) -> Result<PathBuf> {
        let path = self.path_for(artifact.digest());
        let io = |e: std::io::Error| FlowError::CacheIo(format!("{}: {}", path.display(), e));

        let staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(io)?;
        {
            let mut writer = BufWriter::new(staged.as_file());
            serde_json::to_writer(&mut writer, artifact).map_err(|e| FlowError::CacheIo(e.to_string()))?;
            writer.flush().map_err(io)?;
        }
        staged.persist(&path).map_err(|e| io(e.error))?;
        tracing::info!(path = %path.display(), "published kernel to disk cache");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::compute::codegen;
    use crate::expr::ExpressionSet;
    use crate::graph::RelationshipGraph;
    use crate::store::{Coords, Dataset};

    fn artifact() -> KernelArtifact {
        let mut g = RelationshipGraph::new();
        g.add_node("t", Dataset::from_table("row", Coords::Range(3), [("x", vec![1.0, 2.0, 3.0])]).unwrap())
            .unwrap();
        let analysis = analyze(&g, &ExpressionSet::from_exprs(["x * 2"])).unwrap();
        let inputs = DigestInputs::from_analysis(&analysis, Mode::Load);
        let digest = inputs.digest().unwrap();
        let source = codegen::emit(&analysis, Mode::Load).unwrap();
        let program = assemble(&source).unwrap();
        KernelArtifact::new(inputs, digest, source, program)
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KernelCache::open(dir.path()).unwrap();
        let art = artifact();
        assert!(!cache.contains(art.digest()));
        assert!(cache.load(art.digest()).is_none());

        let path = cache.store(&art).unwrap();
        assert!(path.ends_with(format!("{}.kernel.json", art.digest())));
        assert_eq!(cache.load(art.digest()), Some(art));
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KernelCache::open(dir.path()).unwrap();
        let art = artifact();
        fs::write(cache.path_for(art.digest()), b"{ not json").unwrap();
        assert!(cache.load(art.digest()).is_none());
    }

    #[test]
    fn test_tampered_program_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KernelCache::open(dir.path()).unwrap();
        let mut art = artifact();
        art.program.imm[0] ^= 1;
        cache.store(&art).unwrap();
        assert!(cache.load(art.digest()).is_none());
    }

    #[test]
    fn test_unwritable_directory_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"").unwrap();
        let err = KernelCache::open(file.join("sub")).unwrap_err();
        assert!(matches!(err, FlowError::CacheIo(_)));
    }
}
