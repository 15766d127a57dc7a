//! Compilation front door: analysis, key derivation, the two cache tiers and
//! kernel generation.

pub mod cache;
pub mod digest;

pub use cache::{ArtifactMeta, KernelArtifact, KernelCache};
pub use digest::DigestInputs;

use crate::analysis::analyze;
use crate::compute::bytecode::{assemble, Mode};
use crate::compute::{codegen, Kernel};
use crate::config::FlowConfig;
use crate::error::Result;
use crate::expr::ExpressionSet;
use crate::graph::RelationshipGraph;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Compiles expression sets into kernels.
///
/// Each compiler owns a process-local table of artifacts keyed by digest, in front of an
/// optional on-disk cache. The same digest always yields the same shared artifact.
#[derive(Debug)]
pub struct FlowCompiler {
    config: FlowConfig,
    disk: Option<KernelCache>,
    table: Mutex<HashMap<String, Arc<KernelArtifact>>>,
    last_triggered: Option<AtomicBool>,
}

impl Default for FlowCompiler {
    fn default() -> Self {
        Self::new(FlowConfig::default())
    }
}

impl FlowCompiler {
    /// A cache directory that cannot be created is reported and the compiler runs
    /// memory-only.
    pub fn new(config: FlowConfig) -> Self {
        let disk = config.cache_dir.as_ref().and_then(|dir| match KernelCache::open(dir) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "kernel cache disabled");
                None
            }
        });
        let last_triggered = config.track_compilation.then(|| AtomicBool::new(false));
        Self { config, disk, table: Mutex::new(HashMap::new()), last_triggered }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn disk_cache(&self) -> Option<&KernelCache> {
        self.disk.as_ref()
    }

    /// Number of artifacts in the in-memory table.
    pub fn cached_kernels(&self) -> usize {
        self.lock().len()
    }

    /// Whether the most recent `compile` generated a new kernel. `None` unless
    /// `track_compilation` is configured.
    pub fn last_compile_triggered(&self) -> Option<bool> {
        self.last_triggered.as_ref().map(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn compile(&self, graph: &RelationshipGraph, set: &ExpressionSet, mode: Mode) -> Result<Kernel> {
        let analysis = analyze(graph, set)?;
        let inputs = DigestInputs::from_analysis(&analysis, mode);
        let digest = inputs.digest()?;

        let names: Vec<String> = analysis.names.clone();
        if let Some(artifact) = self.lock().get(&digest).cloned() {
            tracing::debug!(%digest, "kernel table hit");
            self.record(false);
            return Ok(Kernel::new(artifact, names, &self.config));
        }

        if let Some(artifact) = self.disk.as_ref().and_then(|d| d.load(&digest)) {
            let artifact = self.publish_local(digest, artifact);
            self.record(false);
            return Ok(Kernel::new(artifact, names, &self.config));
        }

        let source = codegen::emit(&analysis, mode)?;
        let program = assemble(&source)?;
        tracing::info!(
            %digest,
            %mode,
            expressions = set.len(),
            instructions = program.len(),
            "compiled kernel"
        );
        let artifact = KernelArtifact::new(inputs, digest.clone(), source, program);

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.store(&artifact) {
                tracing::warn!(%digest, error = %e, "kernel not persisted; keeping it in memory only");
            }
        }

        let artifact = self.publish_local(digest, artifact);
        self.record(true);
        Ok(Kernel::new(artifact, names, &self.config))
    }

    /// Inserts into the table unless another thread got there first, returning the
    /// winner so every caller shares one artifact per digest.
    fn publish_local(&self, digest: String, artifact: KernelArtifact) -> Arc<KernelArtifact> {
        self.lock().entry(digest).or_insert_with(|| Arc::new(artifact)).clone()
    }

    fn record(&self, triggered: bool) {
        if let Some(flag) = &self.last_triggered {
            flag.store(triggered, Ordering::Relaxed);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<KernelArtifact>>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
