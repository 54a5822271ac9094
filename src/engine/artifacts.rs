//! Last successful result per analysis kind, tagged with the registry version
//! it was computed against.

use crate::model::{AnalysisView, ExplorationArtifact, ExplorationKind};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    version: u64,
}

impl<T> Entry<T> {
    fn fresh(&self, current: u64) -> Option<&T> {
        (self.version == current).then_some(&self.value)
    }
}

#[derive(Debug, Default)]
pub struct ArtifactCache {
    /// Model training, feature importance or optimal ranges: only one at a time.
    analysis: Option<Entry<AnalysisView>>,
    exploration: HashMap<ExplorationKind, Entry<ExplorationArtifact>>,
}

impl ArtifactCache {
    pub fn analysis(&self, current: u64) -> Option<&AnalysisView> {
        self.analysis.as_ref().and_then(|e| e.fresh(current))
    }

    /// Replace whatever analysis was active.
    pub fn store_analysis(&mut self, view: AnalysisView, version: u64) {
        self.analysis = Some(Entry { value: view, version });
    }

    pub fn exploration(&self, kind: ExplorationKind, current: u64) -> Option<&ExplorationArtifact> {
        self.exploration.get(&kind).and_then(|e| e.fresh(current))
    }

    pub fn store_exploration(&mut self, artifact: ExplorationArtifact, version: u64) {
        self.exploration.insert(
            artifact.kind,
            Entry {
                value: artifact,
                version,
            },
        );
    }

    /// Drop every entry not computed against `current`. Returns how many were dropped.
    pub fn evict_stale(&mut self, current: u64) -> usize {
        let mut evicted = 0;
        if self.analysis.as_ref().is_some_and(|e| e.version != current) {
            self.analysis = None;
            evicted += 1;
        }
        let before = self.exploration.len();
        self.exploration.retain(|_, e| e.version == current);
        evicted + (before - self.exploration.len())
    }

    pub fn clear(&mut self) {
        self.analysis = None;
        self.exploration.clear();
    }
}
