//! Cached view of the dataset's columns.
//!
//! The registry carries a version that every mutation bumps; artifacts are tagged
//! with it so anything computed against an older dataset is recognisably stale.

use crate::model::{Column, ColumnSet};

#[derive(Debug, Default)]
pub struct ColumnRegistry {
    version: u64,
    cached: Option<ColumnSet>,
    /// Derived names in registration order. Survive invalidation, cleared only with the session.
    derived: Vec<String>,
}

impl ColumnRegistry {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Cached columns, or `None` when the next read has to go to the backend.
    pub fn cached(&self) -> Option<&ColumnSet> {
        self.cached.as_ref()
    }

    pub fn derived_names(&self) -> &[String] {
        &self.derived
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
        self.version += 1;
    }

    /// Returns `false` when the name was already registered.
    pub fn register_derived(&mut self, name: &str) -> bool {
        if self.derived.iter().any(|d| d == name) {
            return false;
        }
        self.derived.push(name.to_string());
        true
    }

    /// Forget everything; used when a dataset is (re)uploaded.
    pub fn reset(&mut self) {
        self.derived.clear();
        self.invalidate();
    }

    /// Merge a fetch of `/get_columns` and `/get_augmented_df_columns`.
    ///
    /// The merged set is cached only if no invalidation happened since `fetched_at`.
    pub fn absorb(&mut self, fetched_at: u64, base: Vec<String>, augmented: Vec<String>) -> ColumnSet {
        for name in &augmented {
            if !base.contains(name) {
                self.register_derived(name);
            }
        }

        let mut set = ColumnSet::default();
        for name in base {
            if self.derived.contains(&name) || set.contains(&name) {
                continue;
            }
            set.base.push(Column::base(name));
        }
        set.derived = self.derived.iter().cloned().map(Column::derived).collect();

        if fetched_at == self.version {
            self.cached = Some(set.clone());
        }
        set
    }
}
