//! Reconciler: brings declared Dock visibility in line with what the Dock
//! actually contains after the user edits it behind our back.
//!
//! Only ever turns visibility off. Showing a tile again is `install`'s job.
//! Never fails loudly: a pass that can't read the Dock or save the store
//! leaves everything as it was and the next change event tries again.

use std::collections::HashSet;
use std::sync::Arc;

use crate::models::BundleIdentity;
use crate::registry::LauncherRegistry;
use crate::store::ConfigurationStore;

pub struct Reconciler {
    registry: Arc<dyn LauncherRegistry>,
}

impl Reconciler {
    pub fn new(registry: Arc<dyn LauncherRegistry>) -> Self {
        Self { registry }
    }

    /// Mark visible tiles missing from the Dock as hidden, skipping `exempt`
    /// (tiles being edited or installed). Returns the identities that changed.
    pub fn reconcile(
        &self,
        store: &mut ConfigurationStore,
        exempt: &HashSet<BundleIdentity>,
    ) -> Vec<BundleIdentity> {
        let mut missing = Vec::new();
        for cfg in store.configurations() {
            if !cfg.wants_visible || exempt.contains(&cfg.identity) {
                continue;
            }
            match self.registry.find(&cfg.identity) {
                Ok(Some(_)) => {}
                Ok(None) => missing.push(cfg.identity.clone()),
                Err(e) => {
                    tracing::warn!("Reconcile skipped: {e}");
                    return Vec::new();
                }
            }
        }
        if missing.is_empty() {
            return Vec::new();
        }

        match store.mark_hidden(&missing) {
            Ok(changed) => {
                for identity in &changed {
                    tracing::info!(%identity, "Tile no longer in Dock, marked hidden");
                }
                changed
            }
            Err(e) => {
                tracing::warn!("Reconcile could not persist: {e}");
                Vec::new()
            }
        }
    }
}
