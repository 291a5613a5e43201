//! Configuration Store: the durable list of tiles.
//!
//! Owns `tiles.json` and the in-memory list. Knows nothing about bundles or
//! the Dock; the only thing it shares with the rest of the engine is each
//! tile's `identity`. Every mutation goes through one explicit function that
//! validates, applies and persists, returning the new value.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::write_file_atomic;
use crate::error::{TileError, TileResult};
use crate::migration::{decode_document, encode_document};
use crate::models::{BundleIdentity, ConfigId, Configuration};

pub struct ConfigurationStore {
    path: PathBuf,
    identity_prefix: String,
    configurations: Vec<Configuration>,
    /// Identities removed this session; never handed out again.
    retired: HashSet<BundleIdentity>,
}

impl ConfigurationStore {
    /// Load the store from `path`. A missing file is an empty store; a corrupt
    /// one is moved aside so the next save cannot destroy it.
    pub fn open(path: impl Into<PathBuf>, identity_prefix: &str) -> TileResult<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            identity_prefix: identity_prefix.to_string(),
            configurations: Vec::new(),
            retired: HashSet::new(),
        };

        if !store.path.exists() {
            return Ok(store);
        }

        let text = std::fs::read_to_string(&store.path).map_err(|e| TileError::StoreReadFailed {
            path: store.path.clone(),
            reason: e.to_string(),
        })?;

        match decode_document(&text, identity_prefix) {
            Ok(decoded) => {
                store.configurations = decoded.configurations;
                let deduped = store.dedupe_identities();
                if decoded.migrated || deduped {
                    tracing::info!(path = %store.path.display(), "Migrated tiles to current schema");
                    store.save()?;
                }
            }
            Err(reason) => {
                let aside = quarantine(&store.path)?;
                tracing::error!(
                    path = %store.path.display(),
                    moved_to = %aside.display(),
                    "Corrupt tiles file: {reason}. Starting empty."
                );
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn get(&self, id: &ConfigId) -> Option<&Configuration> {
        self.configurations.iter().find(|c| &c.id == id)
    }

    pub fn get_by_identity(&self, identity: &BundleIdentity) -> Option<&Configuration> {
        self.configurations.iter().find(|c| &c.identity == identity)
    }

    /// Create a tile with defaults applied and persist it.
    pub fn create(&mut self, display_name: &str) -> TileResult<Configuration> {
        let cfg = self.fresh(display_name.trim());
        cfg.validate()?;
        self.push(cfg)
    }

    /// Copy `id` under a fresh id and identity. The copy is not visible.
    pub fn duplicate(&mut self, id: &ConfigId) -> TileResult<Configuration> {
        let source = self.get(id).cloned().ok_or(TileError::UnknownConfiguration(*id))?;
        let fresh = self.fresh(&format!("{} Copy", source.display_name));
        let copy = Configuration {
            id: fresh.id,
            identity: fresh.identity,
            display_name: fresh.display_name,
            wants_visible: false,
            member_items: source
                .member_items
                .iter()
                .cloned()
                .map(|mut item| {
                    item.id = uuid::Uuid::new_v4();
                    item
                })
                .collect(),
            ..source
        };
        copy.validate()?;
        self.push(copy)
    }

    /// Defaults plus an identity nobody has used this session.
    fn fresh(&self, display_name: &str) -> Configuration {
        let mut cfg = Configuration::new(display_name, &self.identity_prefix);
        while self.identity_taken(&cfg.identity) {
            cfg = Configuration::new(display_name, &self.identity_prefix);
        }
        cfg
    }

    /// Append a complete record with a single save.
    fn push(&mut self, cfg: Configuration) -> TileResult<Configuration> {
        self.configurations.push(cfg.clone());
        self.save_or_rollback(|s| {
            s.configurations.pop();
        })?;
        Ok(cfg)
    }

    /// Replace a tile wholesale. `id` must exist and `identity` must match the
    /// stored one; identities are immutable.
    pub fn update(&mut self, next: Configuration) -> TileResult<Configuration> {
        next.validate()?;
        let index = self.index_of(&next.id)?;
        if self.configurations[index].identity != next.identity {
            return Err(TileError::InvalidConfiguration(format!(
                "identity of {} cannot change",
                next.id
            )));
        }
        let previous = std::mem::replace(&mut self.configurations[index], next.clone());
        self.save_or_rollback(|s| s.configurations[index] = previous)?;
        Ok(next)
    }

    /// Set declared Dock visibility.
    pub fn set_visible(&mut self, id: &ConfigId, visible: bool) -> TileResult<Configuration> {
        let mut cfg = self.get(id).cloned().ok_or(TileError::UnknownConfiguration(*id))?;
        if cfg.wants_visible == visible {
            return Ok(cfg);
        }
        cfg.wants_visible = visible;
        self.update(cfg)
    }

    /// Record that the given identities are no longer in the Dock. Only ever
    /// turns visibility off. Returns the identities that actually changed.
    pub fn mark_hidden(&mut self, identities: &[BundleIdentity]) -> TileResult<Vec<BundleIdentity>> {
        let before = self.configurations.clone();
        let mut changed = Vec::new();
        for cfg in self.configurations.iter_mut() {
            if cfg.wants_visible && identities.contains(&cfg.identity) {
                cfg.wants_visible = false;
                changed.push(cfg.identity.clone());
            }
        }
        if !changed.is_empty() {
            self.save_or_rollback(|s| s.configurations = before)?;
        }
        Ok(changed)
    }

    /// Delete a tile record. Bundle and Dock cleanup is the caller's job and
    /// must happen first.
    pub fn remove(&mut self, id: &ConfigId) -> TileResult<Configuration> {
        let index = self.index_of(id)?;
        let removed = self.configurations.remove(index);
        let restore = removed.clone();
        self.save_or_rollback(|s| s.configurations.insert(index, restore))?;
        self.retired.insert(removed.identity.clone());
        Ok(removed)
    }

    /// Move a tile to `to_index` in the user-visible order.
    pub fn reorder(&mut self, id: &ConfigId, to_index: usize) -> TileResult<()> {
        let from = self.index_of(id)?;
        let before = self.configurations.clone();
        let cfg = self.configurations.remove(from);
        let to = to_index.min(self.configurations.len());
        self.configurations.insert(to, cfg);
        self.save_or_rollback(|s| s.configurations = before)
    }

    pub fn save(&self) -> TileResult<()> {
        let json = encode_document(&self.configurations).map_err(|reason| {
            TileError::StoreWriteFailed {
                path: self.path.clone(),
                reason,
            }
        })?;
        write_file_atomic(&self.path, json.as_bytes(), Some(0o600)).map_err(|e| {
            TileError::StoreWriteFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn save_or_rollback(&mut self, rollback: impl FnOnce(&mut Self)) -> TileResult<()> {
        if let Err(e) = self.save() {
            rollback(self);
            return Err(e);
        }
        Ok(())
    }

    fn index_of(&self, id: &ConfigId) -> TileResult<usize> {
        self.configurations
            .iter()
            .position(|c| &c.id == id)
            .ok_or(TileError::UnknownConfiguration(*id))
    }

    fn identity_taken(&self, identity: &BundleIdentity) -> bool {
        self.retired.contains(identity) || self.get_by_identity(identity).is_some()
    }

    /// Hand-edited files can contain two records with one identity; the
    /// later record gets a fresh one so the join key stays unique.
    fn dedupe_identities(&mut self) -> bool {
        let mut changed = false;
        let mut seen = HashSet::new();
        for cfg in self.configurations.iter_mut() {
            if !seen.insert(cfg.identity.clone()) {
                let fresh = BundleIdentity::derive(&self.identity_prefix, &ConfigId::new());
                tracing::warn!(
                    duplicate = %cfg.identity,
                    replacement = %fresh,
                    "Duplicate tile identity in tiles file"
                );
                cfg.identity = fresh.clone();
                seen.insert(fresh);
                changed = true;
            }
        }
        changed
    }
}

/// Move a corrupt file out of the way, returning where it went.
fn quarantine(path: &Path) -> TileResult<PathBuf> {
    let aside = path.with_file_name(format!(
        "{}.corrupt-{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        chrono::Utc::now().timestamp()
    ));
    std::fs::rename(path, &aside).map_err(|e| TileError::StoreWriteFailed {
        path: path.to_path_buf(),
        reason: format!("could not move corrupt file aside: {e}"),
    })?;
    Ok(aside)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberItem, TintColor};
    use std::fs;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ConfigurationStore {
        ConfigurationStore::open(dir.path().join("tiles.json"), "com.docktile").unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.configurations().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn create_persists_with_defaults() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let cfg = store.create("  Work ").unwrap();
        assert_eq!(cfg.display_name, "Work");
        assert!(!cfg.wants_visible);

        let reopened = open(&dir);
        assert_eq!(reopened.configurations(), &[cfg]);
    }

    #[test]
    fn update_is_whole_value_and_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let cfg = store.create("Work").unwrap();

        let mut next = cfg.clone();
        next.display_name = "Office".into();
        next.icon.tint = TintColor::Green;
        next.member_items.push(MemberItem::app("Mail", "/System/Applications/Mail.app"));
        store.update(next.clone()).unwrap();
        assert_eq!(open(&dir).get(&cfg.id), Some(&next));

        let mut hijack = next.clone();
        hijack.identity = BundleIdentity::new("com.evil.tile");
        assert!(matches!(store.update(hijack), Err(TileError::InvalidConfiguration(_))));
        assert_eq!(store.get(&cfg.id).unwrap().identity, cfg.identity);
    }

    #[test]
    fn update_unknown_id_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let stray = Configuration::new("Stray", "com.docktile");
        assert!(matches!(store.update(stray), Err(TileError::UnknownConfiguration(_))));
    }

    #[test]
    fn mark_hidden_never_turns_visibility_on() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let a = store.create("A").unwrap();
        let b = store.create("B").unwrap();
        store.set_visible(&a.id, true).unwrap();

        let changed = store
            .mark_hidden(&[a.identity.clone(), b.identity.clone()])
            .unwrap();
        assert_eq!(changed, vec![a.identity.clone()]);
        assert!(!store.get(&a.id).unwrap().wants_visible);
        assert!(!store.get(&b.id).unwrap().wants_visible);
        assert!(!open(&dir).get(&a.id).unwrap().wants_visible);
    }

    #[test]
    fn removed_identity_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let a = store.create("A").unwrap();
        store.remove(&a.id).unwrap();
        assert!(store.identity_taken(&a.identity));
        assert!(store.get(&a.id).is_none());
    }

    #[test]
    fn duplicate_gets_fresh_identity_and_is_hidden() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let a = store.create("Media").unwrap();
        let mut a = store.set_visible(&a.id, true).unwrap();
        a.member_items.push(MemberItem::app("Music", "/System/Applications/Music.app"));
        let a = store.update(a).unwrap();

        let copy = store.duplicate(&a.id).unwrap();
        assert_eq!(copy.display_name, "Media Copy");
        assert_ne!(copy.id, a.id);
        assert_ne!(copy.identity, a.identity);
        assert!(!copy.wants_visible);
        assert_eq!(copy.member_items.len(), 1);
        assert_ne!(copy.member_items[0].id, a.member_items[0].id);
        assert_eq!(store.configurations().len(), 2);
    }

    #[test]
    fn failed_duplicate_leaves_no_partial_copy() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let a = store.create("Media").unwrap();

        // a directory where tiles.json should be makes every save fail
        fs::remove_file(store.path()).unwrap();
        fs::create_dir(store.path()).unwrap();

        assert!(matches!(store.duplicate(&a.id), Err(TileError::StoreWriteFailed { .. })));
        assert_eq!(store.configurations(), &[a]);
    }

    #[test]
    fn reorder_moves_tile() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let a = store.create("A").unwrap();
        let b = store.create("B").unwrap();
        let c = store.create("C").unwrap();
        store.reorder(&c.id, 0).unwrap();
        let order: Vec<_> = open(&dir).configurations().iter().map(|c| c.id).collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tiles.json"), "{{{ nope").unwrap();
        let store = open(&dir);
        assert!(store.configurations().is_empty());
        let aside = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("tiles.json.corrupt-"));
        assert!(aside);
    }

    #[test]
    fn newer_file_with_unknown_values_keeps_every_tile() {
        let dir = TempDir::new().unwrap();
        let text = r#"{"schemaVersion": 3, "configurations": [
            {"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.A", "name": "A"},
            {"id": "7f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.B", "name": "B",
             "layoutMode": "carousel"}
        ]}"#;
        fs::write(dir.path().join("tiles.json"), text).unwrap();

        let store = open(&dir);
        assert_eq!(store.configurations().len(), 2);
        // nothing was rewritten or moved aside
        assert_eq!(fs::read_to_string(store.path()).unwrap(), text);
    }

    #[test]
    fn legacy_file_is_rewritten_in_current_schema() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tiles.json"),
            r#"[{"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "name": "Old", "layoutMode": "grid2x3"}]"#,
        )
        .unwrap();
        let store = open(&dir);
        assert_eq!(store.configurations().len(), 1);
        let text = fs::read_to_string(dir.path().join("tiles.json")).unwrap();
        assert!(text.contains("\"schemaVersion\": 2"));
        assert!(text.contains("\"layoutMode\": \"grid\""));
    }

    #[test]
    fn duplicate_identities_in_file_are_split() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tiles.json"),
            r#"[{"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.A", "name": "One"},
                {"id": "7f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.A", "name": "Two"}]"#,
        )
        .unwrap();
        let store = open(&dir);
        let ids: HashSet<_> = store.configurations().iter().map(|c| c.identity.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.configurations()[0].identity.as_str(), "t.A");
    }
}
