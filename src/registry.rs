//! Launcher Registry: the Dock's persistent app list.
//!
//! The backing file (`com.apple.dock.plist`) belongs to the shell and can be
//! rewritten by it or by the user at any moment. Every operation therefore
//! reads the file fresh, edits an in-memory copy, and replaces the file
//! atomically. Nothing read here is cached across calls.
//!
//! Entries are matched by the identity in the referenced bundle's manifest.
//! When the bundle is gone the entry is stale: it never counts as present,
//! but it is still removed on uninstall if the identity recorded in the entry
//! itself matches.

use parking_lot::Mutex;
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::write_file_atomic;
use crate::error::{TileError, TileResult};
use crate::manifest::{read_identity, read_manifest};
use crate::models::BundleIdentity;
use crate::tool_cmd::tool_cmd;

const KEY_PERSISTENT_APPS: &str = "persistent-apps";
const KEY_TILE_DATA: &str = "tile-data";
const KEY_FILE_DATA: &str = "file-data";
const KEY_URL_STRING: &str = "_CFURLString";
const KEY_URL_TYPE: &str = "_CFURLStringType";
const KEY_LABEL: &str = "file-label";
const KEY_BUNDLE_ID: &str = "bundle-identifier";
/// `_CFURLStringType` for a plain POSIX path; anything else is a URL.
const URL_TYPE_PATH: i64 = 0;
const URL_TYPE_URL: i64 = 15;
const BINARY_MAGIC: &[u8] = b"bplist";

/// One Dock entry as the engine sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Position in the persistent list
    pub index: usize,
    pub path: Option<PathBuf>,
    pub label: Option<String>,
    /// Identity written into the entry itself (by us or by the shell)
    pub recorded_identity: Option<BundleIdentity>,
    /// Identity read from the referenced bundle; `None` means stale
    pub resolved_identity: Option<BundleIdentity>,
}

impl RegistryEntry {
    pub fn is_stale(&self) -> bool {
        self.resolved_identity.is_none()
    }

    /// Whether this entry belongs to `identity`. Resolvable entries match on
    /// the bundle's own identity; stale ones fall back to the recorded one.
    fn belongs_to(&self, identity: &BundleIdentity) -> bool {
        match &self.resolved_identity {
            Some(resolved) => resolved == identity,
            None => self.recorded_identity.as_ref() == Some(identity),
        }
    }
}

/// Outcome of `add`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    Unchanged,
    Updated,
}

pub trait LauncherRegistry: Send + Sync {
    /// Live (non-stale) entry for `identity`.
    fn find(&self, identity: &BundleIdentity) -> TileResult<Option<RegistryEntry>>;
    /// Register the bundle at `bundle`, replacing any entry with the same
    /// identity in place. Never produces two entries for one identity.
    fn add(&self, bundle: &Path) -> TileResult<RegistryChange>;
    /// Remove every entry of `identity`, stale ones included. Returns how many.
    fn remove_by_identity(&self, identity: &BundleIdentity) -> TileResult<usize>;
    /// Whether a live entry points at `bundle`.
    fn is_present(&self, bundle: &Path) -> bool;
    /// Ask the shell to reload its list without changing it.
    fn request_reload(&self);
}

// ---------------------------------------------------------------------------
// Shell reload signal
// ---------------------------------------------------------------------------

pub trait ShellReloader: Send + Sync {
    /// Fire and forget. Completion is not observable.
    fn reload(&self);
}

/// Runs the configured reload command (default `killall Dock`) on a
/// background thread and logs its exit status.
pub struct CommandReloader {
    command: Vec<String>,
}

impl CommandReloader {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ShellReloader for CommandReloader {
    fn reload(&self) {
        let Some((program, args)) = self.command.split_first() else {
            tracing::warn!("No shell reload command configured");
            return;
        };
        let program = program.clone();
        let args = args.to_vec();
        std::thread::spawn(move || {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            match tool_cmd(&program).args(&arg_refs).run() {
                Ok(_) => tracing::debug!(%program, "Shell reload signalled"),
                Err(e) => tracing::warn!("Shell reload command failed: {e}"),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Dock plist backend
// ---------------------------------------------------------------------------

pub struct DockRegistry {
    plist_path: PathBuf,
    reloader: Arc<dyn ShellReloader>,
    /// Serializes this process's own read-modify-write cycles. Held only for
    /// the duration of one cycle.
    write_lock: Mutex<()>,
}

/// Parsed document plus the format it came in.
struct DockDocument {
    root: Dictionary,
    binary: bool,
}

impl DockRegistry {
    pub fn new(plist_path: impl Into<PathBuf>, reloader: Arc<dyn ShellReloader>) -> Self {
        Self {
            plist_path: plist_path.into(),
            reloader,
            write_lock: Mutex::new(()),
        }
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }

    /// Every entry in the persistent list, in Dock order.
    pub fn entries(&self) -> TileResult<Vec<RegistryEntry>> {
        let doc = self.read()?;
        Ok(parse_entries(&doc.root))
    }

    fn read(&self) -> TileResult<DockDocument> {
        let bytes = match std::fs::read(&self.plist_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DockDocument {
                    root: Dictionary::new(),
                    binary: true,
                });
            }
            Err(e) => return Err(self.read_error(e)),
        };
        let binary = bytes.starts_with(BINARY_MAGIC);
        let root = Value::from_reader(std::io::Cursor::new(bytes))
            .map_err(|e| self.read_error(e))?
            .into_dictionary()
            .ok_or_else(|| self.read_error("root is not a dictionary"))?;
        Ok(DockDocument { root, binary })
    }

    fn write(&self, doc: DockDocument) -> TileResult<()> {
        let value = Value::Dictionary(doc.root);
        let mut buf = Vec::new();
        if doc.binary {
            value.to_writer_binary(&mut buf)
        } else {
            value.to_writer_xml(&mut buf)
        }
        .map_err(|e| self.write_error(e))?;
        write_file_atomic(&self.plist_path, &buf, None).map_err(|e| self.write_error(e))?;
        self.reloader.reload();
        Ok(())
    }

    fn read_error(&self, reason: impl ToString) -> TileError {
        TileError::RegistryReadFailed {
            path: self.plist_path.clone(),
            reason: reason.to_string(),
        }
    }

    fn write_error(&self, reason: impl ToString) -> TileError {
        TileError::RegistryWriteFailed {
            path: self.plist_path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl LauncherRegistry for DockRegistry {
    fn find(&self, identity: &BundleIdentity) -> TileResult<Option<RegistryEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.resolved_identity.as_ref() == Some(identity)))
    }

    fn add(&self, bundle: &Path) -> TileResult<RegistryChange> {
        let manifest = read_manifest(bundle)?;
        let url = url::Url::from_directory_path(bundle)
            .map_err(|()| self.write_error(format!("{} is not an absolute path", bundle.display())))?;

        let _guard = self.write_lock.lock();
        let mut doc = self.read()?;
        let entries = parse_entries(&doc.root);
        let matches: Vec<&RegistryEntry> = entries
            .iter()
            .filter(|e| e.belongs_to(&manifest.identity) || e.path.as_deref() == Some(bundle))
            .collect();

        if let [only] = matches.as_slice()
            && only.path.as_deref() == Some(bundle)
            && only.resolved_identity.as_ref() == Some(&manifest.identity)
            && only.recorded_identity.as_ref() == Some(&manifest.identity)
            && only.label.as_deref() == Some(manifest.display_name.as_str())
        {
            return Ok(RegistryChange::Unchanged);
        }

        let keep_at = matches.first().map(|e| e.index);
        let extra: Vec<usize> = matches.iter().skip(1).map(|e| e.index).collect();

        let mut apps = persistent_apps(&doc.root);
        let entry = match keep_at.and_then(|i| apps.get(i).cloned()) {
            Some(existing) => existing,
            None => new_entry(),
        };
        let entry = stamp_entry(entry, url.as_str(), &manifest.display_name, &manifest.identity);
        match keep_at {
            Some(i) => apps[i] = entry,
            None => apps.push(entry),
        }
        for index in extra.into_iter().rev() {
            apps.remove(index);
        }
        doc.root.insert(KEY_PERSISTENT_APPS.into(), Value::Array(apps));

        self.write(doc)?;
        tracing::info!(identity = %manifest.identity, path = %bundle.display(), "Registered tile in Dock");
        Ok(RegistryChange::Updated)
    }

    fn remove_by_identity(&self, identity: &BundleIdentity) -> TileResult<usize> {
        let _guard = self.write_lock.lock();
        let mut doc = self.read()?;
        let doomed: Vec<usize> = parse_entries(&doc.root)
            .into_iter()
            .filter(|e| e.belongs_to(identity))
            .map(|e| e.index)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut apps = persistent_apps(&doc.root);
        for index in doomed.iter().rev() {
            apps.remove(*index);
        }
        doc.root.insert(KEY_PERSISTENT_APPS.into(), Value::Array(apps));
        self.write(doc)?;
        tracing::info!(%identity, removed = doomed.len(), "Removed tile from Dock");
        Ok(doomed.len())
    }

    fn is_present(&self, bundle: &Path) -> bool {
        match self.entries() {
            Ok(entries) => entries
                .iter()
                .any(|e| !e.is_stale() && e.path.as_deref() == Some(bundle)),
            Err(e) => {
                tracing::warn!("{e}");
                false
            }
        }
    }

    fn request_reload(&self) {
        self.reloader.reload();
    }
}

// ---------------------------------------------------------------------------
// Entry parsing
// ---------------------------------------------------------------------------

fn parse_entries(root: &Dictionary) -> Vec<RegistryEntry> {
    let Some(apps) = root.get(KEY_PERSISTENT_APPS).and_then(Value::as_array) else {
        return Vec::new();
    };
    apps.iter()
        .enumerate()
        .map(|(index, value)| {
            let tile = value
                .as_dictionary()
                .and_then(|d| d.get(KEY_TILE_DATA))
                .and_then(Value::as_dictionary);
            let path = tile.and_then(entry_path);
            let resolved_identity = path.as_deref().and_then(read_identity);
            RegistryEntry {
                index,
                label: tile
                    .and_then(|t| t.get(KEY_LABEL))
                    .and_then(Value::as_string)
                    .map(str::to_string),
                recorded_identity: tile
                    .and_then(|t| t.get(KEY_BUNDLE_ID))
                    .and_then(Value::as_string)
                    .map(BundleIdentity::new),
                resolved_identity,
                path,
            }
        })
        .collect()
}

fn entry_path(tile: &Dictionary) -> Option<PathBuf> {
    let file_data = tile.get(KEY_FILE_DATA)?.as_dictionary()?;
    let raw = file_data.get(KEY_URL_STRING)?.as_string()?;
    let kind = file_data
        .get(KEY_URL_TYPE)
        .and_then(Value::as_signed_integer)
        .unwrap_or(URL_TYPE_URL);
    if kind == URL_TYPE_PATH {
        return Some(PathBuf::from(raw));
    }
    url::Url::parse(raw).ok()?.to_file_path().ok()
}

/// Copy of the persistent list. Written back with `insert`, which keeps the
/// key's position in the document.
fn persistent_apps(root: &Dictionary) -> Vec<Value> {
    root.get(KEY_PERSISTENT_APPS)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn new_entry() -> Value {
    let guid = uuid::Uuid::new_v4().as_u128() as u32;
    let mut entry = Dictionary::new();
    entry.insert("GUID".into(), Value::Integer(i64::from(guid).into()));
    entry.insert("tile-type".into(), Value::String("file-tile".into()));
    entry.insert(KEY_TILE_DATA.into(), Value::Dictionary(Dictionary::new()));
    Value::Dictionary(entry)
}

/// Point `entry` at the bundle, keeping every shell-owned field we don't touch.
fn stamp_entry(entry: Value, url: &str, label: &str, identity: &BundleIdentity) -> Value {
    let mut entry = entry.into_dictionary().unwrap_or_default();
    let mut tile = entry
        .remove(KEY_TILE_DATA)
        .and_then(Value::into_dictionary)
        .unwrap_or_default();
    let mut file_data = tile
        .remove(KEY_FILE_DATA)
        .and_then(Value::into_dictionary)
        .unwrap_or_default();

    file_data.insert(KEY_URL_STRING.into(), Value::String(url.to_string()));
    file_data.insert(KEY_URL_TYPE.into(), Value::Integer(URL_TYPE_URL.into()));
    tile.insert(KEY_FILE_DATA.into(), Value::Dictionary(file_data));
    tile.insert(KEY_LABEL.into(), Value::String(label.to_string()));
    tile.insert(KEY_BUNDLE_ID.into(), Value::String(identity.to_string()));
    entry.insert(KEY_TILE_DATA.into(), Value::Dictionary(tile));
    Value::Dictionary(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingReloader, fake_bundle, write_dock_plist};
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> (DockRegistry, Arc<RecordingReloader>) {
        let reloader = Arc::new(RecordingReloader::default());
        let registry = DockRegistry::new(dir.path().join("com.apple.dock.plist"), reloader.clone());
        (registry, reloader)
    }

    #[test]
    fn missing_plist_is_empty() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        assert!(registry.entries().unwrap().is_empty());
        assert!(registry.find(&BundleIdentity::new("t.A")).unwrap().is_none());
    }

    #[test]
    fn add_then_find_by_identity() {
        let dir = TempDir::new().unwrap();
        let (registry, reloader) = registry(&dir);
        let bundle = fake_bundle(dir.path(), "Tile A", "t.A");

        assert_eq!(registry.add(&bundle).unwrap(), RegistryChange::Updated);
        assert_eq!(reloader.count(), 1);

        let entry = registry.find(&BundleIdentity::new("t.A")).unwrap().unwrap();
        assert_eq!(entry.path.as_deref(), Some(bundle.as_path()));
        assert_eq!(entry.label.as_deref(), Some("Tile A"));
        assert!(registry.is_present(&bundle));
    }

    #[test]
    fn add_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (registry, reloader) = registry(&dir);
        let bundle = fake_bundle(dir.path(), "Tile A", "t.A");

        registry.add(&bundle).unwrap();
        assert_eq!(registry.add(&bundle).unwrap(), RegistryChange::Unchanged);
        assert_eq!(registry.entries().unwrap().len(), 1);
        assert_eq!(reloader.count(), 1);
    }

    #[test]
    fn add_replaces_entry_in_place_after_rename() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        let finder = dir.path().join("Finder.app");
        write_dock_plist(registry.plist_path(), &[(finder.as_path(), None)], true);

        let old = fake_bundle(dir.path(), "Old", "t.A");
        registry.add(&old).unwrap();
        std::fs::remove_dir_all(&old).unwrap();
        let new = fake_bundle(dir.path(), "New", "t.A");
        registry.add(&new).unwrap();

        let entries = registry.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].path.as_deref(), Some(new.as_path()));
        assert_eq!(entries[1].recorded_identity, Some(BundleIdentity::new("t.A")));
    }

    #[test]
    fn stale_entry_is_not_present_but_is_removable() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        let bundle = fake_bundle(dir.path(), "Tile A", "t.A");
        registry.add(&bundle).unwrap();
        std::fs::remove_dir_all(&bundle).unwrap();

        assert!(registry.find(&BundleIdentity::new("t.A")).unwrap().is_none());
        assert!(!registry.is_present(&bundle));
        assert!(registry.entries().unwrap()[0].is_stale());

        assert_eq!(registry.remove_by_identity(&BundleIdentity::new("t.A")).unwrap(), 1);
        assert!(registry.entries().unwrap().is_empty());
    }

    #[test]
    fn remove_leaves_foreign_entries_and_fields_alone() {
        let dir = TempDir::new().unwrap();
        let (registry, reloader) = registry(&dir);
        let safari = dir.path().join("Safari.app");
        write_dock_plist(registry.plist_path(), &[(safari.as_path(), Some("com.apple.Safari"))], false);

        let bundle = fake_bundle(dir.path(), "Tile A", "t.A");
        registry.add(&bundle).unwrap();
        assert_eq!(registry.remove_by_identity(&BundleIdentity::new("t.A")).unwrap(), 1);
        assert_eq!(registry.remove_by_identity(&BundleIdentity::new("t.A")).unwrap(), 0);
        assert_eq!(reloader.count(), 2);

        let entries = registry.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recorded_identity, Some(BundleIdentity::new("com.apple.Safari")));

        // untouched shell-owned key and original (xml) format survive
        let text = std::fs::read_to_string(registry.plist_path()).unwrap();
        assert!(text.contains("<key>autohide</key>"));
    }

    #[test]
    fn binary_plist_stays_binary() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        write_dock_plist(registry.plist_path(), &[], true);
        registry.add(&fake_bundle(dir.path(), "Tile A", "t.A")).unwrap();
        let bytes = std::fs::read(registry.plist_path()).unwrap();
        assert!(bytes.starts_with(BINARY_MAGIC));
    }

    #[test]
    fn corrupt_plist_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = registry(&dir);
        std::fs::write(registry.plist_path(), "garbage").unwrap();
        let err = registry.find(&BundleIdentity::new("t.A")).unwrap_err();
        assert_eq!(err.label(), "RegistryReadFailed");
        assert!(!registry.is_present(&dir.path().join("x.app")));
    }

    #[test]
    fn add_requires_resolvable_bundle() {
        let dir = TempDir::new().unwrap();
        let (registry, reloader) = registry(&dir);
        let err = registry.add(&dir.path().join("Nope.app")).unwrap_err();
        assert_eq!(err.label(), "ManifestReadFailed");
        assert_eq!(reloader.count(), 0);
    }

    #[test]
    fn plain_path_entries_are_understood() {
        let mut file_data = Dictionary::new();
        file_data.insert(KEY_URL_STRING.into(), Value::String("/Applications/Mail.app".into()));
        file_data.insert(KEY_URL_TYPE.into(), Value::Integer(0.into()));
        let mut tile = Dictionary::new();
        tile.insert(KEY_FILE_DATA.into(), Value::Dictionary(file_data));
        assert_eq!(entry_path(&tile), Some(PathBuf::from("/Applications/Mail.app")));
    }

    #[test]
    fn url_entries_are_percent_decoded() {
        let mut file_data = Dictionary::new();
        file_data.insert(
            KEY_URL_STRING.into(),
            Value::String("file:///Users/me/My%20Tiles/Work%20Stuff.app/".into()),
        );
        file_data.insert(KEY_URL_TYPE.into(), Value::Integer(15.into()));
        let mut tile = Dictionary::new();
        tile.insert(KEY_FILE_DATA.into(), Value::Dictionary(file_data));
        assert_eq!(
            entry_path(&tile),
            Some(PathBuf::from("/Users/me/My Tiles/Work Stuff.app"))
        );
    }
}
