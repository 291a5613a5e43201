//! Test doubles and filesystem fixtures shared by the unit tests.

use parking_lot::Mutex;
use plist::{Dictionary, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{TileError, TileResult};
use crate::icon::{IconRasterizer, IconRequest};
use crate::manifest::{KEY_IDENTITY, KEY_NAME, manifest_path};
use crate::models::BundleIdentity;
use crate::process::{LaunchOptions, ProcessController};
use crate::registry::ShellReloader;
use crate::signer::BundleSigner;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

// ---------------------------------------------------------------------------
// Rasterizer
// ---------------------------------------------------------------------------

/// Returns a PNG signature followed by the request parameters, so equal
/// requests give equal bytes.
pub(crate) struct StubRasterizer {
    fixed: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl Default for StubRasterizer {
    fn default() -> Self {
        Self {
            fixed: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl StubRasterizer {
    pub(crate) fn returning(bytes: Vec<u8>) -> Self {
        Self {
            fixed: Some(bytes),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IconRasterizer for StubRasterizer {
    fn render(&self, request: &IconRequest<'_>) -> TileResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(bytes) = &self.fixed {
            return Ok(bytes.clone());
        }
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(
            format!(
                "{}:{}:{}:{}",
                request.spec.tint.hex(),
                request.spec.glyph_value,
                request.style.as_str(),
                request.size
            )
            .as_bytes(),
        );
        Ok(png)
    }
}

// ---------------------------------------------------------------------------
// Shell reload
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingReloader {
    count: AtomicUsize,
}

impl RecordingReloader {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ShellReloader for RecordingReloader {
    fn reload(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeProcessController {
    running: Mutex<HashSet<BundleIdentity>>,
    launches: Mutex<Vec<(PathBuf, LaunchOptions)>>,
    terminations: AtomicUsize,
    /// Ignore terminate requests.
    stubborn: bool,
    fail_launch: bool,
}

impl FakeProcessController {
    pub(crate) fn stubborn() -> Self {
        Self {
            stubborn: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_launch() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    pub(crate) fn set_running(&self, identity: &BundleIdentity) {
        self.running.lock().insert(identity.clone());
    }

    pub(crate) fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn launches(&self) -> Vec<(PathBuf, LaunchOptions)> {
        self.launches.lock().clone()
    }
}

impl ProcessController for FakeProcessController {
    fn is_running(&self, identity: &BundleIdentity) -> bool {
        self.running.lock().contains(identity)
    }

    fn terminate(&self, identity: &BundleIdentity) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.running.lock().remove(identity);
        }
    }

    fn launch(&self, bundle: &Path, options: LaunchOptions) -> TileResult<()> {
        self.launches.lock().push((bundle.to_path_buf(), options));
        if self.fail_launch {
            return Err(TileError::LaunchFailed {
                path: bundle.to_path_buf(),
                reason: "launch refused".to_string(),
            });
        }
        if let Some(identity) = crate::manifest::read_identity(bundle) {
            self.running.lock().insert(identity);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeSigner {
    fail: bool,
    delay: Duration,
    signed: Mutex<Vec<PathBuf>>,
}

impl FakeSigner {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Takes `delay` per bundle, like a real codesign run.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn signed(&self) -> Vec<PathBuf> {
        self.signed.lock().clone()
    }
}

impl BundleSigner for FakeSigner {
    fn sign(&self, bundle: &Path) -> TileResult<()> {
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(TileError::SigningFailed {
                path: bundle.to_path_buf(),
                reason: "codesign exited with code 1: no identity found".to_string(),
            });
        }
        self.signed.lock().push(bundle.to_path_buf());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn write_info_plist(bundle: &Path, dict: Dictionary) {
    std::fs::create_dir_all(bundle.join("Contents")).unwrap();
    Value::Dictionary(dict)
        .to_file_xml(manifest_path(bundle))
        .unwrap();
}

/// Minimal installed-looking bundle `<dir>/<name>.app` carrying `identity`.
pub(crate) fn fake_bundle(dir: &Path, name: &str, identity: &str) -> PathBuf {
    let bundle = dir.join(format!("{name}.app"));
    let mut dict = Dictionary::new();
    dict.insert(KEY_IDENTITY.into(), Value::String(identity.into()));
    dict.insert(KEY_NAME.into(), Value::String(name.into()));
    dict.insert(
        crate::manifest::KEY_DISPLAY_NAME.into(),
        Value::String(name.into()),
    );
    write_info_plist(&bundle, dict);
    bundle
}

/// Skeleton the generator copies: manifest, helper executable, resources.
pub(crate) fn template_bundle(dir: &Path) -> PathBuf {
    let bundle = dir.join("TileTemplate.app");
    let mut dict = Dictionary::new();
    dict.insert("CFBundleExecutable".into(), Value::String("TileHelper".into()));
    dict.insert(KEY_IDENTITY.into(), Value::String("com.docktile.template".into()));
    dict.insert("CFBundlePackageType".into(), Value::String("APPL".into()));
    write_info_plist(&bundle, dict);

    let macos = bundle.join("Contents").join("MacOS");
    std::fs::create_dir_all(&macos).unwrap();
    let helper = macos.join("TileHelper");
    std::fs::write(&helper, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    std::fs::create_dir_all(bundle.join("Contents").join("Resources")).unwrap();
    bundle
}

/// Dock preferences with one `persistent-apps` entry per `(path, recorded id)`
/// and an unrelated shell-owned key.
pub(crate) fn write_dock_plist(path: &Path, apps: &[(&Path, Option<&str>)], binary: bool) {
    let entries = apps
        .iter()
        .map(|(app, recorded)| {
            let url = url::Url::from_directory_path(app).unwrap();
            let mut file_data = Dictionary::new();
            file_data.insert("_CFURLString".into(), Value::String(url.to_string()));
            file_data.insert("_CFURLStringType".into(), Value::Integer(15.into()));
            let mut tile = Dictionary::new();
            tile.insert("file-data".into(), Value::Dictionary(file_data));
            tile.insert(
                "file-label".into(),
                Value::String(app.file_stem().unwrap().to_string_lossy().into_owned()),
            );
            if let Some(id) = recorded {
                tile.insert("bundle-identifier".into(), Value::String((*id).into()));
            }
            let mut entry = Dictionary::new();
            entry.insert("tile-data".into(), Value::Dictionary(tile));
            entry.insert("tile-type".into(), Value::String("file-tile".into()));
            Value::Dictionary(entry)
        })
        .collect();

    let mut root = Dictionary::new();
    root.insert("autohide".into(), Value::Boolean(false));
    root.insert("persistent-apps".into(), Value::Array(entries));
    let value = Value::Dictionary(root);
    if binary {
        value.to_file_binary(path).unwrap();
    } else {
        value.to_file_xml(path).unwrap();
    }
}

/// Drop every Dock entry, the way a user dragging tiles out of the Dock would.
pub(crate) fn clear_dock_plist(path: &Path) {
    let mut root = Value::from_file(path).unwrap().into_dictionary().unwrap();
    root.insert("persistent-apps".into(), Value::Array(Vec::new()));
    Value::Dictionary(root).to_file_binary(path).unwrap();
}
