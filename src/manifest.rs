//! Bundle metadata: `Contents/Info.plist` inside each generated tile.
//!
//! The manifest is the bundle's own record of its identity, readable by
//! external tooling without executing the bundle. Keys the template ships
//! with (executable name, minimum OS, …) are preserved on stamping.

use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

use crate::config::write_file_atomic;
use crate::error::{TileError, TileResult};
use crate::models::{BundleIdentity, Configuration, MemberKind};

pub const KEY_IDENTITY: &str = "CFBundleIdentifier";
pub const KEY_NAME: &str = "CFBundleName";
pub const KEY_DISPLAY_NAME: &str = "CFBundleDisplayName";
pub const KEY_ICON_FILE: &str = "CFBundleIconFile";
/// `true` keeps the process out of the Dock's running indicator and the app switcher.
pub const KEY_UI_ELEMENT: &str = "LSUIElement";
pub const KEY_CONFIG_ID: &str = "DockTileConfigurationID";
pub const KEY_LAYOUT: &str = "DockTileLayoutMode";
pub const KEY_ITEMS: &str = "DockTileItems";

/// The parts of a manifest the engine cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleManifest {
    pub identity: BundleIdentity,
    pub display_name: String,
    pub hidden_from_switcher: bool,
}

pub fn manifest_path(bundle: &Path) -> PathBuf {
    bundle.join("Contents").join("Info.plist")
}

/// Read a bundle's manifest. Fails if the file is missing, unparsable, or has
/// no identity.
pub fn read_manifest(bundle: &Path) -> TileResult<BundleManifest> {
    let path = manifest_path(bundle);
    let dict = load_dictionary(&path)?;

    let identity = dict
        .get(KEY_IDENTITY)
        .and_then(Value::as_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TileError::ManifestReadFailed {
            path: path.clone(),
            reason: format!("missing {KEY_IDENTITY}"),
        })?;
    let display_name = dict
        .get(KEY_DISPLAY_NAME)
        .or_else(|| dict.get(KEY_NAME))
        .and_then(Value::as_string)
        .unwrap_or_default();
    let hidden_from_switcher = dict
        .get(KEY_UI_ELEMENT)
        .and_then(Value::as_boolean)
        .unwrap_or(false);

    Ok(BundleManifest {
        identity: BundleIdentity::new(identity),
        display_name: display_name.to_string(),
        hidden_from_switcher,
    })
}

/// Identity of the bundle at `bundle`, or `None` when it cannot be resolved.
pub fn read_identity(bundle: &Path) -> Option<BundleIdentity> {
    read_manifest(bundle).ok().map(|m| m.identity)
}

/// Stamp `cfg` into the bundle's manifest, keeping every other key.
pub fn stamp_manifest(bundle: &Path, cfg: &Configuration) -> TileResult<()> {
    let path = manifest_path(bundle);
    let mut dict = if path.exists() {
        load_dictionary(&path)?
    } else {
        Dictionary::new()
    };

    dict.insert(KEY_IDENTITY.into(), Value::String(cfg.identity.to_string()));
    dict.insert(KEY_NAME.into(), Value::String(cfg.display_name.clone()));
    dict.insert(KEY_DISPLAY_NAME.into(), Value::String(cfg.display_name.clone()));
    dict.insert(KEY_ICON_FILE.into(), Value::String("AppIcon".into()));
    dict.insert(KEY_UI_ELEMENT.into(), Value::Boolean(!cfg.wants_switcher_visible));
    dict.insert(KEY_CONFIG_ID.into(), Value::String(cfg.id.to_string()));
    dict.insert(KEY_LAYOUT.into(), Value::String(cfg.layout_mode.as_str().into()));
    dict.insert(
        KEY_ITEMS.into(),
        Value::Array(cfg.member_items.iter().map(item_value).collect()),
    );

    let mut buf = Vec::new();
    Value::Dictionary(dict)
        .to_writer_xml(&mut buf)
        .map_err(|e| TileError::manifest_write(&path, e))?;
    write_file_atomic(&path, &buf, Some(0o644)).map_err(|e| TileError::manifest_write(&path, e))
}

fn item_value(item: &crate::models::MemberItem) -> Value {
    let mut dict = Dictionary::new();
    dict.insert("name".into(), Value::String(item.name.clone()));
    dict.insert("path".into(), Value::String(item.path.to_string_lossy().into_owned()));
    dict.insert(
        "kind".into(),
        Value::String(
            match item.kind {
                MemberKind::App => "app",
                MemberKind::Folder => "folder",
            }
            .into(),
        ),
    );
    if let Some(bundle_id) = &item.bundle_identifier {
        dict.insert("bundleIdentifier".into(), Value::String(bundle_id.clone()));
    }
    Value::Dictionary(dict)
}

fn load_dictionary(path: &Path) -> TileResult<Dictionary> {
    Value::from_file(path)
        .map_err(|e| TileError::ManifestReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .into_dictionary()
        .ok_or_else(|| TileError::ManifestReadFailed {
            path: path.to_path_buf(),
            reason: "root is not a dictionary".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemberItem;
    use std::fs;
    use tempfile::TempDir;

    const TEMPLATE_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>TileHelper</string>
    <key>CFBundleIdentifier</key>
    <string>com.docktile.template</string>
    <key>LSMinimumSystemVersion</key>
    <string>14.0</string>
</dict>
</plist>"#;

    fn bundle_with_template(dir: &TempDir) -> PathBuf {
        let bundle = dir.path().join("Work.app");
        fs::create_dir_all(bundle.join("Contents")).unwrap();
        fs::write(manifest_path(&bundle), TEMPLATE_PLIST).unwrap();
        bundle
    }

    #[test]
    fn stamp_then_read() {
        let dir = TempDir::new().unwrap();
        let bundle = bundle_with_template(&dir);
        let mut cfg = Configuration::new("Work", "com.docktile");
        cfg.wants_switcher_visible = true;
        cfg.member_items.push(MemberItem::app("Xcode", "/Applications/Xcode.app"));

        stamp_manifest(&bundle, &cfg).unwrap();
        let manifest = read_manifest(&bundle).unwrap();

        assert_eq!(manifest.identity, cfg.identity);
        assert_eq!(manifest.display_name, "Work");
        assert!(!manifest.hidden_from_switcher);
    }

    #[test]
    fn stamp_keeps_template_keys() {
        let dir = TempDir::new().unwrap();
        let bundle = bundle_with_template(&dir);
        let cfg = Configuration::new("Work", "com.docktile");
        stamp_manifest(&bundle, &cfg).unwrap();

        let dict = load_dictionary(&manifest_path(&bundle)).unwrap();
        assert_eq!(
            dict.get("CFBundleExecutable").and_then(Value::as_string),
            Some("TileHelper")
        );
        assert_eq!(
            dict.get("LSMinimumSystemVersion").and_then(Value::as_string),
            Some("14.0")
        );
        assert_eq!(dict.get(KEY_UI_ELEMENT).and_then(Value::as_boolean), Some(true));
        assert_eq!(dict.get(KEY_LAYOUT).and_then(Value::as_string), Some("grid"));
    }

    #[test]
    fn read_fails_without_identity() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("Broken.app");
        fs::create_dir_all(bundle.join("Contents")).unwrap();
        fs::write(
            manifest_path(&bundle),
            r#"<?xml version="1.0" encoding="UTF-8"?><plist version="1.0"><dict><key>CFBundleName</key><string>x</string></dict></plist>"#,
        )
        .unwrap();
        assert!(matches!(read_manifest(&bundle), Err(TileError::ManifestReadFailed { .. })));
        assert_eq!(read_identity(&bundle), None);
    }

    #[test]
    fn missing_bundle_has_no_identity() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_identity(&dir.path().join("Gone.app")), None);
    }
}
