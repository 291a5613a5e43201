//! Versioned `tiles.json` schema and the decode-time migration table.
//!
//! Schema 1 was a bare JSON array of records with older key names. Schema 2
//! wraps the records in `{"schemaVersion": 2, "configurations": [...]}`.
//! Records are rewritten at the JSON level before typed decoding, so the
//! typed model only ever sees current keys and values.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{
    BundleIdentity, ConfigId, Configuration, GlyphKind, LayoutMode, MemberItem, TintColor,
};

pub(crate) const SCHEMA_VERSION: u64 = 2;

/// Old key -> current key.
const KEY_RENAMES: &[(&str, &str)] = &[
    ("items", "appItems"),
    ("isVisible", "isVisibleInDock"),
    ("showInSwitcher", "showInAppSwitcher"),
];

/// (key, old value) -> current value.
const VALUE_ALIASES: &[(&str, &str, &str)] = &[
    ("layoutMode", "grid2x3", "grid"),
    ("layoutMode", "horizontal1x6", "list"),
    ("tintColor", "grey", "gray"),
    ("tintColor", "graphite", "gray"),
];

/// Result of decoding a document.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub configurations: Vec<Configuration>,
    /// True when anything was rewritten; the caller should persist.
    pub migrated: bool,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    #[serde(rename = "schemaVersion")]
    schema_version: u64,
    configurations: &'a [Configuration],
}

/// Serialize configurations in the current schema.
pub(crate) fn encode_document(configurations: &[Configuration]) -> Result<String, String> {
    serde_json::to_string_pretty(&DocumentRef {
        schema_version: SCHEMA_VERSION,
        configurations,
    })
    .map_err(|e| format!("Failed to serialize configurations: {e}"))
}

/// Decode any known schema version into current configurations.
pub(crate) fn decode_document(text: &str, identity_prefix: &str) -> Result<Decoded, String> {
    let root: Value = serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {e}"))?;

    let (version, records) = match root {
        Value::Array(records) => (1, records),
        Value::Object(mut doc) => {
            let version = doc
                .get("schemaVersion")
                .and_then(Value::as_u64)
                .unwrap_or(SCHEMA_VERSION);
            let records = match doc.remove("configurations") {
                Some(Value::Array(records)) => records,
                None => Vec::new(),
                Some(_) => return Err("\"configurations\" is not an array".to_string()),
            };
            (version, records)
        }
        _ => return Err("Document is neither an array nor an object".to_string()),
    };

    if version > SCHEMA_VERSION {
        tracing::warn!(version, "tiles.json written by a newer version; unknown keys are ignored");
    }

    let mut migrated = version < SCHEMA_VERSION;
    let mut configurations = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let Value::Object(mut record) = record else {
            return Err(format!("Record {index} is not an object"));
        };
        migrated |= migrate_record(&mut record, identity_prefix);
        drop_unknown_values(&mut record, index);
        match serde_json::from_value::<Configuration>(Value::Object(record)) {
            Ok(cfg) => configurations.push(cfg),
            Err(e) => tracing::warn!(record = index, "Skipping unreadable tile record: {e}"),
        }
    }

    Ok(Decoded {
        configurations,
        migrated,
    })
}

/// Apply the migration table to one record. Returns whether it changed.
fn migrate_record(record: &mut Map<String, Value>, identity_prefix: &str) -> bool {
    let mut changed = false;

    for (old, new) in KEY_RENAMES {
        if let Some(value) = record.remove(*old) {
            changed = true;
            record.entry(new.to_string()).or_insert(value);
        }
    }

    // Emoji-only icons predate the glyph kind/value split.
    if let Some(emoji) = record.remove("symbolEmoji") {
        changed = true;
        if !record.contains_key("iconValue") {
            record.insert("iconValue".into(), emoji);
            record.insert("iconType".into(), Value::String("emoji".into()));
        }
    }

    for (key, old, new) in VALUE_ALIASES {
        if record.get(*key).and_then(Value::as_str) == Some(*old) {
            record.insert(key.to_string(), Value::String(new.to_string()));
            changed = true;
        }
    }

    let id = match record.get("id").and_then(Value::as_str).map(Uuid::parse_str) {
        Some(Ok(id)) => id,
        _ => {
            let id = Uuid::new_v4();
            record.insert("id".into(), Value::String(id.to_string()));
            changed = true;
            id
        }
    };

    if !record.get("bundleIdentifier").is_some_and(Value::is_string) {
        let identity = BundleIdentity::derive(identity_prefix, &ConfigId(id));
        record.insert("bundleIdentifier".into(), Value::String(identity.to_string()));
        changed = true;
    }

    changed
}

/// Reset values this version can't represent (a newer tint preset, an
/// unknown layout) to their defaults, and drop member items that don't
/// decode, so one unfamiliar field never costs the whole tile.
fn drop_unknown_values(record: &mut Map<String, Value>, index: usize) {
    reset_if_invalid::<TintColor>(record, "tintColor", index);
    reset_if_invalid::<GlyphKind>(record, "iconType", index);
    reset_if_invalid::<LayoutMode>(record, "layoutMode", index);

    if let Some(Value::Array(items)) = record.get_mut("appItems") {
        let before = items.len();
        items.retain(|item| serde_json::from_value::<MemberItem>(item.clone()).is_ok());
        if items.len() != before {
            tracing::warn!(record = index, dropped = before - items.len(), "Ignoring unreadable member items");
        }
    }
}

fn reset_if_invalid<T: DeserializeOwned>(record: &mut Map<String, Value>, key: &str, index: usize) {
    let Some(value) = record.get(key) else {
        return;
    };
    if serde_json::from_value::<T>(value.clone()).is_err() {
        tracing::warn!(record = index, key, %value, "Unknown value, using the default");
        record.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_document_round_trips() {
        let mut a = Configuration::new("Work", "com.docktile");
        a.icon.tint = TintColor::Custom("#123ABC".into());
        a.icon.scale = 1.25;
        a.layout_mode = LayoutMode::List;
        a.member_items = vec![
            MemberItem::app("Safari", "/Applications/Safari.app"),
            MemberItem::folder("Projects", "/Users/me/Projects"),
        ];
        a.wants_visible = true;
        let b = Configuration::new("Play", "com.docktile");

        let text = encode_document(&[a.clone(), b.clone()]).unwrap();
        let decoded = decode_document(&text, "com.docktile").unwrap();
        assert!(!decoded.migrated);
        assert_eq!(decoded.configurations, vec![a, b]);
    }

    #[test]
    fn legacy_array_is_migrated() {
        let legacy = r#"[{
            "id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f",
            "name": "Old Tile",
            "tintColor": "graphite",
            "symbolEmoji": "🚀",
            "layoutMode": "horizontal1x6",
            "items": [{"name": "Notes", "path": "/Applications/Notes.app"}],
            "isVisible": true
        }]"#;
        let decoded = decode_document(legacy, "com.docktile").unwrap();
        assert!(decoded.migrated);
        let cfg = &decoded.configurations[0];
        assert_eq!(cfg.display_name, "Old Tile");
        assert_eq!(cfg.icon.tint, TintColor::Gray);
        assert_eq!(cfg.icon.glyph_kind, GlyphKind::Emoji);
        assert_eq!(cfg.icon.glyph_value, "🚀");
        assert_eq!(cfg.icon.scale, 1.0);
        assert_eq!(cfg.layout_mode, LayoutMode::List);
        assert_eq!(cfg.member_items.len(), 1);
        assert!(cfg.wants_visible);
        assert!(!cfg.wants_switcher_visible);
        assert_eq!(
            cfg.identity.as_str(),
            "com.docktile.6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f"
        );
    }

    #[test]
    fn legacy_record_survives_a_second_round_trip() {
        let legacy = r#"[{"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "name": "Old", "layoutMode": "grid2x3"}]"#;
        let first = decode_document(legacy, "com.docktile").unwrap().configurations;
        let text = encode_document(&first).unwrap();
        let second = decode_document(&text, "com.docktile").unwrap();
        assert!(!second.migrated);
        assert_eq!(second.configurations, first);
    }

    #[test]
    fn existing_identity_is_never_recomputed() {
        let doc = r#"{"schemaVersion": 2, "configurations": [{
            "id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f",
            "bundleIdentifier": "t.A",
            "name": "A"
        }]}"#;
        let decoded = decode_document(doc, "com.docktile").unwrap();
        assert_eq!(decoded.configurations[0].identity.as_str(), "t.A");
        assert!(!decoded.migrated);
    }

    #[test]
    fn missing_id_gets_one() {
        let decoded = decode_document(r#"[{"name": "No Id"}]"#, "com.docktile").unwrap();
        let cfg = &decoded.configurations[0];
        assert!(cfg.identity.as_str().ends_with(&cfg.id.to_string()));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc = r#"{"schemaVersion": 3, "configurations": [{
            "id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f",
            "bundleIdentifier": "t.A",
            "name": "A",
            "futureField": {"x": 1}
        }]}"#;
        assert_eq!(decode_document(doc, "p").unwrap().configurations.len(), 1);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(decode_document("not json", "p").is_err());
        assert!(decode_document("42", "p").is_err());
        assert!(decode_document("[1, 2]", "p").is_err());
    }

    #[test]
    fn unknown_enum_values_fall_back_to_defaults() {
        let doc = r#"{"schemaVersion": 3, "configurations": [
            {"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.A",
             "name": "A", "layoutMode": "carousel", "tintColor": "mauve", "iconType": "sticker",
             "appItems": [
                {"name": "Notes", "path": "/Applications/Notes.app", "kind": "widget"},
                {"name": "Mail", "path": "/System/Applications/Mail.app"}
             ]},
            {"id": "7f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "bundleIdentifier": "t.B",
             "name": "B", "layoutMode": "list"}
        ]}"#;
        let decoded = decode_document(doc, "com.docktile").unwrap();
        assert_eq!(decoded.configurations.len(), 2);

        let a = &decoded.configurations[0];
        assert_eq!(a.identity.as_str(), "t.A");
        assert_eq!(a.layout_mode, LayoutMode::Grid);
        assert_eq!(a.icon.tint, TintColor::Blue);
        assert_eq!(a.icon.glyph_kind, GlyphKind::Symbol);
        assert_eq!(a.member_items.len(), 1);
        assert_eq!(a.member_items[0].name, "Mail");
        assert_eq!(decoded.configurations[1].layout_mode, LayoutMode::List);
    }

    #[test]
    fn unreadable_record_is_skipped_not_fatal() {
        let doc = r#"[
            {"id": "6f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "name": 42},
            {"id": "7f1d0c2e-3a43-4c4f-9d3e-1a2b3c4d5e6f", "name": "Kept"}
        ]"#;
        let decoded = decode_document(doc, "com.docktile").unwrap();
        assert_eq!(decoded.configurations.len(), 1);
        assert_eq!(decoded.configurations[0].display_name, "Kept");
    }
}
