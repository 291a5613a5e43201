//! Tile configuration value types.
//!
//! A `Configuration` is the declared state of one tile. Its `identity` is the
//! join key between the stored record, the installed bundle and the Dock
//! entry; it is derived once from `id` and never recomputed on rename.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{TileError, TileResult};

/// Allowed range for `IconSpec::scale`.
pub const ICON_SCALE_RANGE: std::ops::RangeInclusive<f64> = 0.5..=1.5;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub Uuid);

impl ConfigId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConfigId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reverse-domain bundle identifier, e.g. `com.docktile.2f1c…`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleIdentity(String);

impl BundleIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the identity for a freshly created tile.
    pub fn derive(prefix: &str, id: &ConfigId) -> Self {
        let prefix = prefix.trim_end_matches('.');
        Self(format!("{prefix}.{}", id.0.as_hyphenated()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Icon
// ---------------------------------------------------------------------------

/// Tile tint. Presets serialize by name, custom tints as `#RRGGBB`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TintColor {
    Red,
    Orange,
    Yellow,
    Green,
    #[default]
    Blue,
    Purple,
    Pink,
    Gray,
    Custom(String),
}

impl TintColor {
    /// sRGB hex for the rasterizer.
    pub fn hex(&self) -> &str {
        match self {
            Self::Red => "#FF3B30",
            Self::Orange => "#FF9500",
            Self::Yellow => "#FFCC00",
            Self::Green => "#34C759",
            Self::Blue => "#007AFF",
            Self::Purple => "#AF52DE",
            Self::Pink => "#FF2D55",
            Self::Gray => "#8E8E93",
            Self::Custom(hex) => hex,
        }
    }
}

impl TryFrom<String> for TintColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(match value.as_str() {
            "red" => Self::Red,
            "orange" => Self::Orange,
            "yellow" => Self::Yellow,
            "green" => Self::Green,
            "blue" => Self::Blue,
            "purple" => Self::Purple,
            "pink" => Self::Pink,
            "gray" => Self::Gray,
            hex => {
                let digits = hex
                    .strip_prefix('#')
                    .ok_or_else(|| format!("unknown tint colour: {hex}"))?;
                if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(format!("invalid custom tint: {hex}"));
                }
                Self::Custom(format!("#{}", digits.to_ascii_uppercase()))
            }
        })
    }
}

impl From<TintColor> for String {
    fn from(value: TintColor) -> Self {
        match value {
            TintColor::Red => "red".into(),
            TintColor::Orange => "orange".into(),
            TintColor::Yellow => "yellow".into(),
            TintColor::Green => "green".into(),
            TintColor::Blue => "blue".into(),
            TintColor::Purple => "purple".into(),
            TintColor::Pink => "pink".into(),
            TintColor::Gray => "gray".into(),
            TintColor::Custom(hex) => hex,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlyphKind {
    /// SF Symbol name
    #[default]
    Symbol,
    Emoji,
}

/// Declarative rasterizer input. Same spec, same pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IconSpec {
    #[serde(rename = "tintColor", default)]
    pub tint: TintColor,
    #[serde(rename = "iconType", default)]
    pub glyph_kind: GlyphKind,
    #[serde(rename = "iconValue", default = "default_glyph_value")]
    pub glyph_value: String,
    #[serde(rename = "iconScale", default = "default_scale")]
    pub scale: f64,
}

fn default_glyph_value() -> String {
    "star.fill".to_string()
}

fn default_scale() -> f64 {
    1.0
}

impl Default for IconSpec {
    fn default() -> Self {
        Self {
            tint: TintColor::default(),
            glyph_kind: GlyphKind::default(),
            glyph_value: default_glyph_value(),
            scale: default_scale(),
        }
    }
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

/// How the tile's popover lays out its members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    #[default]
    Grid,
    List,
}

impl LayoutMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::List => "list",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    #[default]
    App,
    Folder,
}

/// One launchable target inside a tile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberItem {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_identifier: Option<String>,
    #[serde(default)]
    pub kind: MemberKind,
}

impl MemberItem {
    pub fn app(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            bundle_identifier: None,
            kind: MemberKind::App,
        }
    }

    pub fn folder(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MemberKind::Folder,
            ..Self::app(name, path)
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub id: ConfigId,
    #[serde(rename = "bundleIdentifier")]
    pub identity: BundleIdentity,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(flatten)]
    pub icon: IconSpec,
    #[serde(default)]
    pub layout_mode: LayoutMode,
    #[serde(rename = "appItems", default)]
    pub member_items: Vec<MemberItem>,
    /// Declared intent: registered in the Dock.
    #[serde(rename = "isVisibleInDock", default)]
    pub wants_visible: bool,
    /// Declared intent: shown in the app switcher. Baked into the bundle.
    #[serde(rename = "showInAppSwitcher", default)]
    pub wants_switcher_visible: bool,
}

impl Configuration {
    /// A new tile with defaults applied and a freshly derived identity.
    pub fn new(display_name: impl Into<String>, identity_prefix: &str) -> Self {
        let id = ConfigId::new();
        Self {
            identity: BundleIdentity::derive(identity_prefix, &id),
            id,
            display_name: display_name.into(),
            icon: IconSpec::default(),
            layout_mode: LayoutMode::default(),
            member_items: Vec::new(),
            wants_visible: false,
            wants_switcher_visible: false,
        }
    }

    pub fn validate(&self) -> TileResult<()> {
        if self.display_name.trim().is_empty() {
            return Err(TileError::InvalidConfiguration(
                "display name cannot be empty".to_string(),
            ));
        }
        if self.icon.glyph_value.trim().is_empty() {
            return Err(TileError::InvalidConfiguration(
                "icon glyph cannot be empty".to_string(),
            ));
        }
        if !ICON_SCALE_RANGE.contains(&self.icon.scale) {
            return Err(TileError::InvalidConfiguration(format!(
                "icon scale {} outside {:?}",
                self.icon.scale, ICON_SCALE_RANGE
            )));
        }
        Ok(())
    }

    /// Whether moving from `self` to `next` changes anything baked into the
    /// installed bundle (name, icon, manifest flags, members).
    pub fn requires_rebuild(&self, next: &Configuration) -> bool {
        self.display_name != next.display_name
            || self.icon != next.icon
            || self.layout_mode != next.layout_mode
            || self.member_items != next.member_items
            || self.wants_switcher_visible != next.wants_switcher_visible
    }
}
