//! Icon synthesis.
//!
//! The rasterizer is a black box: `(tint, glyph, style, size) -> PNG bytes`.
//! This module asks it for every style and size a Dock icon needs and packs
//! the results into one ICNS container per style.

use std::path::{Path, PathBuf};

use crate::config::write_file_atomic;
use crate::error::{TileError, TileResult};
use crate::models::{GlyphKind, IconSpec};
use crate::tool_cmd::tool_cmd;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// ICNS element types and the pixel size each one holds.
const ICNS_SLOTS: &[(&[u8; 4], u32)] = &[
    (b"icp4", 16),
    (b"icp5", 32),
    (b"icp6", 64),
    (b"ic07", 128),
    (b"ic08", 256),
    (b"ic09", 512),
    (b"ic10", 1024),
    (b"ic11", 32),
    (b"ic12", 64),
    (b"ic13", 512),
    (b"ic14", 1024),
];

/// Appearance variants the Dock can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IconStyle {
    Default,
    Dark,
    Tinted,
}

impl IconStyle {
    pub const ALL: [IconStyle; 3] = [IconStyle::Default, IconStyle::Dark, IconStyle::Tinted];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Dark => "dark",
            Self::Tinted => "tinted",
        }
    }

    /// `AppIcon.icns`, `AppIcon-dark.icns`, `AppIcon-tinted.icns`
    pub fn file_name(self) -> String {
        match self {
            Self::Default => "AppIcon.icns".to_string(),
            other => format!("AppIcon-{}.icns", other.as_str()),
        }
    }
}

/// One rasterization request.
#[derive(Clone, Debug, PartialEq)]
pub struct IconRequest<'a> {
    pub spec: &'a IconSpec,
    pub style: IconStyle,
    pub size: u32,
}

pub trait IconRasterizer: Send + Sync {
    /// Render one square PNG.
    fn render(&self, request: &IconRequest<'_>) -> TileResult<Vec<u8>>;
}

/// Rasterizer backed by an external renderer executable.
pub struct CommandRasterizer {
    program: String,
    scratch_dir: PathBuf,
}

impl CommandRasterizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl IconRasterizer for CommandRasterizer {
    fn render(&self, request: &IconRequest<'_>) -> TileResult<Vec<u8>> {
        let output = self.scratch_dir.join(format!(
            "docktile-icon-{}-{}.png",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        let glyph_kind = match request.spec.glyph_kind {
            GlyphKind::Symbol => "symbol",
            GlyphKind::Emoji => "emoji",
        };
        let size = request.size.to_string();
        let scale = request.spec.scale.to_string();

        let result = tool_cmd(&self.program)
            .args(&["--tint", request.spec.tint.hex()])
            .args(&["--glyph-kind", glyph_kind])
            .args(&["--glyph", &request.spec.glyph_value])
            .args(&["--scale", &scale])
            .args(&["--style", request.style.as_str()])
            .args(&["--size", &size])
            .arg("--output")
            .arg_path(&output)
            .run()
            .map_err(|e| TileError::IconRenderFailed {
                reason: e.to_string(),
            })
            .and_then(|_| {
                std::fs::read(&output).map_err(|e| TileError::IconRenderFailed {
                    reason: format!("renderer produced no output: {e}"),
                })
            });
        let _ = std::fs::remove_file(&output);
        result
    }
}

/// Render every style and write `Contents/Resources/AppIcon*.icns`.
pub fn write_icon_set(
    bundle: &Path,
    spec: &IconSpec,
    rasterizer: &dyn IconRasterizer,
) -> TileResult<()> {
    let resources = bundle.join("Contents").join("Resources");
    for style in IconStyle::ALL {
        let icns = render_icns(spec, style, rasterizer)?;
        let path = resources.join(style.file_name());
        write_file_atomic(&path, &icns, Some(0o644))
            .map_err(|e| TileError::copy_failed(&path, e))?;
    }
    Ok(())
}

fn render_icns(spec: &IconSpec, style: IconStyle, rasterizer: &dyn IconRasterizer) -> TileResult<Vec<u8>> {
    let mut sizes: Vec<u32> = ICNS_SLOTS.iter().map(|(_, size)| *size).collect();
    sizes.sort_unstable();
    sizes.dedup();

    let mut rendered = Vec::with_capacity(sizes.len());
    for size in sizes {
        let png = rasterizer.render(&IconRequest { spec, style, size })?;
        if !png.starts_with(PNG_SIGNATURE) {
            return Err(TileError::IconRenderFailed {
                reason: format!("{} icon at {size}px is not a PNG", style.as_str()),
            });
        }
        rendered.push((size, png));
    }

    let chunks = ICNS_SLOTS.iter().filter_map(|(kind, size)| {
        rendered
            .iter()
            .find(|(s, _)| s == size)
            .map(|(_, png)| (*kind, png.as_slice()))
    });
    Ok(encode_icns(chunks))
}

/// Pack `(OSType, PNG)` chunks into an ICNS container.
pub(crate) fn encode_icns<'a>(chunks: impl IntoIterator<Item = (&'a [u8; 4], &'a [u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (kind, data) in chunks {
        body.extend_from_slice(kind);
        body.extend_from_slice(&((data.len() as u32) + 8).to_be_bytes());
        body.extend_from_slice(data);
    }
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"icns");
    out.extend_from_slice(&((body.len() as u32) + 8).to_be_bytes());
    out.extend_from_slice(&body);
    out
}
