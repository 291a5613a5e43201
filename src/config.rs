use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/DockTile/`
/// - Linux: `~/.config/DockTile/` (or `$XDG_CONFIG_HOME`)
///
/// Nothing is created here; callers create the dir before writing to it.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        })
        .join("DockTile")
}

/// Load a JSON config file, returning Default if missing or corrupt.
/// Logs when the file exists but cannot be read or parsed, so corrupt files
/// are visible in logs instead of silently resetting state.
pub fn load_json_config<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Could not read config {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Corrupt config {}: {e}. Using defaults.", path.display());
            T::default()
        }
    }
}

/// Save a JSON config file atomically with owner-only permissions.
pub fn save_json_config<T: Serialize>(path: &Path, config: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {e}"))?;
    write_file_atomic(path, json.as_bytes(), Some(0o600))
        .map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

/// Replace `target` with `bytes` all-or-nothing: write a sibling temp file,
/// then rename over the target. Readers see either the old or the new file.
///
/// `mode` sets unix permissions on the temp file before the rename; `None`
/// keeps the target's current permissions when it exists.
pub fn write_file_atomic(target: &Path, bytes: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let temp = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&temp, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = mode.or_else(|| {
            std::fs::metadata(target)
                .ok()
                .map(|m| m.permissions().mode() & 0o777)
        });
        if let Some(mode) = mode
            && let Err(e) = std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(mode))
        {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&temp, target).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp);
    })
}

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

pub const SETTINGS_FILE: &str = "settings.json";
pub const TILES_FILE: &str = "tiles.json";

/// Tunables and external collaborators of the lifecycle engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Where generated bundles live. Default: `<config_dir>/Tiles`.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    /// Dock's persistent list. Default: `~/Library/Preferences/com.apple.dock.plist`.
    #[serde(default)]
    pub dock_plist: Option<PathBuf>,
    /// Skeleton `.app` copied for every tile. Default: `TileTemplate.app`
    /// in the running executable's `Resources` directory.
    #[serde(default)]
    pub template_bundle: Option<PathBuf>,
    #[serde(default = "default_identity_prefix")]
    pub identity_prefix: String,
    /// Quiet period before a Dock plist change is reported
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How many times to check that a terminated tile has exited
    #[serde(default = "default_termination_attempts")]
    pub termination_attempts: u32,
    #[serde(default = "default_termination_interval_ms")]
    pub termination_interval_ms: u64,
    /// Icon renderer: receives the request as flags, writes a PNG to `--output`
    #[serde(default = "default_rasterizer_command")]
    pub rasterizer_command: String,
    /// Command (program + args) telling the shell to reload its launcher list
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
    /// `codesign --sign` identity; `-` means ad hoc
    #[serde(default = "default_signer_identity")]
    pub signer_identity: String,
}

fn default_identity_prefix() -> String {
    "com.docktile".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_termination_attempts() -> u32 {
    10
}

fn default_termination_interval_ms() -> u64 {
    100
}

fn default_rasterizer_command() -> String {
    "docktile-render".to_string()
}

fn default_reload_command() -> Vec<String> {
    vec!["killall".to_string(), "Dock".to_string()]
}

fn default_signer_identity() -> String {
    "-".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            install_dir: None,
            dock_plist: None,
            template_bundle: None,
            identity_prefix: default_identity_prefix(),
            debounce_ms: default_debounce_ms(),
            termination_attempts: default_termination_attempts(),
            termination_interval_ms: default_termination_interval_ms(),
            rasterizer_command: default_rasterizer_command(),
            reload_command: default_reload_command(),
            signer_identity: default_signer_identity(),
        }
    }
}

/// Concrete paths after defaults are applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub config_dir: PathBuf,
    pub tiles_file: PathBuf,
    pub install_dir: PathBuf,
    pub dock_plist: PathBuf,
    pub template_bundle: PathBuf,
}

impl EngineSettings {
    pub fn load(dir: &Path) -> Self {
        load_json_config(&dir.join(SETTINGS_FILE))
    }

    pub fn save(&self, dir: &Path) -> Result<(), String> {
        save_json_config(&dir.join(SETTINGS_FILE), self)
    }

    pub fn resolve(&self, config_dir: &Path) -> ResolvedPaths {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        ResolvedPaths {
            config_dir: config_dir.to_path_buf(),
            tiles_file: config_dir.join(TILES_FILE),
            install_dir: self
                .install_dir
                .clone()
                .unwrap_or_else(|| config_dir.join("Tiles")),
            dock_plist: self.dock_plist.clone().unwrap_or_else(|| {
                home.join("Library/Preferences/com.apple.dock.plist")
            }),
            template_bundle: self
                .template_bundle
                .clone()
                .unwrap_or_else(default_template_bundle),
        }
    }
}

/// `<App>.app/Contents/MacOS/<exe>` -> `<App>.app/Contents/Resources/TileTemplate.app`
fn default_template_bundle() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Resources/TileTemplate.app")
}
