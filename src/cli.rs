//! External tool resolution with caching.
//!
//! A tile engine started from Finder or a login item doesn't inherit the
//! user's shell PATH, so tools like a Homebrew-installed icon renderer aren't
//! found. This module probes well-known directories and caches the results
//! for the lifetime of the process.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Well-known directories where the tools live. Computed once.
fn extra_bin_dirs() -> &'static [String] {
    static DIRS: OnceLock<Vec<String>> = OnceLock::new();
    DIRS.get_or_init(|| {
        let home = std::env::var("HOME").unwrap_or_default();

        let mut dirs = vec![
            // codesign, killall, open live here on macOS
            "/usr/bin".to_string(),
            "/usr/sbin".to_string(),
            "/usr/local/bin".to_string(),
        ];

        #[cfg(target_os = "macos")]
        {
            dirs.extend([
                "/opt/homebrew/bin".to_string(),
                "/opt/homebrew/sbin".to_string(),
            ]);
        }

        if !home.is_empty() {
            dirs.push(format!("{home}/.local/bin"));
            dirs.push(format!("{home}/.cargo/bin"));
        }

        dirs
    })
}

/// Resolve a tool to its full path, probing well-known directories.
/// Falls back to the bare name so `Command` can still try PATH.
pub fn resolve_cli(name: &str) -> String {
    static CACHE: OnceLock<parking_lot::Mutex<HashMap<String, String>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| parking_lot::Mutex::new(HashMap::new()));

    if let Some(cached) = cache.lock().get(name) {
        return cached.clone();
    }

    let resolved = resolve_cli_uncached(name);
    cache.lock().insert(name.to_string(), resolved.clone());
    resolved
}

fn resolve_cli_uncached(name: &str) -> String {
    for dir in extra_bin_dirs() {
        let candidate = std::path::Path::new(dir).join(name);
        if candidate.is_file() {
            return candidate.to_string_lossy().to_string();
        }
    }
    name.to_string()
}
