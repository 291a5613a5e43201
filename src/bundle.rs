//! Bundle Generator: turns a `Configuration` into a signed `.app` in the
//! install directory and registers it with the Dock.
//!
//! Bundles are found by the identity in their manifest, never by name, so a
//! renamed tile is rebuilt at its new path and the old one is removed. Every
//! build happens in a hidden staging directory next to the target and is moved
//! into place only after signing succeeds.
//!
//! Calls for the same identity never interleave: a second `install` or
//! `uninstall` while one is running fails with `OperationInProgress`.

use dashmap::DashSet;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{TileError, TileResult};
use crate::icon::{IconRasterizer, IconStyle, write_icon_set};
use crate::manifest::{manifest_path, read_identity, stamp_manifest};
use crate::models::{BundleIdentity, Configuration};
use crate::process::{LaunchOptions, ProcessController, TerminationPolicy, terminate_and_wait};
use crate::registry::{LauncherRegistry, RegistryChange};
use crate::signer::BundleSigner;

const STAGING_PREFIX: &str = ".staging-";
const BUILT_BUNDLE: &str = "built.app";
const PARKED_BUNDLE: &str = "previous.app";
const FALLBACK_NAME: &str = "Tile";

lazy_static::lazy_static! {
    /// Characters that can't appear in a bundle file name.
    static ref UNSAFE_NAME_CHARS: Regex = Regex::new(r"[/:\x00-\x1f\x7f]").unwrap();
}

/// Everything the generator talks to.
pub struct BundleGeneratorParts {
    pub install_dir: PathBuf,
    pub template: PathBuf,
    pub registry: Arc<dyn LauncherRegistry>,
    pub processes: Arc<dyn ProcessController>,
    pub rasterizer: Arc<dyn IconRasterizer>,
    pub signer: Arc<dyn BundleSigner>,
    pub termination: TerminationPolicy,
}

pub struct BundleGenerator {
    install_dir: PathBuf,
    template: PathBuf,
    registry: Arc<dyn LauncherRegistry>,
    processes: Arc<dyn ProcessController>,
    rasterizer: Arc<dyn IconRasterizer>,
    signer: Arc<dyn BundleSigner>,
    termination: TerminationPolicy,
    in_flight: DashSet<BundleIdentity>,
    /// Held while a target path is chosen and filled, so tiles that share a
    /// display name can't claim the same path.
    placement: Mutex<()>,
}

/// Holds an identity in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a DashSet<BundleIdentity>,
    identity: BundleIdentity,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.identity);
    }
}

/// Removes a staging directory on every exit path, unless it holds a
/// bundle that could not be put back.
struct Staging {
    dir: PathBuf,
    keep: bool,
}

impl Staging {
    fn built(&self) -> PathBuf {
        self.dir.join(BUILT_BUNDLE)
    }

    fn parked(&self) -> PathBuf {
        self.dir.join(PARKED_BUNDLE)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.keep {
            tracing::warn!(path = %self.dir.display(), "Keeping staging dir with the previous bundle");
            return;
        }
        if self.dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.dir)
        {
            tracing::warn!(path = %self.dir.display(), "Could not clean staging dir: {e}");
        }
    }
}

impl BundleGenerator {
    pub fn new(parts: BundleGeneratorParts) -> Self {
        Self {
            install_dir: parts.install_dir,
            template: parts.template,
            registry: parts.registry,
            processes: parts.processes,
            rasterizer: parts.rasterizer,
            signer: parts.signer,
            termination: parts.termination,
            in_flight: DashSet::new(),
            placement: Mutex::new(()),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn is_in_flight(&self, identity: &BundleIdentity) -> bool {
        self.in_flight.contains(identity)
    }

    /// Build, sign, register and relaunch the tile. Idempotent.
    pub fn install(&self, cfg: &Configuration) -> TileResult<PathBuf> {
        cfg.validate()?;
        let _claim = self.claim(&cfg.identity)?;

        let previous = self.bundles_for(&cfg.identity);
        self.stop_running(&cfg.identity);

        let mut staging = self.stage(cfg)?;

        let (target, content_changed) = {
            let _placing = self.placement.lock();
            let target = self.target_path(cfg);
            let replaced = previous.iter().any(|p| p == &target);
            let content_changed = !replaced || bundle_content_differs(&target, &staging.built());
            self.swap_into_place(&mut staging, &target)?;
            (target, content_changed)
        };
        drop(staging);

        let change = self.registry.add(&target)?;

        // Only now that the Dock points at the new path can the old one go.
        for old in previous.iter().filter(|p| *p != &target) {
            tracing::info!(identity = %cfg.identity, from = %old.display(), to = %target.display(), "Tile renamed, removing old bundle");
            if let Err(e) = std::fs::remove_dir_all(old) {
                tracing::warn!(path = %old.display(), "Could not remove old bundle: {e}");
            }
        }

        match change {
            RegistryChange::Updated => {}
            RegistryChange::Unchanged if content_changed => self.registry.request_reload(),
            RegistryChange::Unchanged => {
                tracing::debug!(identity = %cfg.identity, "Dock already up to date")
            }
        }

        if let Err(e) = self
            .processes
            .launch(&target, LaunchOptions { activate: false })
        {
            tracing::warn!(identity = %cfg.identity, "{e}");
        }

        tracing::info!(identity = %cfg.identity, path = %target.display(), "Installed tile");
        Ok(target)
    }

    /// Stop the tile, drop its Dock entries and delete its bundle(s).
    ///
    /// Dock cleanup happens even when the bundle is already gone.
    pub fn uninstall(&self, cfg: &Configuration) -> TileResult<()> {
        let _claim = self.claim(&cfg.identity)?;
        let bundles = self.bundles_for(&cfg.identity);
        self.stop_running(&cfg.identity);

        let removed = self.registry.remove_by_identity(&cfg.identity)?;

        for bundle in &bundles {
            std::fs::remove_dir_all(bundle)
                .map_err(|e| TileError::copy_failed(bundle, format!("remove failed: {e}")))?;
        }

        if bundles.is_empty() && removed == 0 {
            tracing::debug!("{}", TileError::IdentityNotFound(cfg.identity.clone()));
        } else {
            tracing::info!(identity = %cfg.identity, bundles = bundles.len(), dock_entries = removed, "Uninstalled tile");
        }
        Ok(())
    }

    pub fn exists(&self, cfg: &Configuration) -> bool {
        !self.bundles_for(&cfg.identity).is_empty()
    }

    /// Installed path of `identity`, whatever its current name.
    pub fn locate(&self, identity: &BundleIdentity) -> TileResult<PathBuf> {
        self.bundles_for(identity)
            .into_iter()
            .next()
            .ok_or_else(|| TileError::IdentityNotFound(identity.clone()))
    }

    /// Bundles in the install dir that no known configuration owns.
    pub fn orphans(&self, known: &HashSet<BundleIdentity>) -> Vec<(PathBuf, Option<BundleIdentity>)> {
        self.scan()
            .into_iter()
            .filter(|(_, identity)| identity.as_ref().is_none_or(|id| !known.contains(id)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn claim(&self, identity: &BundleIdentity) -> TileResult<InFlight<'_>> {
        if !self.in_flight.insert(identity.clone()) {
            return Err(TileError::OperationInProgress(identity.clone()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            identity: identity.clone(),
        })
    }

    fn stop_running(&self, identity: &BundleIdentity) {
        if let Err(e) = terminate_and_wait(self.processes.as_ref(), identity, self.termination) {
            tracing::warn!("{e}; continuing");
        }
    }

    /// Copy the template, stamp it, render icons and sign it inside a fresh
    /// staging dir. Nothing outside the staging dir is touched.
    fn stage(&self, cfg: &Configuration) -> TileResult<Staging> {
        std::fs::create_dir_all(&self.install_dir)
            .map_err(|e| TileError::copy_failed(&self.install_dir, e))?;
        let staging = Staging {
            dir: self
                .install_dir
                .join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4().simple())),
            keep: false,
        };
        let built = staging.built();

        copy_dir_recursive(&self.template, &built)
            .map_err(|e| TileError::copy_failed(&self.template, e))?;
        stamp_manifest(&built, cfg)?;
        write_icon_set(&built, &cfg.icon, self.rasterizer.as_ref())?;
        self.signer.sign(&built)?;
        Ok(staging)
    }

    /// Move the built bundle to `target`, replacing what is there. The old
    /// bundle is parked in the staging dir first so a failed rename can be
    /// rolled back. Caller holds `placement`.
    fn swap_into_place(&self, staging: &mut Staging, target: &Path) -> TileResult<()> {
        let parked = staging.parked();
        let had_previous = target.exists();
        if had_previous {
            std::fs::rename(target, &parked).map_err(|e| TileError::copy_failed(target, e))?;
        }
        let Err(e) = std::fs::rename(staging.built(), target) else {
            return Ok(());
        };
        if !had_previous {
            return Err(TileError::copy_failed(target, e));
        }
        match std::fs::rename(&parked, target) {
            Ok(()) => Err(TileError::copy_failed(target, e)),
            Err(restore) => {
                staging.keep = true;
                Err(rollback_failed(target, &parked, &e, &restore))
            }
        }
    }

    /// `<name>.app`, or `<name> 2.app`, `<name> 3.app`, … when the plain name
    /// is taken by something that isn't this tile. Caller holds `placement`.
    fn target_path(&self, cfg: &Configuration) -> PathBuf {
        let base = sanitize_name(&cfg.display_name);
        (1u32..)
            .map(|n| match n {
                1 => self.install_dir.join(format!("{base}.app")),
                n => self.install_dir.join(format!("{base} {n}.app")),
            })
            .find(|candidate| {
                !candidate.exists() || read_identity(candidate).as_ref() == Some(&cfg.identity)
            })
            .unwrap_or_else(|| self.install_dir.join(format!("{base}.app")))
    }

    fn bundles_for(&self, identity: &BundleIdentity) -> Vec<PathBuf> {
        self.scan()
            .into_iter()
            .filter(|(_, id)| id.as_ref() == Some(identity))
            .map(|(path, _)| path)
            .collect()
    }

    /// Every `.app` directly inside the install dir with its identity.
    fn scan(&self) -> Vec<(PathBuf, Option<BundleIdentity>)> {
        let Ok(entries) = std::fs::read_dir(&self.install_dir) else {
            return Vec::new();
        };
        let mut bundles: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_dir()
                    && path.extension().is_some_and(|ext| ext == "app")
                    && !file_name(path).starts_with('.')
            })
            .map(|path| {
                let identity = read_identity(&path);
                (path, identity)
            })
            .collect();
        bundles.sort();
        bundles
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The new bundle could not be moved in and the old one could not be moved
/// back. The old one stays at `parked`.
fn rollback_failed(
    target: &Path,
    parked: &Path,
    cause: &std::io::Error,
    restore: &std::io::Error,
) -> TileError {
    tracing::error!(
        target = %target.display(),
        parked = %parked.display(),
        "Could not restore previous bundle: {restore}"
    );
    TileError::copy_failed(
        target,
        format!(
            "{cause}; previous bundle could not be restored ({restore}), left at {}",
            parked.display()
        ),
    )
}

/// Display name -> file-system-safe bundle stem.
pub(crate) fn sanitize_name(display_name: &str) -> String {
    let cleaned = UNSAFE_NAME_CHARS.replace_all(display_name, "-");
    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether the parts of a bundle the Dock displays differ.
fn bundle_content_differs(a: &Path, b: &Path) -> bool {
    let resources = |root: &Path, style: IconStyle| {
        root.join("Contents").join("Resources").join(style.file_name())
    };
    let mut files = vec![(manifest_path(a), manifest_path(b))];
    files.extend(IconStyle::ALL.map(|s| (resources(a, s), resources(b, s))));
    files
        .iter()
        .any(|(x, y)| std::fs::read(x).ok() != std::fs::read(y).ok())
}

/// Recursively copy a directory, keeping symlinks as links.
fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &dest)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &dest).map(drop)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        }
    }
    Ok(())
}
