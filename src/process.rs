//! Process Controller: is a tile running, stop it, start it.
//!
//! Termination is asynchronous at the OS level. Callers that must not race a
//! dying process (install overwriting the bundle) go through
//! [`terminate_and_wait`], which polls with a bounded number of attempts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, Signal, System};

use crate::error::{TileError, TileResult};
use crate::manifest::read_identity;
use crate::models::BundleIdentity;
use crate::tool_cmd::tool_cmd;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Bring the tile to the foreground. Install relaunches with `false`.
    pub activate: bool,
}

pub trait ProcessController: Send + Sync {
    fn is_running(&self, identity: &BundleIdentity) -> bool;
    /// Ask every process of `identity` to quit. Returns immediately.
    fn terminate(&self, identity: &BundleIdentity);
    fn launch(&self, bundle: &Path, options: LaunchOptions) -> TileResult<()>;
}

/// Bounded wait used while a tile shuts down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(100),
        }
    }
}

/// Terminate `identity` if it runs and poll until it is gone.
///
/// `Err(ProcessTerminationTimeout)` is soft: the caller logs it and carries on.
pub fn terminate_and_wait(
    processes: &dyn ProcessController,
    identity: &BundleIdentity,
    policy: TerminationPolicy,
) -> TileResult<()> {
    if !processes.is_running(identity) {
        return Ok(());
    }
    tracing::debug!(%identity, "Terminating running tile");
    processes.terminate(identity);
    for _ in 0..policy.attempts {
        std::thread::sleep(policy.interval);
        if !processes.is_running(identity) {
            return Ok(());
        }
    }
    Err(TileError::ProcessTerminationTimeout {
        identity: identity.clone(),
        attempts: policy.attempts,
    })
}

// ---------------------------------------------------------------------------
// sysinfo-backed controller
// ---------------------------------------------------------------------------

/// Finds tile processes by walking each executable path up to its enclosing
/// `.app` and reading that bundle's manifest identity.
pub struct SystemProcessController {
    /// Only executables under this directory are considered, when set.
    bundle_root: Option<PathBuf>,
}

impl SystemProcessController {
    pub fn new(bundle_root: Option<PathBuf>) -> Self {
        Self { bundle_root }
    }

    fn matching_pids(&self, identity: &BundleIdentity) -> (System, Vec<sysinfo::Pid>) {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_exe(sysinfo::UpdateKind::OnlyIfNotSet));

        let mut identities: HashMap<PathBuf, Option<BundleIdentity>> = HashMap::new();
        let pids = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let exe = process.exe()?;
                if let Some(root) = &self.bundle_root
                    && !exe.starts_with(root)
                {
                    return None;
                }
                let bundle = enclosing_bundle(exe)?;
                let found = identities
                    .entry(bundle.to_path_buf())
                    .or_insert_with(|| read_identity(bundle));
                (found.as_ref() == Some(identity)).then_some(*pid)
            })
            .collect();
        (system, pids)
    }
}

impl ProcessController for SystemProcessController {
    fn is_running(&self, identity: &BundleIdentity) -> bool {
        !self.matching_pids(identity).1.is_empty()
    }

    fn terminate(&self, identity: &BundleIdentity) {
        let (system, pids) = self.matching_pids(identity);
        for pid in pids {
            let Some(process) = system.process(pid) else {
                continue;
            };
            match process.kill_with(Signal::Term) {
                Some(true) => tracing::debug!(%identity, pid = pid.as_u32(), "Sent SIGTERM"),
                Some(false) => tracing::warn!(%identity, pid = pid.as_u32(), "SIGTERM not delivered"),
                None => {
                    process.kill();
                }
            }
        }
    }

    fn launch(&self, bundle: &Path, options: LaunchOptions) -> TileResult<()> {
        let mut cmd = tool_cmd("open");
        if !options.activate {
            cmd = cmd.arg("-g");
        }
        cmd.arg_path(bundle)
            .run()
            .map(drop)
            .map_err(|e| TileError::LaunchFailed {
                path: bundle.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// `/X/Work.app/Contents/MacOS/TileHelper` -> `/X/Work.app`
fn enclosing_bundle(exe: &Path) -> Option<&Path> {
    exe.ancestors()
        .skip(1)
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
}
