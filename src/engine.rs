//! The lifecycle engine: one task owns the Configuration Store and serializes
//! every mutation; installs and uninstalls run on the blocking pool and report
//! back to it.
//!
//! ```text
//!  EngineHandle ──Command──▶ actor ──spawn_blocking──▶ BundleGenerator
//!                              ▲  ◀──────Completion──────┘
//!  ChangeWatcher ──ChangeEvent─┘──▶ Reconciler ──▶ ConfigurationStore
//! ```
//!
//! Visibility is owned by the engine: a successful install turns it on, an
//! uninstall turns it off, and the reconciler may only turn it off.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bundle::{BundleGenerator, BundleGeneratorParts};
use crate::config::EngineSettings;
use crate::error::{TileError, TileResult};
use crate::icon::CommandRasterizer;
use crate::models::{BundleIdentity, ConfigId, Configuration};
use crate::process::{SystemProcessController, TerminationPolicy};
use crate::reconciler::Reconciler;
use crate::registry::{CommandReloader, DockRegistry, LauncherRegistry};
use crate::signer::CodesignSigner;
use crate::store::ConfigurationStore;
use crate::watcher::{ChangeEvent, ChangeWatcher};

const COMMAND_QUEUE: usize = 64;

/// Result of [`EngineHandle::update`].
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub configuration: Configuration,
    /// The tile is installed and the change is baked into its bundle.
    pub needs_reinstall: bool,
}

/// One row of [`EngineHandle::status`].
#[derive(Clone, Debug, PartialEq)]
pub struct TileStatus {
    pub configuration: Configuration,
    pub installed_at: Option<PathBuf>,
    pub in_dock: bool,
    pub busy: bool,
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

/// Collaborators of a running engine.
pub struct EngineParts {
    pub store: ConfigurationStore,
    pub generator: Arc<BundleGenerator>,
    pub registry: Arc<dyn LauncherRegistry>,
    /// `None` runs without watching the Dock (one-shot CLI commands).
    pub watcher: Option<Arc<ChangeWatcher>>,
}

impl EngineParts {
    /// Wire the production collaborators from settings.
    pub fn from_settings(settings: &EngineSettings, config_dir: &Path) -> TileResult<Self> {
        let paths = settings.resolve(config_dir);
        let store = ConfigurationStore::open(&paths.tiles_file, &settings.identity_prefix)?;

        let reloader = Arc::new(CommandReloader::new(settings.reload_command.clone()));
        let registry: Arc<dyn LauncherRegistry> =
            Arc::new(DockRegistry::new(&paths.dock_plist, reloader));
        let generator = Arc::new(BundleGenerator::new(BundleGeneratorParts {
            install_dir: paths.install_dir.clone(),
            template: paths.template_bundle,
            registry: registry.clone(),
            processes: Arc::new(SystemProcessController::new(Some(paths.install_dir))),
            rasterizer: Arc::new(CommandRasterizer::new(settings.rasterizer_command.clone())),
            signer: Arc::new(CodesignSigner::new(settings.signer_identity.clone())),
            termination: TerminationPolicy {
                attempts: settings.termination_attempts,
                interval: Duration::from_millis(settings.termination_interval_ms),
            },
        }));
        let watcher = Arc::new(ChangeWatcher::new(
            &paths.dock_plist,
            Duration::from_millis(settings.debounce_ms),
        ));

        Ok(Self {
            store,
            generator,
            registry,
            watcher: Some(watcher),
        })
    }

    pub fn without_watcher(mut self) -> Self {
        self.watcher = None;
        self
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<TileResult<T>>;

enum Command {
    Snapshot(oneshot::Sender<Vec<Configuration>>),
    Status(oneshot::Sender<Vec<TileStatus>>),
    Create { name: String, reply: Reply<Configuration> },
    Update { next: Configuration, reply: Reply<UpdateOutcome> },
    Duplicate { id: ConfigId, reply: Reply<Configuration> },
    Reorder { id: ConfigId, to: usize, reply: Reply<()> },
    Install { id: ConfigId, reply: Reply<PathBuf> },
    Uninstall { id: ConfigId, reply: Reply<()> },
    Remove { id: ConfigId, reply: Reply<Configuration> },
    BeginEdit { id: ConfigId, reply: Reply<()> },
    EndEdit { id: ConfigId, reply: Reply<()> },
    Reconcile(oneshot::Sender<Vec<BundleIdentity>>),
    Shutdown(oneshot::Sender<()>),
}

/// Background work finishing.
enum Completion {
    Installed {
        id: ConfigId,
        identity: BundleIdentity,
        result: TileResult<PathBuf>,
        reply: Reply<PathBuf>,
    },
    Uninstalled {
        id: ConfigId,
        identity: BundleIdentity,
        result: TileResult<()>,
        then: AfterUninstall,
    },
}

enum AfterUninstall {
    Hide(Reply<()>),
    Forget(Reply<Configuration>),
}

impl AfterUninstall {
    fn fail(self, e: TileError) {
        match self {
            Self::Hide(reply) => {
                let _ = reply.send(Err(e));
            }
            Self::Forget(reply) => {
                let _ = reply.send(Err(e));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> TileResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TileError::EngineStopped)?;
        rx.await.map_err(|_| TileError::EngineStopped)
    }

    pub async fn snapshot(&self) -> TileResult<Vec<Configuration>> {
        self.ask(Command::Snapshot).await
    }

    /// Configurations joined with bundle and Dock state.
    pub async fn status(&self) -> TileResult<Vec<TileStatus>> {
        self.ask(Command::Status).await
    }

    pub async fn create(&self, name: &str) -> TileResult<Configuration> {
        let name = name.to_string();
        self.ask(|reply| Command::Create { name, reply }).await?
    }

    /// Replace a tile's declared state. Visibility is kept as stored; use
    /// `install`/`uninstall` to change it.
    pub async fn update(&self, next: Configuration) -> TileResult<UpdateOutcome> {
        self.ask(|reply| Command::Update { next, reply }).await?
    }

    pub async fn duplicate(&self, id: ConfigId) -> TileResult<Configuration> {
        self.ask(|reply| Command::Duplicate { id, reply }).await?
    }

    pub async fn reorder(&self, id: ConfigId, to: usize) -> TileResult<()> {
        self.ask(|reply| Command::Reorder { id, to, reply }).await?
    }

    /// Build and dock the tile; on success it is marked visible.
    pub async fn install(&self, id: ConfigId) -> TileResult<PathBuf> {
        self.ask(|reply| Command::Install { id, reply }).await?
    }

    /// Undock and delete the tile's bundle; on success it is marked hidden.
    pub async fn uninstall(&self, id: ConfigId) -> TileResult<()> {
        self.ask(|reply| Command::Uninstall { id, reply }).await?
    }

    /// Uninstall, then delete the record.
    pub async fn remove(&self, id: ConfigId) -> TileResult<Configuration> {
        self.ask(|reply| Command::Remove { id, reply }).await?
    }

    /// Keep reconcile passes off this tile until `end_edit`.
    pub async fn begin_edit(&self, id: ConfigId) -> TileResult<()> {
        self.ask(|reply| Command::BeginEdit { id, reply }).await?
    }

    pub async fn end_edit(&self, id: ConfigId) -> TileResult<()> {
        self.ask(|reply| Command::EndEdit { id, reply }).await?
    }

    pub async fn reconcile_now(&self) -> TileResult<Vec<BundleIdentity>> {
        self.ask(Command::Reconcile).await
    }

    /// Stop the engine task and its watcher. In-flight bundle work still
    /// runs to completion.
    pub async fn shutdown(&self) -> TileResult<()> {
        self.ask(Command::Shutdown).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Engine {
    store: ConfigurationStore,
    generator: Arc<BundleGenerator>,
    registry: Arc<dyn LauncherRegistry>,
    reconciler: Reconciler,
    watcher: Option<Arc<ChangeWatcher>>,
    /// Tiles the UI is editing
    editing: HashSet<ConfigId>,
    /// Identities with an install or uninstall running
    busy: HashSet<BundleIdentity>,
    /// A reconcile pass skipped tiles and should run again once they settle
    deferred: bool,
    completions: mpsc::UnboundedSender<Completion>,
}

/// Start the engine on the current tokio runtime. Runs one reconcile pass
/// before serving commands.
pub fn spawn(parts: EngineParts) -> EngineHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (completions, completion_rx) = mpsc::unbounded_channel();

    let changes = parts.watcher.as_ref().map(|w| {
        let rx = w.subscribe();
        if let Err(e) = w.start() {
            tracing::warn!(path = %w.path().display(), "Dock watcher unavailable: {e}");
        }
        rx
    });

    let engine = Engine {
        reconciler: Reconciler::new(parts.registry.clone()),
        store: parts.store,
        generator: parts.generator,
        registry: parts.registry,
        watcher: parts.watcher,
        editing: HashSet::new(),
        busy: HashSet::new(),
        deferred: false,
        completions,
    };
    tokio::spawn(engine.run(command_rx, completion_rx, changes));
    EngineHandle { commands }
}

/// Next debounced change, or never when there is no watcher.
async fn next_change(changes: &mut Option<broadcast::Receiver<ChangeEvent>>) -> Option<usize> {
    let Some(rx) = changes else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(event) => Some(event.raw_events),
        // Missed events still mean "something changed"
        Err(broadcast::error::RecvError::Lagged(n)) => Some(n as usize),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut changes: Option<broadcast::Receiver<ChangeEvent>>,
    ) {
        self.reconcile("startup");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(done) = completions.recv() => self.complete(done),
                change = next_change(&mut changes) => match change {
                    Some(raw_events) => {
                        tracing::debug!(raw_events, "Dock changed externally");
                        self.reconcile("dock change");
                    }
                    None => changes = None,
                },
            }
        }
        self.stop_watching();
        tracing::debug!("Engine stopped");
    }

    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }

    /// Returns `false` once the engine should stop.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.store.configurations().to_vec());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Create { name, reply } => {
                let _ = reply.send(self.store.create(&name));
            }
            Command::Update { next, reply } => {
                let _ = reply.send(self.update(next));
            }
            Command::Duplicate { id, reply } => {
                let _ = reply.send(self.store.duplicate(&id));
            }
            Command::Reorder { id, to, reply } => {
                let _ = reply.send(self.store.reorder(&id, to));
            }
            Command::Install { id, reply } => self.start_install(id, reply),
            Command::Uninstall { id, reply } => self.start_uninstall(id, AfterUninstall::Hide(reply)),
            Command::Remove { id, reply } => self.start_uninstall(id, AfterUninstall::Forget(reply)),
            Command::BeginEdit { id, reply } => {
                let result = if self.store.get(&id).is_some() {
                    self.editing.insert(id);
                    Ok(())
                } else {
                    Err(TileError::UnknownConfiguration(id))
                };
                let _ = reply.send(result);
            }
            Command::EndEdit { id, reply } => {
                self.editing.remove(&id);
                let _ = reply.send(Ok(()));
                self.rerun_deferred();
            }
            Command::Reconcile(reply) => {
                let _ = reply.send(self.reconcile("requested"));
            }
            Command::Shutdown(ack) => {
                self.stop_watching();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn update(&mut self, mut next: Configuration) -> TileResult<UpdateOutcome> {
        let previous = self
            .store
            .get(&next.id)
            .cloned()
            .ok_or(TileError::UnknownConfiguration(next.id))?;
        next.wants_visible = previous.wants_visible;
        let configuration = self.store.update(next)?;
        let needs_reinstall =
            previous.requires_rebuild(&configuration) && self.generator.exists(&configuration);
        Ok(UpdateOutcome {
            configuration,
            needs_reinstall,
        })
    }

    fn status(&self) -> Vec<TileStatus> {
        self.store
            .configurations()
            .iter()
            .map(|cfg| TileStatus {
                installed_at: self.generator.locate(&cfg.identity).ok(),
                in_dock: matches!(self.registry.find(&cfg.identity), Ok(Some(_))),
                busy: self.busy.contains(&cfg.identity),
                configuration: cfg.clone(),
            })
            .collect()
    }

    /// Claim `id` for background work. Fails if it is unknown or already busy.
    fn claim(&mut self, id: &ConfigId) -> TileResult<Configuration> {
        let cfg = self
            .store
            .get(id)
            .cloned()
            .ok_or(TileError::UnknownConfiguration(*id))?;
        if !self.busy.insert(cfg.identity.clone()) {
            return Err(TileError::OperationInProgress(cfg.identity));
        }
        Ok(cfg)
    }

    fn start_install(&mut self, id: ConfigId, reply: Reply<PathBuf>) {
        let cfg = match self.claim(&id) {
            Ok(cfg) => cfg,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let generator = self.generator.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let identity = cfg.identity.clone();
            let install_dir = generator.install_dir().to_path_buf();
            let result = tokio::task::spawn_blocking(move || generator.install(&cfg))
                .await
                .unwrap_or_else(|e| Err(TileError::copy_failed(&install_dir, format!("install task failed: {e}"))));
            let _ = completions.send(Completion::Installed {
                id,
                identity,
                result,
                reply,
            });
        });
    }

    fn start_uninstall(&mut self, id: ConfigId, then: AfterUninstall) {
        let cfg = match self.claim(&id) {
            Ok(cfg) => cfg,
            Err(e) => {
                then.fail(e);
                return;
            }
        };
        let generator = self.generator.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let identity = cfg.identity.clone();
            let install_dir = generator.install_dir().to_path_buf();
            let result = tokio::task::spawn_blocking(move || generator.uninstall(&cfg))
                .await
                .unwrap_or_else(|e| Err(TileError::copy_failed(&install_dir, format!("uninstall task failed: {e}"))));
            let _ = completions.send(Completion::Uninstalled {
                id,
                identity,
                result,
                then,
            });
        });
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Installed {
                id,
                identity,
                result,
                reply,
            } => {
                self.busy.remove(&identity);
                let result = result.and_then(|path| self.store.set_visible(&id, true).map(|_| path));
                if let Err(e) = &result {
                    tracing::error!(%identity, "Install failed: {e}");
                }
                let _ = reply.send(result);
            }
            Completion::Uninstalled {
                id,
                identity,
                result,
                then,
            } => {
                self.busy.remove(&identity);
                if let Err(e) = &result {
                    tracing::error!(%identity, "Uninstall failed: {e}");
                }
                match then {
                    AfterUninstall::Hide(reply) => {
                        let result = result.and_then(|()| self.store.set_visible(&id, false).map(drop));
                        let _ = reply.send(result);
                    }
                    AfterUninstall::Forget(reply) => {
                        let result = result.and_then(|()| self.store.remove(&id));
                        self.editing.remove(&id);
                        let _ = reply.send(result);
                    }
                }
            }
        }
        self.rerun_deferred();
    }

    fn rerun_deferred(&mut self) {
        if self.deferred {
            self.reconcile("deferred");
        }
    }

    fn reconcile(&mut self, reason: &str) -> Vec<BundleIdentity> {
        let mut exempt = self.busy.clone();
        exempt.extend(
            self.store
                .configurations()
                .iter()
                .filter(|c| self.editing.contains(&c.id))
                .map(|c| c.identity.clone()),
        );
        self.deferred = self
            .store
            .configurations()
            .iter()
            .any(|c| c.wants_visible && exempt.contains(&c.identity));

        let changed = self.reconciler.reconcile(&mut self.store, &exempt);
        tracing::debug!(reason, changed = changed.len(), deferred = self.deferred, "Reconcile pass");
        changed
    }
}
