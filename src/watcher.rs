//! Change Watcher: one debounced event stream for the Dock preferences file.
//!
//! The shell rewrites its list several times for one logical change, so raw
//! filesystem events go through a trailing-edge [`Debouncer`]: the first event
//! arms a timer, every further event pushes it back, and a single
//! [`ChangeEvent`] goes out once the file has been quiet for the window.
//!
//! The parent directory is watched rather than the file itself; the shell
//! replaces the file by rename, which drops a watch held on the old inode.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// How long the worker sleeps when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);
const CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Debounce state machine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    /// Timer armed; fires at `deadline` unless another event arrives first.
    Pending { deadline: Instant },
}

/// `idle -> pending -> fired -> idle`. Time is passed in so the machine can be
/// driven by tests without sleeping.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// A raw event arrived: arm the timer, or push it back if already armed.
    pub fn on_event(&mut self, now: Instant) {
        self.state = DebounceState::Pending {
            deadline: now + self.window,
        };
    }

    /// Returns `true` exactly once per quiet window, when the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending { deadline } if now >= deadline => {
                self.state = DebounceState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending { deadline } => Some(deadline),
            DebounceState::Idle => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Emitted once per debounced burst.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    /// Raw filesystem events collapsed into this one
    pub raw_events: usize,
}

enum Signal {
    Raw,
    Stop,
}

struct Running {
    watcher: RecommendedWatcher,
    control: mpsc::Sender<Signal>,
    worker: JoinHandle<()>,
}

pub struct ChangeWatcher {
    path: PathBuf,
    window: Duration,
    events: broadcast::Sender<ChangeEvent>,
    running: Mutex<Option<Running>>,
}

impl ChangeWatcher {
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            window,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Begin watching. Calling it while already running does nothing.
    pub fn start(&self) -> notify::Result<()> {
        let mut running = self.running.lock();
        // Don't double-watch
        if running.is_some() {
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let target: Option<OsString> = self.path.file_name().map(|n| n.to_os_string());
        let (control, signals) = mpsc::channel();

        let raw = control.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let touches_target = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == target);
            if touches_target {
                let _ = raw.send(Signal::Raw);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let worker = {
            let path = self.path.clone();
            let window = self.window;
            let events = self.events.clone();
            std::thread::Builder::new()
                .name("docktile-watcher".into())
                .spawn(move || debounce_loop(path, window, signals, events))
                .map_err(notify::Error::io)?
        };

        tracing::info!(path = %self.path.display(), window_ms = self.window.as_millis() as u64, "Watching Dock preferences");
        *running = Some(Running {
            watcher,
            control,
            worker,
        });
        Ok(())
    }

    /// Stop watching. A pending burst is dropped.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.control.send(Signal::Stop);
        drop(running.watcher);
        if running.worker.join().is_err() {
            tracing::warn!("Watcher worker panicked");
        }
        tracing::debug!(path = %self.path.display(), "Stopped watching");
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn debounce_loop(
    path: PathBuf,
    window: Duration,
    signals: mpsc::Receiver<Signal>,
    events: broadcast::Sender<ChangeEvent>,
) {
    let mut debouncer = Debouncer::new(window);
    let mut raw_events = 0usize;
    loop {
        let wait = debouncer
            .deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);
        match signals.recv_timeout(wait) {
            Ok(Signal::Raw) => {
                raw_events += 1;
                debouncer.on_event(Instant::now());
            }
            Ok(Signal::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if debouncer.poll(Instant::now()) {
            tracing::debug!(raw_events, "Dock preferences changed");
            // No subscribers is fine
            let _ = events.send(ChangeEvent {
                path: path.clone(),
                raw_events,
            });
            raw_events = 0;
        }
    }
}
