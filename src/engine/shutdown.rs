//! Graceful-shutdown signals.
//!
//! Signals are polled, never awaited: the controller checks between cycles
//! and workers check between batches, so an in-flight model call always runs
//! to completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::error::Result;

pub trait ShutdownSignal: Send + Sync {
    fn is_requested(&self) -> bool;

    /// Called once by the controller after it has halted.
    fn acknowledge(&self) {}
}

/// In-process flag, set from a Ctrl-C handler or a test.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// A flag set by the first interrupt (SIGINT / Ctrl-C) the process gets.
    /// The handler is installed before this returns, so an interrupt no
    /// longer terminates the process. Needs a tokio runtime.
    pub fn on_interrupt(message: &'static str) -> Result<Self> {
        let flag = Self::new();
        let ctrl = flag.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut interrupt = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                if interrupt.recv().await.is_some() {
                    info!("{message}");
                    ctrl.request();
                }
            });
        }
        #[cfg(not(unix))]
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("{message}");
                ctrl.request();
            }
        });

        Ok(flag)
    }
}

impl ShutdownSignal for ShutdownFlag {
    fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sentinel file: shutdown is requested while the file exists. Removed on
/// acknowledge so the next start is not halted immediately.
#[derive(Debug, Clone)]
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the sentinel.
    pub fn request(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, b"stop\n")
    }
}

impl ShutdownSignal for StopFile {
    fn is_requested(&self) -> bool {
        self.path.exists()
    }

    fn acknowledge(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "stop file consumed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not remove stop file"),
        }
    }
}

/// Requested when any member is.
#[derive(Clone, Default)]
pub struct AnySignal(Vec<Arc<dyn ShutdownSignal>>);

impl AnySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, signal: impl ShutdownSignal + 'static) -> Self {
        self.0.push(Arc::new(signal));
        self
    }
}

impl ShutdownSignal for AnySignal {
    fn is_requested(&self) -> bool {
        self.0.iter().any(|s| s.is_requested())
    }

    fn acknowledge(&self) {
        for signal in &self.0 {
            signal.acknowledge();
        }
    }
}
