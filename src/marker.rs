//! Progress marker persistence
//!
//! The progress marker is the only state the provisioning run keeps between
//! invocations: the name of the last step that fully completed, or the
//! `START` sentinel when nothing has completed yet.
//!
//! # Storage Rules
//!
//! - **One token per file**: the file holds exactly the token, a trailing
//!   newline is tolerated on read
//! - **Full overwrite**: `save` writes a sibling temp file and renames it over
//!   the marker, so a crash leaves either the old or the new value
//! - **Never deleted automatically**: only `clear` (the operator's `reset`)
//!   removes the file
//! - **Explicit store**: the sequencer receives a `MarkerStore`, nothing reads
//!   the marker file as ambient state

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::debug;

/// Token persisted while no step has completed.
pub const SENTINEL: &str = "START";

/// Value of the progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Nothing has completed yet; resume at the first step
    Start,
    /// Name of the most recently completed step
    Completed(String),
}

impl Marker {
    /// Parse a persisted token.
    ///
    /// Surrounding whitespace is trimmed; an empty token is the sentinel.
    pub fn parse(token: &str) -> Result<Self, MarkerError> {
        let token = token.trim();
        if token.is_empty() || token == SENTINEL {
            return Ok(Self::Start);
        }
        if token.contains(char::is_whitespace) {
            return Err(MarkerError::InvalidToken(token.to_string()));
        }
        Ok(Self::Completed(token.to_string()))
    }

    /// Marker for a completed step name.
    pub fn completed(step: impl Into<String>) -> Self {
        Self::Completed(step.into())
    }

    /// The token written to stable storage.
    pub fn as_token(&self) -> &str {
        match self {
            Self::Start => SENTINEL,
            Self::Completed(step) => step,
        }
    }

    /// Name of the completed step, or `None` for the sentinel.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Start => None,
            Self::Completed(step) => Some(step),
        }
    }

    #[inline]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Errors raised while loading, saving or locking the marker.
#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("Progress marker IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The marker file holds something that cannot be a step name
    #[error("Progress marker contains an invalid token {0:?}")]
    InvalidToken(String),

    /// Another invocation holds the advisory lock
    #[error("Another mlnode run holds {path} (pid {owner})")]
    Locked { path: PathBuf, owner: String },
}

/// Storage for the single progress marker value.
pub trait MarkerStore {
    /// Load the persisted marker, `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Marker>, MarkerError>;

    /// Overwrite the persisted marker.
    fn save(&mut self, marker: &Marker) -> Result<(), MarkerError>;
}

/// Marker stored as a one-token text file.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker file so the next run starts from the first step.
    ///
    /// Returns `true` if a file was removed.
    pub fn clear(&self) -> Result<bool, MarkerError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed progress marker {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the advisory lock guarding the load-run-save cycle.
    ///
    /// The lock lives in `<marker>.lock` and holds the owner PID. It is
    /// released when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// `MarkerError::Locked` if another process holds the lock.
    pub fn lock(&self) -> Result<MarkerLock, MarkerError> {
        let lock_path = sibling(&self.path, ".lock");
        ensure_parent(&lock_path)?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                let owner = fs::read_to_string(&lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                return Err(MarkerError::Locked {
                    path: lock_path,
                    owner: if owner.is_empty() {
                        "unknown".to_string()
                    } else {
                        owner
                    },
                });
            }
            Err((_, errno)) => return Err(MarkerError::Io(errno.into())),
        };

        lock.set_len(0)?;
        writeln!(*lock, "{}", std::process::id())?;
        debug!("Acquired marker lock {}", lock_path.display());

        Ok(MarkerLock {
            _lock: lock,
            path: lock_path,
        })
    }
}

impl MarkerStore for FileMarkerStore {
    fn load(&self) -> Result<Option<Marker>, MarkerError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Marker::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, marker: &Marker) -> Result<(), MarkerError> {
        ensure_parent(&self.path)?;

        let tmp = sibling(&self.path, ".tmp");
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{}", marker.as_token())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!("Progress marker {} -> {}", self.path.display(), marker);
        Ok(())
    }
}

/// Held advisory lock on the marker file.
#[derive(Debug)]
pub struct MarkerLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl MarkerLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Marker kept in memory.
///
/// Used by tests and by dry runs, where progress must not reach the disk.
/// Every saved value is kept in `history` in save order.
#[derive(Debug, Clone, Default)]
pub struct MemoryMarkerStore {
    value: Option<Marker>,
    history: Vec<Marker>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an existing marker value.
    pub fn with_marker(marker: Marker) -> Self {
        Self {
            value: Some(marker),
            history: Vec::new(),
        }
    }

    /// Current in-memory value.
    pub fn current(&self) -> Option<&Marker> {
        self.value.as_ref()
    }

    /// All values saved since construction.
    pub fn history(&self) -> &[Marker] {
        &self.history
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn load(&self) -> Result<Option<Marker>, MarkerError> {
        Ok(self.value.clone())
    }

    fn save(&mut self, marker: &Marker) -> Result<(), MarkerError> {
        self.value = Some(marker.clone());
        self.history.push(marker.clone());
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
