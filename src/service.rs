//! Long-running mode: wait for the global configuration, provision the
//! platform identity once, then keep reporting liveness.

use std::convert::Infallible;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigSnapshot, GLOBAL_CONFIG_KEY};
use crate::error::{Error, Result};
use crate::manager::TpmManager;
use crate::module::SecurityModule;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Modify {
        key: String,
        snapshot: ConfigSnapshot,
    },
    Delete {
        key: String,
    },
}

/// Source of configuration changes.
pub trait ConfigFeed {
    /// Waits up to `timeout` for the next change; `None` on timeout.
    fn next_change(&mut self, timeout: Duration) -> Result<Option<ConfigChange>>;
}

/// Receives a heartbeat after every loop iteration.
pub trait LivenessSink {
    fn alive(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    WaitingForConfig,
    Provisioned,
}

pub struct ServiceLoop<'a, M: SecurityModule, F, L> {
    manager: &'a TpmManager<M>,
    feed: F,
    liveness: L,
    state: ServiceState,
}

impl<'a, M, F, L> ServiceLoop<'a, M, F, L>
where
    M: SecurityModule,
    F: ConfigFeed,
    L: LivenessSink,
{
    pub fn new(manager: &'a TpmManager<M>, feed: F, liveness: L) -> Self {
        Self {
            manager,
            feed,
            liveness,
            state: ServiceState::WaitingForConfig,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Handles one change or one tick, then reports liveness. Once
    /// provisioned the feed is no longer read and every step is one tick.
    pub fn step(&mut self) -> Result<ServiceState> {
        let manager = self.manager;
        let config = manager.config();
        let started = Instant::now();
        match self.state {
            ServiceState::WaitingForConfig => {
                if let Some(change) = self.feed.next_change(config.tick_interval)? {
                    self.handle(change)?;
                }
            }
            ServiceState::Provisioned => std::thread::sleep(config.tick_interval),
        }
        let elapsed = started.elapsed();
        if elapsed > config.error_time {
            error!(?elapsed, "liveness report overdue past the error threshold");
        } else if elapsed > config.warning_time {
            warn!(?elapsed, "liveness report overdue");
        }
        self.liveness.alive();
        Ok(self.state)
    }

    /// Runs until a fatal error.
    #[instrument(level = "info", skip_all)]
    pub fn run(mut self) -> Result<Infallible> {
        info!("waiting for global configuration");
        loop {
            self.step()?;
        }
    }

    fn handle(&mut self, change: ConfigChange) -> Result<()> {
        match change {
            ConfigChange::Modify { key, snapshot } if key == GLOBAL_CONFIG_KEY => {
                self.manager.apply_config(&snapshot);
                self.manager.provision_identity()?;
                self.state = ServiceState::Provisioned;
                info!("platform identity provisioned");
            }
            ConfigChange::Delete { key } if key == GLOBAL_CONFIG_KEY => {
                self.manager.reset_config();
            }
            other => debug!(?other, "ignoring configuration change"),
        }
        Ok(())
    }
}

/// Watches a single `key=value` file standing in for the global config item.
pub struct FileConfigFeed {
    path: PathBuf,
    poll_interval: Duration,
    last: Option<String>,
}

impl FileConfigFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(1),
            last: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn poll(&mut self) -> Result<Option<ConfigChange>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if self.last.as_deref() == Some(text.as_str()) => Ok(None),
            Ok(text) => {
                let snapshot = ConfigSnapshot::parse(&text);
                self.last = Some(text);
                Ok(Some(ConfigChange::Modify {
                    key: GLOBAL_CONFIG_KEY.to_owned(),
                    snapshot,
                }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(self.last.take().map(|_| {
                ConfigChange::Delete {
                    key: GLOBAL_CONFIG_KEY.to_owned(),
                }
            })),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}

impl ConfigFeed for FileConfigFeed {
    fn next_change(&mut self, timeout: Duration) -> Result<Option<ConfigChange>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(change) = self.poll()? {
                return Ok(Some(change));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

/// Liveness by bumping the modification time of a file.
pub struct TouchFile {
    path: PathBuf,
}

impl TouchFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LivenessSink for TouchFile {
    fn alive(&mut self) {
        let touched = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            warn!(path = ?self.path, error = %e, "failed to report liveness");
        }
    }
}

/// Single-instance guard: an exclusive `flock` on the lock file, which also
/// records the holder's PID. The kernel drops the lock with the process, so a
/// file left behind by a killed instance does not block the next one.
#[derive(Debug)]
pub struct ProcessLock {
    _file: File,
}

impl ProcessLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                return Err(Error::LockHeld(path.to_path_buf()));
            }
            Err(e) => return Err(Error::io(path, e)),
        }
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| Error::io(path, e))?;
        debug!(?path, "process lock acquired");
        Ok(Self { _file: file })
    }
}
