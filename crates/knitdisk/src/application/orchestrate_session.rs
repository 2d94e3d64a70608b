//! Use case: arm a knitting session on a serial device.
//!
//! Arming is one all-or-nothing sequence:
//!
//! ```text
//! claim device ──► convert image ──► open port ──► register at 901 ──► spawn emulator ──► "armed"
//!      │                 │                │
//!    Busy           Conversion     DeviceUnavailable        (lease released on every failure)
//! ```
//!
//! The instructions are only returned once the emulator task has signalled
//! that it is listening.  After that the machine drives the transfer; the
//! caller can [`stop`](SessionOrchestrator::stop) the session,
//! poll [`is_armed`](SessionOrchestrator::is_armed) or
//! [`wait`](SessionOrchestrator::wait) for it to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::convert_image::{convert_image, ConversionError, ConversionSettings};
use crate::application::emulate_disk::{DiskEmulator, EmulatorConfig, ProtocolError, SessionOutcome};
use crate::infrastructure::serial::DeviceRegistry;
use crate::infrastructure::storage::pattern_store::{PatternStore, SESSION_SLOT};

/// Shown to the operator once a session is armed.
pub const INSTRUCTIONS: &str = "Pattern ready. On the knitting machine: \
1. Switch the machine into disk-load mode from its control panel. \
2. Enter pattern number 901 and confirm to start loading. \
3. Wait until the machine reports the load is complete, then select pattern 901 and begin knitting.";

/// Opens the serial device a session runs on.
///
/// The real implementation lives in
/// [`crate::infrastructure::serial::TokioSerialOpener`]; tests substitute an
/// in-memory pipe.
pub trait DeviceOpener: Send + Sync + 'static {
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Opens `device` at `baud_rate`.
    fn open(&self, device: &str, baud_rate: u32) -> std::io::Result<Self::Port>;
}

/// Errors returned by [`SessionOrchestrator`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another session already holds the device.
    #[error("a session is already armed on {device}")]
    Busy { device: String },

    /// The image could not be turned into a pattern.
    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The serial device could not be opened.
    #[error("serial device {device} unavailable: {source}")]
    DeviceUnavailable {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// No session is tracked for the device.
    #[error("no session on {device}")]
    NotArmed { device: String },

    /// The emulator ended with a protocol failure.
    #[error("session failed: {0}")]
    Protocol(#[from] ProtocolError),

    /// A background task panicked or was cancelled.
    #[error("session task failed: {0}")]
    Task(String),
}

/// Settings applied to every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub conversion: ConversionSettings,
    pub emulator: EmulatorConfig,
    /// Where converted patterns are written.
    pub output_dir: PathBuf,
    pub baud_rate: u32,
}

/// What the caller gets back from a successful [`SessionOrchestrator::arm`].
#[derive(Debug, Clone)]
pub struct ArmedSession {
    pub session_id: Uuid,
    pub device: String,
    pub slot: u16,
    /// The pattern file written by the conversion.
    pub pattern_path: PathBuf,
    pub instructions: &'static str,
}

type SessionTask = JoinHandle<Result<SessionOutcome, ProtocolError>>;

struct ActiveSession {
    id: Uuid,
    stop: oneshot::Sender<()>,
    task: SessionTask,
}

/// Owns the sessions of every device.
pub struct SessionOrchestrator<O: DeviceOpener> {
    opener: Arc<O>,
    config: SessionConfig,
    registry: DeviceRegistry,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl<O: DeviceOpener> SessionOrchestrator<O> {
    pub fn new(opener: O, config: SessionConfig) -> Self {
        Self {
            opener: Arc::new(opener),
            config,
            registry: DeviceRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The registry of claimed devices.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Converts `image_path` and starts serving it on `device` under slot 901.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Busy`] if a session already holds `device`; the
    ///   running session is not touched.
    /// - [`SessionError::Conversion`] if the image cannot be converted; the
    ///   port is never opened.
    /// - [`SessionError::DeviceUnavailable`] if the port cannot be opened.
    ///
    /// On any error nothing is armed and the device is free again.
    pub async fn arm(&self, image_path: &Path, device: &str) -> Result<ArmedSession, SessionError> {
        let lease = self.registry.claim(device).ok_or_else(|| {
            warn!(device, "rejecting arm: device busy");
            SessionError::Busy {
                device: device.to_string(),
            }
        })?;
        let session_id = Uuid::new_v4();
        info!(session = %session_id, device, image = %image_path.display(), "arming session");

        let image = image_path.to_path_buf();
        let output_dir = self.config.output_dir.clone();
        let settings = self.config.conversion;
        let converted =
            tokio::task::spawn_blocking(move || convert_image(&image, &output_dir, &settings))
                .await
                .map_err(|e| SessionError::Task(e.to_string()))?;
        let converted = match converted {
            Ok(converted) => converted,
            Err(e) => {
                error!(session = %session_id, "conversion failed: {e}");
                return Err(e.into());
            }
        };

        let port = self
            .opener
            .open(device, self.config.baud_rate)
            .map_err(|source| {
                error!(session = %session_id, device, "cannot open device: {source}");
                SessionError::DeviceUnavailable {
                    device: device.to_string(),
                    source,
                }
            })?;

        let source_name = converted
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut store = PatternStore::new();
        let slot = store.register(converted.file, source_name);
        let store = store.into_shared();

        let (armed_tx, armed_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let emulator_config = self.config.emulator;
        let task_device = device.to_string();

        // The lease is still ours here, so any entry already in the map is a
        // session that ended without being waited on.
        let mut sessions = self.sessions.lock().await;
        if let Some(stale) = sessions.get(device) {
            debug!(session = %stale.id, device, "replacing finished session");
        }
        let task = tokio::spawn(async move {
            let _lease = lease;
            let mut emulator = DiskEmulator::new(port, store, emulator_config);
            let _ = armed_tx.send(());
            let outcome = emulator.run(stop_rx).await;
            match &outcome {
                Ok(how) => info!(session = %session_id, device = %task_device, ?how, "session ended"),
                Err(e) => error!(session = %session_id, device = %task_device, "session failed: {e}"),
            }
            outcome
        });
        sessions.insert(
            device.to_string(),
            ActiveSession {
                id: session_id,
                stop: stop_tx,
                task,
            },
        );
        drop(sessions);

        if armed_rx.await.is_err() {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(device).is_some_and(|s| s.id == session_id) {
                sessions.remove(device);
            }
            return Err(SessionError::Task("emulator task exited before arming".to_string()));
        }
        info!(session = %session_id, device, slot, "session armed");

        Ok(ArmedSession {
            session_id,
            device: device.to_string(),
            slot,
            pattern_path: converted.path,
            instructions: INSTRUCTIONS,
        })
    }

    /// Stops the session on `device` and waits for its task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotArmed`] if no session is tracked, or the
    /// session's own failure if it had already ended with one.
    pub async fn stop(&self, device: &str) -> Result<SessionOutcome, SessionError> {
        let session = self.take(device).await?;
        info!(session = %session.id, device, "stopping session");
        // The task may already be gone; joining reports how it ended.
        let _ = session.stop.send(());
        join(session.task).await
    }

    /// Whether a live session holds `device`.
    pub async fn is_armed(&self, device: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(device)
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Waits for the session on `device` to end on its own and returns how it
    /// ended.  The session is no longer tracked afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotArmed`] if no session is tracked, or the
    /// session's failure.
    pub async fn wait(&self, device: &str) -> Result<SessionOutcome, SessionError> {
        let session = self.take(device).await?;
        join(session.task).await
    }

    async fn take(&self, device: &str) -> Result<ActiveSession, SessionError> {
        self.sessions
            .lock()
            .await
            .remove(device)
            .ok_or_else(|| SessionError::NotArmed {
                device: device.to_string(),
            })
    }
}

async fn join(task: SessionTask) -> Result<SessionOutcome, SessionError> {
    task.await
        .map_err(|e| SessionError::Task(e.to_string()))?
        .map_err(SessionError::from)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
