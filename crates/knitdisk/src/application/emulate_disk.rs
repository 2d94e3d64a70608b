//! Use case: emulate the knitting machine's floppy drive over a serial link.
//!
//! The emulator is a small state machine driven by bytes from the machine:
//!
//! ```text
//!        bytes arrive           whole frame decoded        response written
//! Idle ───────────────► ReceivingCommand ─────────► ProcessingCommand ──► SendingResponse ──► Idle
//!   ▲                          │
//!   │   good frame             │ bad preamble / bad checksum / NAK
//!   └──────────────────────  Error  (last response resent, failure counted)
//! ```
//!
//! Every well-formed request gets exactly one response.  A malformed frame or
//! a NAK from the machine makes the emulator resend its previous response;
//! more than `max_retries` failures in a row end the session with
//! [`ProtocolError::RetriesExhausted`].  Bytes dropped while resynchronising
//! count as one failure per run of noise, however the port splits them up.
//!
//! The emulator is read-only: it serves pattern payloads from a
//! [`SharedPatternStore`] and answers every write-type command with
//! `WriteProtected`.
//!
//! # Cancellation (for beginners)
//!
//! [`DiskEmulator::run`] waits on three things at once with `tokio::select!`:
//! the stop signal, the next read from the port and an optional idle timer.
//! A response is always written to completion before the loop looks at the
//! stop signal again, so stopping never cuts a frame in half.  Only an
//! explicit send stops the session; dropping the sender leaves it serving.

use std::collections::HashSet;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use knit_core::domain::pattern_file::PatternFile;
use knit_core::protocol::codec::{
    decode_request, encode_response, FrameError, MAX_FRAME_DATA, REQUEST_OVERHEAD,
};
use knit_core::protocol::messages::{
    DirectoryEntryInfo, DirectoryRef, DriveStatus, OpenMode, Request, Response, SearchForm,
    FREE_SECTORS, NAK, READ_CHUNK_SIZE,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::infrastructure::storage::pattern_store::{PatternStore, SharedPatternStore, StoredPattern};

/// Size of the buffer used for each read from the port.
const READ_BUF_SIZE: usize = 512;

/// Discarded bytes charged as one framing failure.  A run of line noise
/// costs one failure when it starts and one more per this many bytes.
const GARBAGE_RUN_LEN: usize = 2 * (MAX_FRAME_DATA + REQUEST_OVERHEAD);

/// Fatal session errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Too many malformed or rejected frames in a row.
    #[error("giving up after {failures} consecutive framing failures")]
    RetriesExhausted { failures: u32 },

    /// Reading from or writing to the port failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A response could not be framed.
    #[error("cannot encode response: {0}")]
    Encode(#[from] FrameError),
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The stop signal was sent.
    Stopped,
    /// The port reported end of stream.
    Disconnected,
    /// No bytes arrived within the idle timeout.
    TimedOut,
}

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    Idle,
    ReceivingCommand,
    ProcessingCommand,
    SendingResponse,
    Error,
}

/// Emulator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Consecutive framing failures tolerated; one more aborts the session.
    pub max_retries: u32,
    /// End the session after this long without input.  `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            idle_timeout: None,
        }
    }
}

/// The file currently open for reading.
#[derive(Debug)]
struct OpenFile {
    slot: u16,
    file: Arc<PatternFile>,
    cursor: usize,
}

/// A floppy drive emulator bound to one byte stream.
pub struct DiskEmulator<S> {
    stream: S,
    store: SharedPatternStore,
    config: EmulatorConfig,
    state: EmulatorState,
    rx_buf: Vec<u8>,
    last_response: Option<Vec<u8>>,
    failures: u32,
    /// Bytes discarded since the last well-formed frame or NAK.
    garbage_run: usize,
    /// Name selected by the last directory reference.
    referenced: Option<String>,
    open: Option<OpenFile>,
    /// Slots already opened in this session; each loads once.
    loaded: HashSet<u16>,
    /// Next position of a first/next directory listing.
    listing: usize,
}

impl<S> DiskEmulator<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, store: SharedPatternStore, config: EmulatorConfig) -> Self {
        Self {
            stream,
            store,
            config,
            state: EmulatorState::Idle,
            rx_buf: Vec::with_capacity(READ_BUF_SIZE),
            last_response: None,
            failures: 0,
            garbage_run: 0,
            referenced: None,
            open: None,
            loaded: HashSet::new(),
            listing: 0,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> EmulatorState {
        self.state
    }

    /// Serves requests until stopped, disconnected, timed out or failed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when retries are exhausted or the port fails.
    /// The emulator is left in [`EmulatorState::Error`] in the first case.
    pub async fn run(
        &mut self,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<SessionOutcome, ProtocolError> {
        info!(
            max_retries = self.config.max_retries,
            idle_timeout = ?self.config.idle_timeout,
            "disk emulator listening"
        );
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut stoppable = true;

        loop {
            let idle_timeout = self.config.idle_timeout;
            tokio::select! {
                signal = &mut stop, if stoppable => {
                    if signal.is_ok() {
                        info!("disk emulator stopped");
                        return Ok(SessionOutcome::Stopped);
                    }
                    debug!("stop handle dropped; serving until disconnect");
                    stoppable = false;
                }
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        info!("serial peer disconnected");
                        return Ok(SessionOutcome::Disconnected);
                    }
                    self.feed(&buf[..n]).await?;
                }
                _ = idle(idle_timeout) => {
                    info!("no traffic within idle timeout; ending session");
                    return Ok(SessionOutcome::TimedOut);
                }
            }
        }
    }

    /// Appends received bytes and answers every complete frame in them.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if retries are exhausted or a write fails.
    pub async fn feed(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.state != EmulatorState::Error {
            self.state = EmulatorState::ReceivingCommand;
        }
        self.rx_buf.extend_from_slice(bytes);

        while let Some(&first) = self.rx_buf.first() {
            if first == NAK {
                self.rx_buf.drain(..1);
                self.garbage_run = 0;
                warn!("machine rejected last response (NAK)");
                self.record_failure().await?;
                continue;
            }

            match decode_request(&self.rx_buf) {
                Ok((request, consumed)) => {
                    self.rx_buf.drain(..consumed);
                    self.failures = 0;
                    self.garbage_run = 0;
                    self.state = EmulatorState::ProcessingCommand;
                    debug!(?request, "request");
                    let response = self.handle_request(request).await;
                    self.send(response).await?;
                }
                Err(e) => match e.discard_len() {
                    Some(n) => {
                        self.rx_buf.drain(..n);
                        self.discard(n, &e).await?;
                    }
                    None => break,
                },
            }
        }

        if self.state != EmulatorState::Error {
            self.state = if self.rx_buf.is_empty() {
                EmulatorState::Idle
            } else {
                EmulatorState::ReceivingCommand
            };
        }
        Ok(())
    }

    /// Computes the response to one request, updating session state.
    pub async fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::DirectoryRef(dir) => self.directory_ref(dir).await,
            Request::Open(mode) => self.open(mode).await,
            Request::Close => match self.open.take() {
                Some(open) => {
                    info!(slot = open.slot, "pattern closed");
                    Response::Status(DriveStatus::Normal)
                }
                None => Response::Status(DriveStatus::NotOpen),
            },
            Request::Read => self.read_chunk(),
            Request::Status => Response::Status(DriveStatus::Normal),
            Request::Modify(code) => {
                debug!(?code, "refusing write-type command");
                Response::Status(DriveStatus::WriteProtected)
            }
            Request::Unsupported { command } => {
                debug!(command, "unsupported command or parameters");
                Response::Status(DriveStatus::ParameterError)
            }
        }
    }

    async fn directory_ref(&mut self, dir: DirectoryRef) -> Response {
        let store = Arc::clone(&self.store);
        let store = store.read().await;

        match dir.search {
            SearchForm::ByName => {
                let name = dir.name.trim();
                if name.is_empty() {
                    self.referenced = None;
                    return Response::Status(DriveStatus::NoFileName);
                }
                self.referenced = Some(name.to_string());
                match store.lookup_name(name) {
                    Some(entry) => Response::DirectoryEntry(entry_info(entry)),
                    None => {
                        debug!(name, "directory lookup missed");
                        Response::Status(DriveStatus::FileNotFound)
                    }
                }
            }
            SearchForm::First => {
                self.listing = 0;
                self.next_listing(&store)
            }
            SearchForm::Next => self.next_listing(&store),
        }
    }

    fn next_listing(&mut self, store: &PatternStore) -> Response {
        match store.nth(self.listing) {
            Some(entry) => {
                self.listing += 1;
                self.referenced = Some(entry.slot.to_string());
                Response::DirectoryEntry(entry_info(entry))
            }
            None => {
                self.referenced = None;
                Response::DirectoryEntry(DirectoryEntryInfo::empty())
            }
        }
    }

    async fn open(&mut self, mode: OpenMode) -> Response {
        if self.open.is_some() {
            return Response::Status(DriveStatus::AlreadyOpen);
        }
        if mode != OpenMode::Read {
            return Response::Status(DriveStatus::WriteProtected);
        }
        let Some(name) = self.referenced.as_deref() else {
            return Response::Status(DriveStatus::NoFileName);
        };

        let store = self.store.read().await;
        match store.lookup_name(name) {
            Some(entry) if !self.loaded.insert(entry.slot) => {
                debug!(slot = entry.slot, "pattern already loaded this session");
                Response::Status(DriveStatus::AlreadyOpen)
            }
            Some(entry) => {
                info!(
                    slot = entry.slot,
                    source = %entry.source,
                    bytes = entry.file.payload_len(),
                    "pattern opened"
                );
                let opened = OpenFile {
                    slot: entry.slot,
                    file: Arc::clone(&entry.file),
                    cursor: 0,
                };
                self.open = Some(opened);
                Response::Status(DriveStatus::Normal)
            }
            None => Response::Status(DriveStatus::FileNotFound),
        }
    }

    fn read_chunk(&mut self) -> Response {
        let Some(open) = self.open.as_mut() else {
            return Response::Status(DriveStatus::NotOpen);
        };
        let payload = open.file.payload();
        if open.cursor >= payload.len() {
            return Response::Status(DriveStatus::EndOfFile);
        }
        let end = (open.cursor + READ_CHUNK_SIZE).min(payload.len());
        let chunk = payload[open.cursor..end].to_vec();
        open.cursor = end;
        debug!(slot = open.slot, cursor = end, total = payload.len(), "served chunk");
        Response::ReadData(chunk)
    }

    async fn send(&mut self, response: Response) -> Result<(), ProtocolError> {
        self.state = EmulatorState::SendingResponse;
        let frame = encode_response(&response)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        debug!(kind = ?response.response_code(), len = frame.len(), "response sent");
        self.last_response = Some(frame);
        self.state = EmulatorState::Idle;
        Ok(())
    }

    /// Charges discarded bytes against the retry budget, once per garbage
    /// run rather than once per read.
    async fn discard(&mut self, n: usize, cause: &FrameError) -> Result<(), ProtocolError> {
        let charged_before = self.garbage_run.div_ceil(GARBAGE_RUN_LEN);
        self.garbage_run += n;
        let charged_after = self.garbage_run.div_ceil(GARBAGE_RUN_LEN);
        if charged_after == charged_before {
            debug!(bytes = n, "still resynchronising: {cause}");
            return Ok(());
        }
        warn!("malformed frame: {cause}");
        for _ in charged_before..charged_after {
            self.record_failure().await?;
        }
        Ok(())
    }

    async fn record_failure(&mut self) -> Result<(), ProtocolError> {
        self.state = EmulatorState::Error;
        self.failures += 1;
        if self.failures > self.config.max_retries {
            error!(failures = self.failures, "retry limit exceeded");
            return Err(ProtocolError::RetriesExhausted {
                failures: self.failures,
            });
        }
        if let Some(frame) = &self.last_response {
            self.stream.write_all(frame).await?;
            self.stream.flush().await?;
            debug!(attempt = self.failures, "resent last response");
        }
        Ok(())
    }
}

fn entry_info(entry: &StoredPattern) -> DirectoryEntryInfo {
    DirectoryEntryInfo {
        name: entry.slot.to_string(),
        size: u32::try_from(entry.file.payload_len()).unwrap_or(u32::MAX),
        free_sectors: FREE_SECTORS,
    }
}

/// Resolves after `timeout`, or never when `None`.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
