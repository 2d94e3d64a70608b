//! Serial device infrastructure.
//!
//! - [`TokioSerialOpener`] opens a real port as a tokio stream.
//! - [`DeviceRegistry`] / [`DeviceLease`] make sure at most one session holds
//!   a device at a time.
//!
//! # Leases (for beginners)
//!
//! A lease is a guard value: while it exists the device name is marked as
//! taken, and dropping it frees the name again.  The orchestrator moves the
//! lease into the emulator task, so the device is released however that task
//! ends, including when the task is aborted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use crate::application::orchestrate_session::DeviceOpener;

// ── Device exclusivity ────────────────────────────────────────────────────────

/// Set of device names currently claimed by a session.
///
/// Cloning is cheap; all clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `device`, or returns `None` if it is already claimed.
    pub fn claim(&self, device: &str) -> Option<DeviceLease> {
        if !self.lock().insert(device.to_string()) {
            return None;
        }
        debug!(device, "device claimed");
        Some(DeviceLease {
            device: device.to_string(),
            registry: self.clone(),
        })
    }

    /// Whether a live lease exists for `device`.
    pub fn is_claimed(&self, device: &str) -> bool {
        self.lock().contains(device)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on one device; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: String,
    registry: DeviceRegistry,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.device);
        debug!(device = %self.device, "device released");
    }
}

// ── Real serial ports ─────────────────────────────────────────────────────────

/// Opens serial devices with `tokio-serial`, 8N1 without flow control.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialOpener;

impl DeviceOpener for TokioSerialOpener {
    type Port = SerialStream;

    fn open(&self, device: &str, baud_rate: u32) -> std::io::Result<SerialStream> {
        tokio_serial::new(device, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::other)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_marks_device_as_claimed() {
        // Arrange
        let registry = DeviceRegistry::new();

        // Act
        let lease = registry.claim("/dev/ttyUSB0");

        // Assert
        assert!(lease.is_some());
        assert!(registry.is_claimed("/dev/ttyUSB0"));
        assert_eq!(lease.unwrap().device(), "/dev/ttyUSB0");
    }

    #[test]
    fn test_second_claim_is_rejected_while_lease_lives() {
        let registry = DeviceRegistry::new();
        let _lease = registry.claim("/dev/ttyUSB0").unwrap();

        assert!(registry.claim("/dev/ttyUSB0").is_none());
    }

    #[test]
    fn test_dropping_lease_releases_device() {
        let registry = DeviceRegistry::new();
        let lease = registry.claim("/dev/ttyUSB0").unwrap();

        drop(lease);

        assert!(!registry.is_claimed("/dev/ttyUSB0"));
        assert!(registry.claim("/dev/ttyUSB0").is_some());
    }

    #[test]
    fn test_devices_are_claimed_independently() {
        let registry = DeviceRegistry::new();
        let _a = registry.claim("/dev/ttyUSB0").unwrap();

        assert!(registry.claim("/dev/ttyUSB1").is_some());
    }

    #[test]
    fn test_clones_share_claims() {
        let registry = DeviceRegistry::new();
        let clone = registry.clone();
        let _lease = registry.claim("COM3").unwrap();

        assert!(clone.is_claimed("COM3"));
    }

    #[tokio::test]
    async fn test_opening_missing_device_fails() {
        let result = TokioSerialOpener.open("/dev/knitdisk-does-not-exist", 9600);
        assert!(result.is_err());
    }
}
