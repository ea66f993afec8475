use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::core::errors::DeviceFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Chunk(Vec<u8>),
    Failed(DeviceFailure),
}

pub type DeviceEvents = mpsc::UnboundedReceiver<DeviceEvent>;

/// Platform recording primitive. `start` begins emitting encoded chunks on
/// the returned channel until `stop` is called.
pub trait RecordingDevice: Send + Sync {
    fn start(&self) -> Result<DeviceEvents, DeviceFailure>;
    fn stop(&self);
}

/// Hands out the recording device to one capture at a time.
#[derive(Clone)]
pub struct DeviceGate {
    device: Arc<dyn RecordingDevice>,
    busy: Arc<Mutex<()>>,
}

impl DeviceGate {
    pub fn new(device: Arc<dyn RecordingDevice>) -> Self {
        Self { device, busy: Arc::new(Mutex::new(())) }
    }

    /// Starts the device, or fails with `Busy` while another lease is alive.
    pub fn acquire(&self) -> Result<DeviceLease, DeviceFailure> {
        let guard = self.busy.clone().try_lock_owned().map_err(|_| DeviceFailure::Busy)?;
        let events = self.device.start()?;
        tracing::debug!("Recording device acquired");
        Ok(DeviceLease { device: self.device.clone(), events, stopped: false, _guard: guard })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.try_lock().is_err()
    }
}

impl std::fmt::Debug for DeviceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGate").field("busy", &self.is_busy()).finish()
    }
}

/// Exclusive use of the device. Dropping the lease stops the device and
/// frees the gate.
pub struct DeviceLease {
    device: Arc<dyn RecordingDevice>,
    events: DeviceEvents,
    stopped: bool,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLease {
    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        self.events.recv().await
    }

    /// Stops the device and appends whatever chunks were still queued.
    pub fn finish(mut self, audio: &mut Vec<u8>) {
        self.stop();
        while let Ok(event) = self.events.try_recv() {
            if let DeviceEvent::Chunk(bytes) = event {
                audio.extend_from_slice(&bytes);
            }
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.device.stop();
            tracing::debug!("Recording device released");
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.stop();
    }
}
