//! Drone command channel with an armed-only heartbeat.
//!
//! The drone disarms itself when heartbeats stop arriving, so the ping stream
//! must exist exactly while the commanded state is armed.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

/// Everything the operator controls on the drone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceCommandState {
    pub armed: bool,
    pub setpoint: [f64; 3],
    /// rows: x, y, z axis; columns: P, I, D
    pub pid: [[f64; 3]; 3],
    /// x, y, z, yaw
    pub trim: [f64; 4],
}

impl Default for DeviceCommandState {
    fn default() -> Self {
        Self {
            armed: false,
            setpoint: [0.0; 3],
            pid: [[1.0; 3]; 3],
            trim: [0.0; 4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DroneMessage {
    Command(DeviceCommandState),
    Heartbeat { armed: bool, count: u64 },
}

struct Shared {
    state: DeviceCommandState,
    /// Bumped on every arm/disarm transition; a ticker only pings while its
    /// epoch is current.
    epoch: u64,
}

pub struct CommandHeartbeatChannel {
    shared: Arc<Mutex<Shared>>,
    tx: mpsc::UnboundedSender<DroneMessage>,
    period: Duration,
    ticker: Option<JoinHandle<()>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|p| p.into_inner())
}

impl CommandHeartbeatChannel {
    pub fn new(period: Duration) -> (Self, mpsc::UnboundedReceiver<DroneMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(Mutex::new(Shared {
                state: DeviceCommandState::default(),
                epoch: 0,
            })),
            tx,
            period,
            ticker: None,
        };
        (channel, rx)
    }

    pub fn state(&self) -> DeviceCommandState {
        lock(&self.shared).state
    }

    pub fn is_armed(&self) -> bool {
        self.state().armed
    }

    /// Emit the full command, then start or stop the heartbeat.
    ///
    /// Must be called inside a tokio runtime when arming.
    pub fn set_armed(&mut self, armed: bool) {
        let (was_armed, epoch) = {
            let mut shared = lock(&self.shared);
            let was_armed = shared.state.armed;
            shared.state.armed = armed;
            if was_armed != armed {
                shared.epoch += 1;
            }
            // sent under the lock: no ping of the old epoch can follow it
            self.emit(shared.state);
            (was_armed, shared.epoch)
        };

        match (was_armed, armed) {
            (false, true) => {
                info!("[drone] armed");
                self.stop_ticker();
                self.ticker = Some(self.spawn_ticker(epoch));
            }
            (true, false) => {
                info!("[drone] disarmed");
                self.stop_ticker();
            }
            _ => {}
        }
    }

    pub fn update_setpoint(&self, setpoint: [f64; 3]) {
        self.update(|s| s.setpoint = setpoint);
    }

    pub fn update_pid(&self, pid: [[f64; 3]; 3]) {
        self.update(|s| s.pid = pid);
    }

    pub fn update_trim(&self, trim: [f64; 4]) {
        self.update(|s| s.trim = trim);
    }

    fn update(&self, f: impl FnOnce(&mut DeviceCommandState)) {
        let mut shared = lock(&self.shared);
        f(&mut shared.state);
        debug!("[drone] command {:?}", shared.state);
        self.emit(shared.state);
    }

    /// Returns false when the link has gone away; the command is then lost.
    fn emit(&self, state: DeviceCommandState) -> bool {
        if self.tx.send(DroneMessage::Command(state)).is_err() {
            warn!("[drone] link closed, command dropped: {:?}", state);
            return false;
        }
        true
    }

    fn spawn_ticker(&self, epoch: u64) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        let period = self.period;

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count = 0u64;
            loop {
                interval.tick().await;
                let guard = lock(&shared);
                if guard.epoch != epoch || !guard.state.armed {
                    break;
                }
                if tx.send(DroneMessage::Heartbeat { armed: true, count }).is_err() {
                    break;
                }
                drop(guard);
                count += 1;
            }
        })
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for CommandHeartbeatChannel {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
