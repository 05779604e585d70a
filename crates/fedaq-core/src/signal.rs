//! The control-system channel boundary.
//!
//! [`SignalLink`] is the seam between procedures and whatever process-variable
//! transport the site runs.  Hooks fire on driver-owned threads, so everything
//! registered here must be thread-safe and must never prompt.
//!
//! [`SimChannel`] is the in-memory implementation used by tests: it exposes the
//! driver side (connect/disconnect, value updates, injected faults) as inherent
//! methods while presenting the same `SignalLink` face to the code under test.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DaqError, DaqResult};

/// Callback invoked with `(channel_name, value)` on every value update.
pub type ValueHook = Box<dyn Fn(&str, f64) + Send + Sync>;

/// Callback invoked with `(channel_name, connected)` on connection changes.
pub type ConnectionHook = Box<dyn Fn(&str, bool) + Send + Sync>;

/// A named, connectable process-variable channel.
pub trait SignalLink: Send + Sync {
    /// The channel's control-system name.
    fn name(&self) -> &str;

    /// Current connection state.
    fn connected(&self) -> bool;

    /// Block until connected or the timeout expires.  Returns the final state.
    fn wait_for_connection(&self, timeout: Duration) -> bool;

    /// Last known value.  May be served from the driver's monitor cache.
    fn read(&self) -> DaqResult<f64>;

    /// Force a fresh round-trip read, bypassing any cache.
    fn read_fresh(&self) -> DaqResult<f64>;

    /// Fire-and-forget write.
    fn write(&self, value: f64) -> DaqResult<()>;

    /// Write and wait for the device acknowledgment.
    fn write_and_wait(&self, value: f64) -> DaqResult<()>;

    /// Register a value hook.  Fires on the driver's thread for every update.
    fn add_value_hook(&self, hook: ValueHook);

    /// Register a connection hook.  Fires on the driver's thread on every change.
    fn add_connection_hook(&self, hook: ConnectionHook);

    /// Re-fire all hooks with the current state.
    ///
    /// Used once after registration in case a channel was already in a bad
    /// state before its hooks were attached.
    fn fire_hooks(&self);
}

/// Wait for every channel in the list, surfacing the first failure.
///
/// Connection attempts run in the driver's background, so waiting on channels
/// one after another still completes in roughly one timeout overall.
pub fn wait_for_all(links: &[Arc<dyn SignalLink>], timeout: Duration) -> DaqResult<()> {
    for link in links {
        if !link.connected() && !link.wait_for_connection(timeout) {
            return Err(DaqError::Disconnected {
                channel: link.name().to_string(),
                timeout_s: timeout.as_secs_f64(),
            });
        }
    }
    Ok(())
}

// ─── In-memory simulator ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    value: Option<f64>,
    connected: bool,
    fail_next_reads: u32,
    write_rejection: Option<String>,
    writes: Vec<f64>,
}

/// In-memory channel for tests.
///
/// The `SignalLink` methods model the consumer side; the remaining inherent
/// methods model the driver side and fire hooks synchronously on the calling
/// thread (in tests, that thread plays the driver).
pub struct SimChannel {
    name: String,
    state: Mutex<SimState>,
    value_hooks: Mutex<Vec<ValueHook>>,
    connection_hooks: Mutex<Vec<ConnectionHook>>,
}

impl SimChannel {
    /// Disconnected channel with no value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState::default()),
            value_hooks: Mutex::new(Vec::new()),
            connection_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Connected channel seeded with an initial value.  The common test setup.
    #[must_use]
    pub fn online(name: impl Into<String>, value: f64) -> Arc<Self> {
        let ch = Self::new(name);
        if let Ok(mut state) = ch.state.lock() {
            state.connected = true;
            state.value = Some(value);
        }
        Arc::new(ch)
    }

    /// Driver-side connect.  Fires connection hooks.
    pub fn connect(&self) {
        self.set_connected(true);
    }

    /// Driver-side disconnect.  Fires connection hooks.
    pub fn disconnect(&self) {
        self.set_connected(false);
    }

    fn set_connected(&self, connected: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = connected;
        }
        if let Ok(hooks) = self.connection_hooks.lock() {
            for hook in hooks.iter() {
                hook(&self.name, connected);
            }
        }
    }

    /// Driver-side value update.  Fires value hooks.
    pub fn set_value(&self, value: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.value = Some(value);
        }
        self.fire_value_hooks(value);
    }

    /// Make the next `n` reads fail, simulating transient driver glitches.
    pub fn fail_next_reads(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_reads = n;
        }
    }

    /// Reject all subsequent writes with the given detail.
    pub fn reject_writes(&self, detail: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.write_rejection = Some(detail.into());
        }
    }

    /// Accept writes again.
    pub fn accept_writes(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.write_rejection = None;
        }
    }

    /// Every value written through the `SignalLink` face, in order.
    #[must_use]
    pub fn written_values(&self) -> Vec<f64> {
        self.state.lock().map(|s| s.writes.clone()).unwrap_or_default()
    }

    fn fire_value_hooks(&self, value: f64) {
        if let Ok(hooks) = self.value_hooks.lock() {
            for hook in hooks.iter() {
                hook(&self.name, value);
            }
        }
    }

    fn do_read(&self) -> DaqResult<f64> {
        let value = {
            let mut state = self.state.lock().map_err(|_| DaqError::SignalRead {
                channel: self.name.clone(),
                detail: "state lock poisoned".into(),
            })?;
            if state.fail_next_reads > 0 {
                state.fail_next_reads -= 1;
                None
            } else if !state.connected {
                None
            } else {
                state.value
            }
        };
        value.ok_or_else(|| DaqError::SignalRead {
            channel: self.name.clone(),
            detail: "no value available".into(),
        })
    }

    fn do_write(&self, value: f64) -> DaqResult<()> {
        {
            let mut state = self.state.lock().map_err(|_| DaqError::SignalWrite {
                channel: self.name.clone(),
                detail: "state lock poisoned".into(),
            })?;
            if let Some(detail) = &state.write_rejection {
                return Err(DaqError::SignalWrite {
                    channel: self.name.clone(),
                    detail: detail.clone(),
                });
            }
            if !state.connected {
                return Err(DaqError::SignalWrite {
                    channel: self.name.clone(),
                    detail: "channel disconnected".into(),
                });
            }
            state.writes.push(value);
            state.value = Some(value);
        }
        self.fire_value_hooks(value);
        Ok(())
    }
}

impl SignalLink for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.connected() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn read(&self) -> DaqResult<f64> {
        self.do_read()
    }

    fn read_fresh(&self) -> DaqResult<f64> {
        self.do_read()
    }

    fn write(&self, value: f64) -> DaqResult<()> {
        self.do_write(value)
    }

    fn write_and_wait(&self, value: f64) -> DaqResult<()> {
        self.do_write(value)
    }

    fn add_value_hook(&self, hook: ValueHook) {
        if let Ok(mut hooks) = self.value_hooks.lock() {
            hooks.push(hook);
        }
    }

    fn add_connection_hook(&self, hook: ConnectionHook) {
        if let Ok(mut hooks) = self.connection_hooks.lock() {
            hooks.push(hook);
        }
    }

    fn fire_hooks(&self) {
        let (connected, value) = self
            .state
            .lock()
            .map(|s| (s.connected, s.value))
            .unwrap_or((false, None));
        if let Ok(hooks) = self.connection_hooks.lock() {
            for hook in hooks.iter() {
                hook(&self.name, connected);
            }
        }
        if let Some(value) = value {
            self.fire_value_hooks(value);
        }
    }
}
