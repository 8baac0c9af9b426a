//! In-memory controller for tests and dry runs.
//!
//! `MockLink` records every frame it receives and answers like the firmware:
//! the handshake gets the identity line, everything else an `OK` line. Faults
//! can be injected to exercise the reconnect path.
//!
//! Clones share state, so a test can keep one handle while the device client
//! owns another.

use crate::hardware::adapter::SerialLink;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_IDENTITY: &str = "1KATARA Arduino Firmware";

#[derive(Debug)]
struct MockState {
    open: bool,
    unplugged: bool,
    identity: String,
    frames: Vec<String>,
    pending: VecDeque<String>,
    fail_writes: usize,
    fail_frames: Vec<(String, usize)>,
    fail_opens: usize,
    opens: usize,
}

/// Simulated valve controller.
#[derive(Debug, Clone)]
pub struct MockLink {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    /// Create a mock that answers the handshake with the KATARA identity.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            state: Arc::new(Mutex::new(MockState {
                open: false,
                unplugged: false,
                identity: DEFAULT_IDENTITY.to_string(),
                frames: Vec::new(),
                pending: VecDeque::new(),
                fail_writes: 0,
                fail_frames: Vec::new(),
                fail_opens: 0,
                opens: 0,
            })),
        }
    }

    /// Answer the handshake with something else.
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        self.lock().identity = identity.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().fail_writes = count;
    }

    /// Fail the next `count` writes of exactly `frame`; other frames go through.
    pub fn fail_frame(&self, frame: impl Into<String>, count: usize) {
        self.lock().fail_frames.push((frame.into(), count));
    }

    /// Fail the next `count` open attempts.
    pub fn fail_next_opens(&self, count: usize) {
        self.lock().fail_opens = count;
    }

    /// Simulate the cable being pulled: every write and open fails until `replug`.
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// Undo `unplug`.
    pub fn replug(&self) {
        self.lock().unplugged = false;
    }

    /// Every frame received so far, in order.
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// Forget recorded frames.
    pub fn clear_frames(&self) {
        self.lock().frames.clear();
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(anyhow!("mock device is unplugged"));
        }
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(anyhow!("simulated open failure"));
        }
        state.open = true;
        state.opens += 1;
        state.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.open = false;
        state.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn write(&mut self, frame: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(anyhow!("mock port is closed"));
        }
        if state.unplugged {
            return Err(anyhow!("mock device is unplugged"));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(anyhow!("simulated write failure"));
        }
        if let Some((_, remaining)) = state
            .fail_frames
            .iter_mut()
            .find(|(f, remaining)| f == frame && *remaining > 0)
        {
            *remaining -= 1;
            return Err(anyhow!("simulated write failure for {frame}"));
        }
        state.frames.push(frame.to_string());
        let reply = if frame == "1c" {
            state.identity.clone()
        } else {
            "OK".to_string()
        };
        state.pending.push_back(reply);
        Ok(())
    }

    async fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>> {
        let mut state = self.lock();
        if !state.open {
            return Err(anyhow!("mock port is closed"));
        }
        Ok(state.pending.pop_front())
    }
}
