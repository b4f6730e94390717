//! Timer driver: reconciles the engine's loss-detection and ACK-delay
//! deadlines with the host's scheduled-callback surface.

use crate::error::Result;
use crate::session::Session;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::debug;

/// Which of the two tracked deadlines a host timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    LossDetection,
    AckDelay,
}

/// Host-chosen token identifying a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(pub u64);

/// One tracked deadline: the engine-reported trigger time and the host
/// timer currently armed for it. `u64::MAX` means unarmed.
#[derive(Debug, Clone, Copy)]
pub struct TimerState {
    pub deadline: u64,
    pub handle: Option<TimerHandle>,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            deadline: u64::MAX,
            handle: None,
        }
    }
}

/// Nanoseconds on a process-local monotonic clock.
pub fn timestamp_now() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

impl Session {
    /// Re-read both engine deadlines and bring the host timers in line.
    /// Runs only once the handshake is complete, and only for hosts that
    /// implement the timer hooks.
    pub(crate) fn update_timers(&mut self) -> Result<()> {
        if !self.callbacks.supports_timers() || !self.handshake_complete {
            return Ok(());
        }

        let loss = self.engine.loss_detection_expiry();
        self.adjust_timer(TimerSlot::LossDetection, loss)?;

        let ack = self.engine.ack_delay_expiry();
        self.adjust_timer(TimerSlot::AckDelay, ack)?;

        Ok(())
    }

    fn adjust_timer(&mut self, slot: TimerSlot, trigger_time: u64) -> Result<()> {
        let state = match slot {
            TimerSlot::LossDetection => self.loss_timer,
            TimerSlot::AckDelay => self.ack_timer,
        };
        if trigger_time == state.deadline {
            return Ok(());
        }

        let mut new_state = state;

        if trigger_time == u64::MAX {
            if let Some(handle) = state.handle {
                self.callbacks.cancel_timer(handle);
            }
            new_state.handle = None;
        } else {
            let now = timestamp_now();
            if trigger_time <= now {
                // Already due: run inline and drop any armed timer.
                if let Some(handle) = state.handle {
                    self.callbacks.cancel_timer(handle);
                }
                new_state.handle = None;
                self.set_timer_state(slot, new_state);
                self.run_timer(slot)?;
                let mut after = self.timer_state(slot);
                after.deadline = trigger_time;
                self.set_timer_state(slot, after);
                return Ok(());
            }
            let from_now = (trigger_time - now) as f64 / 1e9;
            match state.handle {
                Some(handle) => self.callbacks.reset_timer(handle, from_now),
                None => {
                    new_state.handle = self.callbacks.set_timer(from_now, slot);
                }
            }
        }

        new_state.deadline = trigger_time;
        self.set_timer_state(slot, new_state);
        Ok(())
    }

    fn timer_state(&self, slot: TimerSlot) -> TimerState {
        match slot {
            TimerSlot::LossDetection => self.loss_timer,
            TimerSlot::AckDelay => self.ack_timer,
        }
    }

    fn set_timer_state(&mut self, slot: TimerSlot, state: TimerState) {
        match slot {
            TimerSlot::LossDetection => self.loss_timer = state,
            TimerSlot::AckDelay => self.ack_timer = state,
        }
    }

    /// Host entry point when a timer armed via `set_timer` fires.
    pub fn on_timer_fired(&mut self, slot: TimerSlot) -> Result<()> {
        let mut state = self.timer_state(slot);
        state.handle = None;
        self.set_timer_state(slot, state);
        self.run_timer(slot)
    }

    fn run_timer(&mut self, slot: TimerSlot) -> Result<()> {
        match slot {
            TimerSlot::LossDetection => {
                debug!("loss detection timer fired");
                self.engine.on_loss_detection_timer(timestamp_now());
                Ok(())
            }
            TimerSlot::AckDelay => {
                debug!("ack delay timer fired");
                let mut pkt = vec![0u8; self.max_packet_size];
                let n = self
                    .engine
                    .write_pkt(&self.path, &mut pkt, timestamp_now())
                    .map_err(crate::error::Error::from)?;
                if n > 0 {
                    pkt.truncate(n);
                    self.send_queue.push_back(pkt);
                }
                self.write_send_buffer()
            }
        }
    }
}
