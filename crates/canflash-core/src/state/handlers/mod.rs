//! Phase handlers - the work done in each update phase.
//!
//! This module is split into submodules by functionality:
//! - `handshake`: enter bootloader, query boot info, ping
//! - `transfer`: begin update and the chunk-send loop
//! - `finish`: end update and verification

mod finish;
mod handshake;
mod transfer;

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bank::BootInfo;
use crate::config::SessionConfig;
use crate::error::UpdateError;
use crate::events::{LogLevel, MessageDirection, UpdateEvent, UpdateObserver};
use crate::protocol::{BootloaderStatus, CanMessage, DeviceError, MessageKind, describe};
use crate::state::machine::{TransferState, UpdatePhase};
use crate::transport::{CanTransport, CancelToken, ResponseWaiter, TransportError, WaitError};

pub use finish::{end_update, verify};
pub use handshake::{enter_bootloader, ping, query_info, read_status};
pub use transfer::{begin, send_chunks};

/// Resources shared by the phase handlers.
pub struct HandlerContext<'a, T: CanTransport, O: UpdateObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub config: &'a SessionConfig,
    pub cancel: &'a CancelToken,
    pub phase: &'a mut UpdatePhase,
    pub state: &'a mut TransferState,
    pub boot_info: &'a mut BootInfo,
    pub status: &'a mut BootloaderStatus,
    /// Timeout behind `state.deadline`, for diagnostics.
    pub(crate) armed_ms: u64,
}

/// Move `phase` to `to` and notify `observer`.
pub fn transition<O: UpdateObserver>(phase: &mut UpdatePhase, observer: &O, to: UpdatePhase) {
    let from = *phase;
    if from == to {
        return;
    }
    debug_assert!(
        from.can_transition_to(to),
        "illegal phase transition {} -> {}",
        from,
        to
    );
    *phase = to;
    observer.on_event(&UpdateEvent::PhaseChanged { from, to });
}

/// Set the display status, notifying only on change.
pub fn set_status<O: UpdateObserver>(
    status: &mut BootloaderStatus,
    observer: &O,
    to: BootloaderStatus,
) {
    if *status != to {
        *status = to;
        observer.on_event(&UpdateEvent::StatusChanged(to));
    }
}

impl<'a, T: CanTransport, O: UpdateObserver> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn goto(&mut self, to: UpdatePhase) {
        transition(self.phase, self.observer, to);
    }

    pub(crate) fn set_status(&mut self, to: BootloaderStatus) {
        set_status(self.status, self.observer, to);
    }

    pub(crate) fn check_cancel(&self) -> Result<(), UpdateError> {
        if self.cancel.is_cancelled() {
            Err(UpdateError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub(crate) fn pause(&self, duration: Duration) -> Result<(), UpdateError> {
        let until = Instant::now() + duration;
        loop {
            self.check_cancel()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(self.config.poll_interval().min(until - now));
        }
    }

    /// Send one message and report it.
    pub(crate) fn send(&self, id: u16, payload: &[u8]) -> Result<(), UpdateError> {
        self.transport.send(id, payload)?;
        self.emit(UpdateEvent::Message {
            direction: MessageDirection::Tx,
            id,
            payload: payload.to_vec(),
            description: describe(id, payload),
        });
        Ok(())
    }

    /// Register for `ids` plus every device error report.
    pub(crate) fn expect(&self, ids: &[u16]) -> ResponseWaiter {
        let mut all = ids.to_vec();
        all.extend_from_slice(&MessageKind::ERROR_IDS);
        self.transport.hub().expect(&all)
    }

    /// Start the phase deadline.
    pub(crate) fn arm(&mut self, timeout_ms: u64) {
        self.state.deadline = Some(Instant::now() + Duration::from_millis(timeout_ms));
        self.armed_ms = timeout_ms;
    }

    /// Wait for the next message on `waiter` before the armed deadline.
    ///
    /// Fatal device errors come back as `Err`; sequence mismatches are
    /// returned to the caller.
    pub(crate) fn wait(
        &mut self,
        waiter: &ResponseWaiter,
        expected: &'static str,
    ) -> Result<CanMessage, UpdateError> {
        let deadline = self.state.deadline.unwrap_or_else(Instant::now);
        let msg = waiter
            .wait_until(deadline, self.cancel, self.config.poll_interval())
            .map_err(|e| match e {
                WaitError::Timeout => UpdateError::Timeout {
                    phase: *self.phase,
                    expected,
                    timeout_ms: self.armed_ms,
                },
                WaitError::Cancelled => UpdateError::Aborted,
                WaitError::Disconnected => UpdateError::Transport(TransportError::Disconnected),
            })?;

        let description = describe(msg.id(), msg.payload());
        self.emit(UpdateEvent::Message {
            direction: MessageDirection::Rx,
            id: msg.id(),
            payload: msg.payload().to_vec(),
            description,
        });

        if let Some(err) = DeviceError::decode(msg.id(), msg.payload())
            && !err.is_retryable()
        {
            warn!(error = %err, phase = %self.phase, "Fatal device error");
            return Err(UpdateError::Device(err));
        }
        Ok(msg)
    }

    /// Error for a message that has no meaning in the current phase.
    pub(crate) fn unexpected(&self, msg: &CanMessage) -> UpdateError {
        debug!(id = %format!("0x{:03X}", msg.id()), phase = %self.phase, "Unexpected response");
        UpdateError::UnexpectedResponse {
            phase: *self.phase,
            id: msg.id(),
            description: describe(msg.id(), msg.payload()),
        }
    }
}
