//! Update Session - high-level orchestrator for a firmware update.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::bank::BootInfo;
use crate::config::SessionConfig;
use crate::error::UpdateError;
use crate::events::{MessageDirection, TracingObserver, UpdateEvent, UpdateObserver};
use crate::payload::FirmwareImage;
use crate::protocol::constants::CMD_RESET;
use crate::protocol::{BootloaderStatus, describe};
use crate::state::handlers::{self, HandlerContext, set_status, transition};
use crate::state::machine::{TransferState, UpdatePhase};
use crate::transport::{CanTransport, CancelToken, SessionLease, TransportError};

/// Summary of a successful update.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub status: BootloaderStatus,
    pub bytes: u64,
    pub chunks: usize,
    /// Sequence-mismatch resends over the whole transfer.
    pub retries: u32,
    pub crc32: u32,
    pub target_bank: Option<u8>,
    pub elapsed: Duration,
    pub boot_info: BootInfo,
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes in {} chunks, CRC32 0x{:08X}, {} retries, {:.1}s",
            self.status,
            self.bytes,
            self.chunks,
            self.crc32,
            self.retries,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Update Session - drives one device through the update phases.
///
/// At most one session may be active per transport; the lease is taken
/// from the transport's message hub for the duration of each operation.
pub struct UpdateSession<T: CanTransport, O: UpdateObserver> {
    transport: Arc<T>,
    observer: Arc<O>,
    config: SessionConfig,
    cancel: CancelToken,
    phase: UpdatePhase,
    status: BootloaderStatus,
    state: TransferState,
    boot_info: BootInfo,
    last_error: Option<String>,
}

impl<T: CanTransport> UpdateSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: CanTransport, O: UpdateObserver> UpdateSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: Arc<T>, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            observer,
            config,
            cancel: CancelToken::new(),
            phase: UpdatePhase::Idle,
            status: BootloaderStatus::Idle,
            state: TransferState::new(),
            boot_info: BootInfo::new(),
            last_error: None,
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Display status. Never used for control decisions.
    pub fn status(&self) -> BootloaderStatus {
        self.status
    }

    pub fn boot_info(&self) -> &BootInfo {
        &self.boot_info
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Diagnostic of the last failure, kept until the next run.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Token that aborts a running update from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn context(&mut self) -> HandlerContext<'_, T, O> {
        HandlerContext {
            transport: self.transport.as_ref(),
            observer: self.observer.as_ref(),
            config: &self.config,
            cancel: &self.cancel,
            phase: &mut self.phase,
            state: &mut self.state,
            boot_info: &mut self.boot_info,
            status: &mut self.status,
            armed_ms: 0,
        }
    }

    fn lease(&self) -> Result<SessionLease, UpdateError> {
        if self.phase != UpdatePhase::Idle {
            return Err(UpdateError::NotIdle(self.phase));
        }
        self.transport
            .hub()
            .try_acquire_session()
            .ok_or(UpdateError::SessionActive)
    }

    /// Run a complete update of `image`.
    ///
    /// Ends in `Success` or `Failed`; call [`reset`](Self::reset) before the
    /// next run. An abort ends in `Idle`.
    #[instrument(skip(self, image), fields(size = image.len()))]
    pub fn run(&mut self, image: FirmwareImage) -> Result<UpdateReport, UpdateError> {
        let _lease = self.lease()?;
        let started = Instant::now();

        self.last_error = None;
        self.state.load(image);
        info!(
            chunks = self.state.total_chunks,
            crc = %format!("0x{:08X}", self.state.crc32),
            "Starting update"
        );

        let result = Self::drive(&mut self.context());
        match result {
            Ok(()) => {
                let report = UpdateReport {
                    status: self.status,
                    bytes: self.state.bytes_acknowledged,
                    chunks: self.state.total_chunks,
                    retries: self.state.total_retries,
                    crc32: self.state.crc32,
                    target_bank: self.state.target_bank,
                    elapsed: started.elapsed(),
                    boot_info: self.boot_info.clone(),
                };
                self.state.deadline = None;
                self.observer.on_event(&UpdateEvent::Finished {
                    status: self.status,
                    error: None,
                });
                Ok(report)
            }
            Err(UpdateError::Aborted) => {
                self.abort();
                Err(UpdateError::Aborted)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn drive(ctx: &mut HandlerContext<'_, T, O>) -> Result<(), UpdateError> {
        ctx.goto(UpdatePhase::EnteringBootloader);
        handlers::enter_bootloader(ctx)?;

        ctx.goto(UpdatePhase::QueryingInfo);
        handlers::query_info(ctx)?;

        ctx.check_cancel()?;
        ctx.goto(UpdatePhase::Pinging);
        handlers::ping(ctx)?;

        ctx.check_cancel()?;
        ctx.goto(UpdatePhase::Beginning);
        handlers::begin(ctx)?;

        ctx.goto(UpdatePhase::Transferring);
        handlers::send_chunks(ctx)?;

        ctx.check_cancel()?;
        ctx.goto(UpdatePhase::Ending);
        let response = handlers::end_update(ctx)?;

        ctx.goto(UpdatePhase::Verifying);
        handlers::verify(ctx, &response)?;

        ctx.goto(UpdatePhase::Success);
        Ok(())
    }

    fn fail(&mut self, err: &UpdateError) {
        let status = err.status();
        let diagnostic = err.diagnostic();
        warn!(phase = %self.phase, error = %diagnostic, "Update failed");

        transition(&mut self.phase, self.observer.as_ref(), UpdatePhase::Failed);
        set_status(&mut self.status, self.observer.as_ref(), status);
        self.state.deadline = None;
        self.last_error = Some(diagnostic.clone());
        self.observer.on_event(&UpdateEvent::Finished {
            status,
            error: Some(diagnostic),
        });
    }

    /// Abort from any phase.
    ///
    /// Sends one best-effort reset without waiting for a reply, passes
    /// through `Failed` and leaves the session `Idle`. No-op when idle.
    pub fn abort(&mut self) {
        if self.phase == UpdatePhase::Idle {
            debug!("Abort ignored, session idle");
            return;
        }
        warn!(phase = %self.phase, "Aborting update");
        self.cancel.cancel();
        self.send_reset();

        let diagnostic = UpdateError::Aborted.diagnostic();
        transition(&mut self.phase, self.observer.as_ref(), UpdatePhase::Failed);
        self.state.deadline = None;
        self.last_error = Some(diagnostic.clone());
        self.observer.on_event(&UpdateEvent::Finished {
            status: BootloaderStatus::Idle,
            error: Some(diagnostic),
        });
        self.settle_idle();
    }

    /// Return to `Idle`, sending one reset to the device. An in-flight
    /// update is aborted; a finished one resets the device out of its
    /// bootloader.
    pub fn reset(&mut self) {
        match self.phase {
            UpdatePhase::Idle => {}
            UpdatePhase::Success | UpdatePhase::Failed => {
                self.send_reset();
                self.settle_idle();
            }
            _ => self.abort(),
        }
    }

    fn settle_idle(&mut self) {
        transition(&mut self.phase, self.observer.as_ref(), UpdatePhase::Idle);
        set_status(&mut self.status, self.observer.as_ref(), BootloaderStatus::Idle);
        self.cancel.clear();
    }

    fn send_reset(&self) {
        match self.transport.send(CMD_RESET, &[]) {
            Ok(()) => self.observer.on_event(&UpdateEvent::Message {
                direction: MessageDirection::Tx,
                id: CMD_RESET,
                payload: Vec::new(),
                description: describe(CMD_RESET, &[]),
            }),
            Err(e) => warn!(error = %e, "Best-effort reset failed"),
        }
    }

    /// Refresh the boot info of an idle device.
    #[instrument(skip(self))]
    pub fn query_info(&mut self) -> Result<BootInfo, UpdateError> {
        let _lease = self.lease()?;
        handlers::query_info(&mut self.context())?;
        Ok(self.boot_info.clone())
    }

    /// Read the raw status byte of an idle device.
    #[instrument(skip(self))]
    pub fn ping(&mut self) -> Result<u8, UpdateError> {
        let _lease = self.lease()?;
        handlers::read_status(&mut self.context())
    }

    /// Send a reset to an idle device.
    #[instrument(skip(self))]
    pub fn reset_device(&mut self) -> Result<(), UpdateError> {
        let _lease = self.lease()?;
        let mut ctx = self.context();
        ctx.send(CMD_RESET, &[])?;
        ctx.set_status(BootloaderStatus::Idle);
        Ok(())
    }

    #[cfg(test)]
    fn force_phase(&mut self, phase: UpdatePhase) {
        self.phase = phase;
    }
}

/// Handle to an update running on a worker thread.
pub struct UpdateHandle {
    cancel: CancelToken,
    worker: JoinHandle<Result<UpdateReport, UpdateError>>,
}

impl UpdateHandle {
    /// Request an abort. The worker sends the reset and finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the outcome.
    pub fn join(self) -> Result<UpdateReport, UpdateError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Run `session` on a worker thread.
pub fn spawn_update<T, O>(
    mut session: UpdateSession<T, O>,
    image: FirmwareImage,
) -> Result<UpdateHandle, UpdateError>
where
    T: CanTransport + 'static,
    O: UpdateObserver + 'static,
{
    let cancel = session.cancel_token();
    let worker = thread::Builder::new()
        .name("canflash-update".to_string())
        .spawn(move || session.run(image))
        .map_err(TransportError::Io)?;
    Ok(UpdateHandle { cancel, worker })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::CanMessage;
    use crate::protocol::constants::*;
    use crate::transport::{MockTransport, SimulatedDevice};
    use UpdatePhase::*;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<UpdateEvent>>,
    }

    impl UpdateObserver for RecordingObserver {
        fn on_event(&self, event: &UpdateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl RecordingObserver {
        fn phases(&self) -> Vec<UpdatePhase> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    UpdateEvent::PhaseChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect()
        }

        fn finished(&self) -> Vec<(BootloaderStatus, Option<String>)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    UpdateEvent::Finished { status, error } => Some((*status, error.clone())),
                    _ => None,
                })
                .collect()
        }

        fn retries(&self) -> Vec<(usize, u8, String)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    UpdateEvent::Retry {
                        chunk,
                        attempt,
                        diagnostic,
                        ..
                    } => Some((*chunk, *attempt, diagnostic.clone())),
                    _ => None,
                })
                .collect()
        }

        fn last_fraction(&self) -> Option<f64> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|e| match e {
                    UpdateEvent::Progress { fraction, .. } => Some(*fraction),
                    _ => None,
                })
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            enter_delay_ms: 0,
            query_timeout_ms: 500,
            ping_timeout_ms: 500,
            begin_timeout_ms: 500,
            chunk_timeout_ms: 500,
            end_timeout_ms: 500,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes((0..len).map(|i| (i * 31 + 7) as u8).collect()).unwrap()
    }

    fn session_with(
        transport: MockTransport,
        config: SessionConfig,
    ) -> (
        Arc<MockTransport>,
        Arc<RecordingObserver>,
        UpdateSession<MockTransport, RecordingObserver>,
    ) {
        let transport = Arc::new(transport);
        let observer = Arc::new(RecordingObserver::default());
        let session = UpdateSession::with_observer(transport.clone(), config, observer.clone());
        (transport, observer, session)
    }

    fn sent_sequences(transport: &MockTransport) -> Vec<u8> {
        transport
            .sent_with_id(CMD_DATA)
            .iter()
            .map(|m| m.payload()[0])
            .collect()
    }

    #[test]
    fn test_happy_path() {
        let (transport, observer, mut session) =
            session_with(MockTransport::with_device(SimulatedDevice::new()), fast_config());
        let img = image(17);
        let crc = img.crc32();

        let report = session.run(img).unwrap();

        assert_eq!(session.phase(), Success);
        assert_eq!(session.status(), BootloaderStatus::Success);
        assert_eq!(session.state().bytes_acknowledged, 17);
        assert_eq!(session.state().bytes_acknowledged, session.state().total_size);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.retries, 0);
        assert_eq!(report.target_bank, Some(1));
        assert_eq!(report.crc32, crc);

        let ids: Vec<u16> = transport.sent().iter().map(|m| m.id()).collect();
        assert_eq!(
            ids,
            vec![
                CMD_ENTER_BOOTLOADER,
                CMD_QUERY_INFO,
                CMD_PING,
                CMD_BEGIN_UPDATE,
                CMD_DATA,
                CMD_DATA,
                CMD_DATA,
                CMD_END_UPDATE
            ]
        );
        assert_eq!(sent_sequences(&transport), vec![0, 1, 2]);
        assert_eq!(transport.sent_with_id(CMD_BEGIN_UPDATE)[0].payload(), &[17, 0, 0, 0]);
        assert_eq!(
            transport.sent_with_id(CMD_END_UPDATE)[0].payload(),
            &crc.to_le_bytes()
        );

        assert_eq!(
            observer.phases(),
            vec![
                EnteringBootloader,
                QueryingInfo,
                Pinging,
                Beginning,
                Transferring,
                Ending,
                Verifying,
                Success
            ]
        );
        assert_eq!(observer.finished(), vec![(BootloaderStatus::Success, None)]);
        assert_eq!(observer.last_fraction(), Some(1.0));

        let bank = &session.boot_info().banks[1];
        assert!(bank.valid);
        assert_eq!(bank.crc32, crc);
        assert_eq!(session.boot_info().banks[0].version.to_string(), "1.2.0");
    }

    #[test]
    fn test_retry_resends_same_chunk() {
        let device = SimulatedDevice::new().reject_sequence_once(2);
        let (transport, observer, mut session) =
            session_with(MockTransport::with_device(device), fast_config());

        let report = session.run(image(30)).unwrap();

        assert_eq!(session.phase(), Success);
        assert_eq!(sent_sequences(&transport), vec![0, 1, 2, 2, 3, 4]);
        assert_eq!(session.state().retries, 0);
        assert_eq!(session.state().total_retries, 1);
        assert_eq!(report.retries, 1);

        let retries = observer.retries();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].0, 2);
        assert_eq!(retries[0].1, 1);
        assert_eq!(
            retries[0].2,
            "Sequence Mismatch: Expected 2, Received 3 (Auto-retrying)"
        );
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let device = SimulatedDevice::new().always_reject_sequence(1);
        let config = SessionConfig {
            max_chunk_retries: 2,
            ..fast_config()
        };
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(device), config);

        let err = session.run(image(20)).unwrap_err();

        assert!(matches!(
            err,
            UpdateError::RetriesExhausted {
                chunk: 1,
                sequence: 1,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(sent_sequences(&transport), vec![0, 1, 1, 1]);
        assert_eq!(session.phase(), Failed);
        assert!(session.last_error().unwrap().starts_with("Retries exhausted"));
        assert!(transport.sent_with_id(CMD_END_UPDATE).is_empty());
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut device = SimulatedDevice::new();
        let transport = MockTransport::with_responder(move |msg| {
            let mut replies = device.respond(msg);
            if msg.id() == CMD_DATA && msg.payload()[0] == 1 {
                replies.insert(0, CanMessage::from_parts(RSP_PROGRESS, &[0, 7, 0, 0, 0]));
            }
            replies
        });
        let (_transport, _observer, mut session) = session_with(transport, fast_config());

        session.run(image(14)).unwrap();
        assert_eq!(session.state().bytes_acknowledged, 14);
    }

    #[test]
    fn test_ping_timeout_fails_without_hanging() {
        let device = SimulatedDevice::new().silent_on(CMD_PING);
        let config = SessionConfig {
            ping_timeout_ms: 100,
            ..fast_config()
        };
        let (transport, observer, mut session) =
            session_with(MockTransport::with_device(device), config);

        let started = Instant::now();
        let err = session.run(image(10)).unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            UpdateError::Timeout {
                phase: Pinging,
                timeout_ms: 100,
                ..
            }
        ));
        assert_eq!(session.phase(), Failed);
        assert_eq!(session.status(), BootloaderStatus::FailedTimeout);
        assert!(session.last_error().unwrap().contains("ping response"));
        assert!(transport.sent_with_id(CMD_BEGIN_UPDATE).is_empty());
        assert!(transport.sent_with_id(CMD_RESET).is_empty());

        let finished = observer.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, BootloaderStatus::FailedTimeout);
        assert!(finished[0].1.is_some());
    }

    #[test]
    fn test_fatal_flash_error_stops_transfer() {
        let device = SimulatedDevice::new().fail_on_sequence(
            1,
            CanMessage::from_parts(ERR_FLASH_WRITE, &[0x00, 0x10, 0x00, 0x08]),
        );
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(device), fast_config());

        let err = session.run(image(21)).unwrap_err();

        assert!(matches!(err, UpdateError::Device(_)));
        assert_eq!(
            session.last_error(),
            Some("Flash Write Failed at Address 0x08001000")
        );
        assert_eq!(session.status(), BootloaderStatus::FailedFlash);
        assert_eq!(sent_sequences(&transport), vec![0, 1]);
    }

    #[test]
    fn test_size_mismatch_at_end() {
        let mut device = SimulatedDevice::new();
        let transport = MockTransport::with_responder(move |msg| {
            if msg.id() == CMD_END_UPDATE {
                vec![CanMessage::from_parts(
                    ERR_SIZE_MISMATCH,
                    &[0x01, 0, 0, 0, 0x02, 0, 0, 0],
                )]
            } else {
                device.respond(msg)
            }
        });
        let (_transport, observer, mut session) = session_with(transport, fast_config());

        session.run(image(7)).unwrap_err();

        assert_eq!(
            session.last_error(),
            Some("Size Mismatch: Expected 1 bytes, Received 2 bytes")
        );
        let phases = observer.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Ending, Failed]);
    }

    #[test]
    fn test_device_not_ready() {
        let device = SimulatedDevice::new().with_status(BootloaderStatus::InProgress);
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(device), fast_config());

        let err = session.run(image(7)).unwrap_err();
        assert!(matches!(err, UpdateError::NotReady { status: 0x02, .. }));
        assert!(transport.sent_with_id(CMD_BEGIN_UPDATE).is_empty());
    }

    #[test]
    fn test_begin_rejected() {
        let device = SimulatedDevice::new().begin_with(BootloaderStatus::FailedFlash);
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(device), fast_config());

        let err = session.run(image(7)).unwrap_err();
        assert!(matches!(err, UpdateError::Rejected { .. }));
        assert_eq!(session.status(), BootloaderStatus::FailedFlash);
        assert!(transport.sent_with_id(CMD_DATA).is_empty());
    }

    #[test]
    fn test_verification_failed() {
        let mut device = SimulatedDevice::new();
        let transport = MockTransport::with_responder(move |msg| {
            if msg.id() == CMD_END_UPDATE {
                vec![CanMessage::from_parts(
                    RSP_END,
                    &[BootloaderStatus::FailedChecksum.as_u8(), 1, 0, 0, 0, 0],
                )]
            } else {
                device.respond(msg)
            }
        });
        let (_transport, _observer, mut session) = session_with(transport, fast_config());

        let err = session.run(image(9)).unwrap_err();
        assert!(matches!(err, UpdateError::VerificationFailed { status: 0x04, .. }));
        assert_eq!(session.phase(), Failed);
        assert_eq!(session.status(), BootloaderStatus::FailedChecksum);
        assert!(!session.boot_info().banks[1].valid);
    }

    #[test]
    fn test_abort_from_every_phase() {
        for phase in UpdatePhase::ALL {
            if phase == Idle {
                continue;
            }
            let (transport, observer, mut session) =
                session_with(MockTransport::new(), fast_config());
            session.force_phase(phase);

            session.abort();
            session.abort();

            assert_eq!(session.phase(), Idle, "from {}", phase);
            assert_eq!(session.status(), BootloaderStatus::Idle);
            assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1, "from {}", phase);
            assert_eq!(session.last_error(), Some("Update aborted by user"));
            assert_eq!(observer.finished().len(), 1);
        }
    }

    #[test]
    fn test_abort_while_idle_sends_nothing() {
        let (transport, _observer, mut session) = session_with(MockTransport::new(), fast_config());
        session.abort();
        session.reset();
        assert_eq!(session.phase(), Idle);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_cancel_mid_update() {
        let (transport, observer, mut session) =
            session_with(MockTransport::new(), fast_config());
        let cancel = session.cancel_token();
        let mut device = SimulatedDevice::new();
        transport.set_responder(move |msg| {
            if msg.id() == CMD_BEGIN_UPDATE {
                cancel.cancel();
                return Vec::new();
            }
            device.respond(msg)
        });

        let err = session.run(image(7)).unwrap_err();

        assert!(matches!(err, UpdateError::Aborted));
        assert_eq!(session.phase(), Idle);
        assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1);
        assert!(transport.sent_with_id(CMD_DATA).is_empty());
        let phases = observer.phases();
        assert_eq!(&phases[phases.len() - 3..], &[Beginning, Failed, Idle]);
        assert_eq!(
            observer.finished(),
            vec![(
                BootloaderStatus::Idle,
                Some("Update aborted by user".to_string())
            )]
        );
    }

    #[test]
    fn test_reset_after_success_sends_reset_once() {
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(SimulatedDevice::new()), fast_config());
        session.run(image(7)).unwrap();

        assert!(matches!(
            session.run(image(7)),
            Err(UpdateError::NotIdle(Success))
        ));

        session.reset();
        session.reset();
        assert_eq!(session.phase(), Idle);
        assert_eq!(session.status(), BootloaderStatus::Idle);
        assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1);

        session.run(image(8)).unwrap();
        assert_eq!(session.phase(), Success);
    }

    #[test]
    fn test_reset_after_failure_sends_reset_once() {
        let device = SimulatedDevice::new().silent_on(CMD_PING);
        let config = SessionConfig {
            ping_timeout_ms: 50,
            ..fast_config()
        };
        let (transport, observer, mut session) =
            session_with(MockTransport::with_device(device), config);

        assert!(session.run(image(10)).is_err());
        assert_eq!(session.phase(), Failed);
        assert!(transport.sent_with_id(CMD_RESET).is_empty());

        session.reset();
        session.reset();
        assert_eq!(session.phase(), Idle);
        assert_eq!(session.status(), BootloaderStatus::Idle);
        assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1);
        assert_eq!(observer.finished().len(), 1);
        assert!(session.last_error().is_some());
    }

    #[test]
    fn test_second_session_fails_fast() {
        let device = SimulatedDevice::new().silent_on(CMD_PING);
        let transport = Arc::new(MockTransport::with_device(device));
        let config = SessionConfig {
            ping_timeout_ms: 10_000,
            ..fast_config()
        };

        let first = UpdateSession::with_observer(
            transport.clone(),
            config.clone(),
            Arc::new(RecordingObserver::default()),
        );
        let handle = spawn_update(first, image(7)).unwrap();

        let started = Instant::now();
        while !transport.hub().session_active() {
            assert!(started.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(1));
        }

        let mut second = UpdateSession::with_observer(
            transport.clone(),
            config,
            Arc::new(RecordingObserver::default()),
        );
        let checked = Instant::now();
        assert!(matches!(second.run(image(7)), Err(UpdateError::SessionActive)));
        assert!(matches!(second.ping(), Err(UpdateError::SessionActive)));
        assert!(checked.elapsed() < Duration::from_millis(500));
        assert_eq!(second.phase(), Idle);

        assert!(!handle.is_finished());
        handle.cancel();
        assert!(matches!(handle.join(), Err(UpdateError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1);
        assert!(!transport.hub().session_active());
    }

    #[test]
    fn test_spawned_update_completes() {
        let transport = Arc::new(MockTransport::with_device(SimulatedDevice::new()));
        let session = UpdateSession::with_observer(
            transport,
            fast_config(),
            Arc::new(RecordingObserver::default()),
        );
        let report = spawn_update(session, image(64)).unwrap().join().unwrap();
        assert_eq!(report.bytes, 64);
        assert_eq!(report.chunks, 10);
    }

    #[test]
    fn test_standalone_operations() {
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(SimulatedDevice::new()), fast_config());

        let info = session.query_info().unwrap();
        assert!(info.banks[0].valid);
        assert_eq!(info.active_bank, 0);
        assert_eq!(info.bootloader_version.to_string(), "1.0.3");

        assert_eq!(session.ping().unwrap(), BootloaderStatus::Ready.as_u8());
        assert_eq!(session.status(), BootloaderStatus::Ready);

        session.reset_device().unwrap();
        assert_eq!(transport.sent_with_id(CMD_RESET).len(), 1);
        assert_eq!(session.status(), BootloaderStatus::Idle);
        assert_eq!(session.phase(), Idle);

        session.force_phase(Transferring);
        assert!(matches!(
            session.query_info(),
            Err(UpdateError::NotIdle(Transferring))
        ));
    }

    #[test]
    fn test_disconnected_link() {
        let (transport, _observer, mut session) =
            session_with(MockTransport::with_device(SimulatedDevice::new()), fast_config());
        transport.disconnect();

        let err = session.run(image(7)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Transport(TransportError::Disconnected)
        ));
        assert_eq!(session.phase(), Failed);
    }
}
