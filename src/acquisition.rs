//! Acquisition pipeline: keeps reads in flight against a [`DeviceChannel`],
//! runs the software trigger over completed transfers and turns them into an
//! ordered [`AcquisitionEvent`] stream.
//!
//! All mutation happens through [`AcquisitionPipeline::on_transfer_complete`],
//! one completion at a time, on the thread that drives the pipeline. Other
//! threads interact only through a [`StopHandle`].

use crate::acquisition_config::{AcquisitionConfig, ConfigError};
use crate::acquisition_event::{AcquisitionEvent, DataPacket, EventSink, Header};
use crate::device_channel::{
    ControlCommand, DeviceChannel, DeviceError, DeviceSettings, TransferCompletion,
    TransferStatus,
};
use crate::transfer_pool::TransferPool;
use crate::trigger_matcher::{MatchResult, TriggerMatcher};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Acquisition already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device disconnected during acquisition")]
    Disconnected,

    #[error("Device unresponsive after {empty_transfers} empty transfers")]
    Unresponsive { empty_transfers: usize },

    #[error("No read transfer could be kept in flight")]
    TransfersExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    /// Stop requested; waiting for outstanding transfers to come back.
    Stopping,
    /// A fatal error was reported; draining before End.
    Failed,
    Finished,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
            PipelineState::Finished => "finished",
        }
    }
}

/// Requests a stop from any thread. The pipeline acts on it the next time it
/// polls for completions.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }
}

/// Expected counter for the self-test modes.
#[derive(Debug)]
struct SequenceCheck {
    modulus: u32,
    expected: Option<u32>,
    /// Low byte of a word split across two packets.
    low_byte: Option<u8>,
}

impl SequenceCheck {
    fn new(modulus: u32) -> Self {
        Self {
            modulus,
            expected: None,
            low_byte: None,
        }
    }

    /// Check the little-endian 16-bit words of `data`; true if all follow on.
    fn check(&mut self, data: &[u8]) -> bool {
        let mut ok = true;
        for &byte in data {
            let Some(low) = self.low_byte.take() else {
                self.low_byte = Some(byte);
                continue;
            };
            let value = u32::from(u16::from_le_bytes([low, byte]));
            if self.expected.is_some_and(|expected| expected != value) {
                ok = false;
            }
            self.expected = Some((value + 1) % self.modulus);
        }
        ok
    }
}

/// State that lives for exactly one acquisition.
#[derive(Debug)]
struct Session {
    config: AcquisitionConfig,
    stride: usize,
    matcher: TriggerMatcher,
    /// Rows delivered in Data events, pre-trigger context included.
    accepted: u64,
    empty_transfers: usize,
    max_empty_transfers: usize,
    /// Trailing bytes of a transfer that did not form a whole row.
    partial_row: Vec<u8>,
    sequence: Option<SequenceCheck>,
    end_pending: bool,
}

impl Session {
    fn new(config: AcquisitionConfig) -> Self {
        let stride = config.channels.stride();
        let matcher = TriggerMatcher::new(&config.trigger, stride, config.pretrigger_samples());
        let sequence = config.mode.test_modulus().map(SequenceCheck::new);
        Self {
            stride,
            matcher,
            accepted: 0,
            empty_transfers: 0,
            max_empty_transfers: config.max_empty_transfers(),
            partial_row: Vec::new(),
            sequence,
            end_pending: true,
            config,
        }
    }

    fn remaining(&self) -> u64 {
        match self.config.limit_samples {
            0 => u64::MAX,
            limit => limit.saturating_sub(self.accepted),
        }
    }

    /// Join `data` with any partial row left from the previous transfer and
    /// return the whole rows.
    fn whole_rows<'a>(&mut self, data: &'a [u8]) -> Cow<'a, [u8]> {
        if self.partial_row.is_empty() && data.len() % self.stride == 0 {
            return Cow::Borrowed(data);
        }
        let mut joined = std::mem::take(&mut self.partial_row);
        joined.extend_from_slice(data);
        let whole = joined.len() - joined.len() % self.stride;
        self.partial_row = joined.split_off(whole);
        Cow::Owned(joined)
    }
}

fn truncate_rows(data: Cow<'_, [u8]>, len: usize) -> Cow<'_, [u8]> {
    match data {
        Cow::Borrowed(bytes) => Cow::Borrowed(&bytes[..len]),
        Cow::Owned(mut bytes) => {
            bytes.truncate(len);
            Cow::Owned(bytes)
        }
    }
}

fn truncate_tail(data: Cow<'_, [u8]>, start: usize) -> Cow<'_, [u8]> {
    match data {
        Cow::Borrowed(bytes) => Cow::Borrowed(&bytes[start..]),
        Cow::Owned(mut bytes) => Cow::Owned(bytes.split_off(start)),
    }
}

pub struct AcquisitionPipeline<D: DeviceChannel, S: EventSink> {
    device: D,
    sink: S,
    state: PipelineState,
    pool: TransferPool,
    session: Option<Session>,
    stop_handle: StopHandle,
}

impl<D: DeviceChannel, S: EventSink> AcquisitionPipeline<D, S> {
    /// How long [`AcquisitionPipeline::run`] waits for a completion before
    /// checking for a stop request again.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new(device: D, sink: S) -> Self {
        Self {
            device,
            sink,
            state: PipelineState::Idle,
            pool: TransferPool::default(),
            session: None,
            stop_handle: StopHandle::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Transfers submitted to the device and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    /// True until End has been emitted for the current acquisition.
    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.end_pending)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_parts(self) -> (D, S) {
        (self.device, self.sink)
    }

    /// Configure the device, start it and put the initial reads in flight.
    #[tracing::instrument(
        skip_all,
        fields(rate = config.sample_rate, limit = config.limit_samples)
    )]
    pub fn start(&mut self, config: AcquisitionConfig) -> Result<(), AcquisitionError> {
        if self.is_active() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        config.validate()?;

        let transfer_size = config.transfer_size();
        let transfer_count = config.transfer_count();
        log::debug!(
            "Starting acquisition: {} Hz, {} channels, {} transfers of {} bytes",
            config.sample_rate,
            config.channels.len(),
            transfer_count,
            transfer_size
        );

        self.stop_handle.clear();
        self.pool.reset(transfer_count, transfer_size);
        let settings = DeviceSettings::from_config(&config);
        self.device
            .send_control(ControlCommand::Configure, &settings.encode())?;
        self.device.send_control(ControlCommand::Start, &[])?;

        let mut submitted = 0;
        let mut last_error = None;
        while let Some((handle, buffer)) = self.pool.acquire() {
            match self.device.submit_read(handle, buffer) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    log::warn!("Failed to submit initial transfer: {e}");
                    self.pool.abandon(handle);
                    last_error = Some(e);
                    break;
                }
            }
        }

        if submitted == 0 {
            if let Err(e) = self.device.send_control(ControlCommand::Stop, &[]) {
                log::warn!("Failed to stop device after aborted start: {e}");
            }
            self.state = PipelineState::Idle;
            self.session = None;
            return Err(last_error.map_or(AcquisitionError::TransfersExhausted, Into::into));
        }

        self.sink.emit(AcquisitionEvent::Header(Header::from_config(&config)));
        self.session = Some(Session::new(config));
        self.state = PipelineState::Running;
        log::info!("Acquisition started with {submitted} transfers in flight");
        Ok(())
    }

    /// Stop the device and cancel outstanding reads.
    ///
    /// End is emitted once the last outstanding transfer has come back. Safe
    /// to call repeatedly and before [`AcquisitionPipeline::start`].
    #[tracing::instrument(skip_all)]
    pub fn stop(&mut self) {
        if self.state == PipelineState::Running {
            log::debug!("Stop requested");
            self.halt(PipelineState::Stopping);
        }
    }

    /// Drive the pipeline until End has been emitted. Returns the final state.
    pub fn run(&mut self) -> PipelineState {
        while self.is_active() {
            self.poll(Self::POLL_INTERVAL);
        }
        self.state
    }

    /// Handle a pending stop request and at most one completion.
    pub fn poll(&mut self, timeout: Duration) {
        if self.stop_handle.take() {
            self.stop();
        }
        if !self.is_active() {
            return;
        }

        match self.device.poll_completion(timeout) {
            Ok(Some(completion)) => self.on_transfer_complete(completion),
            Ok(None) => {}
            Err(e) => {
                log::error!("Lost completion channel: {e}");
                if self.state == PipelineState::Running {
                    self.fail(e.into());
                }
                // Nothing will ever complete, so stop waiting for it.
                self.pool.abandon_all();
                self.finish_if_drained();
            }
        }
    }

    /// Account for one returned transfer.
    pub fn on_transfer_complete(&mut self, completion: TransferCompletion) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("AcquisitionPipeline::on_transfer_complete");

        let TransferCompletion {
            handle,
            buffer,
            actual_length,
            status,
        } = completion;
        if !self.pool.is_in_flight(handle) {
            log::warn!("Ignoring completion of unknown transfer {handle:?}");
            return;
        }

        let resubmit = self.state == PipelineState::Running
            && self.process(status, &buffer[..actual_length.min(buffer.len())]);
        self.pool.finish(handle, buffer);

        if resubmit {
            self.resubmit();
        }
        self.finish_if_drained();
    }

    /// Returns whether the transfer should be put back in flight.
    fn process(&mut self, status: TransferStatus, data: &[u8]) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match status {
            TransferStatus::NoDevice => {
                self.fail(AcquisitionError::Disconnected);
                false
            }
            TransferStatus::Completed if !data.is_empty() => {
                session.empty_transfers = 0;
                self.ingest(data);
                self.state == PipelineState::Running
            }
            status => {
                session.empty_transfers += 1;
                log::debug!(
                    "Transfer {} with {} bytes ({} in a row)",
                    status.as_str(),
                    data.len(),
                    session.empty_transfers
                );
                if session.empty_transfers > session.max_empty_transfers {
                    let empty_transfers = session.empty_transfers;
                    self.fail(AcquisitionError::Unresponsive { empty_transfers });
                    return false;
                }
                true
            }
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let rows = session.whole_rows(data);
        if session.matcher.is_fired() {
            self.deliver(rows);
            return;
        }

        match session.matcher.feed(&rows) {
            MatchResult::NoMatchYet => {}
            MatchResult::MatchedAt { offset, pretrigger } => {
                let stride = session.stride;
                if !session.config.trigger.is_free_run() {
                    // Rows past the ceiling are never delivered.
                    let offset = ((pretrigger.len() / stride) as u64).min(session.remaining());
                    log::info!("Trigger fired, {offset} samples of context");
                    self.sink.emit(AcquisitionEvent::Trigger { offset });
                }
                self.deliver(Cow::Owned(pretrigger));
                let post = truncate_tail(rows, offset * stride);
                self.deliver(post);
            }
            MatchResult::Fired => self.deliver(rows),
        }
    }

    /// Emit whole rows as a Data event, truncated at the sample limit.
    fn deliver(&mut self, rows: Cow<'_, [u8]>) {
        if self.state != PipelineState::Running {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let available = (rows.len() / session.stride) as u64;
        let take = available.min(session.remaining());
        if take == 0 {
            return;
        }

        let data = truncate_rows(rows, take as usize * session.stride);
        let error = session
            .sequence
            .as_mut()
            .is_some_and(|check| !check.check(&data));
        if error {
            log::warn!("Self-test sequence mismatch");
        }
        session.accepted += take;
        let limit_reached = session.remaining() == 0;
        let packet = DataPacket {
            channel_mask: session.config.channels.channel_mask(),
            data,
            unit_pitch: session.config.unit_pitch,
            error,
        };
        self.sink.emit(AcquisitionEvent::Data(packet));

        if limit_reached {
            log::info!("Sample limit reached, stopping");
            self.halt(PipelineState::Stopping);
        }
    }

    fn resubmit(&mut self) {
        let Some((handle, buffer)) = self.pool.acquire() else {
            return;
        };
        if let Err(e) = self.device.submit_read(handle, buffer) {
            log::warn!("Failed to resubmit transfer: {e}");
            self.pool.abandon(handle);
            if self.pool.outstanding() == 0 {
                self.fail(AcquisitionError::TransfersExhausted);
            }
        }
    }

    /// Report a fatal error once and start draining.
    fn fail(&mut self, error: AcquisitionError) {
        log::error!("Acquisition failed: {error}");
        self.sink.emit(AcquisitionEvent::Error(error));
        self.halt(PipelineState::Failed);
    }

    fn halt(&mut self, next: PipelineState) {
        self.state = next;
        if let Err(e) = self.device.send_control(ControlCommand::Stop, &[]) {
            log::warn!("Failed to send stop command: {e}");
        }
        for handle in self.pool.in_flight() {
            self.device.cancel(handle);
        }
        self.finish_if_drained();
    }

    fn finish_if_drained(&mut self) {
        if self.state == PipelineState::Running || self.pool.outstanding() > 0 {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.end_pending {
            return;
        }

        session.end_pending = false;
        if self.state == PipelineState::Stopping {
            self.state = PipelineState::Finished;
        }
        log::info!(
            "Acquisition ended after {} samples ({})",
            session.accepted,
            self.state.as_str()
        );
        self.sink.emit(AcquisitionEvent::End);
    }
}
