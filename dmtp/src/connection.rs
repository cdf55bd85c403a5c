//! Deadline-aware connection engine
//!
//! Ties the stream table, EDF scheduler, fairness arbiter, gap engine,
//! retransmission gate, path selector and per-path urgency state together
//! behind one sans-IO API. The host drives it with explicit timestamps:
//! it feeds transport parameters, application writes, received frames,
//! acknowledgements and losses in, and pulls packets and events out.

use crate::events::{Outbox, StreamEvent};
use crate::fairness::FairnessArbiter;
use crate::gap::{self, GapEngine};
use crate::recv::ReassemblyError;
use crate::retransmit::{should_skip_retransmit, RetransmitDecision};
use crate::scheduler::{Candidate, EdfScheduler, Selection};
use crate::streams::{StreamMap, StreamRecord};
use bytes::{Bytes, BytesMut};
use dmtp_multipath::{PathError, PathSelector, PathTable, PathTelemetry};
use dmtp_protocol::config::DeadlineConfig;
use dmtp_protocol::congestion::{CongestionAdjustment, CongestionHost, PathUrgencyState, UrgencyLevel};
use dmtp_protocol::frame::{DeadlineControlFrame, DeadlineFrame, FrameError, TransportErrorCode};
use dmtp_protocol::packet::{PacketDeadlineInfo, PathId, SentPacket, StreamFrame};
use dmtp_protocol::params::{DeadlineParameters, ParamsError};
use dmtp_protocol::ranges::{ByteRange, RangeSet};
use dmtp_protocol::stream::{DeadlineMode, StreamDeadlineState, StreamId};
use dmtp_protocol::time::{Interval, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bytes charged to the fairness window for a scheduling decision made
/// without sending, one minimum-size segment
pub const SCHEDULING_QUANTUM: u64 = 1200;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport parameters not exchanged yet
    Init,
    /// Parameters negotiated, data transfer possible
    Established,
    /// Closed by a protocol error
    Closed,
}

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is not in the correct state")]
    InvalidState,

    #[error("Connection is closed")]
    Closed,

    #[error("Deadline-aware streams were not negotiated")]
    DeadlineNotNegotiated,

    #[error("Stream limit of {max} reached")]
    StreamLimit { max: usize },

    #[error("Stream {0} no longer accepts data")]
    StreamFinished(StreamId),

    #[error("Unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("Unknown packet number {0}")]
    UnknownPacket(u64),

    #[error("Final size error on stream {stream_id}: {source}")]
    FinalSize {
        stream_id: StreamId,
        #[source]
        source: ReassemblyError,
    },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport parameter error: {0}")]
    Params(#[from] ParamsError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets acknowledged
    pub packets_acked: u64,
    /// Total packets declared lost
    pub packets_lost: u64,
    /// Lost stream frames queued for retransmission
    pub packets_retransmitted: u64,
    /// Lost stream frames written off by the retransmission gate
    pub retransmits_skipped: u64,
    /// Total payload bytes sent, control frames included
    pub bytes_sent: u64,
    /// Stream bytes sent for deadline picks
    pub deadline_bytes_sent: u64,
    /// Stream bytes sent for non-deadline picks
    pub non_deadline_bytes_sent: u64,
    /// Stream bytes received
    pub bytes_received: u64,
    /// Local bytes written off across all streams
    pub bytes_dropped: u64,
    /// Hard stream deadlines missed
    pub deadlines_missed: u64,
    /// Gap events delivered to the application
    pub gaps_delivered: u64,
    /// Scheduling decisions overridden by the fairness arbiter
    pub fairness_overrides: u64,
}

/// Connection-wide deadline state, present once the extension is negotiated
#[derive(Debug, Clone)]
pub struct ConnectionDeadlineContext {
    deadline_aware_enabled: bool,
    fairness: FairnessArbiter,
}

impl ConnectionDeadlineContext {
    fn new(config: &DeadlineConfig, now: Timestamp) -> Self {
        ConnectionDeadlineContext {
            deadline_aware_enabled: true,
            fairness: FairnessArbiter::new(&config.fairness, now),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.deadline_aware_enabled
    }

    pub fn fairness(&self) -> &FairnessArbiter {
        &self.fairness
    }
}

/// Stream-level control that preempts data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending { stream_id: StreamId, error_code: u64 },
}

/// One packet's worth of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub packet_number: u64,
    /// Path the packet must go out on
    pub path: PathId,
    /// Deadline control frames
    pub control: Vec<DeadlineFrame>,
    /// Reset or stop-sending, if one was scheduled
    pub stream_control: Option<StreamControl>,
    /// Stream data, fresh or retransmitted
    pub stream: Option<StreamFrame>,
    pub deadline_info: PacketDeadlineInfo,
}

impl Transmit {
    /// Wire encoding of the control frames
    pub fn encode_control(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        for frame in &self.control {
            frame.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Check whether the packet carries anything
    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.stream_control.is_none() && self.stream.is_none()
    }
}

#[derive(Debug, Clone)]
struct RetransmitEntry {
    path: PathId,
    frame: StreamFrame,
    info: PacketDeadlineInfo,
}

/// Deadline-aware connection
pub struct Connection {
    config: DeadlineConfig,
    local_params: DeadlineParameters,
    state: ConnectionState,
    close_error: Option<TransportErrorCode>,
    context: Option<ConnectionDeadlineContext>,
    streams: StreamMap,
    scheduler: EdfScheduler,
    gap_engine: GapEngine,
    urgency_gate: Interval,
    urgency: BTreeMap<PathId, PathUrgencyState>,
    paths: PathTable,
    selector: PathSelector,
    outbox: Outbox,
    retransmits: VecDeque<RetransmitEntry>,
    sent: BTreeMap<u64, SentPacket>,
    next_packet_number: u64,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection advertising `local_params`
    ///
    /// The default path is registered without RTT samples.
    pub fn new(config: DeadlineConfig, local_params: DeadlineParameters) -> Self {
        let paths = PathTable::with_path(PathTelemetry::new(PathId::DEFAULT));
        let mut urgency = BTreeMap::new();
        urgency.insert(PathId::DEFAULT, PathUrgencyState::new(config.congestion));

        Connection {
            local_params,
            state: ConnectionState::Init,
            close_error: None,
            context: None,
            streams: StreamMap::new(config.limits.max_streams),
            scheduler: EdfScheduler::new(),
            gap_engine: GapEngine::new(config.check.deadline_check_interval()),
            urgency_gate: Interval::new(config.check.urgency_check_interval()),
            urgency,
            paths,
            selector: PathSelector::new(&config.multipath),
            outbox: Outbox::new(),
            retransmits: VecDeque::new(),
            sent: BTreeMap::new(),
            next_packet_number: 0,
            stats: ConnectionStats::default(),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Transport error the connection was closed with
    pub fn close_error(&self) -> Option<TransportErrorCode> {
        self.close_error
    }

    pub fn local_params(&self) -> DeadlineParameters {
        self.local_params
    }

    fn close(&mut self, code: TransportErrorCode) {
        tracing::warn!(%code, "closing connection");
        self.state = ConnectionState::Closed;
        self.close_error = Some(code);
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn is_deadline_aware(&self) -> bool {
        self.context.as_ref().map_or(false, |c| c.is_enabled())
    }

    fn ensure_negotiated(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if !self.is_deadline_aware() {
            return Err(ConnectionError::DeadlineNotNegotiated);
        }
        Ok(())
    }

    fn stream_for_write(&mut self, stream_id: StreamId) -> Result<&mut StreamRecord, ConnectionError> {
        let max = self.streams.max_streams();
        self.streams
            .get_or_create(stream_id)
            .ok_or(ConnectionError::StreamLimit { max })
    }

    /// Apply the peer's transport parameters
    ///
    /// The extension is active only when both sides advertised it.
    pub fn on_transport_parameters(
        &mut self,
        remote: &DeadlineParameters,
        now: Timestamp,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if self.state != ConnectionState::Init {
            return Err(ConnectionError::InvalidState);
        }

        let negotiated = self.local_params.negotiate(remote);
        if negotiated.enable_deadline_aware_streams {
            self.context = Some(ConnectionDeadlineContext::new(&self.config, now));
        }
        self.state = ConnectionState::Established;
        tracing::info!(
            deadline_aware = negotiated.enable_deadline_aware_streams,
            "transport parameters negotiated"
        );
        Ok(())
    }

    /// Decode and apply the peer's encoded transport parameters
    ///
    /// A malformed value closes the connection with
    /// TRANSPORT_PARAMETER_ERROR.
    pub fn on_transport_parameter_bytes(&mut self, mut bytes: &[u8], now: Timestamp) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        match DeadlineParameters::decode(&mut bytes) {
            Ok(remote) => self.on_transport_parameters(&remote, now),
            Err(err) => {
                self.close(TransportErrorCode::TransportParameterError);
                Err(err.into())
            }
        }
    }

    /// Give a stream a deadline relative to `now`
    ///
    /// Queues a DEADLINE_CONTROL frame announcing it to the peer.
    pub fn set_stream_deadline(
        &mut self,
        stream_id: StreamId,
        deadline: Duration,
        is_hard: bool,
        now: Timestamp,
    ) -> Result<(), ConnectionError> {
        self.ensure_negotiated()?;
        let stream = self.stream_for_write(stream_id)?;
        if stream.reset.is_some() {
            return Err(ConnectionError::StreamFinished(stream_id));
        }

        let mode = DeadlineMode::from_hard_flag(is_hard);
        stream.deadline_state().configure(deadline, mode, now);
        self.outbox
            .push_control(DeadlineFrame::DeadlineControl(DeadlineControlFrame::new(stream_id, deadline)));
        tracing::debug!(stream = %stream_id, ?deadline, ?mode, "stream deadline set");
        Ok(())
    }

    /// Queue data without a deadline of its own
    pub fn add_data(&mut self, stream_id: StreamId, data: Bytes, fin: bool, now: Timestamp) -> Result<u64, ConnectionError> {
        self.ensure_open()?;
        let stream = self.stream_for_write(stream_id)?;
        if !stream.is_writable() {
            return Err(ConnectionError::StreamFinished(stream_id));
        }

        let offset = stream
            .send
            .push(data, now, Timestamp::INFINITE, DeadlineMode::Soft);
        if fin {
            stream.fin_requested = true;
        }
        Ok(offset)
    }

    /// Queue data that must arrive within `deadline` of `now`
    ///
    /// Enables chunk deadlines on the stream if it had no deadline yet.
    pub fn add_data_with_deadline(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
        deadline: Duration,
        mode: DeadlineMode,
        now: Timestamp,
    ) -> Result<u64, ConnectionError> {
        self.ensure_negotiated()?;
        let stream = self.stream_for_write(stream_id)?;
        if !stream.is_writable() {
            return Err(ConnectionError::StreamFinished(stream_id));
        }

        let chunk_deadline = Timestamp::deadline_after(now, deadline);
        stream.deadline_state().enable_chunk_deadlines(deadline, mode);
        let offset = stream.send.push(data, now, chunk_deadline, mode);
        if fin {
            stream.fin_requested = true;
        }
        tracing::trace!(stream = %stream_id, offset, %chunk_deadline, "chunk queued");
        Ok(offset)
    }

    /// Adjust the fairness arbiter
    pub fn configure_fairness(&mut self, min_non_deadline_share: f64, max_starvation_time: Duration) -> Result<(), ConnectionError> {
        self.ensure_negotiated()?;
        if let Some(context) = self.context.as_mut() {
            context.fairness.configure(min_non_deadline_share, max_starvation_time);
        }
        Ok(())
    }

    /// Set the flow control limit on a stream's send offset
    pub fn set_stream_flow_limit(&mut self, stream_id: StreamId, max_data: u64) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.stream_for_write(stream_id)?.max_data = max_data;
        Ok(())
    }

    /// Pin a stream to a path, or clear the pin with `None`
    pub fn set_stream_affinity(&mut self, stream_id: StreamId, path: Option<PathId>) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.stream_for_write(stream_id)?.affinity = path;
        Ok(())
    }

    /// Abandon a stream's send side
    ///
    /// Queued data is discarded without dropped-range frames and the
    /// stream's deadline bookkeeping is cleared. Packets already in flight
    /// keep their deadline information.
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(ConnectionError::UnknownStream(stream_id))?;
        if stream.reset.is_some() {
            return Ok(());
        }

        stream.reset_final_size = stream.send.sent_offset();
        stream.send.drain_all();
        if let Some(state) = stream.deadline.as_mut() {
            state.reset();
        }
        stream.reset = Some(error_code);
        stream.last_turn = 0;
        self.retransmits.retain(|e| e.frame.stream_id != stream_id);
        tracing::debug!(stream = %stream_id, error_code, "stream reset");
        Ok(())
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let stream = self.stream_for_write(stream_id)?;
        if stream.stop_sending.is_none() {
            stream.stop_sending = Some(error_code);
        }
        Ok(())
    }

    /// The peer reset a stream
    pub fn on_reset_stream(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.stream_for_write(stream_id)?;
        self.outbox.push_event(StreamEvent::Reset { stream_id, error_code });
        Ok(())
    }

    /// The peer asked us to stop sending
    pub fn on_stop_sending(&mut self, stream_id: StreamId, error_code: u64) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.stream_for_write(stream_id)?;
        self.outbox
            .push_event(StreamEvent::StopSending { stream_id, error_code });
        Ok(())
    }

    /// Run the rate-limited deadline and urgency scans
    pub fn tick(&mut self, now: Timestamp) {
        if self.is_closed() {
            return;
        }
        let missed = self.gap_engine.poll(&mut self.streams, now, &mut self.outbox);
        self.on_deadlines_missed(&missed);

        if self.urgency_gate.poll(now) {
            self.update_urgency(now);
        }
    }

    /// Run the hard deadline scan immediately
    pub fn check_deadlines(&mut self, now: Timestamp) -> Vec<StreamId> {
        let missed = gap::check_deadlines(&mut self.streams, now, &mut self.outbox);
        self.on_deadlines_missed(&missed);
        missed
    }

    fn on_deadlines_missed(&mut self, missed: &[StreamId]) {
        if !missed.is_empty() {
            self.reset_congestion_boost();
        }
    }

    fn update_urgency(&mut self, now: Timestamp) {
        let earliest = if self.is_deadline_aware() {
            self.streams.iter().filter_map(StreamRecord::pending_deadline).min()
        } else {
            None
        };

        for state in self.urgency.values_mut() {
            let changed = state.update_urgency(earliest, now);
            if changed && state.urgency_level() == UrgencyLevel::None {
                state.reset_boost();
            }
        }
    }

    fn candidates(&self, path: Option<PathId>, now: Timestamp) -> Vec<Candidate> {
        let deadline_aware = self.is_deadline_aware();
        self.streams
            .iter()
            .filter_map(|s| {
                if s.has_urgent_control() {
                    return Some(Candidate {
                        stream_id: s.id,
                        deadline: None,
                        urgent: true,
                        last_turn: s.last_turn,
                    });
                }
                if !s.is_ready(now) {
                    return None;
                }
                if let (Some(path), Some(pinned)) = (path, s.affinity) {
                    if path != pinned {
                        return None;
                    }
                }
                let deadline = if deadline_aware {
                    s.effective_deadline(now).filter(|d| !d.is_infinite())
                } else {
                    None
                };
                Some(Candidate {
                    stream_id: s.id,
                    deadline,
                    urgent: false,
                    last_turn: s.last_turn,
                })
            })
            .collect()
    }

    fn select_stream(&mut self, path: Option<PathId>, now: Timestamp) -> Option<Selection> {
        let candidates = self.candidates(path, now);
        let arbiter = self.context.as_mut().map(|c| &mut c.fairness);
        let selection = self.scheduler.select(&candidates, arbiter, now)?;
        if let Selection::NonDeadline { forced: Some(_), .. } = selection {
            self.stats.fairness_overrides += 1;
        }
        Some(selection)
    }

    fn commit_selection(&mut self, selection: Selection, bytes: u64, now: Timestamp) {
        let turn = self.scheduler.commit();
        if let Some(stream) = self.streams.get_mut(selection.stream_id()) {
            stream.last_turn = turn;
        }
        if matches!(selection, Selection::Urgent(_)) {
            return;
        }
        if let Some(context) = self.context.as_mut() {
            context.fairness.record(selection.is_deadline(), bytes, now);
        }
    }

    /// Pick the stream that gets the next send opportunity on `path`
    ///
    /// Streams pinned to another path are skipped. The decision is
    /// committed and charged one scheduling quantum.
    pub fn pick_ready_stream(&mut self, path: PathId, now: Timestamp) -> Option<StreamId> {
        if self.is_closed() {
            return None;
        }
        let selection = self.select_stream(Some(path), now)?;
        self.commit_selection(selection, SCHEDULING_QUANTUM, now);
        Some(selection.stream_id())
    }

    fn take_control(&mut self, budget: &mut usize) -> Vec<DeadlineFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.outbox.control.front() {
            match frame.encoded_len() {
                Ok(len) if len <= *budget => {
                    *budget -= len;
                    frames.extend(self.outbox.control.pop_front());
                }
                Ok(_) => break,
                Err(err) => {
                    tracing::warn!(%err, "dropping unencodable control frame");
                    self.outbox.control.pop_front();
                }
            }
        }
        frames
    }

    fn take_retransmit(&mut self, budget: usize) -> Option<RetransmitEntry> {
        let entry = self.retransmits.front_mut()?;
        if entry.frame.len() <= budget as u64 {
            return self.retransmits.pop_front();
        }
        if budget == 0 {
            return None;
        }

        let head = StreamFrame {
            stream_id: entry.frame.stream_id,
            offset: entry.frame.offset,
            data: entry.frame.data.split_to(budget),
            fin: false,
        };
        entry.frame.offset += budget as u64;
        Some(RetransmitEntry {
            path: entry.path,
            frame: head,
            info: entry.info,
        })
    }

    fn default_send_path(&self) -> PathId {
        let default = self.selector.default_path();
        if self.paths.is_usable(default) {
            return default;
        }
        self.selector.fallback(&self.paths).unwrap_or(default)
    }

    fn path_for_stream(&self, stream_id: StreamId, now: Timestamp) -> PathId {
        let Some(stream) = self.streams.get(stream_id) else {
            return self.default_send_path();
        };
        if let Some(pinned) = stream.affinity.filter(|p| self.paths.is_usable(*p)) {
            return pinned;
        }

        let deadline = if self.is_deadline_aware() {
            stream.effective_deadline(now)
        } else {
            None
        };
        match self.selector.select_path_for_send(&self.paths, deadline, now) {
            Ok(path) => path,
            Err(err) => {
                tracing::debug!(stream = %stream_id, %err, "path selection failed");
                self.default_send_path()
            }
        }
    }

    /// Assemble the next packet of at most `max_payload` bytes
    ///
    /// Control frames go first, then queued retransmissions, then fresh
    /// data from the stream the scheduler picks. Returns `None` when there
    /// is nothing to send.
    pub fn poll_transmit(&mut self, max_payload: usize, now: Timestamp) -> Option<Transmit> {
        if self.is_closed() {
            return None;
        }
        self.tick(now);
        for stream in self.streams.iter_mut() {
            gap::expire_chunks(stream, now, &mut self.outbox);
        }

        let mut budget = max_payload;
        let control = self.take_control(&mut budget);
        let mut transmit = Transmit {
            packet_number: self.next_packet_number,
            path: self.default_send_path(),
            control,
            stream_control: None,
            stream: None,
            deadline_info: PacketDeadlineInfo::none(self.default_send_path()),
        };

        if let Some(entry) = self.take_retransmit(budget) {
            transmit.path = entry.path;
            transmit.deadline_info = PacketDeadlineInfo {
                send_path: entry.path,
                ..entry.info
            };
            transmit.stream = Some(entry.frame);
        } else if budget > 0 {
            if let Some(selection) = self.select_stream(None, now) {
                self.fill_from_stream(&mut transmit, selection, budget, now);
            }
        }

        if transmit.is_empty() {
            return None;
        }
        self.record_transmit(&transmit, now);
        Some(transmit)
    }

    fn fill_from_stream(&mut self, transmit: &mut Transmit, selection: Selection, budget: usize, now: Timestamp) {
        let stream_id = selection.stream_id();
        if let Selection::Urgent(_) = selection {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                transmit.stream_control = if let (Some(error_code), false) = (stream.reset, stream.reset_sent) {
                    stream.reset_sent = true;
                    Some(StreamControl::ResetStream {
                        stream_id,
                        error_code,
                        final_size: stream.reset_final_size,
                    })
                } else if let Some(error_code) = stream.stop_sending {
                    stream.stop_sending_sent = true;
                    Some(StreamControl::StopSending { stream_id, error_code })
                } else {
                    None
                };
            }
            self.commit_selection(selection, 0, now);
            return;
        }

        let path = self.path_for_stream(stream_id, now);
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };

        let (frame, info) = if stream.needs_fin() {
            stream.fin_sent = true;
            let frame = StreamFrame {
                stream_id,
                offset: stream.send.sent_offset(),
                data: Bytes::new(),
                fin: true,
            };
            (frame, PacketDeadlineInfo::none(path))
        } else {
            let limit = (budget as u64).min(stream.credit()) as usize;
            let Some(taken) = stream.send.take(limit) else {
                return;
            };
            let fin = stream.fin_requested && stream.send.is_empty();
            if fin {
                stream.fin_sent = true;
            }
            let stream_deadline = stream.deadline.as_ref().and_then(StreamDeadlineState::active_deadline);
            let info = taken.deadline_info(path, stream_deadline);
            let frame = StreamFrame {
                stream_id,
                offset: taken.offset,
                data: taken.data,
                fin,
            };
            (frame, info)
        };

        let bytes = frame.len();
        if selection.is_deadline() {
            self.stats.deadline_bytes_sent += bytes;
        } else {
            self.stats.non_deadline_bytes_sent += bytes;
        }
        let urgency_config = self.config.congestion;
        let urgency = self
            .urgency
            .entry(path)
            .or_insert_with(|| PathUrgencyState::new(urgency_config));
        let boosted = selection.is_deadline() && urgency.urgency_level() != UrgencyLevel::None;
        urgency.record_sent(bytes, boosted, now);
        self.commit_selection(selection, bytes, now);

        transmit.path = path;
        transmit.deadline_info = info;
        transmit.stream = Some(frame);
    }

    fn record_transmit(&mut self, transmit: &Transmit, now: Timestamp) {
        let control_bytes: usize = transmit
            .control
            .iter()
            .filter_map(|f| f.encoded_len().ok())
            .sum();
        let stream_bytes = transmit.stream.as_ref().map_or(0, StreamFrame::len);
        let bytes = control_bytes as u64 + stream_bytes;

        self.next_packet_number += 1;
        self.sent.insert(
            transmit.packet_number,
            SentPacket {
                packet_number: transmit.packet_number,
                time_sent: now,
                control: transmit.control.clone(),
                stream: transmit.stream.clone(),
                deadline_info: transmit.deadline_info,
            },
        );
        self.paths.record_sent(transmit.path, bytes);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes;
        tracing::trace!(
            pn = transmit.packet_number,
            path = %transmit.path,
            bytes,
            deadline = transmit.deadline_info.contains_deadline_data,
            "packet sent"
        );
    }

    /// A packet was acknowledged
    pub fn on_packet_acked(&mut self, packet_number: u64) -> Result<(), ConnectionError> {
        let packet = self
            .sent
            .remove(&packet_number)
            .ok_or(ConnectionError::UnknownPacket(packet_number))?;
        self.paths.record_acked(packet.path(), packet.stream_bytes());
        self.stats.packets_acked += 1;
        Ok(())
    }

    /// A packet was declared lost
    ///
    /// Control frames are always requeued. Stream data is either written
    /// off, when all of it is under a hard deadline that has passed, or
    /// queued for retransmission on the path the selector picks.
    pub fn on_packet_lost(&mut self, packet_number: u64, now: Timestamp) -> Result<RetransmitDecision, ConnectionError> {
        let packet = self
            .sent
            .remove(&packet_number)
            .ok_or(ConnectionError::UnknownPacket(packet_number))?;
        self.paths.record_lost(packet.path(), packet.stream_bytes());
        self.stats.packets_lost += 1;

        for frame in packet.control.into_iter().rev() {
            self.outbox.control.push_front(frame);
        }

        let Some(frame) = packet.stream else {
            return Ok(RetransmitDecision::Nothing);
        };
        let info = packet.deadline_info;
        let stream_id = frame.stream_id;

        let reset = self.streams.get(stream_id).map_or(true, |s| s.reset.is_some());
        if reset {
            return Ok(RetransmitDecision::Nothing);
        }

        if should_skip_retransmit(&info, now) {
            self.stats.retransmits_skipped += 1;
            let range = ByteRange::with_len(frame.offset, frame.len());
            if let Some(stream) = self.streams.get_mut(stream_id) {
                gap::record_skipped(stream, range, &mut self.outbox);
            }
            if frame.fin {
                self.retransmits.push_back(RetransmitEntry {
                    path: info.send_path,
                    frame: StreamFrame {
                        stream_id,
                        offset: frame.end(),
                        data: Bytes::new(),
                        fin: true,
                    },
                    info: PacketDeadlineInfo::none(info.send_path),
                });
            }
            tracing::debug!(pn = packet_number, stream = %stream_id, %range, "retransmission skipped");
            return Ok(RetransmitDecision::Skip {
                stream_id,
                offset: range.start,
                length: range.len(),
            });
        }

        let path = self
            .selector
            .select_path_for_retransmit(&self.paths, &info, now)
            .unwrap_or(info.send_path);
        self.stats.packets_retransmitted += 1;
        self.retransmits.push_back(RetransmitEntry {
            path,
            frame: frame.clone(),
            info,
        });
        Ok(RetransmitDecision::Resend { path, frame })
    }

    /// Process a run of encoded deadline frames
    ///
    /// A decoding failure closes the connection with the frame error's
    /// transport code.
    pub fn handle_frames(&mut self, bytes: &[u8], now: Timestamp) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let frames = match DeadlineFrame::decode_all(bytes) {
            Ok(frames) => frames,
            Err(err) => {
                self.close(err.error_code());
                return Err(err.into());
            }
        };
        for frame in frames {
            self.handle_frame(frame, now)?;
        }
        Ok(())
    }

    /// Process one decoded deadline frame
    pub fn handle_frame(&mut self, frame: DeadlineFrame, now: Timestamp) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if !self.is_deadline_aware() {
            let err = FrameError::UnknownType(frame.frame_type());
            self.close(err.error_code());
            return Err(err.into());
        }

        match frame {
            DeadlineFrame::DeadlineControl(control) => {
                let stream = self.stream_for_write(control.stream_id)?;
                stream
                    .deadline_state()
                    .configure(control.deadline(), DeadlineMode::Soft, now);
                tracing::debug!(stream = %control.stream_id, deadline_ms = control.deadline_ms, "peer deadline received");
            }
            DeadlineFrame::StreamDataDropped(dropped) => {
                let stream = self.stream_for_write(dropped.stream_id)?;
                let range = ByteRange::with_len(dropped.offset, dropped.length);
                stream.deadline_state().record_peer_drop(range);
                self.deliver(dropped.stream_id);
            }
        }
        Ok(())
    }

    /// Process received stream data
    pub fn on_stream_frame(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let len = data.len() as u64;
        let stream = self.stream_for_write(stream_id)?;
        if let Err(source) = stream.recv.on_data(offset, data, fin) {
            self.close(TransportErrorCode::FinalSizeError);
            return Err(ConnectionError::FinalSize { stream_id, source });
        }
        self.stats.bytes_received += len;
        self.deliver(stream_id);
        Ok(())
    }

    fn deliver(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };
        let StreamRecord { recv, deadline, .. } = stream;
        let empty = RangeSet::new();
        let dropped = deadline
            .as_ref()
            .map_or(&empty, StreamDeadlineState::receiver_dropped_ranges);

        let mut events = Vec::new();
        recv.deliver(stream_id, dropped, &mut events);
        for event in events {
            if let StreamEvent::Gap { .. } = event {
                self.stats.gaps_delivered += 1;
            }
            self.outbox.push_event(event);
        }
    }

    /// Next application event
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.outbox.events.pop_front()
    }

    /// Insert or refresh a path's telemetry
    pub fn update_path(&mut self, telemetry: PathTelemetry) -> Result<(), ConnectionError> {
        let id = telemetry.id;
        self.paths.update(telemetry)?;
        let config = self.config.congestion;
        self.urgency
            .entry(id)
            .or_insert_with(|| PathUrgencyState::new(config));
        Ok(())
    }

    /// Forget a path
    pub fn remove_path(&mut self, id: PathId) -> Result<(), ConnectionError> {
        self.paths.remove(id)?;
        self.urgency.remove(&id);
        Ok(())
    }

    pub fn set_multipath_enabled(&mut self, enabled: bool) {
        self.selector.set_enabled(enabled);
    }

    pub fn paths(&self) -> &PathTable {
        &self.paths
    }

    /// Deadline-adjusted congestion values for `path`
    ///
    /// Without the extension the host's values come back unchanged.
    pub fn congestion_adjustment<H: CongestionHost + ?Sized>(
        &mut self,
        path: PathId,
        host: &H,
        now: Timestamp,
    ) -> CongestionAdjustment {
        if !self.is_deadline_aware() {
            return CongestionAdjustment {
                urgency: UrgencyLevel::None,
                pacing_gain: host.pacing_gain(),
                congestion_window: host.congestion_window(),
                probe: Default::default(),
            };
        }
        let config = self.config.congestion;
        self.urgency
            .entry(path)
            .or_insert_with(|| PathUrgencyState::new(config))
            .adjust(host, now)
    }

    /// Clear window boosts on every path
    pub fn reset_congestion_boost(&mut self) {
        for state in self.urgency.values_mut() {
            state.reset_boost();
        }
    }

    pub fn stream_deadline(&self, stream_id: StreamId) -> Option<&StreamDeadlineState> {
        self.streams.get(stream_id)?.deadline.as_ref()
    }

    pub fn deadline_context(&self) -> Option<&ConnectionDeadlineContext> {
        self.context.as_ref()
    }

    pub fn path_urgency(&self, path: PathId) -> Option<&PathUrgencyState> {
        self.urgency.get(&path)
    }

    /// Offset the application has consumed on a receive stream
    pub fn consumed_offset(&self, stream_id: StreamId) -> Option<u64> {
        self.streams.get(stream_id).map(|s| s.recv.consumed_offset())
    }

    /// Packets sent and not yet acknowledged or lost
    pub fn packets_in_flight(&self) -> usize {
        self.sent.len()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        for state in self.streams.iter().filter_map(|s| s.deadline.as_ref()) {
            stats.bytes_dropped += state.bytes_dropped();
            stats.deadlines_missed += state.deadlines_missed();
        }
        stats
    }
}

/// Connection shared between a driver task and the application
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    pub fn new(connection: Connection) -> Self {
        SharedConnection {
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    /// Lock the connection for a sequence of calls
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock()
    }

    pub fn poll_transmit(&self, max_payload: usize, now: Timestamp) -> Option<Transmit> {
        self.inner.lock().poll_transmit(max_payload, now)
    }

    pub fn poll_event(&self) -> Option<StreamEvent> {
        self.inner.lock().poll_event()
    }

    pub fn tick(&self, now: Timestamp) {
        self.inner.lock().tick(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmtp_protocol::congestion::{HostSnapshot, ProbePhase};
    use dmtp_protocol::frame::StreamDataDroppedFrame;

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn id(v: u64) -> StreamId {
        StreamId::new(v)
    }

    fn negotiated() -> Connection {
        let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::enabled());
        conn.on_transport_parameters(&DeadlineParameters::enabled(), ms(0))
            .unwrap();
        conn
    }

    #[test]
    fn test_negotiation_requires_both_sides() {
        let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::enabled());
        conn.on_transport_parameters(&DeadlineParameters::default(), ms(0))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert!(conn.deadline_context().is_none());
        assert!(matches!(
            conn.set_stream_deadline(id(0), Duration::from_millis(50), true, ms(0)),
            Err(ConnectionError::DeadlineNotNegotiated)
        ));
    }

    #[test]
    fn test_bad_transport_parameters_close() {
        let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::enabled());
        assert!(conn.on_transport_parameter_bytes(&[0x40], ms(0)).is_err());
        assert!(conn.is_closed());
        assert_eq!(conn.close_error(), Some(TransportErrorCode::TransportParameterError));
    }

    #[test]
    fn test_set_deadline_queues_control_frame() {
        let mut conn = negotiated();
        conn.set_stream_deadline(id(0), Duration::from_millis(50), true, ms(0))
            .unwrap();

        let state = conn.stream_deadline(id(0)).unwrap();
        assert_eq!(state.absolute_deadline(), Some(ms(50)));
        assert_eq!(state.deadline_type(), DeadlineMode::Hard);

        let transmit = conn.poll_transmit(1200, ms(0)).unwrap();
        assert!(matches!(
            transmit.control[0],
            DeadlineFrame::DeadlineControl(DeadlineControlFrame { deadline_ms: 50, .. })
        ));
    }

    #[test]
    fn test_stream_limit() {
        let mut config = DeadlineConfig::default();
        config.limits.max_streams = 1;
        let mut conn = Connection::new(config, DeadlineParameters::enabled());
        conn.on_transport_parameters(&DeadlineParameters::enabled(), ms(0))
            .unwrap();

        conn.set_stream_deadline(id(0), Duration::from_millis(50), false, ms(0))
            .unwrap();
        assert!(matches!(
            conn.set_stream_deadline(id(4), Duration::from_millis(50), false, ms(0)),
            Err(ConnectionError::StreamLimit { max: 1 })
        ));
        assert!(conn.stream_deadline(id(4)).is_none());
    }

    #[test]
    fn test_edf_order_in_transmits() {
        let mut conn = negotiated();
        conn.configure_fairness(0.0, Duration::from_secs(1)).unwrap();
        conn.add_data(id(8), Bytes::from(vec![0u8; 100]), false, ms(0))
            .unwrap();
        conn.add_data_with_deadline(id(4), Bytes::from(vec![1u8; 100]), false, Duration::from_millis(80), DeadlineMode::Soft, ms(0))
            .unwrap();
        conn.add_data_with_deadline(id(0), Bytes::from(vec![2u8; 100]), false, Duration::from_millis(40), DeadlineMode::Soft, ms(0))
            .unwrap();

        let order: Vec<StreamId> = (0..3)
            .filter_map(|_| conn.poll_transmit(1200, ms(1)))
            .filter_map(|t| t.stream.map(|s| s.stream_id))
            .collect();
        assert_eq!(order, vec![id(0), id(4), id(8)]);
    }

    #[test]
    fn test_lost_expired_hard_packet_is_skipped() {
        let mut conn = negotiated();
        conn.add_data_with_deadline(id(0), Bytes::from(vec![0u8; 500]), false, Duration::from_millis(20), DeadlineMode::Hard, ms(0))
            .unwrap();
        let transmit = conn.poll_transmit(1200, ms(0)).unwrap();
        assert!(transmit.deadline_info.hard);

        let decision = conn.on_packet_lost(transmit.packet_number, ms(30)).unwrap();
        assert_eq!(
            decision,
            RetransmitDecision::Skip {
                stream_id: id(0),
                offset: 0,
                length: 500
            }
        );
        assert_eq!(conn.stats().retransmits_skipped, 1);
        assert_eq!(conn.stats().bytes_dropped, 500);

        let next = conn.poll_transmit(1200, ms(30)).unwrap();
        assert_eq!(
            next.control,
            vec![DeadlineFrame::StreamDataDropped(StreamDataDroppedFrame {
                stream_id: id(0),
                offset: 0,
                length: 500
            })]
        );
    }

    #[test]
    fn test_lost_soft_packet_is_resent() {
        let mut conn = negotiated();
        conn.add_data_with_deadline(id(0), Bytes::from(vec![0u8; 500]), false, Duration::from_millis(20), DeadlineMode::Soft, ms(0))
            .unwrap();
        let transmit = conn.poll_transmit(1200, ms(0)).unwrap();

        let decision = conn.on_packet_lost(transmit.packet_number, ms(30)).unwrap();
        assert!(matches!(decision, RetransmitDecision::Resend { path: PathId::DEFAULT, .. }));

        let again = conn.poll_transmit(1200, ms(31)).unwrap();
        assert_eq!(again.stream.unwrap().len(), 500);
        assert_eq!(conn.stats().packets_retransmitted, 1);
    }

    #[test]
    fn test_unknown_packet() {
        let mut conn = negotiated();
        assert!(matches!(conn.on_packet_acked(7), Err(ConnectionError::UnknownPacket(7))));
    }

    #[test]
    fn test_malformed_frames_close_connection() {
        let mut conn = negotiated();
        assert!(conn.handle_frames(&[0x3f], ms(0)).is_err());
        assert!(conn.is_closed());
        assert_eq!(conn.close_error(), Some(TransportErrorCode::FrameEncodingError));
        assert!(matches!(
            conn.add_data(id(0), Bytes::from_static(b"x"), false, ms(0)),
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn test_deadline_frames_without_negotiation_rejected() {
        let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::default());
        conn.on_transport_parameters(&DeadlineParameters::enabled(), ms(0))
            .unwrap();
        let frame = DeadlineFrame::DeadlineControl(DeadlineControlFrame::new(id(0), Duration::from_millis(10)));
        assert!(conn.handle_frame(frame, ms(0)).is_err());
        assert_eq!(conn.close_error(), Some(TransportErrorCode::FrameEncodingError));
    }

    #[test]
    fn test_reset_goes_before_data() {
        let mut conn = negotiated();
        conn.add_data(id(0), Bytes::from(vec![0u8; 100]), false, ms(0))
            .unwrap();
        conn.add_data(id(4), Bytes::from(vec![0u8; 100]), false, ms(0))
            .unwrap();
        conn.reset_stream(id(4), 9).unwrap();

        let first = conn.poll_transmit(1200, ms(0)).unwrap();
        assert_eq!(
            first.stream_control,
            Some(StreamControl::ResetStream {
                stream_id: id(4),
                error_code: 9,
                final_size: 0
            })
        );
        assert!(first.stream.is_none());

        let second = conn.poll_transmit(1200, ms(0)).unwrap();
        assert_eq!(second.stream.map(|s| s.stream_id), Some(id(0)));
        assert!(conn.poll_transmit(1200, ms(0)).is_none());
    }

    #[test]
    fn test_congestion_passthrough_without_extension() {
        let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::default());
        let host = HostSnapshot {
            pacing_gain: 1.25,
            congestion_window: 10_000,
            bandwidth_delay_product: 8_000,
            probe_phase: ProbePhase::ProbeBwCruise,
        };
        let adjustment = conn.congestion_adjustment(PathId::DEFAULT, &host, ms(0));
        assert_eq!(adjustment.pacing_gain, 1.25);
        assert_eq!(adjustment.congestion_window, 10_000);
        assert_eq!(adjustment.urgency, UrgencyLevel::None);
    }

    #[test]
    fn test_urgency_scan_drives_pacing() {
        let mut conn = negotiated();
        conn.add_data_with_deadline(id(0), Bytes::from(vec![0u8; 100]), false, Duration::from_millis(15), DeadlineMode::Soft, ms(0))
            .unwrap();
        conn.tick(ms(0));
        assert_eq!(
            conn.path_urgency(PathId::DEFAULT).unwrap().urgency_level(),
            UrgencyLevel::Critical
        );

        let host = HostSnapshot {
            pacing_gain: 1.0,
            congestion_window: 10_000,
            bandwidth_delay_product: 10_000,
            probe_phase: ProbePhase::ProbeBwCruise,
        };
        let adjustment = conn.congestion_adjustment(PathId::DEFAULT, &host, ms(0));
        assert_eq!(adjustment.pacing_gain, 2.0);
        assert_eq!(adjustment.congestion_window, 15_000);
        assert!(adjustment.probe.quick_probe_exit);
    }

    #[test]
    fn test_passed_soft_deadline_releases_urgency() {
        let mut conn = negotiated();
        conn.set_stream_deadline(id(0), Duration::from_millis(50), false, ms(0))
            .unwrap();
        conn.add_data(id(0), Bytes::from(vec![0u8; 5000]), false, ms(0))
            .unwrap();

        conn.tick(ms(40));
        assert_eq!(
            conn.path_urgency(PathId::DEFAULT).unwrap().urgency_level(),
            UrgencyLevel::Critical
        );

        conn.tick(ms(60));
        assert_eq!(
            conn.path_urgency(PathId::DEFAULT).unwrap().urgency_level(),
            UrgencyLevel::None
        );
        let state = conn.stream_deadline(id(0)).unwrap();
        assert!(!state.is_enabled());
        assert_eq!(state.bytes_dropped(), 0);

        let host = HostSnapshot {
            pacing_gain: 1.0,
            congestion_window: 10_000,
            bandwidth_delay_product: 10_000,
            probe_phase: ProbePhase::ProbeBwCruise,
        };
        let adjustment = conn.congestion_adjustment(PathId::DEFAULT, &host, ms(60));
        assert_eq!(adjustment.pacing_gain, 1.0);
        assert_eq!(adjustment.congestion_window, 10_000);

        // The data still goes out, now as plain traffic
        let transmit = conn.poll_transmit(1200, ms(61)).unwrap();
        assert!(transmit.stream.is_some());
        assert!(!transmit.deadline_info.contains_deadline_data);
    }

    #[test]
    fn test_fin_after_data() {
        let mut conn = negotiated();
        conn.add_data(id(0), Bytes::from(vec![0u8; 10]), true, ms(0))
            .unwrap();
        let transmit = conn.poll_transmit(1200, ms(0)).unwrap();
        let frame = transmit.stream.unwrap();
        assert!(frame.fin);
        assert!(matches!(
            conn.add_data(id(0), Bytes::from_static(b"x"), false, ms(0)),
            Err(ConnectionError::StreamFinished(_))
        ));
        assert!(conn.poll_transmit(1200, ms(0)).is_none());
    }

    #[test]
    fn test_shared_connection() {
        let shared = SharedConnection::new(negotiated());
        let clone = shared.clone();
        clone
            .lock()
            .add_data(id(0), Bytes::from_static(b"hello"), false, ms(0))
            .unwrap();
        assert!(shared.poll_transmit(1200, ms(0)).is_some());
    }
}
