use crate::logstore::{LogWaitOutcome, WaitId};
use crate::metrics::GaugeSet;
use crate::replicator::catchup::CatchUp;
use crate::replicator::error::{CatchUpClosure, ErrorCode, StartError};
use crate::replicator::latch::{LatchGuard, ReplicatorId};
use crate::replicator::options::{ReplicatorOptions, ReplicatorTuning, ReplicatorTuningValidated};
use crate::replicator::pipeline::{Inflight, Pipeline, RequestType, ResponsePayload, RpcResponse};
use crate::replicator::stats::{RunningState, SharedStats, Stat};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, EntryMeta, InstallSnapshotRequest, InstallSnapshotResponse, RpcError,
    TimeoutNowRequest, TimeoutNowResponse,
};
use crate::snapshot::SnapshotReader;
use crate::timer::{monotonic_ms, schedule, TimerHandle};
use crate::types::{Index, Term};
use bytes::{Bytes, BytesMut};
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Duration;

/// Replication state towards one follower.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Discovering the follower's match index with zero-entry probes.
    Probe,
    /// Steady state: pipelining entry-bearing AppendEntries.
    Replicate,
    /// An InstallSnapshot is outstanding; nothing else is pipelined.
    Snapshot,
    /// Terminal.
    Destroyed,
}

/// Completion for a caller-issued heartbeat. When supplied, it replaces the
/// replicator's own heartbeat completion handling entirely.
pub type HeartbeatClosure = Box<dyn FnOnce(Result<AppendEntriesResponse, RpcError>) + Send>;

/// What a response handler decided about the drain loop.
enum Verdict {
    /// Applied cleanly; consume the sequence and keep draining.
    Continue,
    /// Recovery already started (probe/block); stop draining.
    Stop,
    /// Higher term observed; the driver destroys the replicator and informs
    /// the node.
    StepDown(Term),
}

/// Why a suspended replicator is being re-entered.
pub(crate) enum ContinueReason {
    NewEntries,
    BlockTimeout,
    Stopped,
}

/// Drives one follower's log towards the leader's. One long-lived instance
/// per peer, owned by its latch; every mutation happens under a
/// [`LatchGuard`].
pub struct Replicator {
    logger: slog::Logger,
    metric_name: String,
    options: ReplicatorOptions,
    tuning: ReplicatorTuningValidated,
    stats: Arc<SharedStats>,
    state: State,
    stat: Stat,
    pipeline: Pipeline,
    has_succeeded: bool,
    consecutive_errors: u64,
    timeout_now_index: u64,
    catch_up: Option<CatchUp>,
    snapshot_reader: Option<Box<dyn SnapshotReader>>,
    heartbeat_timer: Option<TimerHandle>,
    block_timer: Option<TimerHandle>,
    heartbeat_in_fly: Option<AbortHandle>,
    timeout_now_in_fly: Option<AbortHandle>,
    wait_id: Option<WaitId>,
}

impl Replicator {
    /// Creates a replicator for `options.peer_id`, connects, registers its
    /// metrics, arms the heartbeat timer, and emits the initial probe.
    pub fn start(options: ReplicatorOptions, tuning: ReplicatorTuning) -> Result<ReplicatorId, StartError> {
        let tuning = ReplicatorTuningValidated::try_from(tuning).map_err(StartError::InvalidTuning)?;

        if !options.rpc.connect(&options.peer_id) {
            slog::error!(options.logger, "failed to initialize sending channel"; "peer" => %options.peer_id);
            return Err(StartError::ConnectFailed(options.peer_id.clone()));
        }

        let logger = options.logger.new(slog::o!(
            "group" => options.group_id.as_str().to_string(),
            "peer" => options.peer_id.as_str().to_string(),
        ));

        let stats = Arc::new(SharedStats::default());
        stats.set_next_index(options.log.last_index().val() + 1);

        let metric_name = format!("replicator-{}/{}", options.group_id, options.peer_id);
        Self::register_metrics(&options, &stats, &metric_name);

        let replicator = Replicator {
            logger,
            metric_name,
            options,
            tuning,
            stats: Arc::clone(&stats),
            state: State::Probe,
            stat: Stat::new(),
            pipeline: Pipeline::new(),
            has_succeeded: false,
            consecutive_errors: 0,
            timeout_now_index: 0,
            catch_up: None,
            snapshot_reader: None,
            heartbeat_timer: None,
            block_timer: None,
            heartbeat_in_fly: None,
            timeout_now_in_fly: None,
            wait_id: None,
        };

        let id = ReplicatorId::create(replicator, stats);
        if let Some(mut guard) = id.lock() {
            slog::info!(guard.logger, "replicator started");
            guard.stats.set_last_rpc_send_ms(monotonic_ms());
            Self::start_heartbeat_timer(&id, &mut guard, monotonic_ms());
            Self::send_probe(&id, &mut guard);
        }
        Ok(id)
    }

    fn register_metrics(options: &ReplicatorOptions, stats: &Arc<SharedStats>, metric_name: &str) {
        let mut set = GaugeSet::new();
        {
            let log = Arc::clone(&options.log);
            let stats = Arc::clone(stats);
            set.put(
                "log-lags",
                Box::new(move || log.last_index().val().saturating_sub(stats.next_index().saturating_sub(1))),
            );
        }
        {
            let stats = Arc::clone(stats);
            set.put("next-index", Box::new(move || stats.next_index()));
        }
        {
            let stats = Arc::clone(stats);
            set.put("heartbeat-times", Box::new(move || stats.heartbeat_times()));
        }
        {
            let stats = Arc::clone(stats);
            set.put("install-snapshot-times", Box::new(move || stats.install_snapshot_times()));
        }
        {
            let stats = Arc::clone(stats);
            set.put("append-entries-times", Box::new(move || stats.append_entries_times()));
        }
        {
            let stats = Arc::clone(stats);
            set.put("mismatch-at-one", Box::new(move || stats.mismatch_at_one()));
        }
        // Duplicate registration is tolerated and keeps the original set.
        options.metrics.register(metric_name, set);
    }

    fn next_index(&self) -> Index {
        Index::new(self.stats.next_index())
    }

    fn set_next_index(&self, value: Index) {
        self.stats.set_next_index(value.val());
    }

    fn observe_rpc_send_time(&self, send_ms: u64) {
        if send_ms > self.stats.last_rpc_send_ms() {
            self.stats.set_last_rpc_send_ms(send_ms);
        }
    }

    fn add_inflight(&mut self, inflight: Inflight) {
        self.pipeline.push_inflight(inflight);
        self.options
            .metrics
            .record_size("replicate-inflights-count", self.pipeline.inflight_count() as u64);
    }

    /// Common request fields for probes, heartbeats and entry batches.
    /// Returns None when the previous entry has been compacted away and the
    /// caller must fall back to snapshot installation. Heartbeats never fail:
    /// they zero out the prev fields instead so the follower only refreshes
    /// its leader timestamp.
    fn fill_common_fields(&self, prev_log_index: Index, is_heartbeat: bool) -> Option<AppendEntriesRequest> {
        let mut prev_log_index = prev_log_index;
        let mut prev_log_term = self.options.log.term_of(prev_log_index);
        if prev_log_term == Term::ZERO && prev_log_index.val() != 0 {
            if !is_heartbeat {
                debug_assert!(prev_log_index < self.options.log.first_index());
                slog::debug!(self.logger, "log entry was compacted"; "index" => %prev_log_index);
                return None;
            }
            prev_log_index = Index::ZERO;
            prev_log_term = Term::ZERO;
        }

        Some(AppendEntriesRequest {
            term: self.options.term,
            group_id: self.options.group_id.clone(),
            server_id: self.options.server_id.clone(),
            peer_id: self.options.peer_id.clone(),
            prev_log_index,
            prev_log_term,
            committed_index: self.options.ballot_box.last_committed_index(),
            entries: Vec::new(),
            data: Bytes::new(),
        })
    }

    fn spawn_append_entries(
        id: &ReplicatorId,
        r: &Replicator,
        request: Arc<AppendEntriesRequest>,
        seq: i32,
        version: u64,
        send_ms: u64,
    ) -> AbortHandle {
        let id = id.clone();
        let rpc = Arc::clone(&r.options.rpc);
        let peer = r.options.peer_id.clone();
        tokio::spawn(async move {
            let result = rpc.append_entries(&peer, Arc::clone(&request), None).await;
            Replicator::on_rpc_returned(&id, seq, version, send_ms, ResponsePayload::AppendEntries { request, result });
        })
        .abort_handle()
    }

    /// Sends a zero-entry AppendEntries to discover the follower's match
    /// index. Falls back to snapshot installation when our own log no longer
    /// reaches back far enough.
    fn send_probe(id: &ReplicatorId, r: &mut Replicator) {
        let Some(request) = r.fill_common_fields(r.next_index().prev(), false) else {
            Self::install_snapshot(id, r);
            return;
        };

        r.stat.running_state = RunningState::AppendingEntries;
        r.stat.first_log_index = r.next_index();
        r.stat.last_log_index = r.next_index().prev();
        r.stats.incr_append_entries_times();
        r.state = State::Probe;

        let send_ms = monotonic_ms();
        let version = r.pipeline.version();
        let seq = r.pipeline.next_req_seq();
        let start_index = r.next_index();
        slog::debug!(r.logger, "sending probe";
            "term" => %r.options.term,
            "prev_log_index" => %request.prev_log_index,
            "committed_index" => %request.committed_index
        );

        let request = Arc::new(request);
        let handle = Self::spawn_append_entries(id, r, request, seq, version, send_ms);
        r.add_inflight(Inflight {
            seq,
            request_type: RequestType::AppendEntries,
            start_index,
            count: 0,
            size_bytes: 0,
            rpc_handle: handle,
        });
    }

    /// Sends a heartbeat with the election-timeout/2 deadline. A custom
    /// closure, when given, takes over completion handling (no timer re-arm,
    /// no term check).
    fn send_heartbeat_rpc(id: &ReplicatorId, r: &mut Replicator, closure: Option<HeartbeatClosure>) {
        let Some(request) = r.fill_common_fields(r.next_index().prev(), true) else {
            return;
        };

        r.stats.incr_heartbeat_times();
        let send_ms = monotonic_ms();
        let timeout = r.options.election_timeout / 2;
        slog::debug!(r.logger, "sending heartbeat";
            "term" => %r.options.term,
            "committed_index" => %request.committed_index
        );

        let id = id.clone();
        let rpc = Arc::clone(&r.options.rpc);
        let peer = r.options.peer_id.clone();
        let request = Arc::new(request);
        let handle = tokio::spawn(async move {
            let result = rpc.append_entries(&peer, request, Some(timeout)).await;
            match closure {
                Some(done) => done(result),
                None => Replicator::on_heartbeat_returned(&id, result, send_ms),
            }
        })
        .abort_handle();
        r.heartbeat_in_fly = Some(handle);
    }

    /// Opens the local snapshot and sends InstallSnapshot. I/O failures are
    /// surfaced to the node and not retried here.
    fn install_snapshot(id: &ReplicatorId, r: &mut Replicator) {
        if r.state == State::Snapshot {
            slog::warn!(r.logger, "already installing a snapshot, ignoring the new request");
            return;
        }
        debug_assert!(r.snapshot_reader.is_none(), "snapshot reader outlived its install");

        let Some(reader) = r.options.snapshot_storage.open() else {
            Self::report_snapshot_failure(r, "failed to open snapshot".to_string());
            return;
        };
        let Some(uri) = reader.generate_uri_for_copy() else {
            Self::report_snapshot_failure(r, "failed to generate uri for snapshot reader".to_string());
            return;
        };
        let Some(meta) = reader.load() else {
            let message = format!("failed to load snapshot meta from {}", reader.path());
            Self::report_snapshot_failure(r, message);
            return;
        };

        let request = InstallSnapshotRequest {
            term: r.options.term,
            group_id: r.options.group_id.clone(),
            server_id: r.options.server_id.clone(),
            peer_id: r.options.peer_id.clone(),
            meta: meta.clone(),
            uri,
        };

        r.snapshot_reader = Some(reader);
        r.stat.running_state = RunningState::InstallingSnapshot;
        r.stat.last_log_included = meta.last_included_index;
        r.stat.last_term_included = meta.last_included_term;
        r.state = State::Snapshot;
        r.stats.incr_install_snapshot_times();

        let send_ms = monotonic_ms();
        let version = r.pipeline.version();
        let seq = r.pipeline.next_req_seq();
        let start_index = r.next_index();
        slog::info!(r.logger, "installing snapshot on peer";
            "last_included_index" => %meta.last_included_index,
            "last_included_term" => %meta.last_included_term
        );

        let id2 = id.clone();
        let rpc = Arc::clone(&r.options.rpc);
        let peer = r.options.peer_id.clone();
        let request = Arc::new(request);
        let task_request = Arc::clone(&request);
        let handle = tokio::spawn(async move {
            let result = rpc.install_snapshot(&peer, Arc::clone(&task_request)).await;
            Replicator::on_rpc_returned(
                &id2,
                seq,
                version,
                send_ms,
                ResponsePayload::Snapshot {
                    request: task_request,
                    result,
                },
            );
        })
        .abort_handle();

        r.add_inflight(Inflight {
            seq,
            request_type: RequestType::Snapshot,
            start_index,
            count: 0,
            size_bytes: 0,
            rpc_handle: handle,
        });
    }

    fn report_snapshot_failure(r: &Replicator, message: String) {
        slog::warn!(r.logger, "snapshot install aborted"; "error" => %message);
        let node = Arc::clone(&r.options.node);
        tokio::spawn(async move {
            node.report_snapshot_failure(message);
        });
    }

    /// The entry pump: sends as many entry batches as the pipeline admits.
    fn send_entries(id: &ReplicatorId, r: &mut Replicator) {
        let mut prev_send_index: Option<Index> = None;
        loop {
            match r.pipeline.next_send_index(r.next_index(), r.tuning.max_inflight_msgs) {
                Some(next) if prev_send_index.map_or(true, |prev| next > prev) => {
                    if Self::send_entries_at(id, r, next) {
                        prev_send_index = Some(next);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// Sends one batch starting at `next_sending_index`. Returns false when
    /// nothing was sent (snapshot fallback, or now waiting on the log store).
    fn send_entries_at(id: &ReplicatorId, r: &mut Replicator, next_sending_index: Index) -> bool {
        let Some(mut request) = r.fill_common_fields(next_sending_index.prev(), false) else {
            Self::install_snapshot(id, r);
            return false;
        };

        let mut entries: Vec<EntryMeta> = Vec::new();
        let mut data = BytesMut::new();
        for offset in 0..r.tuning.max_entries_per_request {
            if !r.prepare_entry(next_sending_index, offset, &mut entries, &mut data) {
                break;
            }
        }

        if entries.is_empty() {
            if next_sending_index < r.options.log.first_index() {
                Self::install_snapshot(id, r);
                return false;
            }
            Self::wait_more_entries(id, r, next_sending_index);
            return false;
        }

        request.entries = entries;
        request.data = data.freeze();
        let count = request.entries_count();
        let size_bytes = request.data.len();

        r.stat.running_state = RunningState::AppendingEntries;
        r.stat.first_log_index = request.prev_log_index.next();
        r.stat.last_log_index = request.prev_log_index.plus(count as u64);
        r.stats.incr_append_entries_times();

        let send_ms = monotonic_ms();
        let version = r.pipeline.version();
        let seq = r.pipeline.next_req_seq();
        slog::debug!(r.logger, "sending entries";
            "term" => %r.options.term,
            "prev_log_index" => %request.prev_log_index,
            "prev_log_term" => %request.prev_log_term,
            "committed_index" => %request.committed_index,
            "count" => count
        );

        let request = Arc::new(request);
        let handle = Self::spawn_append_entries(id, r, request, seq, version, send_ms);
        r.add_inflight(Inflight {
            seq,
            request_type: RequestType::AppendEntries,
            start_index: next_sending_index,
            count,
            size_bytes,
            rpc_handle: handle,
        });
        true
    }

    /// Appends one entry's metadata and payload to the batch under
    /// construction. Returns false when the body budget is spent or the log
    /// has no entry at that offset.
    fn prepare_entry(
        &self,
        next_sending_index: Index,
        offset: usize,
        entries: &mut Vec<EntryMeta>,
        data: &mut BytesMut,
    ) -> bool {
        if data.len() >= self.tuning.max_body_size {
            return false;
        }
        let log_index = next_sending_index.plus(offset as u64);
        let Some(entry) = self.options.log.entry_at(log_index) else {
            return false;
        };
        debug_assert!(
            entry.kind != crate::logstore::EntryKind::Configuration || !entry.peers.is_empty(),
            "configuration entry without peers at index {log_index}",
        );

        data.extend_from_slice(&entry.data);
        entries.push(EntryMeta {
            term: entry.term,
            kind: entry.kind,
            data_len: entry.data.len(),
            peers: entry.peers,
            old_peers: entry.old_peers,
        });
        true
    }

    /// Registers a single-shot waiter with the log store; the waiter
    /// re-enters through `continue_sending` once entries land.
    fn wait_more_entries(id: &ReplicatorId, r: &mut Replicator, next_wait_index: Index) {
        slog::debug!(r.logger, "waiting for more entries"; "next_wait_index" => %next_wait_index);
        if r.wait_id.is_some() {
            return;
        }
        let id = id.clone();
        let wait_id = r.options.log.wait(
            next_wait_index.prev(),
            Box::new(move |outcome| {
                let reason = match outcome {
                    LogWaitOutcome::NewEntries => ContinueReason::NewEntries,
                    LogWaitOutcome::Stopped => ContinueReason::Stopped,
                };
                Replicator::continue_sending(&id, reason);
            }),
        );
        r.wait_id = Some(wait_id);
        r.stat.running_state = RunningState::Idle;
    }

    pub(crate) fn continue_sending(id: &ReplicatorId, reason: ContinueReason) {
        let Some(mut guard) = id.lock() else {
            return;
        };
        guard.wait_id = None;
        match reason {
            ContinueReason::BlockTimeout => {
                // Re-probe after a block: the follower may have moved while
                // we were backing off, so rediscover next_index instead of
                // resuming blind.
                Self::send_probe(id, &mut guard);
            }
            ContinueReason::NewEntries => {
                Self::send_entries(id, &mut guard);
            }
            ContinueReason::Stopped => {
                slog::warn!(guard.logger, "replicator stops sending entries");
            }
        }
    }

    /// Backs off after a failure. No RPCs are issued until the block timer
    /// re-enters via `continue_sending`.
    fn block(id: &ReplicatorId, r: &mut Replicator, start_ms: u64) {
        let timeout = r.options.heartbeat_timeout();
        slog::debug!(r.logger, "blocking peer"; "ms" => timeout.as_millis() as u64);
        let due_ms = (start_ms + timeout.as_millis() as u64).saturating_sub(monotonic_ms());
        let id = id.clone();
        let timer = schedule(Duration::from_millis(due_ms), move || {
            Replicator::continue_sending(&id, ContinueReason::BlockTimeout);
        });
        r.block_timer = Some(timer);
        r.stat.running_state = RunningState::Blocking;
    }

    fn start_heartbeat_timer(id: &ReplicatorId, r: &mut Replicator, start_ms: u64) {
        let timeout = r.options.heartbeat_timeout();
        let due_ms = (start_ms + timeout.as_millis() as u64).saturating_sub(monotonic_ms());
        let id = id.clone();
        r.heartbeat_timer = Some(schedule(Duration::from_millis(due_ms), move || {
            id.set_error(ErrorCode::Timeout);
        }));
    }

    /// Error delivery under the latch. `Stopped` tears everything down;
    /// `Timeout` is the heartbeat wakeup.
    pub(crate) fn on_error(id: &ReplicatorId, mut guard: LatchGuard<'_>, code: ErrorCode) {
        match code {
            ErrorCode::Stopped => {
                let r = &mut *guard;
                for inflight in r.pipeline.drain_inflights() {
                    inflight.rpc_handle.abort();
                }
                if let Some(handle) = r.heartbeat_in_fly.take() {
                    handle.abort();
                }
                if let Some(handle) = r.timeout_now_in_fly.take() {
                    handle.abort();
                }
                if let Some(timer) = r.heartbeat_timer.take() {
                    timer.cancel();
                }
                if let Some(timer) = r.block_timer.take() {
                    timer.cancel();
                }
                if let Some(wait_id) = r.wait_id.take() {
                    r.options.log.remove_waiter(wait_id);
                }
                r.notify_on_caught_up(Some(ErrorCode::Stopped), true);
                Self::destroy(guard);
            }
            ErrorCode::Timeout => {
                drop(guard);
                let id = id.clone();
                tokio::spawn(async move {
                    if let Some(mut guard) = id.lock() {
                        Replicator::send_heartbeat_rpc(&id, &mut guard, None);
                    }
                });
            }
            other => panic!("unknown error code for replicator: {other}"),
        }
    }

    fn destroy(guard: LatchGuard<'_>) {
        let mut replicator = guard.destroy();
        slog::info!(replicator.logger, "replicator is going to quit");
        replicator.snapshot_reader = None;
        replicator.options.metrics.unregister(&replicator.metric_name);
        replicator.state = State::Destroyed;
        // Remaining timers and handles drop here; late firings observe the
        // latch sentinel and do nothing.
    }

    /// Invalidates all outstanding sequences and releases the snapshot
    /// reader, if any.
    fn reset_inflights(&mut self) {
        self.pipeline.reset();
        self.snapshot_reader = None;
    }

    /// Response entry point for sequenced RPCs (AppendEntries probes and
    /// batches, InstallSnapshot). Parks the response in the reorder buffer
    /// and drains it in sequence order.
    pub(crate) fn on_rpc_returned(
        id: &ReplicatorId,
        seq: i32,
        state_version: u64,
        send_ms: u64,
        payload: ResponsePayload,
    ) {
        let start_ms = monotonic_ms();
        let Some(mut guard) = id.lock() else {
            return;
        };

        if state_version != guard.pipeline.version() {
            slog::debug!(guard.logger, "ignoring response from an old version";
                "response_version" => state_version,
                "current_version" => guard.pipeline.version(),
                "stat" => %guard.stat
            );
            return;
        }

        guard.pipeline.push_response(RpcResponse { seq, send_ms, payload });

        if guard.pipeline.pending_responses_len() > guard.tuning.max_inflight_msgs {
            slog::warn!(guard.logger, "too many pending responses, resetting to probe";
                "pending" => guard.pipeline.pending_responses_len(),
                "max_inflight_msgs" => guard.tuning.max_inflight_msgs
            );
            guard.reset_inflights();
            guard.state = State::Probe;
            Self::send_probe(id, &mut guard);
            return;
        }

        let mut continue_send = false;
        let mut processed = 0u32;
        loop {
            let Some(next_seq) = guard.pipeline.peek_response_seq() else {
                break;
            };
            if next_seq != guard.pipeline.required_next_seq() {
                if processed > 0 {
                    break;
                }
                // Nothing consumable yet; leave the response parked.
                return;
            }
            let Some(response) = guard.pipeline.pop_response() else {
                break;
            };
            processed += 1;

            let inflight = match guard.pipeline.pop_inflight() {
                Some(inflight) => inflight,
                None => {
                    slog::debug!(guard.logger, "ignoring response without a matching in-flight request"; "seq" => response.seq);
                    continue;
                }
            };
            if inflight.seq != response.seq {
                slog::warn!(guard.logger, "response sequence out of order, resetting to probe";
                    "expect" => inflight.seq,
                    "actual" => response.seq,
                    "state" => ?guard.state,
                    "stat" => %guard.stat
                );
                guard.reset_inflights();
                guard.state = State::Probe;
                Self::block(id, &mut guard, monotonic_ms());
                return;
            }

            let verdict = match response.payload {
                ResponsePayload::AppendEntries { request, result } => Self::handle_append_entries_response(
                    id,
                    &mut guard,
                    &inflight,
                    &request,
                    result,
                    response.send_ms,
                    start_ms,
                ),
                ResponsePayload::Snapshot { request, result } => {
                    Self::handle_install_snapshot_response(id, &mut guard, &request, result)
                }
            };

            match verdict {
                Verdict::Continue => {
                    guard.pipeline.advance_required_seq();
                    continue_send = true;
                }
                Verdict::Stop => {
                    continue_send = false;
                    break;
                }
                Verdict::StepDown(observed_term) => {
                    let node = Arc::clone(&guard.options.node);
                    Self::destroy(guard);
                    tokio::spawn(async move {
                        node.step_down(observed_term);
                    });
                    return;
                }
            }
        }

        if continue_send {
            Self::send_entries(id, &mut guard);
        }
    }

    fn handle_append_entries_response(
        id: &ReplicatorId,
        r: &mut Replicator,
        inflight: &Inflight,
        request: &AppendEntriesRequest,
        result: Result<AppendEntriesResponse, RpcError>,
        send_ms: u64,
        start_ms: u64,
    ) -> Verdict {
        if inflight.start_index != request.prev_log_index.next() {
            slog::warn!(r.logger, "invalid AppendEntries response, resetting to probe";
                "inflight_start_index" => %inflight.start_index,
                "request_prev_log_index" => %request.prev_log_index
            );
            r.reset_inflights();
            r.state = State::Probe;
            Self::send_probe(id, r);
            return Verdict::Stop;
        }

        if request.entries_count() > 0 {
            let metrics = &r.options.metrics;
            metrics.record_latency(
                "replicate-entries",
                Duration::from_millis(monotonic_ms().saturating_sub(send_ms)),
            );
            metrics.record_size("replicate-entries-count", request.entries_count() as u64);
            metrics.record_size("replicate-entries-bytes", request.data.len() as u64);
        }

        let response = match result {
            Err(status) => {
                // A crashed follower fails every RPC immediately; back off
                // instead of spinning until it returns or is removed.
                slog::debug!(r.logger, "AppendEntries failed, backing off"; "error" => %status);
                r.consecutive_errors += 1;
                if r.consecutive_errors % 10 == 0 {
                    slog::warn!(r.logger, "failed to issue RPC to peer";
                        "consecutive_errors" => r.consecutive_errors,
                        "error" => %status
                    );
                }
                r.reset_inflights();
                r.state = State::Probe;
                Self::block(id, r, start_ms);
                return Verdict::Stop;
            }
            Ok(response) => response,
        };
        r.consecutive_errors = 0;

        if !response.success {
            if response.term > r.options.term {
                slog::debug!(r.logger, "peer answered with a greater term";
                    "response_term" => %response.term,
                    "expect_term" => %r.options.term
                );
                r.notify_on_caught_up(Some(ErrorCode::HigherTerm), true);
                return Verdict::StepDown(response.term);
            }

            slog::debug!(r.logger, "AppendEntries rejected, searching for the match index";
                "peer_last_log_index" => %response.last_log_index,
                "local_next_index" => %r.next_index()
            );
            r.observe_rpc_send_time(send_ms);
            r.reset_inflights();
            if response.last_log_index.next() < r.next_index() {
                // The peer's log is shorter than our next_index guess.
                r.set_next_index(response.last_log_index.next());
            } else if r.next_index().val() > 1 {
                // The peer holds entries from an old term; step back one
                // index to find the last one we agree on.
                r.set_next_index(r.next_index().prev());
            } else {
                slog::error!(r.logger, "peer declares that log at index 0 does not match, which is not supposed to happen");
                r.stats.incr_mismatch_at_one();
            }
            Self::send_probe(id, r);
            return Verdict::Stop;
        }

        if response.term != r.options.term {
            slog::error!(r.logger, "response term mismatch on success";
                "response_term" => %response.term,
                "expect_term" => %r.options.term
            );
            r.reset_inflights();
            r.state = State::Probe;
            return Verdict::Stop;
        }

        r.observe_rpc_send_time(send_ms);
        let entries_count = request.entries_count();
        if entries_count > 0 {
            let first = r.next_index();
            let last = r.next_index().plus(entries_count as u64 - 1);
            r.options.ballot_box.commit_at(first, last, &r.options.peer_id);
            slog::debug!(r.logger, "replicated entries"; "first" => %first, "last" => %last);
        } else {
            // A successful probe: the follower's log matches, start
            // pipelining.
            r.state = State::Replicate;
        }
        r.set_next_index(r.next_index().plus(entries_count as u64));
        r.has_succeeded = true;
        r.notify_on_caught_up(None, false);
        if r.timeout_now_index > 0 && r.timeout_now_index < r.next_index().val() {
            Self::send_timeout_now(id, r, false, None);
        }
        Verdict::Continue
    }

    fn handle_install_snapshot_response(
        id: &ReplicatorId,
        r: &mut Replicator,
        request: &InstallSnapshotRequest,
        result: Result<InstallSnapshotResponse, RpcError>,
    ) -> Verdict {
        // The reader is released on every completion path.
        r.snapshot_reader = None;

        let success = match result {
            Err(status) => {
                slog::info!(r.logger, "InstallSnapshot failed";
                    "last_included_index" => %request.meta.last_included_index,
                    "error" => %status
                );
                r.consecutive_errors += 1;
                if r.consecutive_errors % 10 == 0 {
                    slog::warn!(r.logger, "failed to install snapshot on peer";
                        "consecutive_errors" => r.consecutive_errors,
                        "error" => %status
                    );
                }
                false
            }
            Ok(response) if !response.success => {
                if response.term > r.options.term {
                    r.notify_on_caught_up(Some(ErrorCode::HigherTerm), true);
                    return Verdict::StepDown(response.term);
                }
                slog::info!(r.logger, "InstallSnapshot rejected by peer";
                    "last_included_index" => %request.meta.last_included_index
                );
                false
            }
            Ok(_) => {
                r.set_next_index(request.meta.last_included_index.next());
                slog::info!(r.logger, "InstallSnapshot succeeded";
                    "last_included_index" => %request.meta.last_included_index,
                    "next_index" => %r.next_index()
                );
                true
            }
        };

        // Snapshot installation is not retried explicitly; failure falls
        // back to probing after a block.
        if !success {
            r.reset_inflights();
            r.state = State::Probe;
            Self::block(id, r, monotonic_ms());
            return Verdict::Stop;
        }

        r.has_succeeded = true;
        r.notify_on_caught_up(None, false);
        if r.timeout_now_index > 0 && r.timeout_now_index < r.next_index().val() {
            Self::send_timeout_now(id, r, false, None);
        }
        r.state = State::Replicate;
        Verdict::Continue
    }

    /// Heartbeat completions bypass the sequenced pipeline entirely.
    fn on_heartbeat_returned(id: &ReplicatorId, result: Result<AppendEntriesResponse, RpcError>, send_ms: u64) {
        let start_ms = monotonic_ms();
        let Some(mut guard) = id.lock() else {
            return;
        };

        match result {
            Err(status) => {
                slog::debug!(guard.logger, "heartbeat failed"; "error" => %status);
                guard.state = State::Probe;
                guard.consecutive_errors += 1;
                if guard.consecutive_errors % 10 == 0 {
                    slog::warn!(guard.logger, "failed to issue heartbeat to peer";
                        "consecutive_errors" => guard.consecutive_errors,
                        "error" => %status
                    );
                }
                Self::start_heartbeat_timer(id, &mut guard, start_ms);
            }
            Ok(response) => {
                guard.consecutive_errors = 0;
                if response.term > guard.options.term {
                    slog::debug!(guard.logger, "heartbeat answered with a greater term";
                        "response_term" => %response.term,
                        "expect_term" => %guard.options.term
                    );
                    let node = Arc::clone(&guard.options.node);
                    guard.notify_on_caught_up(Some(ErrorCode::HigherTerm), true);
                    Self::destroy(guard);
                    tokio::spawn(async move {
                        node.step_down(response.term);
                    });
                    return;
                }
                guard.observe_rpc_send_time(send_ms);
                Self::start_heartbeat_timer(id, &mut guard, start_ms);
            }
        }
    }

    /// Catch-up bookkeeping. `code = None` is the progress path (fires only
    /// once the margin is met); `before_destroy` delivers unconditionally
    /// because no further progress will ever happen.
    fn notify_on_caught_up(&mut self, code: Option<ErrorCode>, before_destroy: bool) {
        let Some(mut catch_up) = self.catch_up.take() else {
            return;
        };

        if code == Some(ErrorCode::Timeout) {
            if !catch_up.error_was_set {
                catch_up.result = Err(ErrorCode::Timeout);
            }
        } else if before_destroy {
            if !catch_up.error_was_set {
                catch_up.error_was_set = true;
                if let Some(code) = code {
                    catch_up.result = Err(code);
                }
            }
        } else {
            if self.next_index().val() - 1 + catch_up.max_margin < self.options.log.last_index().val() {
                self.catch_up = Some(catch_up);
                return;
            }
            if catch_up.error_was_set {
                self.catch_up = Some(catch_up);
                return;
            }
            catch_up.error_was_set = true;
            if let Some(code) = code {
                catch_up.result = Err(code);
            }
            if let Some(timer) = &catch_up.timer {
                if !timer.cancel() {
                    // The timer is already firing; let it deliver the result
                    // we just recorded.
                    self.catch_up = Some(catch_up);
                    return;
                }
            }
        }

        catch_up.dispatch();
    }

    fn on_catch_up_timed_out(id: &ReplicatorId) {
        let Some(mut guard) = id.lock() else {
            return;
        };
        guard.notify_on_caught_up(Some(ErrorCode::Timeout), false);
    }

    /// Sends TimeoutNow, instructing the peer to start an election at once.
    /// With `stop_after_finish` the replicator destroys itself on completion
    /// regardless of outcome.
    fn send_timeout_now(id: &ReplicatorId, r: &mut Replicator, stop_after_finish: bool, timeout: Option<Duration>) {
        let request = TimeoutNowRequest {
            term: r.options.term,
            group_id: r.options.group_id.clone(),
            server_id: r.options.server_id.clone(),
            peer_id: r.options.peer_id.clone(),
        };
        slog::debug!(r.logger, "sending TimeoutNow"; "stop_after_finish" => stop_after_finish);

        let id2 = id.clone();
        let rpc = Arc::clone(&r.options.rpc);
        let peer = r.options.peer_id.clone();
        let handle = tokio::spawn(async move {
            let result = rpc.timeout_now(&peer, request, timeout).await;
            Replicator::on_timeout_now_returned(&id2, result, stop_after_finish);
        })
        .abort_handle();

        if !stop_after_finish {
            // Issued by transfer_leadership; keep the handle so stop can
            // cancel it.
            r.timeout_now_in_fly = Some(handle);
            r.timeout_now_index = 0;
        }
    }

    fn on_timeout_now_returned(
        id: &ReplicatorId,
        result: Result<TimeoutNowResponse, RpcError>,
        stop_after_finish: bool,
    ) {
        let Some(mut guard) = id.lock() else {
            return;
        };

        let response = match result {
            Err(status) => {
                slog::debug!(guard.logger, "TimeoutNow failed"; "error" => %status);
                if stop_after_finish {
                    guard.notify_on_caught_up(Some(ErrorCode::Stopped), true);
                    Self::destroy(guard);
                }
                return;
            }
            Ok(response) => response,
        };

        slog::debug!(guard.logger, "received TimeoutNowResponse"; "success" => response.success);
        if response.term > guard.options.term {
            let node = Arc::clone(&guard.options.node);
            guard.notify_on_caught_up(Some(ErrorCode::HigherTerm), true);
            Self::destroy(guard);
            tokio::spawn(async move {
                node.step_down(response.term);
            });
            return;
        }
        if stop_after_finish {
            guard.notify_on_caught_up(Some(ErrorCode::Stopped), true);
            Self::destroy(guard);
        }
    }
}

/// Point-in-time view of the replicator internals, for diagnostics and
/// tests. None once the replicator is destroyed.
#[derive(Debug, Clone)]
pub struct ReplicatorView {
    pub state: State,
    pub next_index: u64,
    pub req_seq: i32,
    pub required_next_seq: i32,
    pub version: u64,
    pub inflight_count: usize,
    pub pending_responses: usize,
    pub has_succeeded: bool,
    pub consecutive_errors: u64,
    pub timeout_now_index: u64,
}

impl ReplicatorId {
    /// Stops the replicator: cancels outstanding work and destroys it.
    pub fn stop(&self) {
        self.set_error(ErrorCode::Stopped);
    }

    /// The index the leader will send next, or 0 until the first
    /// acknowledged RPC proves the pipeline works.
    pub fn next_index(&self) -> u64 {
        match self.lock() {
            Some(guard) if guard.has_succeeded => guard.next_index().val(),
            _ => 0,
        }
    }

    /// Monotonic-clock milliseconds of the latest successfully acknowledged
    /// RPC send. Lock-free.
    pub fn last_rpc_send_ms(&self) -> u64 {
        self.shared_stats().last_rpc_send_ms()
    }

    /// Registers a one-shot closure invoked once the peer is within
    /// `max_margin` entries of the leader's last log index, fails, or times
    /// out after `due` (when given).
    pub fn wait_for_caught_up(&self, max_margin: u64, due: Option<Duration>, done: CatchUpClosure) {
        let Some(mut guard) = self.lock() else {
            tokio::spawn(async move {
                done(Err(ErrorCode::Gone));
            });
            return;
        };
        if guard.catch_up.is_some() {
            slog::error!(guard.logger, "previous wait_for_caught_up is not over");
            tokio::spawn(async move {
                done(Err(ErrorCode::Busy));
            });
            return;
        }

        let mut catch_up = CatchUp::new(max_margin, done);
        if let Some(due) = due {
            let id = self.clone();
            catch_up.timer = Some(schedule(due, move || {
                Replicator::on_catch_up_timed_out(&id);
            }));
        }
        guard.catch_up = Some(catch_up);
    }

    /// Arranges for TimeoutNow once the peer has replicated up to
    /// `log_index`; sends immediately when it already has. Returns false
    /// when the replicator is destroyed.
    pub fn transfer_leadership(&self, log_index: Index) -> bool {
        let Some(mut guard) = self.lock() else {
            return false;
        };
        if guard.has_succeeded && guard.next_index().val() > log_index.val() {
            Replicator::send_timeout_now(self, &mut guard, false, None);
        } else {
            // Registered so the response path fires TimeoutNow when
            // next_index crosses log_index.
            guard.timeout_now_index = log_index.val();
        }
        true
    }

    pub fn stop_transfer_leadership(&self) -> bool {
        let Some(mut guard) = self.lock() else {
            return false;
        };
        guard.timeout_now_index = 0;
        true
    }

    /// Sends TimeoutNow with the given deadline and destroys the replicator
    /// when it completes, successfully or not.
    pub fn send_timeout_now_and_stop(&self, timeout: Duration) -> bool {
        let Some(mut guard) = self.lock() else {
            return false;
        };
        Replicator::send_timeout_now(self, &mut guard, true, Some(timeout));
        true
    }

    /// Sends a heartbeat immediately. A supplied closure observes the raw
    /// completion instead of the replicator's own handling.
    pub fn send_heartbeat(&self, closure: Option<HeartbeatClosure>) {
        match self.lock() {
            Some(mut guard) => Replicator::send_heartbeat_rpc(self, &mut guard, closure),
            None => {
                if let Some(done) = closure {
                    tokio::spawn(async move {
                        done(Err(RpcError::ReplicatorGone));
                    });
                }
            }
        }
    }

    /// Cancels an active block backoff and probes right away. Used when a
    /// configuration change or a hint of peer recovery arrives.
    pub fn unblock_and_send_now(&self) {
        let Some(mut guard) = self.lock() else {
            return;
        };
        if let Some(timer) = guard.block_timer.take() {
            if timer.cancel() {
                let id = self.clone();
                tokio::spawn(async move {
                    Replicator::continue_sending(&id, ContinueReason::BlockTimeout);
                });
            }
        }
    }

    pub fn view(&self) -> Option<ReplicatorView> {
        let guard = self.lock()?;
        Some(ReplicatorView {
            state: guard.state,
            next_index: guard.next_index().val(),
            req_seq: guard.pipeline.req_seq(),
            required_next_seq: guard.pipeline.required_next_seq(),
            version: guard.pipeline.version(),
            inflight_count: guard.pipeline.inflight_count(),
            pending_responses: guard.pipeline.pending_responses_len(),
            has_succeeded: guard.has_succeeded,
            consecutive_errors: guard.consecutive_errors,
            timeout_now_index: guard.timeout_now_index,
        })
    }
}
