//! # Loss Detection (RFC 9002 Sections 5-6, draft-17 recovery)
//!
//! The [`LossDetector`] owns all per-connection recovery state and drives
//! the three mechanisms around it:
//!
//! 1. **ACK processing** - expands ACK ranges against the sent-packet
//!    registry, samples RTT, forwards ECN, and dispatches per-frame
//!    acknowledgement callbacks.
//! 2. **Loss detection** - the packet-threshold + time-threshold rule,
//!    recording a per-space `loss_time` for packets that are not yet lost
//!    but could become so.
//! 3. **Timer scheduling** - a single alarm fed by the highest-priority
//!    deadline (loss time, then crypto retransmit, then PTO), polled by a
//!    25 ms periodic wake and disarmed when nothing is in flight.
//!
//! ## Serialization
//!
//! Every public operation takes one exclusive mutex around the registry,
//! the per-space scalars, the RTT estimator, and the timer handle; nothing
//! suspends while it is held. The armed deadline is additionally published
//! through an atomic so the periodic wake and diagnostics can read it
//! without the lock. Collaborator callbacks run under the mutex and are
//! trusted not to call back in.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::frames::{AckFrame, Frame, FrameType, PacketNumberRange};
use crate::registry::{OutstandingCounters, PacketInfo, SentPacketRegistry};
use crate::rtt::{RttEstimator, RttStats};
use crate::timer;
use crate::traits::{CongestionController, Padder, Pinger, RecoveryContext, RecoveryEvent};
use crate::types::{
    Clock, EncryptionLevel, Instant, KeyPhase, PacketNumber, PacketNumberSpace, PacketType,
    PerSpace,
};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Mutable recovery state, guarded by the loss detection mutex.
struct DetectorState {
    registry: SentPacketRegistry,
    rtt: RttEstimator,

    /// Highest packet number ever observed as acknowledged, per space.
    /// Monotonic non-decreasing.
    largest_acked_packet: PerSpace<Option<PacketNumber>>,

    /// Deadline at which the earliest not-yet-lost packet in each space
    /// would become lost by the time threshold.
    loss_time: PerSpace<Option<Instant>>,

    time_of_last_sent_ack_eliciting_packet: Option<Instant>,
    time_of_last_sent_crypto_packet: Option<Instant>,

    /// Peer-advertised scaling applied to ACK delay values
    /// (RFC 9000 Section 18.2; default 3).
    ack_delay_exponent: u8,

    /// The periodic wake, present while the alarm is armed under a tokio
    /// runtime.
    timer: Option<JoinHandle<()>>,
}

/// QUIC loss detection and probe timeout core.
///
/// Registers interest in ACK frames, tracks every sent packet, and calls
/// out to the congestion controller, frame reactors, and probe
/// collaborators as packets resolve.
pub struct LossDetector {
    context: RecoveryContext,
    cc: Arc<dyn CongestionController>,
    pinger: Arc<dyn Pinger>,
    padder: Arc<dyn Padder>,
    clock: Arc<dyn Clock>,

    /// Lock-free view of the registry's outstanding counters.
    outstanding: Arc<OutstandingCounters>,

    /// Armed alarm deadline in nanoseconds since the clock epoch;
    /// zero means disarmed.
    alarm_at: AtomicU64,

    inner: Mutex<DetectorState>,
}

impl LossDetector {
    pub fn new(
        context: RecoveryContext,
        cc: Arc<dyn CongestionController>,
        pinger: Arc<dyn Pinger>,
        padder: Arc<dyn Padder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = SentPacketRegistry::new();
        let outstanding = registry.counters();
        let rtt = RttEstimator::new(&context.ld_config);
        Self {
            context,
            cc,
            pinger,
            padder,
            clock,
            outstanding,
            alarm_at: AtomicU64::new(0),
            inner: Mutex::new(DetectorState {
                registry,
                rtt,
                largest_acked_packet: PerSpace::default(),
                loss_time: PerSpace::default(),
                time_of_last_sent_ack_eliciting_packet: None,
                time_of_last_sent_crypto_packet: None,
                ack_delay_exponent: 3,
                timer: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DetectorState> {
        self.inner.lock().expect("loss detection mutex poisoned")
    }

    /// Frame types this handler registers interest in.
    pub fn interests(&self) -> &'static [FrameType] {
        &[FrameType::Ack]
    }

    /// Entry point for frames routed to this handler. Only ACK is
    /// expected; anything else is a dispatcher bug.
    pub fn handle_frame(self: &Arc<Self>, level: EncryptionLevel, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Ack(ack) => self.on_ack_received(ack, level.pn_space()),
            other => {
                debug!(frame_type = ?other.frame_type(), "unexpected frame type");
                Err(Error::UnexpectedFrame(other.frame_type()))
            }
        }
    }

    /// Record a sent packet and re-evaluate the alarm.
    ///
    /// Version-negotiation packets occupy no packet number space and are
    /// ignored entirely. `in_flight` gates congestion accounting and timer
    /// arming, matching the caller's byte accounting decision.
    pub fn on_packet_sent(self: &Arc<Self>, info: PacketInfo, in_flight: bool) {
        if info.packet_type == PacketType::VersionNegotiation {
            return;
        }

        let mut state = self.state();

        let packet_number = info.packet_number;
        let ack_eliciting = info.ack_eliciting;
        let is_crypto_packet = info.is_crypto_packet;
        let time_sent = info.time_sent;
        let sent_bytes = info.sent_bytes;

        debug!(
            space = info.pn_space.name(),
            packet_number, sent_bytes, ack_eliciting, "packet sent"
        );

        state.registry.insert(info);

        if in_flight {
            if is_crypto_packet {
                state.time_of_last_sent_crypto_packet = Some(time_sent);
            }
            if ack_eliciting {
                state.time_of_last_sent_ack_eliciting_packet = Some(time_sent);
            }
            self.cc.on_packet_sent(sent_bytes);
            self.set_loss_detection_timer(&mut state);
        }
    }

    /// Install the peer's advertised ack_delay_exponent transport
    /// parameter.
    pub fn update_ack_delay_exponent(&self, ack_delay_exponent: u8) {
        self.state().ack_delay_exponent = ack_delay_exponent;
    }

    /// Re-initialize all recovery state, as on connection (re)start.
    pub fn reset(&self) {
        let mut state = self.state();
        self.disarm(&mut state);
        state.registry.clear();
        state.time_of_last_sent_ack_eliciting_packet = None;
        state.time_of_last_sent_crypto_packet = None;
        state.largest_acked_packet = PerSpace::default();
        state.loss_time = PerSpace::default();
        state.rtt.reset();
    }

    /// Tear down: cancel the periodic wake and drop every outstanding
    /// packet record. No further callbacks fire.
    pub fn shutdown(&self) {
        let mut state = self.state();
        debug!("shutdown");
        self.disarm(&mut state);
        state.registry.clear();
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn largest_acked_packet_number(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        *self.state().largest_acked_packet.get(space)
    }

    pub fn loss_time(&self, space: PacketNumberSpace) -> Option<Instant> {
        *self.state().loss_time.get(space)
    }

    pub fn rtt_stats(&self) -> RttStats {
        self.state().rtt.stats()
    }

    /// Current persistent-congestion period for the given threshold, for
    /// the congestion controller's use.
    pub fn congestion_period(&self, threshold: u32) -> Duration {
        self.state().rtt.congestion_period(threshold)
    }

    pub fn sent_packet_count(&self, space: PacketNumberSpace) -> usize {
        self.state().registry.len(space)
    }

    /// Lock-free handle to the outstanding counters.
    pub fn counters(&self) -> Arc<OutstandingCounters> {
        Arc::clone(&self.outstanding)
    }

    /// The armed alarm deadline, if any. Lock-free.
    pub fn alarm_at(&self) -> Option<Instant> {
        match self.alarm_at.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(Instant::from_nanos(nanos)),
        }
    }

    // ========================================================================
    // ACK Processing
    // ========================================================================

    fn on_ack_received(
        self: &Arc<Self>,
        ack: &AckFrame,
        pn_space: PacketNumberSpace,
    ) -> Result<()> {
        // Expand the block section up front: a malformed frame is rejected
        // before any state changes.
        let ranges = ack.packet_number_ranges()?;

        let mut state = self.state();

        let largest_acked = state.largest_acked_packet.get_mut(pn_space);
        *largest_acked = Some(
            largest_acked.map_or(ack.largest_acknowledged, |prev| {
                prev.max(ack.largest_acknowledged)
            }),
        );

        let newly_acked = Self::determine_newly_acked(&state.registry, pn_space, &ranges);
        if newly_acked.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();

        // If the largest acknowledged is newly acked and ack-eliciting,
        // update the RTT.
        let sample_time = state
            .registry
            .get(pn_space, ack.largest_acknowledged)
            .and_then(|pi| {
                let eliciting = pi.ack_eliciting
                    || newly_acked.iter().any(|&pn| {
                        state
                            .registry
                            .get(pn_space, pn)
                            .map_or(false, |p| p.ack_eliciting)
                    });
                if eliciting {
                    Some(pi.time_sent)
                } else {
                    None
                }
            });
        if let Some(time_sent) = sample_time {
            let latest_rtt = now.saturating_duration_since(time_sent);
            // ack_delay arrives in microseconds, scaled down by the peer's
            // ack_delay_exponent.
            let delay_us = ack
                .ack_delay
                .checked_shl(u32::from(state.ack_delay_exponent))
                .unwrap_or(u64::MAX);
            state
                .rtt
                .update_rtt(latest_rtt, Duration::from_micros(delay_us));
        }

        trace!(
            space = pn_space.name(),
            unacked = state.registry.len(pn_space),
            ack_eliciting_outstanding = self.outstanding.ack_eliciting_outstanding(),
            crypto_outstanding = self.outstanding.crypto_outstanding(),
            "processing ack"
        );

        if let Some(ecn) = &ack.ecn_counts {
            if let Some(pi) = state.registry.get(pn_space, ack.largest_acknowledged) {
                self.cc.process_ecn(pi, ecn);
            }
        }

        // Newly acked packets resolve in ascending packet-number order;
        // each packet's frame callbacks fire in packet order.
        for &packet_number in &newly_acked {
            self.on_packet_acked(&mut state, pn_space, packet_number);
        }

        self.detect_lost_packets(&mut state, pn_space, now);

        state.rtt.set_crypto_count(0);
        state.rtt.set_pto_count(0);

        self.set_loss_detection_timer(&mut state);
        Ok(())
    }

    /// Collect the packet numbers present in the registry and covered by
    /// the ACK's ranges, ascending.
    fn determine_newly_acked(
        registry: &SentPacketRegistry,
        pn_space: PacketNumberSpace,
        ranges: &[PacketNumberRange],
    ) -> Vec<PacketNumber> {
        let map = registry.space(pn_space);
        let mut newly_acked = Vec::new();
        // Range expansion yields strictly descending disjoint ranges, so
        // walking them in reverse gives ascending packet numbers overall.
        for range in ranges.iter().rev() {
            newly_acked.extend(map.range(range.smallest..=range.largest).map(|(&pn, _)| pn));
        }
        newly_acked
    }

    fn on_packet_acked(
        &self,
        state: &mut DetectorState,
        pn_space: PacketNumberSpace,
        packet_number: PacketNumber,
    ) {
        debug!(space = pn_space.name(), packet_number, "packet acked");
        if let Some(info) = state.registry.get(pn_space, packet_number) {
            if info.in_flight {
                self.cc.on_packet_acked(info);
            }
            for frame in &info.frames {
                if let Some(reactor) = frame.generated_by() {
                    reactor.on_frame_acked(frame.id());
                }
            }
        }
        state.registry.remove(pn_space, packet_number);
    }

    // ========================================================================
    // Loss Detection
    // ========================================================================

    fn detect_lost_packets(
        &self,
        state: &mut DetectorState,
        pn_space: PacketNumberSpace,
        now: Instant,
    ) {
        *state.loss_time.get_mut(pn_space) = None;

        let Some(largest_acked) = *state.largest_acked_packet.get(pn_space) else {
            // Nothing has been acknowledged in this space, so nothing can
            // be declared lost yet.
            return;
        };

        // kGranularity is a floor on the reordering window, not a ceiling.
        let rtt_bound = state.rtt.latest_rtt().max(state.rtt.smoothed_rtt());
        let loss_delay = self
            .context
            .ld_config
            .time_threshold
            .apply(rtt_bound)
            .max(state.rtt.granularity());

        // Packets sent before this time are deemed lost.
        let lost_send_time = now.saturating_sub(loss_delay);
        // Packets with numbers strictly below this are deemed lost.
        let lost_pn = largest_acked.saturating_sub(self.context.ld_config.packet_threshold);

        let mut lost = Vec::new();
        let mut earliest_candidate: Option<Instant> = None;
        // Only packets at or below the largest acknowledged can be judged.
        for (&packet_number, unacked) in state.registry.space(pn_space).range(..=largest_acked) {
            if unacked.time_sent < lost_send_time || packet_number < lost_pn {
                if unacked.time_sent < lost_send_time {
                    debug!(
                        space = pn_space.name(),
                        packet_number,
                        time_sent = unacked.time_sent.as_nanos(),
                        loss_delay_ns = loss_delay.as_nanos() as u64,
                        "lost: time since sent is too long"
                    );
                } else {
                    debug!(
                        space = pn_space.name(),
                        packet_number,
                        largest_acked,
                        threshold = self.context.ld_config.packet_threshold,
                        "lost: packet delta is too large"
                    );
                }
                lost.push(packet_number);
            } else {
                // Not lost yet: remember when it would become so.
                let becomes_lost = unacked.time_sent.saturating_add(loss_delay);
                earliest_candidate = Some(match earliest_candidate {
                    None => becomes_lost,
                    Some(current) => current.min(becomes_lost),
                });
            }
        }
        *state.loss_time.get_mut(pn_space) = earliest_candidate;

        if lost.is_empty() {
            return;
        }

        // The congestion controller hears about the in-flight subset once,
        // as a set; reactors then decide retransmission frame by frame.
        {
            let in_flight: BTreeMap<PacketNumber, &PacketInfo> = lost
                .iter()
                .filter_map(|&pn| {
                    state
                        .registry
                        .get(pn_space, pn)
                        .filter(|info| info.in_flight)
                        .map(|info| (pn, info))
                })
                .collect();
            if !in_flight.is_empty() {
                self.cc.on_packets_lost(&in_flight);
            }

            for &pn in &lost {
                if let Some(info) = state.registry.get(pn_space, pn) {
                    self.dispatch_frame_lost(info);
                    self.context
                        .event_sink
                        .trigger(RecoveryEvent::PacketLost(info));
                }
            }
        }

        for pn in lost {
            state.registry.remove(pn_space, pn);
        }
    }

    /// Notify each frame's reactor that the frame was lost. Stale reactors
    /// are skipped.
    fn dispatch_frame_lost(&self, info: &PacketInfo) {
        debug!(
            space = info.pn_space.name(),
            packet_number = info.packet_number,
            packet_type = ?info.packet_type,
            "retransmit"
        );
        for frame in &info.frames {
            if let Some(reactor) = frame.generated_by() {
                reactor.on_frame_lost(frame.id());
            }
        }
    }

    // ========================================================================
    // Timer Scheduling
    // ========================================================================

    /// Earliest pending loss time across spaces. Ties resolve to the
    /// lowest-numbered space.
    fn earliest_loss_time(state: &DetectorState) -> Option<(Instant, PacketNumberSpace)> {
        let mut earliest = None;
        for (space, loss_time) in state.loss_time.iter() {
            if let Some(at) = *loss_time {
                earliest = match earliest {
                    Some((current, _)) if current <= at => earliest,
                    _ => Some((at, space)),
                };
            }
        }
        earliest
    }

    fn is_client_without_one_rtt_key(&self) -> bool {
        let keys = &self.context.key_info;
        self.context.side.is_client()
            && !((keys.is_encryption_key_available(KeyPhase::Phase1)
                && keys.is_decryption_key_available(KeyPhase::Phase1))
                || (keys.is_encryption_key_available(KeyPhase::Phase0)
                    && keys.is_decryption_key_available(KeyPhase::Phase0)))
    }

    /// Recompute and arm (or disarm) the alarm. Runs after every send and
    /// every processed ACK, and after every expiry.
    fn set_loss_detection_timer(self: &Arc<Self>, state: &mut DetectorState) {
        if let Some((loss_time, space)) = Self::earliest_loss_time(state) {
            self.arm(state, loss_time);
            debug!(
                space = space.name(),
                at = loss_time.as_nanos(),
                "time threshold loss detection timer set"
            );
            return;
        }

        if self.outstanding.crypto_outstanding() > 0 || self.is_client_without_one_rtt_key() {
            // Crypto retransmission timer.
            let base = state
                .time_of_last_sent_crypto_packet
                .unwrap_or(Instant::ZERO);
            let alarm = base.saturating_add(state.rtt.handshake_retransmit_timeout());
            self.arm(state, alarm);
            debug!(at = alarm.as_nanos(), "crypto retransmission timer set");
            return;
        }

        // Don't arm the alarm when no ack-eliciting packets are in flight:
        // there is nothing a probe could elicit an ACK for.
        if self.outstanding.ack_eliciting_outstanding() == 0 {
            self.disarm(state);
            return;
        }

        let base = state
            .time_of_last_sent_ack_eliciting_packet
            .unwrap_or(Instant::ZERO);
        let alarm = base.saturating_add(state.rtt.current_pto_period());
        self.arm(state, alarm);
        debug!(at = alarm.as_nanos(), "PTO timer set");
    }

    fn arm(self: &Arc<Self>, state: &mut DetectorState, at: Instant) {
        self.alarm_at.store(at.as_nanos(), Ordering::Release);
        let running = state.timer.as_ref().map_or(false, |t| !t.is_finished());
        if !running {
            state.timer = timer::spawn_periodic_wake(Arc::downgrade(self));
        }
    }

    fn disarm(&self, state: &mut DetectorState) {
        self.alarm_at.store(0, Ordering::Release);
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!("loss detection alarm has been unset");
        }
    }

    /// One tick of the periodic wake: fire the alarm if its deadline has
    /// passed. Returns whether the wake should keep running.
    ///
    /// Embeddings without a tokio runtime call this from their own
    /// scheduler at the same cadence.
    pub fn handle_tick(self: &Arc<Self>) -> bool {
        let mut state = self.state();
        let alarm = self.alarm_at.load(Ordering::Acquire);
        if alarm == 0 {
            state.timer = None;
            return false;
        }

        let now = self.clock.now();
        if now.as_nanos() >= alarm {
            self.alarm_at.store(0, Ordering::Release);
            self.on_loss_detection_timeout(&mut state, now);
        }
        self.alarm_at.load(Ordering::Acquire) != 0
    }

    fn on_loss_detection_timeout(self: &Arc<Self>, state: &mut DetectorState, now: Instant) {
        if let Some((_, space)) = Self::earliest_loss_time(state) {
            // Time threshold loss detection.
            self.detect_lost_packets(state, space, now);
        } else if self.outstanding.crypto_outstanding() > 0 {
            trace!("crypto retransmission");
            self.retransmit_all_unacked_crypto_data(state);
            let count = state.rtt.crypto_count();
            state.rtt.set_crypto_count(count + 1);
        } else if self.is_client_without_one_rtt_key() {
            // Anti-deadlock probe: a Handshake packet proves address
            // ownership; otherwise a padded Initial earns more
            // anti-amplification credit.
            if self
                .context
                .key_info
                .is_encryption_key_available(KeyPhase::Handshake)
            {
                self.send_one_handshake_packet();
            } else {
                self.send_one_padded_initial();
            }
            let count = state.rtt.crypto_count();
            state.rtt.set_crypto_count(count + 1);
        } else {
            trace!("PTO");
            self.send_one_or_two_packets();
            let count = state.rtt.pto_count();
            state.rtt.set_pto_count(count + 1);
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            for space in PacketNumberSpace::ALL {
                for (&packet_number, unacked) in state.registry.space(space) {
                    trace!(
                        space = space.name(),
                        packet_number,
                        is_crypto = unacked.is_crypto_packet,
                        ack_eliciting = unacked.ack_eliciting,
                        sent_bytes = unacked.sent_bytes,
                        "unacked"
                    );
                }
            }
        }

        self.set_loss_detection_timer(state);
    }

    /// On crypto timeout, every unacked crypto packet in every space is a
    /// retransmission candidate.
    fn retransmit_all_unacked_crypto_data(&self, state: &mut DetectorState) {
        for space in PacketNumberSpace::ALL {
            let crypto_packets: Vec<PacketNumber> = state
                .registry
                .space(space)
                .iter()
                .filter(|(_, info)| info.is_crypto_packet)
                .map(|(&pn, _)| pn)
                .collect();
            if crypto_packets.is_empty() {
                continue;
            }

            {
                let lost: BTreeMap<PacketNumber, &PacketInfo> = crypto_packets
                    .iter()
                    .filter_map(|&pn| state.registry.get(space, pn).map(|info| (pn, info)))
                    .collect();
                for info in lost.values() {
                    self.dispatch_frame_lost(info);
                }
                self.cc.on_packets_lost(&lost);
            }

            for pn in crypto_packets {
                state.registry.remove(space, pn);
            }
        }
    }

    // ========================================================================
    // Probe Requests
    // ========================================================================

    fn request_probe(&self, level: EncryptionLevel, padded: bool) {
        if padded {
            self.padder.request(level);
        } else {
            self.pinger.request(level);
        }
        // Probes must be sendable even when cwnd would block them.
        self.cc.add_extra_credit();
    }

    fn send_one_or_two_packets(&self) {
        self.request_probe(EncryptionLevel::OneRtt, false);
        self.request_probe(EncryptionLevel::OneRtt, false);
        debug!("ping frames requested at 1-RTT");
    }

    fn send_one_handshake_packet(&self) {
        self.request_probe(EncryptionLevel::Handshake, false);
        debug!("handshake probe requested");
    }

    fn send_one_padded_initial(&self) {
        self.request_probe(EncryptionLevel::Initial, true);
        debug!("padded initial requested");
    }
}

impl Drop for LossDetector {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.lock() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}
