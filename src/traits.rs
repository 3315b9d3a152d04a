//! # Collaborator Contracts
//!
//! The recovery core coordinates several external components. Their
//! observable contracts live here as traits so the core stays decoupled
//! from policy and the whole subsystem is testable with mocks:
//!
//! - [`CongestionController`] - byte accounting and congestion feedback.
//! - [`FrameReactor`] - the frame generator notified on ack/loss so it can
//!   release or retransmit.
//! - [`Pinger`] / [`Padder`] - emit probe packets on timeout.
//! - [`KeyInfo`] - packet protection key availability.
//! - [`RecoveryEventSink`] - observability hook for recovery events.
//!
//! All callbacks are invoked under the detector's serialization discipline
//! and are trusted to be non-blocking and non-throwing; implementations
//! must not call back into the detector.

#![forbid(unsafe_code)]

use crate::config::LossDetectionConfig;
use crate::frames::{EcnCounts, FrameId};
use crate::registry::PacketInfo;
use crate::types::{EncryptionLevel, KeyPhase, PacketNumber, Side};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Congestion controller contract (RFC 9002 Section 7).
///
/// Only the surface the loss detector drives is specified; the algorithm
/// behind it (NewReno, Cubic, BBR) is pluggable.
pub trait CongestionController: Send + Sync {
    /// An in-flight packet left the endpoint.
    fn on_packet_sent(&self, sent_bytes: usize);

    /// An in-flight packet was acknowledged.
    fn on_packet_acked(&self, info: &PacketInfo);

    /// A batch of in-flight packets was declared lost. Called once per
    /// detection pass with the whole set.
    fn on_packets_lost(&self, lost_packets: &BTreeMap<PacketNumber, &PacketInfo>);

    /// The peer reported ECN counts covering `largest_acked`.
    fn process_ecn(&self, largest_acked: &PacketInfo, ecn: &EcnCounts);

    /// Grant credit for one probe packet so it can be sent even when the
    /// congestion window would otherwise block it.
    fn add_extra_credit(&self);
}

/// A frame generator to be notified when a frame it emitted is acknowledged
/// or lost. For any given frame exactly one of the two callbacks fires,
/// at most once.
pub trait FrameReactor: Send + Sync {
    /// The frame was acknowledged; retained retransmission state can be
    /// released.
    fn on_frame_acked(&self, id: FrameId);

    /// The frame's packet was declared lost; the reactor decides whether
    /// and how to retransmit.
    fn on_frame_lost(&self, id: FrameId);
}

/// Requests a PING probe at the given encryption level.
pub trait Pinger: Send + Sync {
    fn request(&self, level: EncryptionLevel);
}

/// Requests a padded probe packet at the given encryption level. Padded
/// Initials earn the client extra anti-amplification credit.
pub trait Padder: Send + Sync {
    fn request(&self, level: EncryptionLevel);
}

/// Packet protection key availability, per key phase.
pub trait KeyInfo: Send + Sync {
    fn is_encryption_key_available(&self, phase: KeyPhase) -> bool;
    fn is_decryption_key_available(&self, phase: KeyPhase) -> bool;
}

/// Events the recovery core publishes for observability.
#[derive(Debug, Clone, Copy)]
pub enum RecoveryEvent<'a> {
    /// A packet was declared lost by the time or packet threshold rule.
    PacketLost(&'a PacketInfo),
}

/// Observability hook. Triggered synchronously from within recovery
/// operations; implementations must be cheap.
pub trait RecoveryEventSink: Send + Sync {
    fn trigger(&self, event: RecoveryEvent<'_>);
}

/// A sink that drops every event, for embeddings without tracing needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl RecoveryEventSink for NullEventSink {
    fn trigger(&self, _event: RecoveryEvent<'_>) {}
}

/// Connection-scoped context handed to the loss detector at construction:
/// which side this endpoint is, where key availability can be queried,
/// where events go, and the loss-detection configuration.
#[derive(Clone)]
pub struct RecoveryContext {
    pub side: Side,
    pub key_info: Arc<dyn KeyInfo>,
    pub event_sink: Arc<dyn RecoveryEventSink>,
    pub ld_config: LossDetectionConfig,
}
