//! # quic-recovery: QUIC Loss Detection and RTT Estimation (RFC 9002)
//!
//! Per-connection recovery core for a QUIC endpoint: tracks every in-flight
//! packet, interprets acknowledgements, declares losses, measures
//! round-trip time, and schedules probe and retransmission timeouts.
//!
//! ## Architecture
//!
//! ```text
//! quic-recovery/
//! ├── types     - packet numbers, number spaces, key phases, clock
//! ├── error     - protocol violation / dispatch errors
//! ├── config    - thresholds and base durations (RFC 9002 Appendix A)
//! ├── frames    - the consumed ACK interface and per-frame bookkeeping
//! ├── traits    - collaborator contracts (congestion, reactors, probes)
//! ├── rtt       - RTT estimator and derived timeout periods
//! ├── registry  - per-space sent-packet maps and outstanding counters
//! ├── detector  - ACK processing, loss detection, timer scheduling
//! └── timer     - the 25 ms periodic wake
//! ```
//!
//! ## Design Principles
//!
//! 1. **Deterministic**: the core never reads wall time; a [`Clock`] is
//!    injected and every state transition follows from inputs and time.
//! 2. **One lock**: a single mutex serializes all recovery state; no
//!    operation suspends while holding it.
//! 3. **Pluggable collaborators**: congestion control, frame reactors,
//!    probe emission, and key availability are traits, so the core is
//!    testable with mocks and decoupled from policy.
//! 4. **No wire formats**: ACK frames arrive through a small structured
//!    interface; parsing belongs to the frame layer.
//!
//! ## Usage Sketch
//!
//! ```rust,ignore
//! let detector = Arc::new(LossDetector::new(context, cc, pinger, padder, clock));
//!
//! // On every send:
//! detector.on_packet_sent(packet_info, /* in_flight */ true);
//!
//! // On every received ACK:
//! detector.handle_frame(level, &Frame::Ack(ack))?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod detector;
pub mod error;
pub mod frames;
pub mod registry;
pub mod rtt;
pub mod timer;
pub mod traits;
pub mod types;

pub use config::{LossDetectionConfig, TimeThreshold};
pub use detector::LossDetector;
pub use error::{Error, Result};
pub use frames::{AckBlock, AckFrame, EcnCounts, Frame, FrameId, FrameInfo, FrameType};
pub use registry::{OutstandingCounters, PacketInfo, SentPacketRegistry};
pub use rtt::{RttEstimator, RttStats};
pub use timer::{TokioClock, LOSS_DETECTION_TICK};
pub use traits::{
    CongestionController, FrameReactor, KeyInfo, NullEventSink, Padder, Pinger, RecoveryContext,
    RecoveryEvent, RecoveryEventSink,
};
pub use types::{
    Clock, EncryptionLevel, Instant, KeyPhase, ManualClock, PacketNumber, PacketNumberSpace,
    PacketType, Side,
};
