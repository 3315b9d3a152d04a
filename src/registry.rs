//! # Sent-Packet Registry (RFC 9002 Section 2, Appendix A.1)
//!
//! One ordered map per packet number space, from packet number to the
//! metadata of a sent-but-unresolved packet, plus the two outstanding
//! counters the timer decision logic reads.
//!
//! Every entry leaves the registry exactly once: when its packet is
//! acknowledged or when it is declared lost.

#![forbid(unsafe_code)]

use crate::frames::FrameInfo;
use crate::types::{Instant, PacketNumber, PacketNumberSpace, PacketType, PerSpace};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Metadata retained for each sent packet (RFC 9002 Appendix A.1.1).
#[derive(Debug, Clone)]
pub struct PacketInfo {
    /// Packet number, unique within its space.
    pub packet_number: PacketNumber,

    /// The packet number space this packet was sent in.
    pub pn_space: PacketNumberSpace,

    /// Header classification; diagnostics only.
    pub packet_type: PacketType,

    /// Monotonic send time.
    pub time_sent: Instant,

    /// Bytes counted toward in-flight accounting.
    pub sent_bytes: usize,

    /// Contains at least one ack-eliciting frame.
    pub ack_eliciting: bool,

    /// Carries CRYPTO-level data.
    pub is_crypto_packet: bool,

    /// Counts toward the congestion controller's bytes in flight.
    pub in_flight: bool,

    /// Frames carried, in packet order, each with its reactor
    /// back-reference.
    pub frames: SmallVec<[FrameInfo; 4]>,
}

/// Counts of unresolved packets, readable without the recovery mutex.
///
/// Writes happen only under the detector's mutex; the atomics exist so
/// diagnostics and the timer decision can load them lock-free.
#[derive(Debug, Default)]
pub struct OutstandingCounters {
    crypto: AtomicU32,
    ack_eliciting: AtomicU32,
}

impl OutstandingCounters {
    /// Unresolved packets carrying CRYPTO data, across all spaces.
    pub fn crypto_outstanding(&self) -> u32 {
        self.crypto.load(Ordering::Relaxed)
    }

    /// Unresolved ack-eliciting packets, across all spaces.
    pub fn ack_eliciting_outstanding(&self) -> u32 {
        self.ack_eliciting.load(Ordering::Relaxed)
    }
}

/// The three per-space sent-packet maps and their shared counters.
#[derive(Debug, Default)]
pub struct SentPacketRegistry {
    spaces: PerSpace<BTreeMap<PacketNumber, PacketInfo>>,
    counters: Arc<OutstandingCounters>,
}

impl SentPacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the outstanding counters, for lock-free reads elsewhere.
    pub fn counters(&self) -> Arc<OutstandingCounters> {
        Arc::clone(&self.counters)
    }

    /// Record a sent packet and bump the outstanding counters.
    ///
    /// Packet numbers are assigned monotonically per space, so each
    /// insertion lands after every existing key.
    pub fn insert(&mut self, info: PacketInfo) {
        let map = self.spaces.get_mut(info.pn_space);
        debug_assert!(
            map.last_key_value()
                .map_or(true, |(&last, _)| last < info.packet_number),
            "packet numbers must be inserted in increasing order"
        );

        if info.is_crypto_packet {
            self.counters.crypto.fetch_add(1, Ordering::Relaxed);
        }
        if info.ack_eliciting {
            self.counters.ack_eliciting.fetch_add(1, Ordering::Relaxed);
        }
        map.insert(info.packet_number, info);
    }

    /// Remove a packet that was acknowledged or declared lost, returning
    /// its metadata. Counter underflow is a fatal bookkeeping bug.
    pub fn remove(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
    ) -> Option<PacketInfo> {
        let info = self.spaces.get_mut(space).remove(&packet_number)?;
        if info.is_crypto_packet {
            let prev = self.counters.crypto.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "crypto_outstanding underflow");
        }
        if info.ack_eliciting {
            let prev = self.counters.ack_eliciting.fetch_sub(1, Ordering::Relaxed);
            assert!(prev > 0, "ack_eliciting_outstanding underflow");
        }
        Some(info)
    }

    pub fn get(
        &self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
    ) -> Option<&PacketInfo> {
        self.spaces.get(space).get(&packet_number)
    }

    /// The ordered map for one space, for range walks.
    pub fn space(&self, space: PacketNumberSpace) -> &BTreeMap<PacketNumber, PacketInfo> {
        self.spaces.get(space)
    }

    pub fn len(&self, space: PacketNumberSpace) -> usize {
        self.spaces.get(space).len()
    }

    pub fn is_empty(&self) -> bool {
        PacketNumberSpace::ALL
            .iter()
            .all(|&s| self.spaces.get(s).is_empty())
    }

    /// Drop every entry in every space and zero the counters. No
    /// callbacks fire for the dropped records.
    pub fn clear(&mut self) {
        for space in PacketNumberSpace::ALL {
            self.spaces.get_mut(space).clear();
        }
        self.counters.crypto.store(0, Ordering::Relaxed);
        self.counters.ack_eliciting.store(0, Ordering::Relaxed);
    }
}
