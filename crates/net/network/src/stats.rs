//! Per-peer quality tracking: rolling transfer-speed averages and a
//! reconnection throttle derived from recent connection events.
//!
//! Entries persist across sessions and are keyed by the peer's public key, so
//! a reconnecting peer inherits its history.

use parking_lot::{Mutex, RwLock};
use quartz_eth_wire::{DisconnectReason, PeerId};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

/// Weight of the newest sample in the exponentially decaying average.
const TRANSFER_SPEED_ALPHA: f64 = 0.5;

/// Number of samples required before an average is reported.
const TRANSFER_SPEED_WARMUP: u32 = 2;

/// Number of recent events kept per peer.
const EVENT_HISTORY: usize = 32;

/// Base delay after any disconnect before the peer may be redialed.
const DISCONNECT_DELAY: Duration = Duration::from_millis(100);

/// Delay after a failed or in-flight connection attempt.
const FAILED_CONNECTION_DELAY: Duration = Duration::from_secs(10);

/// The kinds of transfer speeds tracked per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSpeedType {
    /// Round-trip latency of small requests.
    Latency,
    /// Header download speed.
    Headers,
    /// Block body download speed.
    Bodies,
    /// Receipt download speed.
    Receipts,
    /// State node download speed.
    NodeData,
    /// Snap range download speed.
    SnapRanges,
}

impl TransferSpeedType {
    const COUNT: usize = 6;

    const fn index(self) -> usize {
        match self {
            Self::Latency => 0,
            Self::Headers => 1,
            Self::Bodies => 2,
            Self::Receipts => 3,
            Self::NodeData => 4,
            Self::SnapRanges => 5,
        }
    }
}

/// Which side initiated a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectSide {
    /// We disconnected the peer.
    Local,
    /// The peer disconnected us.
    Remote,
}

/// Connection related events recorded per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    /// A connection attempt was started.
    Connecting,
    /// A connection attempt failed.
    ConnectionFailed,
    /// A connection attempt failed because the target was unreachable.
    ConnectionFailedTargetUnreachable,
    /// The session was disconnected.
    Disconnect(DisconnectSide, DisconnectReason),
}

/// What caused a reconnection delay, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayCause {
    /// Delay caused by a connection-related event.
    Event(PeerEventKind),
}

/// A recorded event together with its wall-clock time.
#[derive(Debug, Clone, Copy)]
struct TimedEvent {
    kind: PeerEventKind,
    at: Instant,
}

/// Exponentially decaying average with a warm-up phase.
///
/// After the warm-up the reported value is
/// `alpha * newest + (1 - alpha) * previous`. Zero-valued samples count, they
/// represent observed idle time.
#[derive(Debug, Clone, Copy)]
struct DecayingAverage {
    value: f64,
    samples: u32,
}

impl DecayingAverage {
    const fn new() -> Self {
        Self { value: 0.0, samples: 0 }
    }

    fn update(&mut self, sample: u64) {
        if self.samples == 0 {
            self.value = sample as f64;
        } else {
            self.value =
                TRANSFER_SPEED_ALPHA * sample as f64 + (1.0 - TRANSFER_SPEED_ALPHA) * self.value;
        }
        self.samples = self.samples.saturating_add(1);
    }

    fn current(&self) -> Option<u64> {
        (self.samples >= TRANSFER_SPEED_WARMUP).then_some(self.value as u64)
    }
}

/// Statistics tracked for a single peer.
#[derive(Debug)]
pub struct PeerStats {
    inner: Mutex<PeerStatsInner>,
}

#[derive(Debug)]
struct PeerStatsInner {
    speeds: [DecayingAverage; TransferSpeedType::COUNT],
    events: VecDeque<TimedEvent>,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PeerStatsInner {
                speeds: [DecayingAverage::new(); TransferSpeedType::COUNT],
                events: VecDeque::with_capacity(EVENT_HISTORY),
            }),
        }
    }
}

impl PeerStats {
    /// Records a connection-related event.
    pub fn add_event(&self, kind: PeerEventKind) {
        self.add_event_at(kind, Instant::now())
    }

    fn add_event_at(&self, kind: PeerEventKind, at: Instant) {
        let mut inner = self.inner.lock();
        if inner.events.len() == EVENT_HISTORY {
            inner.events.pop_front();
        }
        inner.events.push_back(TimedEvent { kind, at });
    }

    /// Records a disconnect event.
    pub fn add_disconnect(&self, side: DisconnectSide, reason: DisconnectReason) {
        self.add_event(PeerEventKind::Disconnect(side, reason));
    }

    /// Records a transfer-speed sample for the given kind.
    pub fn add_transfer_speed(&self, kind: TransferSpeedType, value: u64) {
        let mut inner = self.inner.lock();
        inner.speeds[kind.index()].update(value);
    }

    /// Returns the current rolling average for the given kind, or `None`
    /// while the warm-up phase has not seen enough samples.
    pub fn average_transfer_speed(&self, kind: TransferSpeedType) -> Option<u64> {
        self.inner.lock().speeds[kind.index()].current()
    }

    /// Returns whether a new connection to this peer should currently be
    /// held off, and the event that caused the delay.
    ///
    /// Once the event-specific delay has elapsed the peer is immediately
    /// eligible again.
    pub fn is_connection_delayed(&self) -> (bool, Option<DelayCause>) {
        self.is_connection_delayed_at(Instant::now())
    }

    fn is_connection_delayed_at(&self, now: Instant) -> (bool, Option<DelayCause>) {
        let inner = self.inner.lock();
        let Some(event) = inner.events.back() else { return (false, None) };

        let delay = event_delay(event.kind);
        if now.saturating_duration_since(event.at) < delay {
            (true, Some(DelayCause::Event(event.kind)))
        } else {
            (false, None)
        }
    }
}

/// The fixed lookup from event to reconnection delay.
fn event_delay(kind: PeerEventKind) -> Duration {
    match kind {
        PeerEventKind::Connecting |
        PeerEventKind::ConnectionFailed |
        PeerEventKind::ConnectionFailedTargetUnreachable => FAILED_CONNECTION_DELAY,
        PeerEventKind::Disconnect(_, reason) => disconnect_delay(reason),
    }
}

/// Delay applied after a disconnect with the given reason. A handful of
/// reasons indicate the peer is of no use to us any time soon and extend the
/// base window substantially.
fn disconnect_delay(reason: DisconnectReason) -> Duration {
    match reason {
        DisconnectReason::UselessPeer |
        DisconnectReason::ProtocolBreach |
        DisconnectReason::IncompatibleP2PProtocolVersion => Duration::from_secs(15 * 60),
        DisconnectReason::ClientQuitting => Duration::from_secs(10 * 60),
        DisconnectReason::TooManyPeers | DisconnectReason::AlreadyConnected => {
            Duration::from_secs(60)
        }
        _ => DISCONNECT_DELAY,
    }
}

/// Tracks [`PeerStats`] for all peers the node has seen.
///
/// The map is never pruned on disconnect; history survives the session.
#[derive(Debug, Default)]
pub struct NodeStats {
    peers: RwLock<FxHashMap<PeerId, Arc<PeerStats>>>,
}

impl NodeStats {
    /// Returns the stats entry for the peer, creating it if absent.
    pub fn peer(&self, peer_id: PeerId) -> Arc<PeerStats> {
        if let Some(stats) = self.peers.read().get(&peer_id) {
            return Arc::clone(stats)
        }
        Arc::clone(self.peers.write().entry(peer_id).or_default())
    }

    /// Returns the stats entry for the peer if one exists.
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerStats>> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Number of peers with recorded statistics.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns `true` if no peer has recorded statistics.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decaying_average_converges() {
        let stats = PeerStats::default();
        for value in [30u64, 51, 140, 110, 133, 51, 140, 110, 133, 51, 140, 110, 133] {
            stats.add_transfer_speed(TransferSpeedType::Headers, value);
        }
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Headers), Some(122));

        // idle samples drag the average down, they are not ignored
        stats.add_transfer_speed(TransferSpeedType::Headers, 0);
        stats.add_transfer_speed(TransferSpeedType::Headers, 0);
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Headers), Some(30));
    }

    #[test]
    fn average_withheld_during_warmup() {
        let stats = PeerStats::default();
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Bodies), None);
        stats.add_transfer_speed(TransferSpeedType::Bodies, 100);
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Bodies), None);
        stats.add_transfer_speed(TransferSpeedType::Bodies, 100);
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Bodies), Some(100));
    }

    #[test]
    fn speed_kinds_are_independent(){
        let stats = PeerStats::default();
        stats.add_transfer_speed(TransferSpeedType::Headers, 10);
        stats.add_transfer_speed(TransferSpeedType::Headers, 10);
        assert_eq!(stats.average_transfer_speed(TransferSpeedType::Receipts), None);
    }

    #[test]
    fn plain_disconnect_delay_expires() {
        let stats = PeerStats::default();
        let start = Instant::now();
        stats.add_event_at(
            PeerEventKind::Disconnect(DisconnectSide::Remote, DisconnectReason::Other),
            start,
        );

        let (delayed, cause) = stats.is_connection_delayed_at(start + Duration::from_millis(50));
        assert!(delayed);
        assert!(matches!(cause, Some(DelayCause::Event(PeerEventKind::Disconnect(_, _)))));

        // the base 100ms window has elapsed
        let (delayed, cause) = stats.is_connection_delayed_at(start + Duration::from_millis(125));
        assert!(!delayed);
        assert_eq!(cause, None);
    }

    #[test]
    fn useless_peer_is_delayed_for_a_long_time() {
        let stats = PeerStats::default();
        let start = Instant::now();
        stats.add_event_at(
            PeerEventKind::Disconnect(DisconnectSide::Local, DisconnectReason::UselessPeer),
            start,
        );

        let (delayed, _) = stats.is_connection_delayed_at(start + Duration::from_secs(10 * 60));
        assert!(delayed);
        let (delayed, _) = stats.is_connection_delayed_at(start + Duration::from_secs(16 * 60));
        assert!(!delayed);
    }

    #[test]
    fn connection_failure_delay() {
        let stats = PeerStats::default();
        let start = Instant::now();
        stats.add_event_at(PeerEventKind::ConnectionFailed, start);

        let (delayed, _) = stats.is_connection_delayed_at(start + Duration::from_secs(5));
        assert!(delayed);
        let (delayed, _) = stats.is_connection_delayed_at(start + Duration::from_secs(11));
        assert!(!delayed);
    }

    #[test]
    fn entries_persist_per_peer() {
        let stats = NodeStats::default();
        let peer = PeerId::with_last_byte(1);
        stats.peer(peer).add_transfer_speed(TransferSpeedType::Headers, 7);
        stats.peer(peer).add_transfer_speed(TransferSpeedType::Headers, 7);
        assert_eq!(
            stats.peer(peer).average_transfer_speed(TransferSpeedType::Headers),
            Some(7)
        );
        assert_eq!(stats.len(), 1);
        assert!(stats.get(&PeerId::with_last_byte(2)).is_none());
    }
}
