//! Type definitions shared by stations and the coordinator.
//!
//! Contains:
//! - Station identity and positions
//! - The `Event`/`Reply` messages exchanged over the transport, with their wire shape
//! - Transport channel aliases (shared event queue, per-station reply queues)
//! - Radio limits that both sides validate against

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::InvariantViolation;

/// Stable station identifier; doubles as the index into coordinator state.
pub type StationId = u32;

/// Per-station packet sequence number.
pub type PacketId = u32;

/// Highest transmit power a station may request (dB).
pub const MAX_TX_POWER_DB: f32 = 20.0;

/// Lowest valid channel number.
pub const MIN_CHANNEL: u8 = 1;
/// Highest valid channel number.
pub const MAX_CHANNEL: u8 = 11;

/// Upper bound on simultaneously simulated stations. Sizes the station task pool.
pub const MAX_STATION_COUNT: usize = 256;

/// Returns true when `channel` is one of the usable channels 1..=11.
pub fn is_valid_channel(channel: u8) -> bool {
    (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel)
}

/// Depth of the shared station→coordinator queue. Stations suspend when it is full.
pub const EVENT_QUEUE_SIZE: usize = 64;
/// Bounded channel carrying events from every station to the coordinator.
pub type EventQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_SIZE>;
/// Sender side of the event queue, held by each station.
pub type EventQueueSender<'a> = embassy_sync::channel::Sender<'a, CriticalSectionRawMutex, Event, EVENT_QUEUE_SIZE>;
/// Receiver side of the event queue, held only by the coordinator.
pub type EventQueueReceiver<'a> = embassy_sync::channel::Receiver<'a, CriticalSectionRawMutex, Event, EVENT_QUEUE_SIZE>;

/// A station has at most one request outstanding, so one slot is enough.
pub const REPLY_QUEUE_SIZE: usize = 1;
/// Private coordinator→station reply channel.
pub type ReplyQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Reply, REPLY_QUEUE_SIZE>;
/// Sender side of a reply queue, held by the coordinator.
pub type ReplyQueueSender<'a> = embassy_sync::channel::Sender<'a, CriticalSectionRawMutex, Reply, REPLY_QUEUE_SIZE>;
/// Receiver side of a reply queue, held by the owning station.
pub type ReplyQueueReceiver<'a> = embassy_sync::channel::Receiver<'a, CriticalSectionRawMutex, Reply, REPLY_QUEUE_SIZE>;

/// Position in the plane, in arbitrary distance units. The coordinator sits at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Message from a station to the coordinator. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct Event {
    pub station_id: StationId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    /// Clear-channel assessment request.
    Sense { channel: u8 },
    /// The station started putting a packet on the air.
    DataStart { packet_id: PacketId, tx_power_db: f32, channel: u8 },
    /// The station finished the transmission it started last.
    DataDone,
}

impl Event {
    pub fn sense(station_id: StationId, channel: u8) -> Self {
        Self { station_id, kind: EventKind::Sense { channel } }
    }

    pub fn data_start(station_id: StationId, packet_id: PacketId, tx_power_db: f32, channel: u8) -> Self {
        Self {
            station_id,
            kind: EventKind::DataStart { packet_id, tx_power_db, channel },
        }
    }

    pub fn data_done(station_id: StationId) -> Self {
        Self { station_id, kind: EventKind::DataDone }
    }
}

/// Coordinator's answer to a SENSE or DATA/DONE event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    #[serde(rename = "channel_active")]
    ChannelActive,
    #[serde(rename = "channel_inactive")]
    ChannelInactive,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "NOACK")]
    NoAck,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::ChannelActive => "channel_active",
            Reply::ChannelInactive => "channel_inactive",
            Reply::Ack => "ACK",
            Reply::NoAck => "NOACK",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireKind {
    Sense,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirePhase {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "")]
    None,
}

/// Flat transport shape of an `Event`:
/// `{stationId, kind, phase, packetId, txPowerDb, channel}`.
///
/// Fields a given kind does not use carry neutral values (packet 0, power 0.0, channel 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub station_id: StationId,
    pub kind: WireKind,
    pub phase: WirePhase,
    pub packet_id: PacketId,
    pub tx_power_db: f32,
    pub channel: u8,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        let (kind, phase, packet_id, tx_power_db, channel) = match event.kind {
            EventKind::Sense { channel } => (WireKind::Sense, WirePhase::None, 0, 0.0, channel),
            EventKind::DataStart { packet_id, tx_power_db, channel } => (WireKind::Data, WirePhase::Start, packet_id, tx_power_db, channel),
            EventKind::DataDone => (WireKind::Data, WirePhase::Done, 0, 0.0, MIN_CHANNEL),
        };
        WireEvent {
            station_id: event.station_id,
            kind,
            phase,
            packet_id,
            tx_power_db,
            channel,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = InvariantViolation;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = match (wire.kind, wire.phase) {
            (WireKind::Sense, WirePhase::None) => EventKind::Sense { channel: wire.channel },
            (WireKind::Data, WirePhase::Start) => EventKind::DataStart {
                packet_id: wire.packet_id,
                tx_power_db: wire.tx_power_db,
                channel: wire.channel,
            },
            (WireKind::Data, WirePhase::Done) => EventKind::DataDone,
            (kind, phase) => {
                return Err(InvariantViolation::MalformedEvent {
                    station: wire.station_id,
                    detail: format!("kind {kind:?} cannot carry phase {phase:?}"),
                });
            }
        };
        Ok(Event { station_id: wire.station_id, kind })
    }
}
