//! MAC policies.
//!
//! A policy decides when a station transmits and with which power, channel and
//! retry budget. It only ever calls the station's public operations, so the
//! coordinator is unaware of which policy is installed.

use embassy_time::Duration;
use serde::Deserialize;

use super::clock::Clock;
use super::error::StationError;
use super::station::{ChannelState, Station, TxResult};
use super::types::{MAX_TX_POWER_DB, PacketId, is_valid_channel};

/// What happened to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u8 },
    Dropped { attempts: u8 },
}

#[allow(async_fn_in_trait)]
pub trait MacPolicy {
    /// Tries to get `packet` acknowledged.
    async fn send_packet<C: Clock>(&mut self, station: &mut Station<'_, C>, packet: PacketId) -> Result<Delivery, StationError>;

    /// Sends packets forever at the station's cadence. Returns only on error.
    async fn run<C: Clock>(&mut self, station: &mut Station<'_, C>) -> Result<(), StationError> {
        loop {
            let packet = station.wait_for_next_transmission().await;
            match self.send_packet(station, packet).await? {
                Delivery::Delivered { attempts } => {
                    log::trace!("station {} delivered packet #{} after {} attempt(s)", station.id(), packet, attempts);
                }
                Delivery::Dropped { attempts } => {
                    log::debug!("station {} dropped packet #{} after {} attempt(s)", station.id(), packet, attempts);
                }
            }
        }
    }
}

/// No medium access control at all: channel 1, 0 dB, send whenever a packet is
/// ready and retry blindly.
#[derive(Debug, Clone)]
pub struct NullMac {
    pub max_attempts: u8,
}

impl Default for NullMac {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl MacPolicy for NullMac {
    async fn send_packet<C: Clock>(&mut self, station: &mut Station<'_, C>, packet: PacketId) -> Result<Delivery, StationError> {
        for attempt in 1..=self.max_attempts {
            if station.transmit(packet, 0.0, 1).await? == TxResult::Ack {
                return Ok(Delivery::Delivered { attempts: attempt });
            }
        }
        Ok(Delivery::Dropped { attempts: self.max_attempts })
    }
}

/// Largest accepted contention window, in slots.
pub const MAX_CONTENTION_WINDOW: u32 = 1 << 16;
/// Largest accepted backoff slot (one second).
pub const MAX_SLOT_US: u64 = 1_000_000;

/// Parameters of the carrier-sense policy (`[csma]` in the configuration).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CsmaParameters {
    pub tx_power_db: f32,
    pub channel: u8,
    pub cw_min: u32,
    pub cw_max: u32,
    pub slot_us: u64,
    pub max_retransmissions: u8,
}

impl Default for CsmaParameters {
    fn default() -> Self {
        Self {
            tx_power_db: MAX_TX_POWER_DB,
            channel: 1,
            cw_min: 16,
            cw_max: 1024,
            slot_us: 1_000,
            max_retransmissions: 2,
        }
    }
}

impl CsmaParameters {
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_channel(self.channel) {
            return Err(format!("Invalid csma channel {}, must be 1-11", self.channel));
        }
        if self.cw_min == 0 || self.cw_min > self.cw_max {
            return Err(format!("Invalid contention window {}..{}", self.cw_min, self.cw_max));
        }
        if self.cw_max > MAX_CONTENTION_WINDOW {
            return Err(format!("Invalid cw-max {}, must be at most {}", self.cw_max, MAX_CONTENTION_WINDOW));
        }
        if self.slot_us == 0 || self.slot_us > MAX_SLOT_US {
            return Err(format!("Invalid slot-us {}, must be 1-{}", self.slot_us, MAX_SLOT_US));
        }
        Ok(())
    }
}

/// Carrier sense with binary exponential backoff.
///
/// Before every attempt the station senses its channel and backs off a random
/// number of slots in `1..=cw` for as long as the channel is busy. Every NOACK
/// doubles `cw` up to `cw_max` and adds one more random backoff.
#[derive(Debug, Clone)]
pub struct CsmaMac {
    params: CsmaParameters,
}

impl CsmaMac {
    pub fn new(mut params: CsmaParameters) -> Self {
        if !(params.tx_power_db <= MAX_TX_POWER_DB) {
            log::warn!("csma tx power {} dB clamped to {} dB", params.tx_power_db, MAX_TX_POWER_DB);
            params.tx_power_db = MAX_TX_POWER_DB;
        }
        Self { params }
    }

    async fn back_off<C: Clock>(&self, station: &mut Station<'_, C>, cw: u32) {
        let slots = station.random_slots(1..=cw.max(1));
        station.idle(Duration::from_micros(self.params.slot_us.saturating_mul(slots as u64))).await;
    }
}

impl MacPolicy for CsmaMac {
    async fn send_packet<C: Clock>(&mut self, station: &mut Station<'_, C>, packet: PacketId) -> Result<Delivery, StationError> {
        let attempts = self.params.max_retransmissions + 1;
        let mut cw = self.params.cw_min;

        for attempt in 1..=attempts {
            while station.sense(self.params.channel).await? == ChannelState::Busy {
                self.back_off(station, cw).await;
            }

            match station.transmit(packet, self.params.tx_power_db, self.params.channel).await? {
                TxResult::Ack => return Ok(Delivery::Delivered { attempts: attempt }),
                TxResult::NoAck => {
                    cw = cw.saturating_mul(2).min(self.params.cw_max);
                    if attempt < attempts {
                        self.back_off(station, cw).await;
                    }
                }
            }
        }
        Ok(Delivery::Dropped { attempts })
    }
}

/// Policy chosen for every station of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MacProtocol {
    #[default]
    Null,
    Csma,
}

impl std::str::FromStr for MacProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" | "nullmac" => Ok(MacProtocol::Null),
            "csma" | "csmamac" => Ok(MacProtocol::Csma),
            other => Err(format!("Unknown MAC protocol '{other}', expected 'null' or 'csma'")),
        }
    }
}
