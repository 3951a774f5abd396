//! Station actor.
//!
//! A station owns its location, cadence and sequence counter and never sees
//! other stations. It talks to the coordinator only through the shared event
//! queue and waits for answers on its private reply queue. All waiting happens
//! on the station's `Clock`, so a suspended station never holds up anyone else.

use embassy_time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::clock::Clock;
use super::error::{InvariantViolation, StationError};
use super::types::{
    Event, EventQueueSender, MAX_TX_POWER_DB, PacketId, Point, Reply, ReplyQueueReceiver, StationId, is_valid_channel,
};

/// Default simulated on-air time of one packet.
pub const DEFAULT_AIRTIME: Duration = Duration::from_millis(10);

/// Default spread of the cadence jitter, as a fraction of the remaining wait.
/// The jitter is centred on zero, so 0.2 means ±10%.
pub const DEFAULT_JITTER_FRACTION: f32 = 0.2;

/// Result of a clear-channel assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Busy,
    Idle,
}

/// Acknowledgement for a finished transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    Ack,
    NoAck,
}

/// Timing knobs shared by all stations of a run.
#[derive(Debug, Clone, Copy)]
pub struct StationTiming {
    pub cadence: Duration,
    pub airtime: Duration,
    pub jitter_fraction: f32,
}

impl StationTiming {
    pub fn with_cadence(cadence: Duration) -> Self {
        Self {
            cadence,
            airtime: DEFAULT_AIRTIME,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

pub struct Station<'a, C: Clock> {
    id: StationId,
    location: Point,
    timing: StationTiming,
    last_tx_us: Option<u64>,
    seq_no: PacketId,
    rng: StdRng,
    clock: &'a C,
    to_coordinator: EventQueueSender<'a>,
    replies: ReplyQueueReceiver<'a>,
}

impl<'a, C: Clock> Station<'a, C> {
    pub fn new(
        id: StationId,
        location: Point,
        timing: StationTiming,
        seed: u64,
        clock: &'a C,
        to_coordinator: EventQueueSender<'a>,
        replies: ReplyQueueReceiver<'a>,
    ) -> Self {
        log::info!("Setting up station id:{} at ({:.1}, {:.1})", id, location.x, location.y);
        Self {
            id,
            location,
            timing,
            last_tx_us: None,
            seq_no: 0,
            rng: StdRng::seed_from_u64(seed),
            clock,
            to_coordinator,
            replies,
        }
    }

    pub fn id(&self) -> StationId {
        self.id
    }

    pub fn location(&self) -> Point {
        self.location
    }

    /// Number of packets handed out so far.
    pub fn packets_generated(&self) -> PacketId {
        self.seq_no
    }

    /// Blocks until this station is due to send another packet and returns its
    /// sequence number.
    ///
    /// The first call returns immediately with 0. Later calls wait out whatever
    /// is left of the cadence since the previous call, with a symmetric random
    /// jitter that keeps the long-run average at the cadence.
    pub async fn wait_for_next_transmission(&mut self) -> PacketId {
        if let Some(last_tx_us) = self.last_tx_us {
            let elapsed_us = self.clock.now().as_micros().saturating_sub(last_tx_us);
            let cadence_us = self.timing.cadence.as_micros();
            if cadence_us > elapsed_us {
                let remaining = (cadence_us - elapsed_us) as f32;
                let jitter = (self.rng.r#gen::<f32>() - 0.5) * self.timing.jitter_fraction * remaining;
                let wait_us = (remaining + jitter).max(0.0) as u64;
                self.clock.sleep(Duration::from_micros(wait_us)).await;
            }
        }

        self.last_tx_us = Some(self.clock.now().as_micros());

        let packet = self.seq_no;
        self.seq_no += 1;
        packet
    }

    /// Asks the coordinator whether `channel` is in use around this station.
    pub async fn sense(&mut self, channel: u8) -> Result<ChannelState, StationError> {
        if !is_valid_channel(channel) {
            return Err(StationError::InvalidChannel(channel));
        }

        self.to_coordinator.send(Event::sense(self.id, channel)).await;
        self.clock.mark_activity();
        let reply = self.replies.receive().await;
        self.clock.mark_activity();
        match reply {
            Reply::ChannelActive => Ok(ChannelState::Busy),
            Reply::ChannelInactive => Ok(ChannelState::Idle),
            reply => Err(InvariantViolation::UnexpectedReply {
                station: self.id,
                reply,
                expected: "a sense result",
            }
            .into()),
        }
    }

    /// Puts `packet` on the air for one airtime and waits for the coordinator's verdict.
    ///
    /// `tx_power_db` is at most 20 dB and `channel` is one of 1..=11; invalid
    /// requests fail before anything is sent.
    pub async fn transmit(&mut self, packet: PacketId, tx_power_db: f32, channel: u8) -> Result<TxResult, StationError> {
        // Written so NaN is rejected as well.
        if !(tx_power_db <= MAX_TX_POWER_DB) {
            return Err(StationError::InvalidPower(tx_power_db));
        }
        if !is_valid_channel(channel) {
            return Err(StationError::InvalidChannel(channel));
        }

        self.to_coordinator.send(Event::data_start(self.id, packet, tx_power_db, channel)).await;
        self.clock.mark_activity();
        self.clock.sleep(self.timing.airtime).await;
        self.to_coordinator.send(Event::data_done(self.id)).await;
        self.clock.mark_activity();

        let reply = self.replies.receive().await;
        self.clock.mark_activity();
        match reply {
            Reply::Ack => Ok(TxResult::Ack),
            Reply::NoAck => Ok(TxResult::NoAck),
            reply => Err(InvariantViolation::UnexpectedReply {
                station: self.id,
                reply,
                expected: "ACK or NOACK",
            }
            .into()),
        }
    }

    /// Suspends the station for `duration` of its own clock. Used for backoff.
    pub async fn idle(&self, duration: Duration) {
        self.clock.sleep(duration).await;
    }

    /// Uniform random integer in `range`, drawn from the station's own generator.
    pub fn random_slots(&mut self, range: core::ops::RangeInclusive<u32>) -> u32 {
        self.rng.gen_range(range)
    }
}
