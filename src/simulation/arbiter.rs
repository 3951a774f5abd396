//! Access point arbitration state.
//!
//! `Arbiter` owns one transmission slot and one received log per station and
//! applies events to them one at a time. It has no notion of channels/queues or
//! time; the coordinator feeds it events in arrival order and forwards whatever
//! reply it produces. Because it is only ever touched by that single consumer,
//! every interference computation sees a consistent snapshot of all slots.
//!
//! Interference model:
//! - Every other in-progress transmission on the same channel contributes
//!   `tx_power - path_loss(distance)` to the noise, summed in linear power on
//!   top of the ambient noise floor.
//! - For clear-channel assessment the distance is measured from the sensing
//!   station; for reception it is measured from the access point.

use serde::Deserialize;

use super::error::{CoordinatorError, InvariantViolation};
use super::signal_calculations::{PropagationModel, db_to_linear, linear_to_db};
use super::types::{Event, EventKind, PacketId, Point, Reply, StationId, is_valid_channel};

/// Position of the access point.
pub const ACCESS_POINT_POSITION: Point = Point::ORIGIN;

/// Receiver thresholds (`[radio]` in the configuration).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RadioThresholds {
    /// Ambient noise with no interferers (dB).
    pub noise_floor_db: f32,
    /// Lowest SNR at which the access point can decode a packet.
    pub minimum_snr_ap_db: f32,
    /// Rise of the noise above the floor at which a sensing station reports the channel busy.
    pub minimum_snr_cca_db: f32,
}

impl Default for RadioThresholds {
    fn default() -> Self {
        Self {
            noise_floor_db: -91.3,
            minimum_snr_ap_db: 20.0,
            minimum_snr_cca_db: 4.0,
        }
    }
}

/// A transmission currently on the air.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveTransmission {
    pub packet_id: PacketId,
    pub tx_power_db: f32,
    pub channel: u8,
    /// Sticky: once set it stays set until the transmission's DONE.
    pub corrupted: bool,
}

/// Per-station slot. A corrupted flag only exists while a transmission is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TransmissionSlot {
    #[default]
    Idle,
    InProgress(ActiveTransmission),
}

impl TransmissionSlot {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, TransmissionSlot::InProgress(tx) if tx.corrupted)
    }

    fn active_on(&self, channel: u8) -> Option<&ActiveTransmission> {
        match self {
            TransmissionSlot::InProgress(tx) if tx.channel == channel => Some(tx),
            _ => None,
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub events: u64,
    pub senses: u64,
    pub busy_senses: u64,
    pub transmissions: u64,
    pub acks: u64,
    pub noacks: u64,
}

pub struct Arbiter<P: PropagationModel> {
    locations: Vec<Point>,
    slots: Vec<TransmissionSlot>,
    received: Vec<Vec<PacketId>>,
    model: P,
    thresholds: RadioThresholds,
    stats: ArbiterStats,
}

impl<P: PropagationModel> Arbiter<P> {
    /// Station `i` is the station located at `locations[i]`.
    pub fn new(locations: Vec<Point>, model: P, thresholds: RadioThresholds) -> Self {
        let count = locations.len();
        Self {
            locations,
            slots: vec![TransmissionSlot::Idle; count],
            received: vec![Vec::new(); count],
            model,
            thresholds,
            stats: ArbiterStats::default(),
        }
    }

    pub fn station_count(&self) -> usize {
        self.locations.len()
    }

    pub fn slot(&self, station: StationId) -> Option<&TransmissionSlot> {
        self.slots.get(station as usize)
    }

    pub fn received_count(&self, station: StationId) -> usize {
        self.received.get(station as usize).map_or(0, Vec::len)
    }

    pub fn received_log(&self, station: StationId) -> &[PacketId] {
        self.received.get(station as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    /// True once every station has at least `target` delivered packets.
    pub fn all_reached(&self, target: usize) -> bool {
        self.received.iter().all(|log| log.len() >= target)
    }

    /// Applies one event and returns the reply owed to its station, if any.
    pub fn process(&mut self, event: &Event) -> Result<Option<Reply>, CoordinatorError> {
        let station = event.station_id;
        let index = station as usize;
        if index >= self.slots.len() {
            return Err(InvariantViolation::UnknownStation { station }.into());
        }
        self.stats.events += 1;

        match event.kind {
            EventKind::Sense { channel } => {
                check_channel(station, channel)?;
                self.stats.senses += 1;
                let rise = self.noise_rise_at_station_db(station, channel)?;
                if rise >= self.thresholds.minimum_snr_cca_db {
                    self.stats.busy_senses += 1;
                    Ok(Some(Reply::ChannelActive))
                } else {
                    Ok(Some(Reply::ChannelInactive))
                }
            }
            EventKind::DataStart { packet_id, tx_power_db, channel } => {
                check_channel(station, channel)?;
                if matches!(self.slots[index], TransmissionSlot::InProgress(_)) {
                    return Err(InvariantViolation::DuplicateStart { station }.into());
                }
                self.stats.transmissions += 1;
                self.slots[index] = TransmissionSlot::InProgress(ActiveTransmission {
                    packet_id,
                    tx_power_db,
                    channel,
                    corrupted: false,
                });
                self.mark_collisions(channel)?;
                Ok(None)
            }
            EventKind::DataDone => {
                let TransmissionSlot::InProgress(tx) = std::mem::take(&mut self.slots[index]) else {
                    return Err(InvariantViolation::DoneWithoutStart { station }.into());
                };
                if tx.corrupted {
                    self.stats.noacks += 1;
                    log::debug!("AP: packet #{} from station id:{} was corrupted", tx.packet_id, station);
                    Ok(Some(Reply::NoAck))
                } else {
                    self.received[index].push(tx.packet_id);
                    self.stats.acks += 1;
                    log::debug!("AP: Got packet #{} from station id:{}", tx.packet_id, station);
                    Ok(Some(Reply::Ack))
                }
            }
        }
    }

    /// How far the noise around `station` rises above the floor because of other
    /// transmissions on `channel` (dB).
    fn noise_rise_at_station_db(&self, station: StationId, channel: u8) -> Result<f32, CoordinatorError> {
        let Some(&listener) = self.locations.get(station as usize) else {
            return Err(InvariantViolation::UnknownStation { station }.into());
        };
        let noise = self.total_noise_db(station, channel, &listener)?;
        Ok(noise - self.thresholds.noise_floor_db)
    }

    /// SNR at the access point of `station`'s current transmission, or `None` when idle.
    pub fn uplink_snr_db(&self, station: StationId) -> Result<Option<f32>, CoordinatorError> {
        let Some(TransmissionSlot::InProgress(tx)) = self.slots.get(station as usize) else {
            return Ok(None);
        };
        let noise = self.total_noise_db(station, tx.channel, &ACCESS_POINT_POSITION)?;
        let distance = self.locations[station as usize].distance_to(&ACCESS_POINT_POSITION);
        let path_loss = self.model.path_loss_db(distance)?;
        Ok(Some(self.model.snr_db(tx.tx_power_db, path_loss, noise)))
    }

    /// Re-evaluates every in-progress transmission on `channel` against the
    /// current set of interferers. Already corrupted transmissions are skipped;
    /// corruption is never cleared here.
    fn mark_collisions(&mut self, channel: u8) -> Result<(), CoordinatorError> {
        for station in 0..self.slots.len() {
            let Some(tx) = self.slots[station].active_on(channel) else {
                continue;
            };
            if tx.corrupted {
                continue;
            }
            let station = station as StationId;
            let Some(snr) = self.uplink_snr_db(station)? else {
                continue;
            };
            if snr < self.thresholds.minimum_snr_ap_db {
                log::debug!("AP: transmission from station id:{} corrupted (SNR {:.1} dB)", station, snr);
                if let TransmissionSlot::InProgress(tx) = &mut self.slots[station as usize] {
                    tx.corrupted = true;
                }
            }
        }
        Ok(())
    }

    /// Noise floor plus every other active transmission on `channel`, as heard at `receiver`.
    fn total_noise_db(&self, exclude: StationId, channel: u8, receiver: &Point) -> Result<f32, CoordinatorError> {
        let mut noise_linear = db_to_linear(self.thresholds.noise_floor_db);
        for (other, slot) in self.slots.iter().enumerate() {
            if other == exclude as usize {
                continue;
            }
            let Some(tx) = slot.active_on(channel) else {
                continue;
            };
            let distance = self.locations[other].distance_to(receiver);
            let path_loss = self.model.path_loss_db(distance)?;
            noise_linear += db_to_linear(tx.tx_power_db - path_loss);
        }
        Ok(linear_to_db(noise_linear))
    }
}

fn check_channel(station: StationId, channel: u8) -> Result<(), InvariantViolation> {
    if is_valid_channel(channel) {
        Ok(())
    } else {
        Err(InvariantViolation::ChannelOutOfRange { station, channel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::error::PropagationError;
    use crate::simulation::signal_calculations::Fixed;

    /// Loss grows by 1 dB per distance unit on top of 50 dB.
    struct Linear;

    impl PropagationModel for Linear {
        fn path_loss_db(&self, distance: f32) -> Result<f32, PropagationError> {
            if !(distance >= 0.0) {
                return Err(PropagationError::InvalidDistance(distance));
            }
            Ok(50.0 + distance)
        }
    }

    fn arbiter<P: PropagationModel>(locations: &[Point], model: P) -> Arbiter<P> {
        Arbiter::new(locations.to_vec(), model, RadioThresholds::default())
    }

    fn violation(result: Result<Option<Reply>, CoordinatorError>) -> InvariantViolation {
        match result {
            Err(CoordinatorError::Violation(v)) => v,
            other => panic!("expected an invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn single_station_snr_is_link_budget_over_floor() {
        let mut ap = arbiter(&[Point::new(30.0, 40.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();

        // 20 - (50 + 50) + 91.3
        let snr = ap.uplink_snr_db(0).unwrap().unwrap();
        assert!((snr - 11.3).abs() < 1e-3, "{snr}");
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::NoAck));
    }

    #[test]
    fn lone_station_above_threshold_always_acks() {
        let mut ap = arbiter(&[Point::new(10.0, 0.0)], Linear);
        for packet in 0..20 {
            ap.process(&Event::data_start(0, packet, 20.0, 3)).unwrap();
            // 20 - 60 + 91.3 = 51.3 dB
            assert!((ap.uplink_snr_db(0).unwrap().unwrap() - 51.3).abs() < 1e-3);
            assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::Ack));
        }
        assert_eq!(ap.received_log(0), (0..20).collect::<Vec<PacketId>>().as_slice());
    }

    #[test]
    fn later_start_corrupts_earlier_transmission() {
        // Fixed loss of 86.3 dB gives A an SNR of exactly 25 dB on its own.
        let mut ap = arbiter(&[Point::new(5.0, 5.0), Point::new(6.0, 5.0)], Fixed { loss_db: 86.3 });
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        assert!((ap.uplink_snr_db(0).unwrap().unwrap() - 25.0).abs() < 1e-3);
        assert!(!ap.slot(0).unwrap().is_corrupted());

        // B's power is chosen so A's total noise becomes -81.3 dB, i.e. SNR 15 dB.
        let b_linear = db_to_linear(-81.3) - db_to_linear(-91.3);
        let b_power = linear_to_db(b_linear) + 86.3;
        ap.process(&Event::data_start(1, 0, b_power, 1)).unwrap();

        assert!((ap.uplink_snr_db(0).unwrap().unwrap() - 15.0).abs() < 0.01);
        assert!(ap.slot(0).unwrap().is_corrupted());
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::NoAck));
        assert_eq!(ap.received_count(0), 0);
    }

    #[test]
    fn strong_late_arrival_can_still_ack() {
        let a = Point::new(36.3, 0.0);
        let b = Point::new(0.0, 10.0);
        let mut ap = arbiter(&[a, b], Linear);

        ap.process(&Event::data_start(0, 4, 20.0, 1)).unwrap();
        assert!(!ap.slot(0).unwrap().is_corrupted());
        ap.process(&Event::data_start(1, 9, 20.0, 1)).unwrap();

        assert!(ap.slot(0).unwrap().is_corrupted());
        assert!(!ap.slot(1).unwrap().is_corrupted());
        assert_eq!(ap.process(&Event::data_done(1)).unwrap(), Some(Reply::Ack));
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::NoAck));
        assert_eq!(ap.received_log(1), &[9]);
    }

    #[test]
    fn corruption_survives_interferer_leaving() {
        let mut ap = arbiter(&[Point::new(36.3, 0.0), Point::new(0.0, 10.0), Point::new(0.0, 30.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        ap.process(&Event::data_start(1, 0, 20.0, 1)).unwrap();
        assert!(ap.slot(0).unwrap().is_corrupted());

        // Interferer finishes; a third START triggers another evaluation of A.
        ap.process(&Event::data_done(1)).unwrap();
        ap.process(&Event::data_start(2, 0, -30.0, 1)).unwrap();
        assert!(ap.slot(0).unwrap().is_corrupted());
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::NoAck));
    }

    #[test]
    fn other_channels_do_not_interfere() {
        let mut ap = arbiter(&[Point::new(36.3, 0.0), Point::new(0.0, 10.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        ap.process(&Event::data_start(1, 0, 20.0, 6)).unwrap();

        assert!((ap.uplink_snr_db(0).unwrap().unwrap() - 25.0).abs() < 1e-3);
        assert_eq!(ap.process(&Event::sense(0, 1)).unwrap(), Some(Reply::ChannelInactive));
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::Ack));
        assert_eq!(ap.process(&Event::data_done(1)).unwrap(), Some(Reply::Ack));
    }

    #[test]
    fn own_transmission_is_not_noise() {
        let mut ap = arbiter(&[Point::new(1.0, 0.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 2)).unwrap();
        assert!(ap.noise_rise_at_station_db(0, 2).unwrap().abs() < 1e-4);
        assert_eq!(ap.process(&Event::sense(0, 2)).unwrap(), Some(Reply::ChannelInactive));
    }

    #[test]
    fn sense_hears_nearby_transmitter() {
        // Listener 5 units from a 0 dB transmitter: -55 dB against a -91.3 dB floor.
        let mut ap = arbiter(&[Point::new(20.0, 0.0), Point::new(25.0, 0.0)], Linear);
        assert_eq!(ap.process(&Event::sense(0, 1)).unwrap(), Some(Reply::ChannelInactive));
        ap.process(&Event::data_start(1, 0, 0.0, 1)).unwrap();
        assert!((ap.noise_rise_at_station_db(0, 1).unwrap() - 36.3).abs() < 0.01);
        assert_eq!(ap.process(&Event::sense(0, 1)).unwrap(), Some(Reply::ChannelActive));
        assert_eq!(ap.process(&Event::sense(0, 2)).unwrap(), Some(Reply::ChannelInactive));
    }

    #[test]
    fn sense_uses_distance_between_stations() {
        // Both are far from the AP but close to each other; only their mutual distance matters.
        let mut ap = arbiter(&[Point::new(500.0, 0.0), Point::new(501.0, 0.0)], Linear);
        ap.process(&Event::data_start(1, 0, -30.0, 1)).unwrap();
        // -30 - 51 = -81 dB, about 10.7 dB above the floor.
        assert_eq!(ap.process(&Event::sense(0, 1)).unwrap(), Some(Reply::ChannelActive));
    }

    #[test]
    fn second_start_is_fatal() {
        let mut ap = arbiter(&[Point::new(1.0, 1.0)], Linear);
        ap.process(&Event::data_start(0, 0, 10.0, 1)).unwrap();
        assert_eq!(
            violation(ap.process(&Event::data_start(0, 1, 10.0, 1))),
            InvariantViolation::DuplicateStart { station: 0 }
        );
    }

    #[test]
    fn done_without_start_is_fatal() {
        let mut ap = arbiter(&[Point::new(1.0, 1.0)], Linear);
        assert_eq!(violation(ap.process(&Event::data_done(0))), InvariantViolation::DoneWithoutStart { station: 0 });
    }

    #[test]
    fn unknown_station_and_bad_channel_are_fatal() {
        let mut ap = arbiter(&[Point::new(1.0, 1.0)], Linear);
        assert_eq!(violation(ap.process(&Event::sense(3, 1))), InvariantViolation::UnknownStation { station: 3 });
        assert_eq!(
            violation(ap.process(&Event::data_start(0, 0, 1.0, 0))),
            InvariantViolation::ChannelOutOfRange { station: 0, channel: 0 }
        );
        assert_eq!(
            violation(ap.process(&Event::sense(0, 12))),
            InvariantViolation::ChannelOutOfRange { station: 0, channel: 12 }
        );
        assert_eq!(ap.stats().senses, 0);
    }

    #[test]
    fn noise_rise_for_unknown_station_is_a_violation() {
        let ap = arbiter(&[Point::new(1.0, 1.0)], Linear);
        assert_eq!(
            ap.noise_rise_at_station_db(4, 1),
            Err(CoordinatorError::Violation(InvariantViolation::UnknownStation { station: 4 }))
        );
    }

    #[test]
    fn done_always_resets_slot() {
        let mut ap = arbiter(&[Point::new(36.3, 0.0), Point::new(0.0, 10.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        ap.process(&Event::data_start(1, 0, 20.0, 1)).unwrap();
        assert!(ap.slot(0).unwrap().is_corrupted());

        ap.process(&Event::data_done(0)).unwrap();
        ap.process(&Event::data_done(1)).unwrap();
        for station in 0..2 {
            assert_eq!(ap.slot(station), Some(&TransmissionSlot::Idle));
            assert!(!ap.slot(station).unwrap().is_corrupted());
        }

        // A clean retry after the reset is delivered.
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        assert_eq!(ap.process(&Event::data_done(0)).unwrap(), Some(Reply::Ack));
    }

    #[test]
    fn logs_grow_by_at_most_one_per_done() {
        let mut ap = arbiter(&[Point::new(10.0, 0.0), Point::new(0.0, 12.0)], Linear);
        let script = [
            Event::data_start(0, 0, 20.0, 1),
            Event::sense(1, 1),
            Event::data_start(1, 0, 20.0, 1),
            Event::data_done(0),
            Event::data_done(1),
            Event::data_start(1, 1, 20.0, 4),
            Event::data_done(1),
        ];
        let mut previous = [0usize; 2];
        for event in &script {
            ap.process(event).unwrap();
            for station in 0..2u32 {
                let now = ap.received_count(station);
                assert!(now >= previous[station as usize]);
                let allowed = usize::from(*event == Event::data_done(station));
                assert!(now - previous[station as usize] <= allowed);
                previous[station as usize] = now;
            }
        }
        assert_eq!(ap.stats().events, script.len() as u64);
        assert_eq!(ap.stats().transmissions, 3);
    }

    #[test]
    fn target_is_reached_only_when_every_station_has_it() {
        let mut ap = arbiter(&[Point::new(1.0, 0.0), Point::new(0.0, 1.0)], Linear);
        ap.process(&Event::data_start(0, 0, 20.0, 1)).unwrap();
        ap.process(&Event::data_done(0)).unwrap();
        assert!(!ap.all_reached(1));
        ap.process(&Event::data_start(1, 0, 20.0, 1)).unwrap();
        ap.process(&Event::data_done(1)).unwrap();
        assert!(ap.all_reached(1));
        assert!(!ap.all_reached(2));
    }
}
