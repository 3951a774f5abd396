//! Access point event loop.
//!
//! The coordinator is the only consumer of the shared event queue. It reads one
//! event, lets the `Arbiter` apply it, delivers the reply (if any) on the
//! station's private queue and checks the termination condition before it
//! reads the next event. Between events it is parked on the queue.

use super::arbiter::{Arbiter, ArbiterStats, RadioThresholds};
use super::error::{CoordinatorError, InvariantViolation};
use super::signal_calculations::PropagationModel;
use super::types::{Event, EventQueueReceiver, PacketId, Point, ReplyQueueSender, StationId};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Delivered packets per station, indexed by station id.
    pub received: Vec<usize>,
    pub stats: ArbiterStats,
}

impl RunReport {
    pub fn total_received(&self) -> usize {
        self.received.iter().sum()
    }

    /// Share of finished transmissions that were acknowledged.
    pub fn delivery_ratio(&self) -> f64 {
        let finished = self.stats.acks + self.stats.noacks;
        if finished == 0 {
            return 0.0;
        }
        self.stats.acks as f64 / finished as f64
    }
}

pub struct Coordinator<'a, P: PropagationModel> {
    arbiter: Arbiter<P>,
    events: EventQueueReceiver<'a>,
    replies: Vec<ReplyQueueSender<'a>>,
}

impl<'a, P: PropagationModel> Coordinator<'a, P> {
    /// `replies[i]` must be the reply queue of the station at `locations[i]`.
    /// A reply owed to a station without a queue aborts the run.
    pub fn new(
        locations: Vec<Point>,
        model: P,
        thresholds: RadioThresholds,
        events: EventQueueReceiver<'a>,
        replies: Vec<ReplyQueueSender<'a>>,
    ) -> Self {
        Self {
            arbiter: Arbiter::new(locations, model, thresholds),
            events,
            replies,
        }
    }

    pub fn received_count(&self, station: StationId) -> usize {
        self.arbiter.received_count(station)
    }

    pub fn received_log(&self, station: StationId) -> &[PacketId] {
        self.arbiter.received_log(station)
    }

    /// Processes events until every station has `target` packets delivered.
    ///
    /// Returns early with an error on the first invariant violation; the
    /// arbitration state cannot be trusted afterwards.
    pub async fn run(&mut self, target: usize) -> Result<RunReport, CoordinatorError> {
        while !self.arbiter.all_reached(target) {
            let event = self.events.receive().await;
            if let Err(err) = self.handle(&event) {
                log::error!("AP: aborting on {:?}: {}", event, err);
                return Err(err);
            }
        }

        Ok(self.report())
    }

    fn handle(&mut self, event: &Event) -> Result<(), CoordinatorError> {
        if log::log_enabled!(log::Level::Trace) {
            if let Ok(wire) = serde_json::to_string(event) {
                log::trace!("AP <- {}", wire);
            }
        }

        let Some(reply) = self.arbiter.process(event)? else {
            return Ok(());
        };
        let station = event.station_id;
        let Some(replies) = self.replies.get(station as usize) else {
            return Err(InvariantViolation::UnknownStation { station }.into());
        };
        replies.try_send(reply).map_err(|_| InvariantViolation::ReplyQueueFull { station })?;
        Ok(())
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            received: (0..self.arbiter.station_count() as StationId).map(|id| self.arbiter.received_count(id)).collect(),
            stats: self.arbiter.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::clock::{Clock, VirtualClock};
    use crate::simulation::mac::{CsmaMac, CsmaParameters, MacPolicy, NullMac};
    use crate::simulation::signal_calculations::{Fixed, FreeSpace};
    use crate::simulation::station::{Station, StationTiming};
    use crate::simulation::types::{EventQueue, Reply, ReplyQueue};
    use embassy_futures::select::{Either, select};
    use embassy_futures::{block_on, yield_now};
    use embassy_time::Duration;
    use futures::future::join_all;

    fn coordinator<'a>(locations: Vec<Point>, events: &'a EventQueue, replies: &'a [ReplyQueue]) -> Coordinator<'a, Fixed> {
        Coordinator::new(
            locations,
            Fixed { loss_db: 40.0 },
            RadioThresholds::default(),
            events.receiver(),
            replies.iter().map(ReplyQueue::sender).collect(),
        )
    }

    /// Polls `run` until it finishes or has drained everything already queued.
    fn drive(run: impl Future<Output = Result<RunReport, CoordinatorError>>) -> Option<Result<RunReport, CoordinatorError>> {
        let idle = async {
            for _ in 0..64 {
                yield_now().await;
            }
        };
        match block_on(select(run, idle)) {
            Either::First(result) => Some(result),
            Either::Second(()) => None,
        }
    }

    #[test]
    fn zero_target_returns_without_reading() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0)], &events, &replies);

        events.try_send(Event::sense(0, 1)).unwrap();
        let report = drive(coordinator.run(0)).unwrap().unwrap();
        assert_eq!(report.received, vec![0]);
        assert_eq!(report.stats.events, 0);
        assert!(events.try_receive().is_ok());
    }

    #[test]
    fn replies_go_to_the_requesting_station_only() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new(), ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0), Point::new(2.0, 0.0)], &events, &replies);

        events.try_send(Event::sense(1, 1)).unwrap();
        events.try_send(Event::data_start(0, 0, 10.0, 1)).unwrap();
        events.try_send(Event::data_done(0)).unwrap();
        // Station 1 never transmits, so the run stays pending.
        assert!(drive(coordinator.run(1)).is_none());

        assert_eq!(replies[1].try_receive().ok(), Some(Reply::ChannelInactive));
        assert_eq!(replies[0].try_receive().ok(), Some(Reply::Ack));
        assert!(replies[0].try_receive().is_err());
        assert_eq!(coordinator.received_count(0), 1);
        assert_eq!(coordinator.received_log(0), &[0]);
    }

    #[test]
    fn overflowing_reply_queue_aborts_the_run() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0)], &events, &replies);

        // Nobody reads the first answer before the second is due.
        events.try_send(Event::sense(0, 1)).unwrap();
        events.try_send(Event::sense(0, 1)).unwrap();
        assert_eq!(
            drive(coordinator.run(1)),
            Some(Err(CoordinatorError::Violation(InvariantViolation::ReplyQueueFull { station: 0 })))
        );
    }

    #[test]
    fn station_without_reply_queue_aborts_the_run() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0), Point::new(2.0, 0.0)], &events, &replies);

        events.try_send(Event::sense(1, 1)).unwrap();
        assert_eq!(
            drive(coordinator.run(1)),
            Some(Err(CoordinatorError::Violation(InvariantViolation::UnknownStation { station: 1 })))
        );
    }

    #[test]
    fn duplicate_start_aborts_the_run() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0)], &events, &replies);

        events.try_send(Event::data_start(0, 0, 10.0, 1)).unwrap();
        events.try_send(Event::data_start(0, 1, 10.0, 1)).unwrap();
        assert_eq!(
            drive(coordinator.run(1)),
            Some(Err(CoordinatorError::Violation(InvariantViolation::DuplicateStart { station: 0 })))
        );
    }

    #[test]
    fn run_stops_exactly_at_target() {
        let events = EventQueue::new();
        let replies = [ReplyQueue::new()];
        let mut coordinator = coordinator(vec![Point::new(1.0, 0.0)], &events, &replies);

        let station = async {
            for packet in 0..2 {
                events.send(Event::data_start(0, packet, 10.0, 1)).await;
                events.send(Event::data_done(0)).await;
                if packet == 1 {
                    events.send(Event::data_start(0, 2, 10.0, 1)).await;
                }
                replies[0].receive().await;
            }
        };
        let report = match block_on(select(coordinator.run(2), station)) {
            Either::First(report) => report.unwrap(),
            Either::Second(()) => panic!("coordinator kept running past the target"),
        };
        assert_eq!(report.received, vec![2]);
        // The third packet is still queued.
        assert_eq!(events.try_receive().ok(), Some(Event::data_start(0, 2, 10.0, 1)));
    }

    const CADENCE_MS: u64 = 100;

    /// Runs every station under `mac` on a virtual clock until `target` is met.
    /// Starts are staggered over one cadence.
    fn simulate<M: MacPolicy + Clone>(locations: Vec<Point>, mac: M, target: usize) -> (RunReport, u64) {
        let clock = VirtualClock::new();
        let events = EventQueue::new();
        let replies: Vec<ReplyQueue> = locations.iter().map(|_| ReplyQueue::new()).collect();

        let mut stations: Vec<Station<'_, VirtualClock>> = locations
            .iter()
            .zip(&replies)
            .enumerate()
            .map(|(id, (location, reply))| {
                Station::new(
                    id as StationId,
                    *location,
                    StationTiming::with_cadence(Duration::from_millis(CADENCE_MS)),
                    42 + id as u64,
                    &clock,
                    events.sender(),
                    reply.receiver(),
                )
            })
            .collect();
        let mut coordinator = Coordinator::new(
            locations.clone(),
            FreeSpace::default(),
            RadioThresholds::default(),
            events.receiver(),
            replies.iter().map(ReplyQueue::sender).collect(),
        );

        let stagger = Duration::from_millis(CADENCE_MS / stations.len() as u64);
        let mut macs = vec![mac; stations.len()];
        let clock = &clock;
        let actors = join_all(stations.iter_mut().zip(macs.iter_mut()).enumerate().map(|(i, (station, mac))| async move {
            clock.sleep(stagger * i as u32).await;
            mac.run(station).await
        }));

        let report = match block_on(select(coordinator.run(target), actors)) {
            Either::First(result) => result.unwrap(),
            Either::Second(results) => panic!("stations stopped before the target: {results:?}"),
        };
        (report, clock.now().as_millis())
    }

    #[test]
    fn null_mac_stations_reach_target() {
        let locations = vec![Point::new(3.0, 4.0), Point::new(-6.0, 8.0), Point::new(10.0, -2.0)];
        let (report, elapsed_ms) = simulate(locations, NullMac::default(), 5);

        assert!(report.received.iter().all(|&count| count >= 5));
        assert!(report.received.contains(&5));
        assert_eq!(report.stats.acks as usize, report.total_received());
        assert!(elapsed_ms >= 4 * CADENCE_MS * 9 / 10);
    }

    #[test]
    fn csma_stations_reach_target() {
        let locations = vec![Point::new(1.0, 1.0), Point::new(2.0, 2.0), Point::new(-3.0, 1.0), Point::new(0.5, -4.0)];
        let (report, _) = simulate(locations, CsmaMac::new(CsmaParameters::default()), 4);

        assert!(report.received.iter().all(|&count| count >= 4));
        assert!(report.stats.senses > 0);
        assert!(report.delivery_ratio() > 0.0);
    }

    #[test]
    fn delivery_ratio_handles_empty_run() {
        let report = RunReport {
            received: vec![0, 0],
            stats: ArbiterStats::default(),
        };
        assert_eq!(report.delivery_ratio(), 0.0);
        assert_eq!(report.total_received(), 0);
    }
}
