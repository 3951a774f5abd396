//! Simulation runner.
//!
//! Places the stations, wires up the transport, spawns one task per station
//! and runs the coordinator until every station has the requested number of
//! packets delivered. The process exits from here once the run is over.

use embassy_executor::Spawner;
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use crate::config::{Placement, SimulationConfig};

use super::clock::EmbassyClock;
use super::coordinator::Coordinator;
use super::mac::{CsmaMac, CsmaParameters, MacPolicy, MacProtocol, NullMac};
use super::station::Station;
use super::types::{EventQueue, MAX_STATION_COUNT, Point, ReplyQueue, StationId};

static CLOCK: EmbassyClock = EmbassyClock;

/// Draws one location per station inside the placement square, rounded to 0.1 m.
pub fn place_stations<R: Rng>(count: usize, placement: &Placement, rng: &mut R) -> Vec<Point> {
    let coordinate = Uniform::new_inclusive(placement.min, placement.max);
    let round = |v: f32| (v * 10.0).round() / 10.0;
    (0..count)
        .map(|_| Point::new(round(coordinate.sample(rng)), round(coordinate.sample(rng))))
        .collect()
}

#[embassy_executor::task(pool_size = MAX_STATION_COUNT)]
async fn station_task(mut station: Station<'static, EmbassyClock>, mac: MacProtocol, csma: CsmaParameters, start_delay: Duration) {
    Timer::after(start_delay).await;
    let location = station.location();
    log::debug!("Station id:{} at ({:.1}, {:.1}) starting with {:?}", station.id(), location.x, location.y, mac);

    let result = match mac {
        MacProtocol::Null => NullMac::default().run(&mut station).await,
        MacProtocol::Csma => CsmaMac::new(csma).run(&mut station).await,
    };
    if let Err(err) = result {
        log::error!("Station id:{} stopped: {}", station.id(), err);
        std::process::exit(1);
    }
}

/// Central task: sets up the run, drives the coordinator and reports.
#[embassy_executor::task]
pub async fn network_task(spawner: Spawner, config: SimulationConfig) {
    let seed = config.seed.unwrap_or_else(rand::random);
    log::info!(
        "Starting {} station(s) with {:?} MAC, {} packet(s)/s, target {} packet(s) each, seed {}",
        config.station_count,
        config.mac,
        config.packets_per_second,
        config.packets_to_receive,
        seed
    );

    let mut placement_rng = StdRng::seed_from_u64(seed);
    let locations = place_stations(config.station_count, &config.placement, &mut placement_rng);

    // INTENTIONAL LEAK: embassy tasks need 'static channels; they live until process exit.
    let events: &'static EventQueue = Box::leak(Box::new(EventQueue::new()));
    let mut reply_senders = Vec::with_capacity(locations.len());

    let timing = config.station_timing();
    let stagger = config.start_stagger();
    for (index, location) in locations.iter().enumerate() {
        let replies: &'static ReplyQueue = Box::leak(Box::new(ReplyQueue::new()));
        reply_senders.push(replies.sender());

        let id = index as StationId;
        let station = Station::new(
            id,
            *location,
            timing,
            seed.wrapping_add(id as u64),
            &CLOCK,
            events.sender(),
            replies.receiver(),
        );
        // Station count is validated against the task pool size.
        let _ = spawner.spawn(station_task(station, config.mac, config.csma.clone(), stagger * id));
    }

    let mut coordinator = Coordinator::new(locations, config.propagation.clone(), config.radio, events.receiver(), reply_senders);

    let started = Instant::now();
    match coordinator.run(config.packets_to_receive).await {
        Ok(report) => {
            let elapsed = started.elapsed();
            log::info!(
                "Target reached: {} packet(s) delivered, {} event(s), {} sense request(s) ({} busy), {} ACK / {} NOACK",
                report.total_received(),
                report.stats.events,
                report.stats.senses,
                report.stats.busy_senses,
                report.stats.acks,
                report.stats.noacks
            );
            log::info!(
                "Delivery ratio {:.1}%, simulated time {:.3} s (goal {:.3} s)",
                report.delivery_ratio() * 100.0,
                elapsed.as_micros() as f64 / 1e6,
                config.goal_time().as_micros() as f64 / 1e6
            );
            for (id, received) in report.received.iter().enumerate() {
                log::debug!("Station id:{} delivered {} packet(s)", id, received);
            }
            std::process::exit(0);
        }
        Err(err) => {
            log::error!("Simulation aborted: {}", err);
            std::process::exit(1);
        }
    }
}
