// Host polling loop with a link watchdog
// Note: the watchdog reports the link stale when no complete poll of the rover
// has succeeded for LINK_TIMEOUT, e.g. the USB cable was pulled or the master rebooted

use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::boards::Rover;
use crate::config::{LINK_TIMEOUT, LinkConfig};
use crate::messages::{LinkHealth, RoverSnapshot};
use crate::protocol::{LinkError, SerialTransport, SimulatedRover, Transport};

pub struct Runtime {
    last_ok: Instant,
    health: LinkHealth,
    /// Read sets must be (re)declared before the next poll
    needs_setup: bool,
    timeout: Duration,
}

impl Runtime {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_ok: Instant::now(),
            health: LinkHealth::Stale, // Stale until the first poll
            needs_setup: true,
            timeout,
        }
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    /// Declare read sets and clear boot faults if the link was (re)started
    fn setup<T: Transport>(&mut self, rover: &mut Rover<T>) -> Result<(), LinkError> {
        if !self.needs_setup {
            return Ok(());
        }
        rover.declare_read_sets()?;
        rover.reset_faults()?;
        info!("Read sets declared, boot faults cleared");
        self.needs_setup = false;
        Ok(())
    }

    /// One poll: set up if needed, then read every board. Timeouts clear the
    /// bus and schedule a fresh setup; the watchdog decides the health.
    pub fn poll<T: Transport>(&mut self, rover: &mut Rover<T>) -> Option<RoverSnapshot> {
        let result = self.setup(rover).and_then(|()| rover.poll());
        match result {
            Ok(mut snapshot) => {
                if self.health != LinkHealth::Ok {
                    info!("Link up");
                }
                self.last_ok = Instant::now();
                self.health = LinkHealth::Ok;
                snapshot.health = LinkHealth::Ok;
                return Some(snapshot);
            }
            Err(e) if e.is_timeout() => {
                warn!("Poll timed out: {}", e);
                if let Err(e) = rover.bus_mut().clear_timeout() {
                    error!("Failed to clear the link: {}", e);
                }
                self.needs_setup = true;
            }
            Err(e) => warn!("Poll failed: {}", e),
        }
        self.check_watchdog();
        None
    }

    fn check_watchdog(&mut self) {
        let age = self.last_ok.elapsed();
        if age >= self.timeout {
            if self.health != LinkHealth::Stale {
                warn!("Link stale ({:?} since last poll)", age);
            }
            self.health = LinkHealth::Stale;
        }
    }
}

pub async fn run(config: LinkConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if config.simulate {
        info!("Using the simulated rover");
        let sim = SimulatedRover::new(&config.drive_steer, &config.lift);
        return run_with(sim, &config).await;
    }
    info!("Connecting to master on {}...", config.port);
    let transport = SerialTransport::connect(&config.port, config.baud)?;
    run_with(transport, &config).await
}

async fn run_with<T: Transport>(
    transport: T,
    config: &LinkConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut rover = Rover::new(transport, config);
    let mut runtime = Runtime::new(LINK_TIMEOUT);
    let mut tick = interval(config.poll_period());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Runtime started: {}Hz loop, {}ms link timeout, {} drive/steer and {} lift boards",
        config.loop_hz,
        LINK_TIMEOUT.as_millis(),
        config.drive_steer.len(),
        config.lift.len()
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {
                // the bus is blocking; one transaction at a time
                match runtime.poll(&mut rover) {
                    Some(snapshot) => info!("{}", serde_json::to_string(&snapshot)?),
                    None => debug!("No snapshot this tick, link {:?}", runtime.health()),
                }
            }
            res = &mut ctrl_c => {
                res?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }
    Ok(())
}
