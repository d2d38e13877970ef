//! # Simulation Controller
//!
//! Start/stop/status lifecycle around [`Simulation`]. `start` validates
//! the configuration, builds the engine, and spawns a background thread
//! that runs rounds until stopped; `stop` joins the thread, drains all
//! pending deliveries and unloads the engine; `status` serializes a
//! snapshot at any time. `stop` is idempotent and `start` on a running
//! controller fails with [`SimError::AlreadyRunning`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::{Simulation, StatusSnapshot};
use crate::{SimConfig, SimError, SimResult};

struct Shared {
    sim: Mutex<Option<Simulation>>,
    running: AtomicBool,
}

pub struct SimulationController {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    /// Wall-clock pause between rounds, keeping the lock available to
    /// `status` calls while the loop runs.
    pacing: Duration,
}

impl Default for SimulationController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                sim: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            handle: None,
            pacing: Duration::from_millis(10),
        }
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Validate the configuration, load a fresh simulation, and start
    /// the round loop.
    pub fn start(&mut self, config: SimConfig) -> SimResult<()> {
        if self.is_running() {
            return Err(SimError::AlreadyRunning);
        }
        let sim = Simulation::new(config)?;
        {
            let mut guard = self.lock_sim();
            *guard = Some(sim);
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let pacing = self.pacing;
        self.handle = Some(std::thread::spawn(move || {
            tracing::info!("simulation loop started");
            while shared.running.load(Ordering::SeqCst) {
                let mut guard = match shared.sim.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let Some(sim) = guard.as_mut() else {
                    break;
                };
                match sim.run_round() {
                    Ok(outcome) => {
                        tracing::trace!(?outcome, "round complete");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "round failed, stopping loop");
                        shared.running.store(false, Ordering::SeqCst);
                    }
                }
                drop(guard);
                if !pacing.is_zero() {
                    std::thread::sleep(pacing);
                }
            }
            tracing::info!("simulation loop stopped");
        }));
        Ok(())
    }

    /// Stop the loop, drain pending deliveries, and unload the engine.
    /// Safe to call repeatedly; later calls are no-ops.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("simulation loop panicked before stop");
            }
        }
        let mut guard = self.lock_sim();
        if let Some(sim) = guard.as_mut() {
            sim.clear_pending();
        }
        *guard = None;
    }

    /// Snapshot of the loaded simulation, or an idle snapshot when
    /// nothing is loaded.
    pub fn status(&self) -> StatusSnapshot {
        let guard = self.lock_sim();
        match guard.as_ref() {
            Some(sim) => sim.status_snapshot(self.is_running()),
            None => StatusSnapshot::idle(),
        }
    }

    /// Change the base network delay of the running simulation.
    pub fn set_delay(&self, secs: f64) -> SimResult<()> {
        let mut guard = self.lock_sim();
        match guard.as_mut() {
            Some(sim) => sim.set_delay(secs),
            None => Err(SimError::NotRunning),
        }
    }

    fn lock_sim(&self) -> std::sync::MutexGuard<'_, Option<Simulation>> {
        match self.shared.sim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        self.stop();
    }
}
