//! Health watchdog
//!
//! Periodically checks that the target receiver is attached and that
//! sentences flow through the daemon. A present but silent receiver triggers
//! a full reset (stop, then re-acquire); an absent receiver is only logged,
//! since no restart can bring back unplugged hardware.
//!
//! ```text
//! present | flowing | in cooldown | decision
//! --------+---------+-------------+-----------------
//!   no    |    -    |      -      | Absent (wait)
//!   yes   |   yes   |      -      | Healthy
//!   yes   |   no    |     no      | Reset
//!   yes   |   no    |     yes     | Suppressed
//! ```

use crate::acquisition::{AcquisitionController, AcquisitionError};
use crate::config::WatchdogSettings;
use crate::daemon::{DaemonControl, DaemonHandle};
use crate::probe::DataFlowProbe;
use crate::service;
use crate::shutdown::ShutdownSignal;
use crate::usb::DescriptorResolver;
use common::TargetSignature;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// One health observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub device_present: bool,
    pub data_flowing: bool,
    pub daemon_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No matching hardware; nothing to do until it returns
    Absent,
    Healthy,
    /// Hardware present but silent; stop and re-acquire
    Reset,
    /// A reset is warranted but one happened too recently
    Suppressed,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Absent => write!(f, "absent"),
            Decision::Healthy => write!(f, "healthy"),
            Decision::Reset => write!(f, "reset"),
            Decision::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// Map an observation to a decision
pub fn decide(observation: Observation, in_cooldown: bool) -> Decision {
    match (observation.device_present, observation.data_flowing) {
        (false, _) => Decision::Absent,
        (true, true) => Decision::Healthy,
        (true, false) if in_cooldown => Decision::Suppressed,
        (true, false) => Decision::Reset,
    }
}

/// A reset that did not bring data back
#[derive(Debug, Error)]
#[error("watchdog reset failed ({consecutive} in a row): {source}")]
pub struct WatchdogResetFailure {
    pub consecutive: u32,
    #[source]
    pub source: AcquisitionError,
}

pub struct Watchdog<R, D, P> {
    controller: AcquisitionController<R, D, P>,
    settings: WatchdogSettings,
    cooldown_until: Option<Instant>,
    last_present: Option<bool>,
    consecutive_failures: u32,
    resets: u32,
    current: Option<DaemonHandle>,
}

impl<R, D, P> Watchdog<R, D, P>
where
    R: DescriptorResolver,
    D: DaemonControl,
    P: DataFlowProbe,
{
    pub fn new(controller: AcquisitionController<R, D, P>, settings: WatchdogSettings) -> Self {
        Self {
            controller,
            settings,
            cooldown_until: None,
            last_present: None,
            consecutive_failures: 0,
            resets: 0,
            current: None,
        }
    }

    /// Start from an already acquired binding
    pub fn with_handle(mut self, handle: DaemonHandle) -> Self {
        self.current = Some(handle);
        self
    }

    pub fn controller(&self) -> &AcquisitionController<R, D, P> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut AcquisitionController<R, D, P> {
        &mut self.controller
    }

    pub fn current_handle(&self) -> Option<&DaemonHandle> {
        self.current.as_ref()
    }

    /// Resets triggered so far
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Check the hardware and, when present, the sentence stream
    pub async fn observe(&mut self, signature: &TargetSignature) -> Observation {
        let device_present = self.controller.locator().locate(signature).is_some();
        self.log_presence_edge(signature, device_present);

        let daemon_running = self.controller.daemon_mut().is_running();
        let data_flowing = if device_present {
            match self
                .controller
                .probe()
                .observe(self.settings.probe_window())
                .await
            {
                Ok(sample) => {
                    debug!("Probe saw {} sentence(s)", sample.sentences);
                    sample.is_flowing()
                }
                Err(e) => {
                    debug!("Probe failed: {}", e);
                    false
                }
            }
        } else {
            false
        };

        if device_present && !daemon_running {
            warn!("Daemon is not running while {} is attached", signature);
        }

        Observation {
            device_present,
            data_flowing,
            daemon_running,
        }
    }

    /// Apply the decision for `observation` made at `now`.
    ///
    /// A reset runs to completion before this returns.
    pub async fn evaluate(
        &mut self,
        signature: &TargetSignature,
        observation: Observation,
        now: Instant,
    ) -> Decision {
        let decision = decide(observation, self.in_cooldown(now));

        match decision {
            Decision::Absent => {
                info!("No device matching {}, waiting", signature);
                service::report_status(&format!("Waiting for {}", signature));
            }
            Decision::Healthy => {
                debug!("Healthy: data flowing from {}", signature);
                self.consecutive_failures = 0;
            }
            Decision::Suppressed => {
                let remaining = self
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);
                warn!(
                    "No data from {} but reset cooldown active ({:?} left)",
                    signature, remaining
                );
            }
            Decision::Reset => {
                self.cooldown_until = Some(now + self.settings.reset_cooldown());
                self.reset(signature).await;
            }
        }

        decision
    }

    /// One full observe-and-act cycle
    pub async fn check(&mut self, signature: &TargetSignature) -> Decision {
        let observation = self.observe(signature).await;
        self.evaluate(signature, observation, Instant::now()).await
    }

    async fn reset(&mut self, signature: &TargetSignature) {
        self.resets += 1;
        warn!(
            "{} present but no data flowing, resetting (reset #{})",
            signature, self.resets
        );
        service::report_status(&format!("Resetting {}", signature));

        let policy = self
            .controller
            .policy()
            .with_max_attempts(self.settings.reset_attempts);
        // A reset in flight is never abandoned halfway
        let outcome = self
            .controller
            .reset(signature, policy, &ShutdownSignal::never())
            .await;

        match outcome {
            Ok(handle) => self.restored(handle),
            // Consumers miss the update, but the daemon is bound and flowing
            Err(AcquisitionError::Handoff { handle, reason }) => {
                error!("Reset bound {} but hand-off failed: {}", handle, reason);
                self.restored(handle);
            }
            Err(source) => {
                self.consecutive_failures += 1;
                self.current = None;
                let failure = WatchdogResetFailure {
                    consecutive: self.consecutive_failures,
                    source,
                };
                if self.consecutive_failures >= self.settings.failure_alert_threshold {
                    error!("{}", failure);
                } else {
                    warn!("{}", failure);
                }
            }
        }
    }

    fn restored(&mut self, handle: DaemonHandle) {
        info!("Reset restored data flow: {}", handle);
        service::report_status(&format!("Active on {}", handle.device.display()));
        self.consecutive_failures = 0;
        self.current = Some(handle);
    }

    fn log_presence_edge(&mut self, signature: &TargetSignature, present: bool) {
        match (self.last_present, present) {
            (Some(false), true) => info!("{} attached", signature),
            (Some(true), false) => warn!("{} detached", signature),
            (None, false) => info!("{} not attached", signature),
            _ => {}
        }
        self.last_present = Some(present);
    }

    /// Check forever at the configured interval until `shutdown` fires.
    ///
    /// After a reset the next check waits out the cooldown instead of the
    /// normal interval. A check that already started finishes first.
    pub async fn run(&mut self, signature: &TargetSignature, shutdown: &ShutdownSignal) {
        info!(
            "Watchdog started: interval {:?}, cooldown {:?}",
            self.settings.check_interval(),
            self.settings.reset_cooldown()
        );

        let mut wait = self.settings.check_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }

            wait = match self.check(signature).await {
                Decision::Reset => self.settings.reset_cooldown(),
                _ => self.settings.check_interval(),
            };
        }

        info!("Watchdog stopped after {} reset(s)", self.resets);
    }
}
