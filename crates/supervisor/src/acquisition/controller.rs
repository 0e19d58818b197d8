//! Acquisition controller

use super::retry::RetryPolicy;
use super::state::{AcquisitionState, AttemptTracker, InvalidTransition};
use crate::daemon::{BindFailure, DaemonControl, DaemonHandle};
use crate::handoff::HandoffPublisher;
use crate::probe::DataFlowProbe;
use crate::shutdown::ShutdownSignal;
use crate::usb::{DescriptorResolver, DeviceLocator, LocateOutcome};
use common::{CandidateDevice, TargetSignature};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Data never arrived within the verification window
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no data from {} within {window:?}: {reason}", .device.display())]
pub struct VerificationFailure {
    pub device: PathBuf,
    pub window: Duration,
    pub reason: String,
}

/// Why a single attempt ended in `Failed`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error("no device matching {0}")]
    NotFound(TargetSignature),

    #[error(transparent)]
    Bind(#[from] BindFailure),

    #[error(transparent)]
    Verification(#[from] VerificationFailure),

    #[error("attempt cancelled")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("acquisition exhausted after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        /// Matching hardware was located in at least one attempt
        hardware_seen: bool,
        last: AttemptFailure,
    },

    #[error("acquisition cancelled")]
    Cancelled,

    /// The daemon is bound and verified but consumers were not told
    #[error("acquired {handle} but the hand-off file was not written: {reason}")]
    Handoff { handle: DaemonHandle, reason: String },
}

impl AcquisitionError {
    /// Process exit status for one-shot mode.
    ///
    /// 2 when no matching hardware was ever seen, 3 when hardware was seen
    /// but never bound and verified, 4 on cancellation, 5 when the binding
    /// could not be published.
    pub fn exit_code(&self) -> u8 {
        match self {
            AcquisitionError::Exhausted {
                hardware_seen: false,
                ..
            } => 2,
            AcquisitionError::Exhausted { .. } => 3,
            AcquisitionError::Cancelled => 4,
            AcquisitionError::Handoff { .. } => 5,
        }
    }

    /// The live binding, when acquisition itself succeeded
    pub fn bound_handle(&self) -> Option<&DaemonHandle> {
        match self {
            AcquisitionError::Handoff { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// Outcome of one attempt, kept for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt: u32,
    pub states: Vec<AcquisitionState>,
    pub device: Option<CandidateDevice>,
    /// Device matched the target signature (not a fallback node)
    pub verified_device: bool,
    pub failure: Option<AttemptFailure>,
}

/// Drives `Searching → Binding → Verifying → Active` with bounded retries.
pub struct AcquisitionController<R, D, P> {
    locator: DeviceLocator<R>,
    daemon: D,
    probe: P,
    policy: RetryPolicy,
    verify_window: Duration,
    handoff: Option<HandoffPublisher>,
    reports: Vec<AttemptReport>,
}

impl<R, D, P> AcquisitionController<R, D, P>
where
    R: DescriptorResolver,
    D: DaemonControl,
    P: DataFlowProbe,
{
    pub fn new(
        locator: DeviceLocator<R>,
        daemon: D,
        probe: P,
        policy: RetryPolicy,
        verify_window: Duration,
    ) -> Self {
        Self {
            locator,
            daemon,
            probe,
            policy,
            verify_window,
            handoff: None,
            reports: Vec::new(),
        }
    }

    /// Publish every successful binding through `publisher`
    pub fn with_handoff(mut self, publisher: HandoffPublisher) -> Self {
        self.handoff = Some(publisher);
        self
    }

    pub fn locator(&self) -> &DeviceLocator<R> {
        &self.locator
    }

    pub fn daemon_mut(&mut self) -> &mut D {
        &mut self.daemon
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Reports of the most recent acquisition run, in attempt order
    pub fn reports(&self) -> &[AttemptReport] {
        &self.reports
    }

    /// Acquire with the configured retry policy
    pub async fn acquire(
        &mut self,
        signature: &TargetSignature,
        shutdown: &ShutdownSignal,
    ) -> Result<DaemonHandle, AcquisitionError> {
        let policy = self.policy;
        self.acquire_with(signature, policy, shutdown).await
    }

    /// Stop the current daemon, then acquire from scratch
    pub async fn reset(
        &mut self,
        signature: &TargetSignature,
        policy: RetryPolicy,
        shutdown: &ShutdownSignal,
    ) -> Result<DaemonHandle, AcquisitionError> {
        if let Err(e) = self.daemon.stop().await {
            warn!("Stopping daemon before reset failed: {}", e);
        }
        self.acquire_with(signature, policy, shutdown).await
    }

    /// Run up to `policy.max_attempts` attempts until one reaches `Active`.
    ///
    /// Cancellation is honored between steps and during backoff; an attempt
    /// interrupted mid-way is recorded as `Failed` and not retried.
    pub async fn acquire_with(
        &mut self,
        signature: &TargetSignature,
        policy: RetryPolicy,
        shutdown: &ShutdownSignal,
    ) -> Result<DaemonHandle, AcquisitionError> {
        self.reports.clear();
        let mut hardware_seen = false;
        let mut last = None;

        for attempt in 1..=policy.max_attempts {
            if shutdown.is_triggered() {
                return Err(AcquisitionError::Cancelled);
            }

            info!(
                "Acquisition attempt {}/{} for {}",
                attempt, policy.max_attempts, signature
            );

            let mut tracker = AttemptTracker::new(attempt);
            let mut device = None;
            let result = tokio::select! {
                result = self.attempt(signature, &mut tracker, &mut device) => result,
                _ = shutdown.cancelled() => Err(AttemptFailure::Cancelled),
            };

            match result {
                Ok(handle) => {
                    let verified_device = device.as_ref().is_some_and(|(_, verified)| *verified);
                    self.record(tracker, device, None);
                    info!("Acquired {}", handle);
                    if let Err(e) = self.publish(&handle, verified_device) {
                        error!("Failed to publish hand-off file: {:#}", e);
                        return Err(AcquisitionError::Handoff {
                            handle,
                            reason: format!("{:#}", e),
                        });
                    }
                    return Ok(handle);
                }
                Err(failure) => {
                    tracker.fail();
                    let verified = device.as_ref().map(|(_, verified)| *verified);
                    log_failure(attempt, &failure, verified);
                    // Only a node carrying the signature counts as the hardware
                    hardware_seen |= verified == Some(true);
                    self.record(tracker, device, Some(failure.clone()));

                    if matches!(failure, AttemptFailure::Cancelled) {
                        return Err(AcquisitionError::Cancelled);
                    }
                    last = Some(failure);
                }
            }

            if attempt < policy.max_attempts {
                let wait = policy.backoff_after(attempt);
                info!("Retrying in {:?}", wait);
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.cancelled() => return Err(AcquisitionError::Cancelled),
                }
            }
        }

        let attempts = policy.max_attempts;
        let last = last.unwrap_or(AttemptFailure::NotFound(signature.clone()));
        error!(
            "Acquisition exhausted after {} attempt(s), hardware {}: {}",
            attempts,
            if hardware_seen { "present" } else { "absent" },
            last
        );
        Err(AcquisitionError::Exhausted {
            attempts,
            hardware_seen,
            last,
        })
    }

    async fn attempt(
        &mut self,
        signature: &TargetSignature,
        tracker: &mut AttemptTracker,
        device: &mut Option<(CandidateDevice, bool)>,
    ) -> Result<DaemonHandle, AttemptFailure> {
        tracker.advance(AcquisitionState::Searching)?;
        let candidate = match self.locator.find(signature) {
            LocateOutcome::Verified(candidate) => {
                *device = Some((candidate.clone(), true));
                candidate
            }
            LocateOutcome::Unverified(candidate) => {
                warn!("Binding unverified device {}", candidate);
                *device = Some((candidate.clone(), false));
                candidate
            }
            LocateOutcome::NotFound => {
                return Err(AttemptFailure::NotFound(signature.clone()));
            }
        };

        tracker.advance(AcquisitionState::Binding)?;
        let handle = self.daemon.bind(candidate.path()).await?;

        tracker.advance(AcquisitionState::Verifying)?;
        let window = self.verify_window;
        let failed = |reason: String| VerificationFailure {
            device: candidate.path().to_path_buf(),
            window,
            reason,
        };
        let sample = self
            .probe
            .observe(window)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !sample.is_flowing() {
            return Err(failed(format!(
                "{} sentence(s) in {} byte(s), {} required",
                sample.sentences, sample.bytes, sample.required
            ))
            .into());
        }

        tracker.advance(AcquisitionState::Active)?;
        Ok(handle)
    }

    fn record(
        &mut self,
        tracker: AttemptTracker,
        device: Option<(CandidateDevice, bool)>,
        failure: Option<AttemptFailure>,
    ) {
        let verified_device = device.as_ref().is_some_and(|(_, verified)| *verified);
        self.reports.push(AttemptReport {
            attempt: tracker.attempt(),
            states: tracker.into_history(),
            device: device.map(|(candidate, _)| candidate),
            verified_device,
            failure,
        });
    }

    fn publish(&self, handle: &DaemonHandle, verified: bool) -> anyhow::Result<()> {
        match &self.handoff {
            Some(publisher) => publisher.publish(handle, verified),
            None => Ok(()),
        }
    }
}

/// `verified` is `None` when no node was picked, `Some(false)` for a
/// fallback node without the target signature.
fn log_failure(attempt: u32, failure: &AttemptFailure, verified: Option<bool>) {
    match failure {
        AttemptFailure::NotFound(_) => {
            warn!("Attempt {} failed, hardware absent: {}", attempt, failure)
        }
        AttemptFailure::Bind(_) | AttemptFailure::Verification(_) if verified == Some(false) => {
            warn!(
                "Attempt {} failed, hardware absent, fallback node broken: {}",
                attempt, failure
            )
        }
        AttemptFailure::Bind(_) | AttemptFailure::Verification(_) => {
            warn!("Attempt {} failed, hardware present: {}", attempt, failure)
        }
        AttemptFailure::Cancelled => info!("Attempt {} cancelled", attempt),
        AttemptFailure::Transition(_) => error!("Attempt {} aborted: {}", attempt, failure),
    }
}
