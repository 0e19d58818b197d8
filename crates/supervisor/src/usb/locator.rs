//! Device location
//!
//! Scans the configured candidate nodes in ascending order and returns the
//! first one whose USB descriptor matches the target signature.

use super::resolver::{DescriptorResolver, SysfsResolver};
use crate::config::DeviceSettings;
use common::{CandidateDevice, TargetSignature};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Policy applied when no candidate carries the target signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// No match means not found
    #[default]
    Strict,
    /// Bind to the lowest-numbered present node, reported as unverified
    FirstPresent,
}

/// Result of a policy-aware locate pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateOutcome {
    /// A candidate whose descriptor matches the signature
    Verified(CandidateDevice),
    /// No match; the fallback policy picked this node anyway
    Unverified(CandidateDevice),
    /// No candidate was usable
    NotFound,
}

impl LocateOutcome {
    pub fn device(&self) -> Option<&CandidateDevice> {
        match self {
            LocateOutcome::Verified(d) | LocateOutcome::Unverified(d) => Some(d),
            LocateOutcome::NotFound => None,
        }
    }
}

/// Candidate node namespace: `<prefix><first>` through `<prefix><last>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub prefix: String,
    pub first: u32,
    pub last: u32,
}

impl ScanRange {
    pub fn new(prefix: impl Into<String>, first: u32, last: u32) -> Self {
        Self {
            prefix: prefix.into(),
            first,
            last,
        }
    }

    /// Every node name in the range, ascending, whether present or not
    pub fn paths(&self) -> impl Iterator<Item = (u32, PathBuf)> + '_ {
        (self.first..=self.last).map(|i| (i, PathBuf::from(format!("{}{}", self.prefix, i))))
    }
}

pub struct DeviceLocator<R> {
    resolver: R,
    scan: ScanRange,
    fallback: FallbackPolicy,
}

impl DeviceLocator<SysfsResolver> {
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self::new(
            SysfsResolver::new(&settings.sysfs_root, settings.max_depth),
            ScanRange::new(
                settings.device_prefix.clone(),
                settings.scan_first,
                settings.scan_last,
            ),
            settings.fallback,
        )
    }
}

impl<R: DescriptorResolver> DeviceLocator<R> {
    pub fn new(resolver: R, scan: ScanRange, fallback: FallbackPolicy) -> Self {
        Self {
            resolver,
            scan,
            fallback,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn scan_range(&self) -> &ScanRange {
        &self.scan
    }

    /// Enumerate the candidate nodes that currently exist, ascending index
    pub fn candidates(&self) -> Vec<CandidateDevice> {
        self.scan
            .paths()
            .filter(|(_, path)| path.exists())
            .map(|(index, path)| CandidateDevice::new(path, index))
            .collect()
    }

    /// Strict locate over a fresh enumeration
    pub fn locate(&self, signature: &TargetSignature) -> Option<CandidateDevice> {
        self.locate_in(signature, &self.candidates())
    }

    /// Strict locate over an explicit candidate sequence.
    ///
    /// Candidates are examined in the given order and the first match wins.
    pub fn locate_in(
        &self,
        signature: &TargetSignature,
        candidates: &[CandidateDevice],
    ) -> Option<CandidateDevice> {
        for candidate in candidates {
            if !prepare_node(candidate) {
                continue;
            }

            match self.resolver.resolve(candidate.path()) {
                Some(descriptor) if signature.matches(&descriptor) => {
                    info!("Matched {} at {}", descriptor, candidate);
                    return Some(candidate.clone());
                }
                Some(descriptor) => {
                    debug!("{} is {}, not {}", candidate, descriptor, signature);
                }
                None => {
                    debug!("{} has no USB descriptor", candidate);
                }
            }
        }

        None
    }

    /// Locate honoring the configured fallback policy
    pub fn find(&self, signature: &TargetSignature) -> LocateOutcome {
        let candidates = self.candidates();
        if let Some(device) = self.locate_in(signature, &candidates) {
            return LocateOutcome::Verified(device);
        }

        match self.fallback {
            FallbackPolicy::Strict => LocateOutcome::NotFound,
            FallbackPolicy::FirstPresent => match candidates.into_iter().next() {
                Some(device) => {
                    warn!(
                        "No device matches {}; falling back to unverified {}",
                        signature, device
                    );
                    LocateOutcome::Unverified(device)
                }
                None => LocateOutcome::NotFound,
            },
        }
    }
}

/// Make sure a candidate node is usable before matching.
///
/// Nodes without world read/write are widened in place; other processes
/// (the telemetry forwarder, operator tools) rely on that too. Returns false
/// when the node cannot be inspected or corrected.
fn prepare_node(candidate: &CandidateDevice) -> bool {
    let meta = match fs::metadata(candidate.path()) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Skipping {}: {}", candidate, e);
            return false;
        }
    };

    if !meta.file_type().is_char_device() {
        warn!("{} is not a character device", candidate);
    }

    let mode = meta.permissions().mode();
    if mode & 0o666 != 0o666 {
        let widened = (mode & 0o7777) | 0o666;
        match fs::set_permissions(candidate.path(), fs::Permissions::from_mode(widened)) {
            Ok(()) => info!(
                "Widened permissions on {}: {:o} -> {:o}",
                candidate,
                mode & 0o7777,
                widened
            ),
            Err(e) => {
                warn!("Skipping {}: cannot fix permissions: {}", candidate, e);
                return false;
            }
        }
    }

    true
}
