//! Checks that the host can talk to a BLE device before a connection is attempted.
//!
//! A [`ReadinessCheck`] runs a fixed sequence of gates and resolves to exactly one [`Readiness`]
//! outcome per invocation:
//!
//! ```text
//! capability ──> permission ──> radio ──> Ready
//!     │              │            │
//!  Failed        Rejected      Rejected / Failed
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use btleplug::api::{Central, CentralState, Manager as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};

use crate::error::{readable_thread_panic_error, DeviceError, ReadinessError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Capability,
    Permission,
    Radio,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            GateKind::Capability => "capability",
            GateKind::Permission => "permission",
            GateKind::Radio => "radio",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug)]
pub enum Readiness {
    Ready,
    // the user declined a step, retry only on a new explicit request
    Rejected { gate: GateKind },
    Failed(ReadinessError),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::Rejected { gate } => write!(f, "rejected at the {} step", gate),
            Readiness::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Debug)]
pub enum GateStatus {
    Passed,
    Declined,
    Unsupported,
    Failed(DeviceError),
}

pub trait ReadinessGate: Send + Sync {
    fn kind(&self) -> GateKind;

    fn check(&self) -> BoxFuture<'_, GateStatus>;
}

/// Clears the pending flag however the check ends.
struct PendingGuard<'a> {
    pending: &'a AtomicBool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.store(false, Ordering::SeqCst);
    }
}

pub struct ReadinessCheck {
    gates: Vec<Box<dyn ReadinessGate>>,
    pending: AtomicBool,
}

impl ReadinessCheck {
    pub fn new(gates: Vec<Box<dyn ReadinessGate>>) -> Self {
        ReadinessCheck { gates, pending: AtomicBool::new(false) }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn ensure_ready(&self) -> Readiness {
        if self.pending.swap(true, Ordering::SeqCst) {
            return Readiness::Failed(ReadinessError::AlreadyPending);
        }
        let _guard = PendingGuard { pending: &self.pending };

        for gate in &self.gates {
            let kind = gate.kind();
            let status = AssertUnwindSafe(gate.check()).catch_unwind().await;

            match status {
                Ok(GateStatus::Passed) => {
                    debug!("Readiness gate {} passed", kind);
                },
                Ok(GateStatus::Declined) => {
                    info!("Readiness gate {} declined", kind);
                    return Readiness::Rejected { gate: kind };
                },
                Ok(GateStatus::Unsupported) => {
                    warn!("Readiness gate {}: not supported", kind);
                    return Readiness::Failed(ReadinessError::Unsupported);
                },
                Ok(GateStatus::Failed(source)) => {
                    warn!("Readiness gate {} failed: {}", kind, source);
                    return Readiness::Failed(ReadinessError::Device { gate: kind.to_string(), source });
                },
                Err(panic) => {
                    let message = readable_thread_panic_error(&panic);
                    warn!("Readiness gate {} faulted: {}", kind, message);
                    return Readiness::Failed(ReadinessError::GateFault { gate: kind.to_string(), message });
                },
            }
        }

        Readiness::Ready
    }
}

async fn adapters() -> Result<Vec<Adapter>, DeviceError> {
    let manager = Manager::new().await?;
    Ok(manager.adapters().await?)
}

/// A BLE manager with at least one adapter exists.
pub struct BtleCapabilityGate;

impl ReadinessGate for BtleCapabilityGate {
    fn kind(&self) -> GateKind {
        GateKind::Capability
    }

    fn check(&self) -> BoxFuture<'_, GateStatus> {
        async move {
            match adapters().await {
                Ok(adapters) if adapters.is_empty() => GateStatus::Unsupported,
                Ok(_) => GateStatus::Passed,
                Err(err) => GateStatus::Failed(err),
            }
        }.boxed()
    }
}

/// The process may scan; a permission error means the user has not granted bluetooth access.
pub struct BtlePermissionGate;

impl ReadinessGate for BtlePermissionGate {
    fn kind(&self) -> GateKind {
        GateKind::Permission
    }

    fn check(&self) -> BoxFuture<'_, GateStatus> {
        async move {
            let adapters = match adapters().await {
                Ok(adapters) => adapters,
                Err(err) if err.is_permission_denied() => return GateStatus::Declined,
                Err(err) => return GateStatus::Failed(err),
            };

            for adapter in &adapters {
                if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
                    let err = DeviceError::from(err);
                    if err.is_permission_denied() {
                        return GateStatus::Declined;
                    }
                    return GateStatus::Failed(err);
                }
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Failed to stop permission probe scan: {:?}", err);
                }
            }
            GateStatus::Passed
        }.boxed()
    }
}

/// Some adapter reports its radio as powered on.
pub struct BtleRadioGate;

impl ReadinessGate for BtleRadioGate {
    fn kind(&self) -> GateKind {
        GateKind::Radio
    }

    fn check(&self) -> BoxFuture<'_, GateStatus> {
        async move {
            let adapters = match adapters().await {
                Ok(adapters) => adapters,
                Err(err) => return GateStatus::Failed(err),
            };

            let mut last_error = None;
            let mut powered_off = false;
            for adapter in &adapters {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => return GateStatus::Passed,
                    Ok(CentralState::PoweredOff) => powered_off = true,
                    // not every platform can tell
                    Ok(_) => return GateStatus::Passed,
                    Err(err) => last_error = Some(DeviceError::from(err)),
                }
            }

            match (powered_off, last_error) {
                (true, _) => GateStatus::Declined,
                (false, Some(err)) => GateStatus::Failed(err),
                (false, None) => GateStatus::Unsupported,
            }
        }.boxed()
    }
}

pub fn btle_readiness_check() -> ReadinessCheck {
    ReadinessCheck::new(vec![
        Box::new(BtleCapabilityGate),
        Box::new(BtlePermissionGate),
        Box::new(BtleRadioGate),
    ])
}
