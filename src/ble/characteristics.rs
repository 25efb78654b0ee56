//! GATT service resolution.
//!
//! After a connection is up, the [`ServiceResolver`] locates the target
//! service, characteristic and notification-enable descriptor, enables
//! notification delivery and writes the descriptor. Only a confirmed write
//! completes resolution.

use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::connection::SessionId;
use crate::ble::uuids::{from_short, matches_short, ENABLE_NOTIFICATION_VALUE};
use crate::config::GattTarget;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Descriptor UUIDs of the characteristic.
    pub descriptors: Vec<Uuid>,
}

/// Full UUIDs of the resolved notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Service UUID as discovered.
    pub service: Uuid,
    /// Characteristic UUID as discovered.
    pub characteristic: Uuid,
    /// Descriptor UUID as discovered.
    pub descriptor: Uuid,
}

/// Locate the target path in a discovered service list.
pub fn resolve(services: &[GattService], target: &GattTarget) -> Result<ResolvedTarget> {
    let service = services
        .iter()
        .find(|s| matches_short(&s.uuid, target.service))
        .ok_or_else(|| {
            for s in services {
                debug!("  Available service: {}", s.uuid);
            }
            Error::ServiceNotFound {
                uuid: from_short(target.service).to_string(),
            }
        })?;

    let characteristic = service
        .characteristics
        .iter()
        .find(|c| matches_short(&c.uuid, target.characteristic))
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: from_short(target.characteristic).to_string(),
        })?;

    let descriptor = characteristic
        .descriptors
        .iter()
        .find(|d| matches_short(d, target.descriptor))
        .ok_or_else(|| Error::DescriptorNotFound {
            uuid: from_short(target.descriptor).to_string(),
        })?;

    Ok(ResolvedTarget {
        service: service.uuid,
        characteristic: characteristic.uuid,
        descriptor: *descriptor,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Discovering,
    WritingDescriptor(ResolvedTarget),
}

/// Drives resolution for one session at a time.
#[derive(Debug)]
pub struct ServiceResolver {
    target: GattTarget,
    phase: Phase,
}

impl ServiceResolver {
    /// Create a resolver for the given target.
    pub fn new(target: GattTarget) -> Self {
        Self {
            target,
            phase: Phase::Idle,
        }
    }

    /// Request service discovery.
    pub fn begin(&mut self, session: SessionId, transport: &mut dyn Transport) -> Result<()> {
        debug!("Discovering services for {}", session);
        transport.discover_services(session)?;
        self.phase = Phase::Discovering;
        Ok(())
    }

    /// Discovery finished: resolve, enable notifications, write the descriptor.
    pub fn on_services(
        &mut self,
        session: SessionId,
        discovered: std::result::Result<Vec<GattService>, String>,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if self.phase != Phase::Discovering {
            return Err(Error::InvalidData {
                context: "service discovery result without a pending request".to_string(),
            });
        }

        let services = discovered.map_err(|reason| Error::ConnectionFailed {
            reason: format!("service discovery failed: {}", reason),
        })?;

        let resolved = resolve(&services, &self.target)?;
        debug!(
            "Resolved service {} / characteristic {} / descriptor {}",
            resolved.service, resolved.characteristic, resolved.descriptor
        );

        transport.enable_notifications(session, &resolved)?;
        transport.write_descriptor(session, &resolved, &ENABLE_NOTIFICATION_VALUE)?;
        self.phase = Phase::WritingDescriptor(resolved);
        Ok(())
    }

    /// The descriptor write completed.
    pub fn on_descriptor_written(
        &mut self,
        result: std::result::Result<(), String>,
    ) -> Result<ResolvedTarget> {
        let Phase::WritingDescriptor(resolved) = self.phase else {
            return Err(Error::InvalidData {
                context: "descriptor write result without a pending write".to_string(),
            });
        };
        self.phase = Phase::Idle;

        result.map_err(|reason| Error::DescriptorWriteFailed { reason })?;
        info!("Notifications enabled on {}", resolved.characteristic);
        Ok(resolved)
    }

    /// Forget any in-flight resolution.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
    }
}
