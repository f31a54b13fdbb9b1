//! Interface manager
//!
//! Claims interface 0 of the device's active configuration, forcibly
//! detaching whatever driver currently owns it, and guarantees the claim is
//! released exactly once.

use crate::error::{ConnectionError, Result};
use crate::platform::{ClaimPolicy, UsbHost, UsbInterface};
use tracing::{debug, info, warn};

/// Interface the printer exposes its bulk pipes on
pub const PRIMARY_INTERFACE: u8 = 0;

/// Force-claim the primary interface of `device`
pub fn claim_interface<H: UsbHost>(
    host: &H,
    device: &H::Device,
) -> Result<ClaimedInterface<H::Interface>> {
    let interface = host
        .claim(device, PRIMARY_INTERFACE, ClaimPolicy::Force)
        .map_err(|source| ConnectionError::Claim {
            interface: PRIMARY_INTERFACE,
            source,
        })?;

    for endpoint in interface.endpoints() {
        info!(
            "Interface {} endpoint: direction={}, address={:#04x}, type={:?}",
            interface.number(),
            endpoint.direction,
            endpoint.address,
            endpoint.transfer_kind
        );
    }

    Ok(ClaimedInterface::new(interface))
}

/// A claimed interface that is released at most once
///
/// Dropping an unreleased guard releases the interface.
pub struct ClaimedInterface<I: UsbInterface> {
    interface: I,
    released: bool,
}

impl<I: UsbInterface> ClaimedInterface<I> {
    pub fn new(interface: I) -> Self {
        Self {
            interface,
            released: false,
        }
    }

    pub fn get(&self) -> &I {
        &self.interface
    }

    /// Release the claim; later calls are no-ops
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            debug!(
                "Interface {} already released, ignoring",
                self.interface.number()
            );
            return Ok(());
        }

        self.released = true;
        self.interface.release()?;
        debug!("Released interface {}", self.interface.number());
        Ok(())
    }
}

impl<I: UsbInterface> Drop for ClaimedInterface<I> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.release()
        {
            warn!("Failed to release interface on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::mock::{MockDevice, MockHost};

    fn host() -> (MockHost, MockDevice) {
        let root = MockDevice::root();
        let printer = MockDevice::device(0x1203, 0x0172);
        root.attach(printer.clone());
        (MockHost::new(root), printer)
    }

    #[test]
    fn test_claim_forces_kernel_driver_off() {
        let (host, printer) = host();
        host.set_kernel_owned(true);

        let claimed = claim_interface(&host, &printer).unwrap();
        assert_eq!(claimed.get().number(), PRIMARY_INTERFACE);
        assert_eq!(host.forced_detaches(), 1);
        assert_eq!(host.claims(), 1);
    }

    #[test]
    fn test_claim_failure_maps_to_claim_error() {
        let (host, printer) = host();
        host.fail_claim(PlatformError::Access);

        let err = claim_interface(&host, &printer).err().unwrap();
        assert_eq!(
            err,
            ConnectionError::Claim {
                interface: 0,
                source: PlatformError::Access
            }
        );
    }

    #[test]
    fn test_release_twice_is_a_noop() {
        let (host, printer) = host();
        let mut claimed = claim_interface(&host, &printer).unwrap();

        claimed.release().unwrap();
        claimed.release().unwrap();
        drop(claimed);
        assert_eq!(host.releases(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let (host, printer) = host();
        let claimed = claim_interface(&host, &printer).unwrap();
        drop(claimed);
        assert_eq!(host.releases(), 1);
        assert_eq!(host.claimed_device(), None);
    }

    #[test]
    fn test_failed_release_is_not_retried() {
        let (host, printer) = host();
        host.fail_release(PlatformError::NoDevice);
        let mut claimed = claim_interface(&host, &printer).unwrap();

        assert_eq!(
            claimed.release(),
            Err(ConnectionError::Platform(PlatformError::NoDevice))
        );
        assert!(claimed.release().is_ok());
    }
}
