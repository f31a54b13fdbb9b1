//! Platform USB capability
//!
//! The connection client never talks to libusb directly. It drives a host
//! through these traits: enumerate the hub tree, claim an interface, resolve
//! endpoint pipes and receive their events. [`crate::rusb_host`] implements
//! them on top of libusb, [`crate::mock`] in memory.
//!
//! Event hooks are invoked on the platform's own callback thread and must
//! return quickly.

use crate::error::PlatformError;
use crate::identity::DeviceIdentity;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a node in the hub tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Transfer direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn of(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub transfer_kind: TransferKind,
    pub max_packet_size: u16,
}

/// How to behave when the interface is already bound to another driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPolicy {
    /// Detach the current owner and take the interface
    Force,
    /// Fail with `Busy` if the interface is owned
    Cooperative,
}

/// Description of the platform implementation, logged at init
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub description: String,
    pub version: String,
}

/// Event delivered by a pipe on the platform callback thread
#[derive(Debug, Clone)]
pub enum PipeEvent {
    /// Bytes moved through the pipe (received on IN, written on OUT)
    Data(Bytes),
    /// Asynchronous fault on the pipe
    Error(PlatformError),
}

/// Pipe event callback
pub type PipeHook = Arc<dyn Fn(PipeEvent) + Send + Sync>;

/// Device detach callback
pub type DetachHook = Arc<dyn Fn() + Send + Sync>;

/// A device in the attached-device tree
pub trait UsbNode: Clone + Send + 'static {
    fn node_id(&self) -> NodeId;

    /// Vendor/product ids, or `None` if the descriptor cannot be read
    fn identity(&self) -> Option<DeviceIdentity>;

    fn is_hub(&self) -> bool;

    /// Devices attached below this node; empty for non-hubs
    fn children(&self) -> Vec<Self>;
}

/// Host-side USB services
pub trait UsbHost: Send + Sync + 'static {
    type Device: UsbNode;
    type Interface: UsbInterface;
    /// Guard that keeps a detach watch registered until dropped
    type Watch: Send + 'static;

    fn info(&self) -> HostInfo;

    /// Root of the attached-device tree
    fn root_hub(&self) -> Result<Self::Device, PlatformError>;

    /// Claim interface `number` of the device's active configuration
    fn claim(
        &self,
        device: &Self::Device,
        number: u8,
        policy: ClaimPolicy,
    ) -> Result<Self::Interface, PlatformError>;

    /// Invoke `hook` when `device` leaves the bus
    fn watch_detach(
        &self,
        device: &Self::Device,
        hook: DetachHook,
    ) -> Result<Self::Watch, PlatformError>;
}

/// A claimed interface
pub trait UsbInterface: Send + 'static {
    type Pipe: UsbPipe;

    fn number(&self) -> u8;

    fn endpoints(&self) -> Vec<EndpointInfo>;

    /// Resolve the pipe bound to endpoint `address`
    fn pipe(&self, address: u8) -> Result<Self::Pipe, PlatformError>;

    fn release(&mut self) -> Result<(), PlatformError>;
}

/// A directional transfer channel bound to one endpoint
///
/// Hooks must be attached before [`UsbPipe::open`]; events produced while
/// the pipe is open are delivered to the hook. `submit` errors are returned
/// to the caller and never delivered to the hook.
pub trait UsbPipe: Send + 'static {
    fn address(&self) -> u8;

    fn set_event_hook(&mut self, hook: PipeHook);

    fn open(&mut self) -> Result<(), PlatformError>;

    fn close(&mut self) -> Result<(), PlatformError>;

    fn is_open(&self) -> bool;

    /// Synchronous transfer bounded by the platform timeout
    ///
    /// On success a [`PipeEvent::Data`] carrying the written bytes is
    /// delivered to the hook before returning.
    fn submit(&mut self, data: &[u8]) -> Result<usize, PlatformError>;
}
