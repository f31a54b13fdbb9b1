//! USB connection client for TSPL label printers
//!
//! Locates a printer by vendor/product id anywhere in the USB hub tree,
//! force-claims its primary interface, opens a bulk pipe pair and notifies
//! registered listeners about connection state and traffic.
//!
//! The platform USB stack sits behind the traits in [`platform`]; the crate
//! ships a libusb implementation ([`rusb_host`]) and an in-memory one
//! ([`mock`]) for tests.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod interface;
pub mod listener;
pub mod locator;
pub mod mock;
pub mod pipes;
pub mod platform;
pub mod registry;
pub mod rusb_host;
pub mod state;

pub use client::ConnectionClient;
pub use config::{ClientConfig, ConfigError, EndpointConfig, ErrorPolicy};
pub use error::{ConnectionError, PlatformError, Result};
pub use identity::{DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID, DeviceIdentity};
pub use listener::{ChannelListener, ClientEvent, ClientListener, DataListener, channel_listener};
pub use locator::find_device;
pub use rusb_host::{RusbHost, RusbOptions};
pub use state::{ClientHandle, ConnectionState};
