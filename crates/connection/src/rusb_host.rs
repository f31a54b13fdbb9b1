//! libusb platform via rusb
//!
//! libusb exposes a flat device list; the hub tree is rebuilt from each
//! device's parent link, under a virtual root that owns the root hubs.
//!
//! Threads:
//! - one reader per open IN pipe, polling `read_bulk` and pushing data
//!   events to the pipe hook
//! - one `usb-events` thread driving `handle_events` while at least one
//!   detach watch is alive, so hotplug callbacks fire

use crate::error::PlatformError;
use crate::identity::DeviceIdentity;
use crate::platform::{
    ClaimPolicy, DetachHook, Direction, EndpointInfo, HostInfo, NodeId, PipeEvent, PipeHook,
    TransferKind, UsbHost, UsbInterface, UsbNode, UsbPipe,
};
use bytes::Bytes;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// USB hub device class
const HUB_CLASS: u8 = 0x09;

/// Node id of the virtual root
const ROOT_NODE: NodeId = NodeId(u32::MAX);

/// Tick of the hotplug event loop
const EVENT_TICK: Duration = Duration::from_millis(100);

/// Upper bound of the reader's wait after repeated failures
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Tunables for the libusb host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RusbOptions {
    /// Timeout of a synchronous write
    #[serde(default = "RusbOptions::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// How long one read poll on the IN pipe waits for data
    #[serde(default = "RusbOptions::default_read_poll_ms")]
    pub read_poll_ms: u64,
    /// Size of the IN pipe read buffer
    #[serde(default = "RusbOptions::default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl RusbOptions {
    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_read_poll_ms() -> u64 {
        100
    }

    fn default_read_buffer_size() -> usize {
        512
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

impl Default for RusbOptions {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            read_poll_ms: Self::default_read_poll_ms(),
            read_buffer_size: Self::default_read_buffer_size(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background thread with a stop flag, joined on drop
struct Worker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> Result<Self, PlatformError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || body(flag))
            .map_err(|e| PlatformError::Other {
                message: format!("failed to spawn USB thread: {}", e),
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("USB background thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `duration` in short slices, returning early once `stop` is set
fn pause(stop: &AtomicBool, duration: Duration) {
    let mut left = duration;
    while !left.is_zero() && !stop.load(Ordering::SeqCst) {
        let slice = left.min(EVENT_TICK);
        std::thread::sleep(slice);
        left -= slice;
    }
}

/// Run of identical reader failures
///
/// Only the first failure of a run is reported. The wait before the next
/// poll doubles with every repeat, up to [`MAX_ERROR_BACKOFF`].
struct ErrorRun {
    last: Option<PlatformError>,
    base: Duration,
    backoff: Duration,
}

impl ErrorRun {
    fn new(base: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            last: None,
            base,
            backoff: base,
        }
    }

    /// Record a failure; true if it starts a new run
    fn failed(&mut self, error: &PlatformError) -> bool {
        if self.last.as_ref() == Some(error) {
            self.backoff = (self.backoff * 2).min(MAX_ERROR_BACKOFF);
            return false;
        }
        self.last = Some(error.clone());
        self.backoff = self.base;
        true
    }

    fn backoff(&self) -> Duration {
        self.backoff
    }

    fn reset(&mut self) {
        if self.last.take().is_some() {
            self.backoff = self.base;
        }
    }
}

/// Hotplug event thread shared by every detach watch of a host
///
/// The first watch starts it, dropping the last watch stops it.
struct EventLoop {
    state: Mutex<EventLoopState>,
}

#[derive(Default)]
struct EventLoopState {
    watches: usize,
    worker: Option<Worker>,
}

impl EventLoop {
    fn new() -> Self {
        Self {
            state: Mutex::new(EventLoopState::default()),
        }
    }

    fn acquire(
        &self,
        start: impl FnOnce() -> Result<Worker, PlatformError>,
    ) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        if state.worker.is_none() {
            state.worker = Some(start()?);
        }
        state.watches += 1;
        Ok(())
    }

    fn release(&self) {
        let idle = {
            let mut state = lock(&self.state);
            state.watches = state.watches.saturating_sub(1);
            if state.watches == 0 {
                state.worker.take()
            } else {
                None
            }
        };
        // joined outside the lock
        if let Some(mut worker) = idle {
            worker.stop();
        }
    }

    fn shutdown(&self) {
        let worker = lock(&self.state).worker.take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        lock(&self.state).worker.is_some()
    }
}

fn spawn_event_loop(context: Context) -> Result<Worker, PlatformError> {
    Worker::spawn("usb-events".to_string(), move |stop| {
        debug!("USB event loop started");
        while !stop.load(Ordering::SeqCst) {
            match context.handle_events(Some(EVENT_TICK)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    trace!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TICK);
                }
            }
        }
        debug!("USB event loop stopped");
    })
}

/// libusb-backed [`UsbHost`]
///
/// The libusb context is created on first use.
pub struct RusbHost {
    options: RusbOptions,
    context: Mutex<Option<Context>>,
    events: Arc<EventLoop>,
}

impl RusbHost {
    pub fn new(options: RusbOptions) -> Self {
        Self {
            options,
            context: Mutex::new(None),
            events: Arc::new(EventLoop::new()),
        }
    }

    fn context(&self) -> Result<Context, PlatformError> {
        let mut context = lock(&self.context);
        if let Some(context) = context.as_ref() {
            return Ok(context.clone());
        }

        let created = Context::new()?;
        debug!("Created libusb context");
        *context = Some(created.clone());
        Ok(created)
    }
}

impl Drop for RusbHost {
    fn drop(&mut self) {
        self.events.shutdown();
    }
}

/// Node of the libusb hub tree
#[derive(Clone)]
pub struct RusbNode {
    context: Context,
    /// `None` for the virtual root
    device: Option<Device<Context>>,
}

impl RusbNode {
    pub fn bus_number(&self) -> Option<u8> {
        self.device.as_ref().map(|d| d.bus_number())
    }

    pub fn address(&self) -> Option<u8> {
        self.device.as_ref().map(|d| d.address())
    }

    fn same_device(a: &Device<Context>, b: &Device<Context>) -> bool {
        a.bus_number() == b.bus_number() && a.address() == b.address()
    }
}

impl UsbNode for RusbNode {
    fn node_id(&self) -> NodeId {
        match &self.device {
            Some(device) => NodeId(u32::from(device.bus_number()) << 8 | u32::from(device.address())),
            None => ROOT_NODE,
        }
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        let descriptor = self.device.as_ref()?.device_descriptor().ok()?;
        Some(DeviceIdentity::new(
            descriptor.vendor_id(),
            descriptor.product_id(),
        ))
    }

    fn is_hub(&self) -> bool {
        match &self.device {
            Some(device) => device
                .device_descriptor()
                .map(|d| d.class_code() == HUB_CLASS)
                .unwrap_or(false),
            None => true,
        }
    }

    fn children(&self) -> Vec<Self> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter(|candidate| match (&self.device, candidate.get_parent()) {
                (None, None) => true,
                (Some(me), Some(parent)) => Self::same_device(me, &parent),
                _ => false,
            })
            .map(|device| RusbNode {
                context: self.context.clone(),
                device: Some(device),
            })
            .collect()
    }
}

/// Keeps a hotplug registration, and with it the event loop, alive
pub struct RusbWatch {
    registration: Option<Registration<Context>>,
    events: Option<Arc<EventLoop>>,
}

impl Drop for RusbWatch {
    fn drop(&mut self) {
        // deregister before the loop that dispatches the callback can stop
        drop(self.registration.take());
        if let Some(events) = self.events.take() {
            events.release();
        }
    }
}

struct DetachCallback {
    bus: u8,
    address: u8,
    hook: DetachHook,
}

impl Hotplug<Context> for DetachCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        trace!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
    }

    fn device_left(&mut self, device: Device<Context>) {
        if device.bus_number() == self.bus && device.address() == self.address {
            debug!(
                "Hot-plug callback: watched device left (bus={}, addr={})",
                self.bus, self.address
            );
            (self.hook)();
        }
    }
}

impl UsbHost for RusbHost {
    type Device = RusbNode;
    type Interface = RusbInterface;
    type Watch = RusbWatch;

    fn info(&self) -> HostInfo {
        let version = rusb::version();
        HostInfo {
            description: "libusb (rusb)".to_string(),
            version: format!(
                "{}.{}.{}",
                version.major(),
                version.minor(),
                version.micro()
            ),
        }
    }

    fn root_hub(&self) -> Result<RusbNode, PlatformError> {
        Ok(RusbNode {
            context: self.context()?,
            device: None,
        })
    }

    fn claim(
        &self,
        node: &RusbNode,
        number: u8,
        policy: ClaimPolicy,
    ) -> Result<RusbInterface, PlatformError> {
        let device = node.device.as_ref().ok_or(PlatformError::InvalidParam)?;
        let handle = device.open()?;

        let mut detached_kernel_driver = false;
        match handle.kernel_driver_active(number) {
            Ok(true) if policy == ClaimPolicy::Cooperative => return Err(PlatformError::Busy),
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                handle.detach_kernel_driver(number)?;
                detached_kernel_driver = true;
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", number);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                );
            }
        }

        handle.claim_interface(number)?;
        debug!(
            "Claimed interface {} (bus={}, addr={})",
            number,
            device.bus_number(),
            device.address()
        );

        Ok(RusbInterface {
            handle: Arc::new(handle),
            number,
            endpoints: read_endpoints(device, number),
            detached_kernel_driver,
            options: self.options.clone(),
            released: false,
        })
    }

    fn watch_detach(
        &self,
        node: &RusbNode,
        hook: DetachHook,
    ) -> Result<RusbWatch, PlatformError> {
        let device = node.device.as_ref().ok_or(PlatformError::InvalidParam)?;

        if !rusb::has_hotplug() {
            warn!("libusb hotplug not supported, device detach will not be reported");
            return Ok(RusbWatch {
                registration: None,
                events: None,
            });
        }

        let context = self.context()?;
        let identity = node.identity().ok_or(PlatformError::NotFound)?;
        let callback: Box<dyn Hotplug<Context>> = Box::new(DetachCallback {
            bus: device.bus_number(),
            address: device.address(),
            hook,
        });

        let registration = HotplugBuilder::new()
            .vendor_id(identity.vendor_id)
            .product_id(identity.product_id)
            .enumerate(false)
            .register(&context, callback)?;

        self.events.acquire(|| spawn_event_loop(context.clone()))?;
        info!("Watching {} for detach", identity);

        Ok(RusbWatch {
            registration: Some(registration),
            events: Some(Arc::clone(&self.events)),
        })
    }
}

/// Endpoints of alternate setting 0 of interface `number`
fn read_endpoints(device: &Device<Context>, number: u8) -> Vec<EndpointInfo> {
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to get active config descriptor: {}", e);
            return Vec::new();
        }
    };

    config
        .interfaces()
        .filter(|interface| interface.number() == number)
        .filter_map(|interface| interface.descriptors().next())
        .flat_map(|descriptor| {
            descriptor
                .endpoint_descriptors()
                .map(|endpoint| EndpointInfo {
                    address: endpoint.address(),
                    direction: match endpoint.direction() {
                        rusb::Direction::In => Direction::In,
                        rusb::Direction::Out => Direction::Out,
                    },
                    transfer_kind: match endpoint.transfer_type() {
                        rusb::TransferType::Control => TransferKind::Control,
                        rusb::TransferType::Isochronous => TransferKind::Isochronous,
                        rusb::TransferType::Bulk => TransferKind::Bulk,
                        rusb::TransferType::Interrupt => TransferKind::Interrupt,
                    },
                    max_packet_size: endpoint.max_packet_size(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Interface claimed through libusb
pub struct RusbInterface {
    handle: Arc<DeviceHandle<Context>>,
    number: u8,
    endpoints: Vec<EndpointInfo>,
    detached_kernel_driver: bool,
    options: RusbOptions,
    released: bool,
}

impl UsbInterface for RusbInterface {
    type Pipe = RusbPipe;

    fn number(&self) -> u8 {
        self.number
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.clone()
    }

    fn pipe(&self, address: u8) -> Result<RusbPipe, PlatformError> {
        if !self.endpoints.is_empty() && !self.endpoints.iter().any(|ep| ep.address == address) {
            return Err(PlatformError::NotFound);
        }

        Ok(RusbPipe {
            handle: Arc::clone(&self.handle),
            address,
            options: self.options.clone(),
            hook: None,
            open: false,
            reader: None,
        })
    }

    fn release(&mut self) -> Result<(), PlatformError> {
        if self.released {
            return Err(PlatformError::InvalidParam);
        }
        self.released = true;
        self.handle.release_interface(self.number)?;

        // hand the interface back to the kernel driver we took it from
        if self.detached_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.number) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.number, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.number);
            }
        }
        Ok(())
    }
}

/// Bulk pipe on a libusb device handle
pub struct RusbPipe {
    handle: Arc<DeviceHandle<Context>>,
    address: u8,
    options: RusbOptions,
    hook: Option<PipeHook>,
    open: bool,
    reader: Option<Worker>,
}

impl RusbPipe {
    fn hook(&self) -> PipeHook {
        self.hook.clone().unwrap_or_else(|| Arc::new(|_| {}))
    }

    fn spawn_reader(&self) -> Result<Worker, PlatformError> {
        let handle = Arc::clone(&self.handle);
        let hook = self.hook();
        let address = self.address;
        let poll = self.options.read_poll();
        let mut buffer = vec![0u8; self.options.read_buffer_size.max(1)];

        Worker::spawn(format!("usb-pipe-{:02x}", address), move |stop| {
            debug!("Reader for pipe {:#04x} started", address);
            let mut errors = ErrorRun::new(poll);
            while !stop.load(Ordering::SeqCst) {
                match handle.read_bulk(address, &mut buffer, poll) {
                    Ok(0) | Err(rusb::Error::Timeout) => errors.reset(),
                    Ok(len) => {
                        errors.reset();
                        hook(PipeEvent::Data(Bytes::copy_from_slice(&buffer[..len])));
                    }
                    // printers answer IO when no status data is pending
                    Err(rusb::Error::Io) => {}
                    Err(rusb::Error::NoDevice) => {
                        hook(PipeEvent::Error(PlatformError::NoDevice));
                        break;
                    }
                    Err(e) => {
                        let error = PlatformError::from(e);
                        if errors.failed(&error) {
                            hook(PipeEvent::Error(error));
                        } else {
                            trace!("Pipe {:#04x} still failing: {}", address, error);
                        }
                        pause(&stop, errors.backoff());
                    }
                }
            }
            debug!("Reader for pipe {:#04x} stopped", address);
        })
    }
}

impl UsbPipe for RusbPipe {
    fn address(&self) -> u8 {
        self.address
    }

    fn set_event_hook(&mut self, hook: PipeHook) {
        self.hook = Some(hook);
    }

    fn open(&mut self) -> Result<(), PlatformError> {
        if self.open {
            return Err(PlatformError::Busy);
        }
        // touches the device, so an unplugged printer fails here
        self.handle.clear_halt(self.address)?;
        if Direction::of(self.address) == Direction::In {
            self.reader = Some(self.spawn_reader()?);
        }
        self.open = true;
        debug!("Opened pipe {:#04x}", self.address);
        Ok(())
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        if !self.open {
            return Err(PlatformError::InvalidParam);
        }
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        self.open = false;
        debug!("Closed pipe {:#04x}", self.address);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn submit(&mut self, data: &[u8]) -> Result<usize, PlatformError> {
        if !self.open {
            return Err(PlatformError::Io);
        }
        if Direction::of(self.address) != Direction::Out {
            return Err(PlatformError::InvalidParam);
        }

        let written = self
            .handle
            .write_bulk(self.address, data, self.options.transfer_timeout())?;
        trace!("Bulk OUT {:#04x}: {} bytes", self.address, written);

        if let Some(hook) = &self.hook {
            hook(PipeEvent::Data(Bytes::copy_from_slice(&data[..written])));
        }
        Ok(written)
    }
}
