//! In-memory USB host
//!
//! Builds an arbitrary hub tree (cycles included) and records what the
//! client does with it. Faults can be injected per operation, and device
//! detach or inbound data can be simulated; those events are delivered from
//! a separate thread, the way a real platform callback thread would.
//!
//! ```
//! use connection::mock::{MockDevice, MockHost};
//! use connection::{ClientConfig, ConnectionClient};
//!
//! let root = MockDevice::root();
//! root.attach(MockDevice::device(0x1203, 0x0172));
//! let host = MockHost::new(root);
//!
//! let client = ConnectionClient::with_host(host.clone(), ClientConfig::default());
//! client.init().unwrap();
//! client.connect().unwrap();
//! client.send_text("CLS\r\n").unwrap();
//! assert_eq!(host.written_bytes(), b"CLS\r\n".to_vec());
//! ```

use crate::config::{DEFAULT_READ_ENDPOINT, DEFAULT_WRITE_ENDPOINT};
use crate::error::PlatformError;
use crate::identity::DeviceIdentity;
use crate::platform::{
    ClaimPolicy, DetachHook, Direction, EndpointInfo, HostInfo, NodeId, PipeEvent, PipeHook,
    TransferKind, UsbHost, UsbInterface, UsbNode, UsbPipe,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

/// Identity reported by plain mock hubs
pub const MOCK_HUB_IDENTITY: DeviceIdentity = DeviceIdentity::new(0x05e3, 0x0608);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct NodeData {
    id: NodeId,
    identity: Option<DeviceIdentity>,
    hub: bool,
    children: Mutex<Vec<MockDevice>>,
}

/// Node of a mock hub tree; clones share the node
#[derive(Clone)]
pub struct MockDevice {
    node: Arc<NodeData>,
}

impl MockDevice {
    fn build(identity: Option<DeviceIdentity>, hub: bool) -> Self {
        Self {
            node: Arc::new(NodeData {
                id: NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)),
                identity,
                hub,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Root hub
    pub fn root() -> Self {
        Self::build(Some(DeviceIdentity::new(0x1d6b, 0x0002)), true)
    }

    /// External hub
    pub fn hub() -> Self {
        Self::build(Some(MOCK_HUB_IDENTITY), true)
    }

    pub fn hub_with_identity(identity: DeviceIdentity) -> Self {
        Self::build(Some(identity), true)
    }

    /// Leaf device
    pub fn device(vendor_id: u16, product_id: u16) -> Self {
        Self::build(Some(DeviceIdentity::new(vendor_id, product_id)), false)
    }

    /// Leaf device whose descriptor cannot be read
    pub fn unreadable() -> Self {
        Self::build(None, false)
    }

    /// Attach `child` below this node
    pub fn attach(&self, child: MockDevice) {
        lock(&self.node.children).push(child);
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("id", &self.node.id)
            .field("identity", &self.node.identity)
            .field("hub", &self.node.hub)
            .finish()
    }
}

impl UsbNode for MockDevice {
    fn node_id(&self) -> NodeId {
        self.node.id
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        self.node.identity
    }

    fn is_hub(&self) -> bool {
        self.node.hub
    }

    fn children(&self) -> Vec<Self> {
        lock(&self.node.children).clone()
    }
}

#[derive(Default)]
struct Faults {
    root: Option<PlatformError>,
    claim: Option<PlatformError>,
    release: Option<PlatformError>,
    watch: Option<PlatformError>,
    resolve: HashMap<u8, PlatformError>,
    open: HashMap<u8, PlatformError>,
    close: HashMap<u8, PlatformError>,
    submit: Option<PlatformError>,
    detach_on_open: Option<u8>,
}

#[derive(Default)]
struct Recorder {
    claims: AtomicUsize,
    releases: AtomicUsize,
    forced_detaches: AtomicUsize,
    pipe_opens: AtomicUsize,
    pipe_closes: AtomicUsize,
    submits: AtomicUsize,
}

struct HostState {
    endpoints: Vec<EndpointInfo>,
    kernel_owned: Mutex<bool>,
    faults: Mutex<Faults>,
    counters: Recorder,
    written: Mutex<Vec<Bytes>>,
    claimed_by: Mutex<Option<NodeId>>,
    open_pipes: Mutex<HashMap<u8, PipeHook>>,
    detach_hooks: Mutex<Vec<(u64, NodeId, DetachHook)>>,
    next_watch: AtomicU64,
}

/// Mock platform capability
#[derive(Clone)]
pub struct MockHost {
    root: MockDevice,
    state: Arc<HostState>,
}

impl MockHost {
    /// Host whose devices expose a bulk OUT 0x01 and bulk IN 0x82 endpoint
    pub fn new(root: MockDevice) -> Self {
        Self::with_endpoints(
            root,
            vec![
                bulk_endpoint(DEFAULT_WRITE_ENDPOINT),
                bulk_endpoint(DEFAULT_READ_ENDPOINT),
            ],
        )
    }

    pub fn with_endpoints(root: MockDevice, endpoints: Vec<EndpointInfo>) -> Self {
        Self {
            root,
            state: Arc::new(HostState {
                endpoints,
                kernel_owned: Mutex::new(false),
                faults: Mutex::new(Faults::default()),
                counters: Recorder::default(),
                written: Mutex::new(Vec::new()),
                claimed_by: Mutex::new(None),
                open_pipes: Mutex::new(HashMap::new()),
                detach_hooks: Mutex::new(Vec::new()),
                next_watch: AtomicU64::new(1),
            }),
        }
    }

    pub fn root(&self) -> &MockDevice {
        &self.root
    }

    /// Pretend a kernel driver currently owns the interface
    pub fn set_kernel_owned(&self, owned: bool) {
        *lock(&self.state.kernel_owned) = owned;
    }

    pub fn fail_root_hub(&self, error: PlatformError) {
        lock(&self.state.faults).root = Some(error);
    }

    pub fn fail_claim(&self, error: PlatformError) {
        lock(&self.state.faults).claim = Some(error);
    }

    pub fn fail_release(&self, error: PlatformError) {
        lock(&self.state.faults).release = Some(error);
    }

    pub fn fail_watch(&self, error: PlatformError) {
        lock(&self.state.faults).watch = Some(error);
    }

    pub fn fail_resolve(&self, endpoint: u8, error: PlatformError) {
        lock(&self.state.faults).resolve.insert(endpoint, error);
    }

    pub fn fail_open(&self, endpoint: u8, error: PlatformError) {
        lock(&self.state.faults).open.insert(endpoint, error);
    }

    pub fn fail_close(&self, endpoint: u8, error: PlatformError) {
        lock(&self.state.faults).close.insert(endpoint, error);
    }

    pub fn fail_submit(&self, error: PlatformError) {
        lock(&self.state.faults).submit = Some(error);
    }

    /// Unplug the claimed device as soon as `endpoint` opens
    ///
    /// The detach callbacks run before `open` returns.
    pub fn detach_on_open(&self, endpoint: u8) {
        lock(&self.state.faults).detach_on_open = Some(endpoint);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        *lock(&self.state.faults) = Faults::default();
    }

    pub fn claims(&self) -> usize {
        self.state.counters.claims.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.counters.releases.load(Ordering::SeqCst)
    }

    /// How many times a claim detached the previous owner
    pub fn forced_detaches(&self) -> usize {
        self.state.counters.forced_detaches.load(Ordering::SeqCst)
    }

    pub fn pipe_opens(&self) -> usize {
        self.state.counters.pipe_opens.load(Ordering::SeqCst)
    }

    pub fn pipe_closes(&self) -> usize {
        self.state.counters.pipe_closes.load(Ordering::SeqCst)
    }

    /// Number of submit calls, successful or not
    pub fn submits(&self) -> usize {
        self.state.counters.submits.load(Ordering::SeqCst)
    }

    pub fn is_pipe_open(&self, endpoint: u8) -> bool {
        lock(&self.state.open_pipes).contains_key(&endpoint)
    }

    pub fn claimed_device(&self) -> Option<NodeId> {
        *lock(&self.state.claimed_by)
    }

    pub fn active_watches(&self) -> usize {
        lock(&self.state.detach_hooks).len()
    }

    /// Successful writes, one entry per transfer
    pub fn written(&self) -> Vec<Bytes> {
        lock(&self.state.written).clone()
    }

    /// All written bytes concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.state.written)
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect()
    }

    /// Fire the detach callbacks watching `device` on a callback thread
    ///
    /// Returns how many callbacks ran.
    pub fn simulate_detach(&self, device: &MockDevice) -> Result<usize, PlatformError> {
        self.state.fire_detach(device.node_id())
    }

    /// Deliver inbound data on an open pipe from a callback thread
    ///
    /// Returns false if no pipe is open on `endpoint`.
    pub fn simulate_data(&self, endpoint: u8, data: &[u8]) -> Result<bool, PlatformError> {
        self.deliver(endpoint, PipeEvent::Data(Bytes::copy_from_slice(data)))
    }

    /// Deliver an asynchronous pipe fault from a callback thread
    pub fn simulate_pipe_error(
        &self,
        endpoint: u8,
        error: PlatformError,
    ) -> Result<bool, PlatformError> {
        self.deliver(endpoint, PipeEvent::Error(error))
    }

    fn deliver(&self, endpoint: u8, event: PipeEvent) -> Result<bool, PlatformError> {
        let hook = lock(&self.state.open_pipes).get(&endpoint).cloned();
        match hook {
            Some(hook) => {
                on_callback_thread(move || hook(event))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl HostState {
    fn fire_detach(&self, node: NodeId) -> Result<usize, PlatformError> {
        let hooks: Vec<DetachHook> = lock(&self.detach_hooks)
            .iter()
            .filter(|(_, watched, _)| *watched == node)
            .map(|(_, _, hook)| Arc::clone(hook))
            .collect();

        on_callback_thread(move || {
            let count = hooks.len();
            for hook in hooks {
                hook();
            }
            count
        })
    }
}

/// Run `f` on a fresh thread and wait for it
///
/// A panic inside `f` comes back as [`PlatformError::Other`].
fn on_callback_thread<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, PlatformError> {
    let handle = std::thread::Builder::new()
        .name("mock-usb-callback".to_string())
        .spawn(f)
        .map_err(|e| PlatformError::Other {
            message: format!("failed to spawn mock callback thread: {e}"),
        })?;

    handle.join().map_err(|_| PlatformError::Other {
        message: "mock callback panicked".to_string(),
    })
}

fn bulk_endpoint(address: u8) -> EndpointInfo {
    EndpointInfo {
        address,
        direction: Direction::of(address),
        transfer_kind: TransferKind::Bulk,
        max_packet_size: 512,
    }
}

/// Guard returned by [`MockHost::watch_detach`]
pub struct MockWatch {
    id: u64,
    state: Arc<HostState>,
}

impl Drop for MockWatch {
    fn drop(&mut self) {
        lock(&self.state.detach_hooks).retain(|(id, _, _)| *id != self.id);
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;
    type Interface = MockInterface;
    type Watch = MockWatch;

    fn info(&self) -> HostInfo {
        HostInfo {
            description: "in-memory mock host".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn root_hub(&self) -> Result<MockDevice, PlatformError> {
        if let Some(error) = lock(&self.state.faults).root.clone() {
            return Err(error);
        }
        Ok(self.root.clone())
    }

    fn claim(
        &self,
        device: &MockDevice,
        number: u8,
        policy: ClaimPolicy,
    ) -> Result<MockInterface, PlatformError> {
        if let Some(error) = lock(&self.state.faults).claim.clone() {
            return Err(error);
        }

        let mut kernel_owned = lock(&self.state.kernel_owned);
        if *kernel_owned {
            if policy == ClaimPolicy::Cooperative {
                return Err(PlatformError::Busy);
            }
            *kernel_owned = false;
            self.state
                .counters
                .forced_detaches
                .fetch_add(1, Ordering::SeqCst);
        }

        self.state.counters.claims.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.claimed_by) = Some(device.node_id());

        Ok(MockInterface {
            number,
            state: Arc::clone(&self.state),
            released: false,
        })
    }

    fn watch_detach(
        &self,
        device: &MockDevice,
        hook: DetachHook,
    ) -> Result<MockWatch, PlatformError> {
        if let Some(error) = lock(&self.state.faults).watch.clone() {
            return Err(error);
        }

        let id = self.state.next_watch.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.detach_hooks).push((id, device.node_id(), hook));
        Ok(MockWatch {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

/// Interface claimed on a [`MockHost`]
pub struct MockInterface {
    number: u8,
    state: Arc<HostState>,
    released: bool,
}

impl UsbInterface for MockInterface {
    type Pipe = MockPipe;

    fn number(&self) -> u8 {
        self.number
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.state.endpoints.clone()
    }

    fn pipe(&self, address: u8) -> Result<MockPipe, PlatformError> {
        if let Some(error) = lock(&self.state.faults).resolve.get(&address).cloned() {
            return Err(error);
        }
        if !self.state.endpoints.iter().any(|ep| ep.address == address) {
            return Err(PlatformError::NotFound);
        }

        Ok(MockPipe {
            address,
            state: Arc::clone(&self.state),
            hook: None,
            open: false,
        })
    }

    fn release(&mut self) -> Result<(), PlatformError> {
        if self.released {
            return Err(PlatformError::InvalidParam);
        }
        if let Some(error) = lock(&self.state.faults).release.clone() {
            return Err(error);
        }

        self.released = true;
        self.state.counters.releases.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.claimed_by) = None;
        Ok(())
    }
}

/// Pipe on a [`MockInterface`]
pub struct MockPipe {
    address: u8,
    state: Arc<HostState>,
    hook: Option<PipeHook>,
    open: bool,
}

impl UsbPipe for MockPipe {
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
        if let Some(error) = lock(&self.state.faults).open.get(&self.address).cloned() {
            return Err(error);
        }

        self.open = true;
        self.state.counters.pipe_opens.fetch_add(1, Ordering::SeqCst);
        let hook = self.hook.clone().unwrap_or_else(|| Arc::new(|_| {}));
        lock(&self.state.open_pipes).insert(self.address, hook);

        let unplug = lock(&self.state.faults).detach_on_open == Some(self.address);
        let claimed = *lock(&self.state.claimed_by);
        if unplug && let Some(node) = claimed {
            self.state.fire_detach(node)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), PlatformError> {
        if !self.open {
            return Err(PlatformError::InvalidParam);
        }
        if let Some(error) = lock(&self.state.faults).close.get(&self.address).cloned() {
            return Err(error);
        }

        self.open = false;
        self.state.counters.pipe_closes.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.open_pipes).remove(&self.address);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn submit(&mut self, data: &[u8]) -> Result<usize, PlatformError> {
        self.state.counters.submits.fetch_add(1, Ordering::SeqCst);

        if !self.open {
            return Err(PlatformError::Io);
        }
        if let Some(error) = lock(&self.state.faults).submit.clone() {
            return Err(error);
        }

        let data = Bytes::copy_from_slice(data);
        lock(&self.state.written).push(data.clone());
        if let Some(hook) = &self.hook {
            hook(PipeEvent::Data(data.clone()));
        }
        Ok(data.len())
    }
}
