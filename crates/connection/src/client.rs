//! Connection client
//!
//! Owns one device session: locate and claim on [`ConnectionClient::init`],
//! open pipes on [`ConnectionClient::connect`], close them on
//! [`ConnectionClient::disconnect`], release everything on
//! [`ConnectionClient::shutdown`].
//!
//! Lifecycle calls and transfers are serialized by a session mutex, so the
//! client can be shared between threads. Platform callbacks never take that
//! mutex: a device detach only flips the shared connected flag and leaves a
//! marker that the next lifecycle call reconciles.

use crate::config::{ClientConfig, ErrorPolicy};
use crate::dispatch::Dispatcher;
use crate::error::{ConnectionError, PipeOperation, PlatformError, Result};
use crate::identity::{DeviceIdentity, encode_ascii};
use crate::interface::{ClaimedInterface, claim_interface};
use crate::listener::{ClientListener, DataListener};
use crate::locator::find_device;
use crate::pipes::{PipeHooks, PipePair, open_pipes};
use crate::platform::{DetachHook, UsbHost, UsbInterface, UsbPipe};
use crate::rusb_host::{RusbHost, RusbOptions};
use crate::state::{ClientHandle, ConnectionState, Transition};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

type Pipe<H> = <<H as UsbHost>::Interface as UsbInterface>::Pipe;

struct Session<H: UsbHost> {
    state: ConnectionState,
    device: Option<H::Device>,
    interface: Option<ClaimedInterface<H::Interface>>,
    pipes: Option<PipePair<Pipe<H>>>,
    detach_watch: Option<H::Watch>,
}

impl<H: UsbHost> Session<H> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            device: None,
            interface: None,
            pipes: None,
            detach_watch: None,
        }
    }

    fn apply(&mut self, transition: Transition) {
        if let Some(next) = self.state.next(transition) {
            debug!("Connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// USB connection client for one printer
pub struct ConnectionClient<H: UsbHost = RusbHost> {
    host: H,
    config: ClientConfig,
    handle: ClientHandle,
    dispatcher: Arc<Dispatcher>,
    session: Mutex<Session<H>>,
}

impl ConnectionClient<RusbHost> {
    /// Client for the device with the given ids on the local libusb host
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self::with_host(
            RusbHost::new(RusbOptions::default()),
            ClientConfig::new(vendor_id, product_id),
        )
    }
}

impl<H: UsbHost> ConnectionClient<H> {
    pub fn with_host(host: H, config: ClientConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!("Suspicious endpoint configuration: {}", e);
        }

        let handle = ClientHandle::new(config.identity());
        let dispatcher = Arc::new(Dispatcher::new(handle.clone()));

        Self {
            host,
            config,
            handle,
            dispatcher,
            session: Mutex::new(Session::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.handle.identity()
    }

    /// Shared view handed to listeners
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Locate the device and claim its interface
    ///
    /// Repeated calls after a successful init are no-ops.
    pub fn init(&self) -> Result<()> {
        let mut session = self.lock();

        match session.state {
            ConnectionState::ShutDown => return Err(ConnectionError::ShutDown),
            ConnectionState::Uninitialized => {}
            state => {
                debug!("init() in state {}, nothing to do", state);
                return Ok(());
            }
        }

        let info = self.host.info();
        info!("USB host implementation: {}", info.description);
        info!("Implementation version: {}", info.version);

        let device = match self.locate() {
            Ok(device) => device,
            Err(e) => return self.report(e),
        };

        let interface = match claim_interface(&self.host, &device) {
            Ok(interface) => interface,
            Err(e) => return self.report(e),
        };

        session.detach_watch = match self.host.watch_detach(&device, self.detach_hook()) {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!("Detach events unavailable for {}: {}", self.identity(), e);
                None
            }
        };
        session.device = Some(device);
        session.interface = Some(interface);
        session.apply(Transition::Claim);

        info!("Claimed interface of device {}", self.identity());
        Ok(())
    }

    /// Open both pipes; a no-op when already connected
    pub fn connect(&self) -> Result<()> {
        let mut session = self.lock();

        if session.state.is_connected() {
            return Ok(());
        }
        if session.state.is_terminal() {
            return Err(ConnectionError::ShutDown);
        }
        if session.interface.is_none() {
            return Err(ConnectionError::NotClaimed);
        }

        // detached while not connected: the claimed handle is stale
        if self.handle.take_detach() {
            return self.report(ConnectionError::Detached {
                identity: self.identity(),
            });
        }

        if let Some(mut stale) = session.pipes.take()
            && let Err(e) = stale.close()
        {
            debug!("Closing pipes left over from a detach: {}", e);
        }

        let endpoints = self.config.endpoints;
        let on_detach = self.detach_hook();
        let hooks = PipeHooks {
            read: self.dispatcher.read_hook(endpoints.read, Arc::clone(&on_detach)),
            write: self.dispatcher.write_hook(endpoints.write, on_detach),
        };

        let Some(interface) = session.interface.as_ref() else {
            return Err(ConnectionError::NotClaimed);
        };
        let mut pipes = match open_pipes(interface.get(), &endpoints, hooks) {
            Ok(pipes) => pipes,
            Err(e) => return self.report(e),
        };

        if self.handle.take_detach() {
            if let Err(e) = pipes.close() {
                debug!("Closing pipes of a detached device: {}", e);
            }
            return self.report(ConnectionError::Detached {
                identity: self.identity(),
            });
        }

        session.pipes = Some(pipes);
        session.apply(Transition::Connect);
        self.handle.set_connected(true);
        info!("Connected to {}", self.identity());
        self.dispatcher.connection_established();

        // detached between the check above and the flag flip
        if self.handle.take_detach() {
            session.apply(Transition::Detach);
            if self.handle.set_connected(false) {
                self.dispatcher.connection_lost();
            }
        }
        Ok(())
    }

    /// Close both pipes; a no-op when not connected
    pub fn disconnect(&self) -> Result<()> {
        let mut session = self.lock();

        if !session.state.is_connected() {
            debug!("disconnect() in state {}, nothing to do", session.state);
            return Ok(());
        }

        let closed = match session.pipes.take() {
            Some(mut pipes) => pipes.close(),
            None => Ok(()),
        };
        session.apply(Transition::Disconnect);
        if self.handle.set_connected(false) {
            self.dispatcher.connection_lost();
        }
        info!("Disconnected from {}", self.identity());

        match closed {
            Ok(()) => Ok(()),
            Err(e) => self.report(e),
        }
    }

    /// Close pipes if connected and release the interface
    ///
    /// Terminal: every later lifecycle call fails with `ShutDown`.
    pub fn shutdown(&self) -> Result<()> {
        let mut session = self.lock();

        if session.state.is_terminal() {
            return Ok(());
        }

        let was_connected = session.state.is_connected();
        let mut failure = None;

        if let Some(mut pipes) = session.pipes.take() {
            match pipes.close() {
                Err(e) if was_connected => failure = Some(e),
                Err(e) => debug!("Closing pipes left over from a detach: {}", e),
                Ok(()) => {}
            }
        }
        if self.handle.set_connected(false) {
            self.dispatcher.connection_lost();
        }

        session.detach_watch = None;
        if let Some(mut interface) = session.interface.take()
            && let Err(e) = interface.release()
        {
            failure.get_or_insert(e);
        }
        session.device = None;
        session.apply(Transition::Shutdown);
        info!("Connection client for {} shut down", self.identity());

        match failure {
            Some(e) => self.report(e),
            None => Ok(()),
        }
    }

    /// Send raw bytes, blocking until the platform finishes the transfer
    ///
    /// Fails with `NotConnected` without touching the bus when not
    /// connected. Transfer failures follow the configured [`ErrorPolicy`].
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self.transfer(data) {
            Ok(_) => Ok(()),
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => self.report(e),
        }
    }

    /// Send text encoded as 7-bit ASCII
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(&encode_ascii(text))
    }

    /// Send raw bytes and return the platform result unfiltered
    pub fn transfer(&self, data: &[u8]) -> Result<usize> {
        let mut session = self.lock();

        if !session.state.is_connected() || !self.handle.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let endpoint = self.config.endpoints.write;
        let pipes = match session.pipes.as_mut() {
            Some(pipes) if pipes.is_open() => pipes,
            _ => return Err(ConnectionError::NotConnected),
        };
        let written = match pipes.write_mut().submit(data) {
            Ok(written) => written,
            Err(source) => {
                if source == PlatformError::NoDevice {
                    self.device_gone(&mut session);
                }
                return Err(ConnectionError::pipe(endpoint, PipeOperation::Transfer, source));
            }
        };

        debug!("Sent {} of {} bytes to {:#04x}", written, data.len(), endpoint);
        Ok(written)
    }

    pub fn add_client_listener(&self, listener: Arc<dyn ClientListener>) {
        self.dispatcher.client_listeners().add(listener);
    }

    pub fn remove_client_listener(&self, listener: &Arc<dyn ClientListener>) -> bool {
        self.dispatcher.client_listeners().remove(listener)
    }

    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.dispatcher.data_listeners().add(listener);
    }

    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) -> bool {
        self.dispatcher.data_listeners().remove(listener)
    }

    fn locate(&self) -> Result<H::Device> {
        let identity = self.identity();
        let root = self.host.root_hub()?;
        find_device(&root, identity).ok_or(ConnectionError::Discovery { identity })
    }

    fn detach_hook(&self) -> DetachHook {
        let handle = self.handle.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        Arc::new(move || {
            info!("Device {} detached", handle.identity());
            if handle.mark_detached() {
                dispatcher.connection_lost();
            }
        })
    }

    /// A transfer found the device gone without a detach event
    fn device_gone(&self, session: &mut Session<H>) {
        if self.handle.mark_detached() {
            info!("Device {} no longer answers", self.identity());
            self.dispatcher.connection_lost();
        }
        self.handle.take_detach();
        session.apply(Transition::Detach);
    }

    /// Lock the session, folding in any detach seen since the last call
    fn lock(&self) -> MutexGuard<'_, Session<H>> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        if session.state.is_connected() && self.handle.take_detach() {
            info!(
                "Device {} was detached, connect() required",
                self.identity()
            );
            session.apply(Transition::Detach);
        }
        session
    }

    /// Log a caught failure, tell client listeners, then apply the policy
    fn report(&self, error: ConnectionError) -> Result<()> {
        error!("{}", error);
        self.dispatcher.connection_failed(error.clone());

        match self.config.error_policy {
            ErrorPolicy::Report => Ok(()),
            ErrorPolicy::Propagate => Err(error),
        }
    }
}

impl<H: UsbHost> Drop for ConnectionClient<H> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Shutdown on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ClientEvent, channel_listener};
    use crate::mock::{MockDevice, MockHost};
    use crate::platform::UsbNode;
    use async_channel::Receiver;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (MockHost, MockDevice) {
        let root = MockDevice::root();
        let printer = MockDevice::device(0x1203, 0x0172);
        root.attach(printer.clone());
        (MockHost::new(root), printer)
    }

    fn client(host: &MockHost) -> ConnectionClient<MockHost> {
        ConnectionClient::with_host(host.clone(), ClientConfig::default())
    }

    fn watch(client: &ConnectionClient<MockHost>) -> Receiver<ClientEvent> {
        let (listener, rx) = channel_listener();
        client.add_client_listener(listener.clone());
        client.add_data_listener(listener);
        rx
    }

    async fn next(rx: &Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_init_claims_and_watches() {
        let (host, printer) = setup();
        let client = client(&host);

        client.init().unwrap();
        assert_eq!(client.state(), ConnectionState::Claimed);
        assert_eq!(host.claimed_device(), Some(printer.node_id()));
        assert_eq!(host.active_watches(), 1);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_repeated_init_is_noop() {
        let (host, _) = setup();
        let client = client(&host);

        client.init().unwrap();
        client.init().unwrap();
        assert_eq!(host.claims(), 1);
        assert_eq!(client.state(), ConnectionState::Claimed);
    }

    #[test]
    fn test_init_without_device_stays_uninitialized() {
        let host = MockHost::new(MockDevice::root());
        let client = client(&host);

        client.init().unwrap();
        assert_eq!(client.state(), ConnectionState::Uninitialized);
        assert_eq!(client.connect(), Err(ConnectionError::NotClaimed));
    }

    #[test]
    fn test_init_propagates_under_propagate_policy() {
        let host = MockHost::new(MockDevice::root());
        let client = ConnectionClient::with_host(
            host,
            ClientConfig::default().with_error_policy(ErrorPolicy::Propagate),
        );

        assert_eq!(
            client.init(),
            Err(ConnectionError::Discovery {
                identity: DeviceIdentity::new(0x1203, 0x0172)
            })
        );
    }

    #[test]
    fn test_root_hub_failure_is_platform_error() {
        let (host, _) = setup();
        host.fail_root_hub(PlatformError::Access);
        let client = ConnectionClient::with_host(
            host,
            ClientConfig::default().with_error_policy(ErrorPolicy::Propagate),
        );

        assert_eq!(
            client.init(),
            Err(ConnectionError::Platform(PlatformError::Access))
        );
    }

    #[test]
    fn test_watch_failure_does_not_block_init() {
        let (host, _) = setup();
        host.fail_watch(PlatformError::Other {
            message: "hotplug not supported".to_string(),
        });
        let client = client(&host);

        client.init().unwrap();
        assert_eq!(client.state(), ConnectionState::Claimed);
        assert_eq!(host.active_watches(), 0);
    }

    #[test]
    fn test_claim_failure_leaves_client_unclaimed() {
        let (host, _) = setup();
        host.fail_claim(PlatformError::Busy);
        let client = client(&host);

        client.init().unwrap();
        assert_eq!(client.state(), ConnectionState::Uninitialized);
        assert_eq!(client.connect(), Err(ConnectionError::NotClaimed));

        host.clear_faults();
        client.init().unwrap();
        assert_eq!(client.state(), ConnectionState::Claimed);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        client.connect().unwrap();

        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
        assert_eq!(host.pipe_opens(), 2);

        client.disconnect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_silent() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.disconnect().unwrap();
        client.init().unwrap();
        client.disconnect().unwrap();
        assert_eq!(host.pipe_closes(), 0);

        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
    }

    #[test]
    fn test_send_while_disconnected_fails_without_transfer() {
        let (host, _) = setup();
        let client = client(&host);

        assert_eq!(client.send(b"CLS\n"), Err(ConnectionError::NotConnected));
        client.init().unwrap();
        assert_eq!(client.send_text("CLS\n"), Err(ConnectionError::NotConnected));
        client.connect().unwrap();
        client.disconnect().unwrap();
        assert_eq!(client.send(b"CLS\n"), Err(ConnectionError::NotConnected));

        assert_eq!(host.submits(), 0);
    }

    #[tokio::test]
    async fn test_transfer_failure_is_reported_not_raised() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);
        client.init().unwrap();
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);

        host.fail_submit(PlatformError::Timeout);
        client.send(b"PRINT 1\n").unwrap();

        let expected = ConnectionError::pipe(0x01, PipeOperation::Transfer, PlatformError::Timeout);
        assert_eq!(next(&rx).await, ClientEvent::ConnectionFailed(expected.clone()));
        assert_eq!(client.transfer(b"PRINT 1\n"), Err(expected));
        assert!(client.is_connected());
    }

    #[test]
    fn test_connect_failure_keeps_client_disconnected() {
        let (host, _) = setup();
        host.fail_open(0x01, PlatformError::Busy);
        let client = client(&host);

        client.init().unwrap();
        client.connect().unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Claimed);
        assert!(!host.is_pipe_open(0x82));

        host.clear_faults();
        client.connect().unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_detach_moves_to_disconnected_once() {
        let (host, printer) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);

        assert_eq!(host.simulate_detach(&printer).unwrap(), 1);
        assert!(!client.is_connected());
        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);

        assert_eq!(client.state(), ConnectionState::Disconnected);
        // pipes are left to the platform
        assert!(host.is_pipe_open(0x01));

        client.disconnect().unwrap();
        assert_eq!(client.send(b"x"), Err(ConnectionError::NotConnected));
        assert!(rx.is_empty());

        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
        assert!(client.is_connected());
    }

    async fn quiet(rx: &Receiver<ClientEvent>) {
        let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {:?}", extra);
    }

    fn detached() -> ConnectionError {
        ConnectionError::Detached {
            identity: DeviceIdentity::new(0x1203, 0x0172),
        }
    }

    #[tokio::test]
    async fn test_connect_after_detach_while_claimed_fails() {
        let (host, printer) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        assert_eq!(host.simulate_detach(&printer).unwrap(), 1);

        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionFailed(detached()));
        quiet(&rx).await;
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Claimed);
        assert_eq!(host.pipe_opens(), 0);

        // the printer came back
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
    }

    #[tokio::test]
    async fn test_connect_after_detach_while_disconnected_fails() {
        let (host, printer) = setup();
        let client = ConnectionClient::with_host(
            host.clone(),
            ClientConfig::default().with_error_policy(ErrorPolicy::Propagate),
        );
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        client.disconnect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);

        host.simulate_detach(&printer).unwrap();
        assert_eq!(client.connect(), Err(detached()));
        assert_eq!(next(&rx).await, ClientEvent::ConnectionFailed(detached()));
        quiet(&rx).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_detach_during_pipe_open_aborts_connect() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        host.detach_on_open(0x01);
        client.connect().unwrap();

        assert_eq!(next(&rx).await, ClientEvent::ConnectionFailed(detached()));
        quiet(&rx).await;
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Claimed);
        assert!(!host.is_pipe_open(0x01));
        assert!(!host.is_pipe_open(0x82));

        host.clear_faults();
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_read_pipe_losing_device_counts_as_detach() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);

        assert!(host.simulate_pipe_error(0x82, PlatformError::NoDevice).unwrap());
        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);
        quiet(&rx).await;
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.send(b"x"), Err(ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_write_losing_device_counts_as_detach() {
        let (host, printer) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);

        host.fail_submit(PlatformError::NoDevice);
        client.send(b"PRINT 1\n").unwrap();

        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);
        assert_eq!(
            next(&rx).await,
            ClientEvent::ConnectionFailed(ConnectionError::pipe(
                0x01,
                PipeOperation::Transfer,
                PlatformError::NoDevice
            ))
        );
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // the hotplug event that follows does not announce the loss twice
        assert_eq!(host.simulate_detach(&printer).unwrap(), 1);
        quiet(&rx).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_and_is_terminal() {
        let (host, _) = setup();
        let client = client(&host);
        let rx = watch(&client);

        client.init().unwrap();
        client.connect().unwrap();
        client.shutdown().unwrap();

        assert_eq!(next(&rx).await, ClientEvent::ConnectionEstablished);
        assert_eq!(next(&rx).await, ClientEvent::ConnectionLost);
        assert_eq!(host.releases(), 1);
        assert_eq!(host.active_watches(), 0);
        assert!(!host.is_pipe_open(0x01));
        assert_eq!(client.state(), ConnectionState::ShutDown);

        client.shutdown().unwrap();
        assert_eq!(host.releases(), 1);
        assert_eq!(client.init(), Err(ConnectionError::ShutDown));
        assert_eq!(client.connect(), Err(ConnectionError::ShutDown));
        assert_eq!(client.send(b"x"), Err(ConnectionError::NotConnected));
        client.disconnect().unwrap();
    }

    #[test]
    fn test_shutdown_without_init() {
        let (host, _) = setup();
        let client = client(&host);

        client.shutdown().unwrap();
        assert_eq!(client.state(), ConnectionState::ShutDown);
        assert_eq!(host.releases(), 0);
    }

    #[test]
    fn test_drop_releases_interface() {
        let (host, _) = setup();
        {
            let client = client(&host);
            client.init().unwrap();
            client.connect().unwrap();
        }
        assert_eq!(host.releases(), 1);
        assert!(!host.is_pipe_open(0x82));
    }

    #[test]
    fn test_client_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectionClient<MockHost>>();
    }
}
