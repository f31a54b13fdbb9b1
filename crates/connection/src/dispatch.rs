//! Event dispatcher
//!
//! Platform callbacks (device detach, pipe data, pipe error) and lifecycle
//! notifications are fanned out to listeners off the producing thread.
//!
//! Each listener registration owns a lane: a dedicated thread draining an
//! unbounded FIFO queue. Producers only enqueue, so a slow listener never
//! holds up the USB callback thread, and one listener always observes events
//! in the order they were produced. Panics inside a listener are caught and
//! logged per task.

use crate::error::{ConnectionError, PipeOperation, PlatformError};
use crate::identity::decode_ascii;
use crate::listener::{ClientListener, DataListener};
use crate::platform::{DetachHook, PipeEvent, PipeHook};
use crate::registry::ListenerRegistry;
use crate::state::ClientHandle;
use async_channel::{Receiver, Sender, unbounded};
use bytes::Bytes;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

type Task = Box<dyn FnOnce() + Send>;

/// Ordered notification queue served by one thread
#[derive(Clone)]
pub(crate) struct Lane {
    name: Arc<str>,
    tx: Sender<Task>,
}

impl Lane {
    /// Start a lane thread
    ///
    /// The thread exits once every sender is dropped and the queue is empty.
    pub(crate) fn spawn(name: String) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let name: Arc<str> = name.into();
        let thread_name = name.clone();

        if let Err(e) = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_lane(thread_name, rx))
        {
            error!("Failed to spawn listener lane {}: {}", name, e);
        }

        Self { name, tx }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task without blocking
    pub(crate) fn submit(&self, task: Task) {
        if self.tx.try_send(task).is_err() {
            warn!("Listener lane {} is closed, dropping notification", self.name);
        }
    }
}

fn run_lane(name: Arc<str>, rx: Receiver<Task>) {
    trace!("Listener lane {} started", name);

    while let Ok(task) = rx.recv_blocking() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            error!(
                "Listener on lane {} panicked: {}",
                name,
                panic_message(panic.as_ref())
            );
        }
    }

    trace!("Listener lane {} stopped", name);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Fans events out to registered listeners
pub struct Dispatcher {
    client: ClientHandle,
    client_listeners: ListenerRegistry<dyn ClientListener>,
    data_listeners: ListenerRegistry<dyn DataListener>,
}

impl Dispatcher {
    pub fn new(client: ClientHandle) -> Self {
        Self {
            client,
            client_listeners: ListenerRegistry::new("client"),
            data_listeners: ListenerRegistry::new("data"),
        }
    }

    pub fn client_listeners(&self) -> &ListenerRegistry<dyn ClientListener> {
        &self.client_listeners
    }

    pub fn data_listeners(&self) -> &ListenerRegistry<dyn DataListener> {
        &self.data_listeners
    }

    pub fn connection_established(&self) {
        self.notify_clients(|listener, client| listener.connection_established(client));
    }

    pub fn connection_lost(&self) {
        self.notify_clients(|listener, client| listener.connection_lost(client));
    }

    pub fn connection_failed(&self, error: ConnectionError) {
        let error = Arc::new(error);
        self.notify_clients(move |listener, client| listener.connection_failed(client, &error));
    }

    pub fn message_received(&self, data: Bytes) {
        let text: Arc<str> = decode_ascii(&data).into();
        debug!("Received {} bytes", data.len());
        self.notify_data(move |listener| {
            listener.data_received(&data);
            listener.message_received(&text);
        });
    }

    pub fn message_sent(&self, data: Bytes) {
        let text: Arc<str> = decode_ascii(&data).into();
        self.notify_data(move |listener| {
            listener.data_sent(&data);
            listener.message_sent(&text);
        });
    }

    /// Hook for the read (IN) pipe
    ///
    /// `on_detach` runs instead of a failure notification when the pipe
    /// reports the device gone.
    pub(crate) fn read_hook(self: &Arc<Self>, endpoint: u8, on_detach: DetachHook) -> PipeHook {
        let dispatcher = Arc::clone(self);
        Arc::new(move |event| match event {
            PipeEvent::Data(data) => dispatcher.message_received(data),
            PipeEvent::Error(source) => dispatcher.pipe_error(endpoint, source, &on_detach),
        })
    }

    /// Hook for the write (OUT) pipe
    pub(crate) fn write_hook(self: &Arc<Self>, endpoint: u8, on_detach: DetachHook) -> PipeHook {
        let dispatcher = Arc::clone(self);
        Arc::new(move |event| match event {
            PipeEvent::Data(data) => dispatcher.message_sent(data),
            PipeEvent::Error(source) => dispatcher.pipe_error(endpoint, source, &on_detach),
        })
    }

    fn pipe_error(&self, endpoint: u8, source: PlatformError, on_detach: &DetachHook) {
        if source == PlatformError::NoDevice {
            warn!("Pipe {:#04x} lost its device", endpoint);
            on_detach();
            return;
        }
        let error = ConnectionError::pipe(endpoint, PipeOperation::Event, source);
        warn!("{}", error);
        self.connection_failed(error);
    }

    fn notify_clients<F>(&self, notify: F)
    where
        F: Fn(&dyn ClientListener, &ClientHandle) + Send + Sync + 'static,
    {
        let notify = Arc::new(notify);
        for (listener, lane) in self.client_listeners.snapshot() {
            let notify = Arc::clone(&notify);
            let client = self.client.clone();
            lane.submit(Box::new(move || notify(listener.as_ref(), &client)));
        }
    }

    fn notify_data<F>(&self, notify: F)
    where
        F: Fn(&dyn DataListener) + Send + Sync + 'static,
    {
        let notify = Arc::new(notify);
        for (listener, lane) in self.data_listeners.snapshot() {
            let notify = Arc::clone(&notify);
            lane.submit(Box::new(move || notify(listener.as_ref())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Recorder {
        tx: Mutex<mpsc::Sender<String>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }

        fn record(&self, entry: String) {
            let _ = self.tx.lock().unwrap().send(entry);
        }
    }

    impl DataListener for Recorder {
        fn message_received(&self, message: &str) {
            self.record(format!("rx:{message}"));
        }

        fn message_sent(&self, message: &str) {
            self.record(format!("tx:{message}"));
        }
    }

    impl ClientListener for Recorder {
        fn connection_established(&self, _client: &ClientHandle) {
            self.record("up".to_string());
        }

        fn connection_lost(&self, _client: &ClientHandle) {
            self.record("down".to_string());
        }

        fn connection_failed(&self, _client: &ClientHandle, error: &ConnectionError) {
            self.record(format!("failed:{error}"));
        }
    }

    struct Panicking;

    impl DataListener for Panicking {
        fn message_received(&self, _message: &str) {
            panic!("listener bug");
        }

        fn message_sent(&self, _message: &str) {}
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(ClientHandle::new(DeviceIdentity::default())))
    }

    #[test]
    fn test_events_delivered_in_order_per_listener() {
        let dispatcher = dispatcher();
        let (recorder, rx) = Recorder::new();
        dispatcher.data_listeners().add(recorder);

        for i in 0..50 {
            dispatcher.message_received(Bytes::from(format!("{i}")));
        }

        for i in 0..50 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), format!("rx:{i}"));
        }
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let dispatcher = dispatcher();
        let (recorder, rx) = Recorder::new();
        dispatcher.data_listeners().add(Arc::new(Panicking));
        dispatcher.data_listeners().add(recorder);

        dispatcher.message_received(Bytes::from_static(b"first"));
        dispatcher.message_received(Bytes::from_static(b"second"));

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "rx:first");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "rx:second");
    }

    #[test]
    fn test_hooks_route_pipe_events() {
        let dispatcher = dispatcher();
        let (recorder, rx) = Recorder::new();
        dispatcher.data_listeners().add(recorder);

        let read = dispatcher.read_hook(0x82, Arc::new(|| {}));
        let write = dispatcher.write_hook(0x01, Arc::new(|| {}));
        write(PipeEvent::Data(Bytes::from_static(b"PRINT 1\n")));
        read(PipeEvent::Data(Bytes::from_static(&[0x4f, 0x4b, 0xff])));

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "tx:PRINT 1\n");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "rx:OK\u{FFFD}");
    }

    #[test]
    fn test_pipe_errors_split_on_missing_device() {
        let dispatcher = dispatcher();
        let (recorder, rx) = Recorder::new();
        dispatcher.client_listeners().add(recorder);

        let detaches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&detaches);
        let read = dispatcher.read_hook(
            0x82,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        read(PipeEvent::Error(PlatformError::Io));
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            "failed:pipe 0x82 event failed: input/output error"
        );

        read(PipeEvent::Error(PlatformError::NoDevice));
        assert_eq!(detaches.load(Ordering::SeqCst), 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_client_notifications_share_lane_order() {
        let dispatcher = dispatcher();
        let (recorder, rx) = Recorder::new();
        dispatcher.client_listeners().add(recorder);

        dispatcher.connection_established();
        dispatcher.connection_lost();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "up");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "down");
    }

    #[test]
    fn test_no_listeners_is_a_noop() {
        let dispatcher = dispatcher();
        dispatcher.connection_lost();
        dispatcher.message_sent(Bytes::from_static(b"x"));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
