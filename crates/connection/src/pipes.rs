//! Pipe manager
//!
//! Resolves the read (IN) and write (OUT) endpoints of a claimed interface
//! to pipes, attaches event hooks before opening, and opens both or none.

use crate::config::EndpointConfig;
use crate::error::{ConnectionError, PipeOperation, Result};
use crate::platform::{PipeHook, UsbInterface, UsbPipe};
use tracing::{debug, warn};

/// Hooks attached to the pipes before they are opened
pub struct PipeHooks {
    pub read: PipeHook,
    pub write: PipeHook,
}

/// Open read/write pipes
pub struct PipePair<P: UsbPipe> {
    read: P,
    write: P,
}

/// Resolve and open both pipes
///
/// If the write pipe fails to open, the already opened read pipe is closed
/// again before the error is returned.
pub fn open_pipes<I: UsbInterface>(
    interface: &I,
    endpoints: &EndpointConfig,
    hooks: PipeHooks,
) -> Result<PipePair<I::Pipe>> {
    let mut read = resolve(interface, endpoints.read, hooks.read)?;
    let mut write = resolve(interface, endpoints.write, hooks.write)?;

    read.open()
        .map_err(|e| ConnectionError::pipe(endpoints.read, PipeOperation::Open, e))?;

    if let Err(e) = write.open() {
        if let Err(rollback) = read.close() {
            warn!(
                "Failed to roll back read pipe {:#04x}: {}",
                endpoints.read, rollback
            );
        }
        return Err(ConnectionError::pipe(
            endpoints.write,
            PipeOperation::Open,
            e,
        ));
    }

    debug!(
        "Opened pipes read={:#04x} write={:#04x}",
        endpoints.read, endpoints.write
    );
    Ok(PipePair { read, write })
}

fn resolve<I: UsbInterface>(interface: &I, address: u8, hook: PipeHook) -> Result<I::Pipe> {
    let mut pipe = interface
        .pipe(address)
        .map_err(|e| ConnectionError::pipe(address, PipeOperation::Resolve, e))?;
    pipe.set_event_hook(hook);
    Ok(pipe)
}

impl<P: UsbPipe> PipePair<P> {
    /// Close the write pipe, then the read pipe
    ///
    /// Both are attempted; the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        let write = close_pipe(&mut self.write);
        let read = close_pipe(&mut self.read);
        write.and(read)
    }

    pub fn is_open(&self) -> bool {
        self.read.is_open() && self.write.is_open()
    }

    pub fn write_mut(&mut self) -> &mut P {
        &mut self.write
    }
}

fn close_pipe<P: UsbPipe>(pipe: &mut P) -> Result<()> {
    if !pipe.is_open() {
        return Ok(());
    }
    pipe.close()
        .map_err(|e| ConnectionError::pipe(pipe.address(), PipeOperation::Close, e))
}
