//! In-order execution stream.
//!
//! Work submitted to a [`Stream`] runs on a dedicated worker thread in
//! submission order, asynchronously to the host. Kernel failures do not
//! surface at submission: the first one is kept as a sticky error and
//! returned by the next [`Stream::synchronize`].

use crate::launch::LaunchConfig;
use mpsgemm_common::{MpsgemmError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Run { label: String, job: Job },
    Fence(Sender<()>),
}

#[derive(Default)]
struct Shared {
    sticky_error: Mutex<Option<MpsgemmError>>,
    kernel_launches: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn record_failure(&self, label: &str, err: MpsgemmError) {
        warn!(label, error = %err, "queued work failed");
        let mut slot = self.sticky_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// A managed execution stream.
pub struct Stream {
    name: String,
    sender: Option<Sender<Command>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("kernel_launches", &self.kernel_launches())
            .finish()
    }
}

impl Stream {
    /// Spawn the worker thread backing a new stream.
    pub fn new(name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name(format!("mpsgemm-stream-{name}"))
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Run { label, job } => {
                            trace!(label = %label, "executing");
                            match panic::catch_unwind(AssertUnwindSafe(job)) {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => worker_shared.record_failure(&label, err),
                                Err(_) => worker_shared.record_failure(
                                    &label,
                                    MpsgemmError::LaunchFailed(format!("{label} aborted")),
                                ),
                            }
                            worker_shared.completed.fetch_add(1, Ordering::SeqCst);
                        }
                        Command::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| MpsgemmError::LaunchFailed(format!("failed to spawn stream worker: {e}")))?;

        debug!(stream = name, "created stream");
        Ok(Self { name: name.to_string(), sender: Some(sender), shared })
    }

    fn submit(&self, command: Command) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(MpsgemmError::QueueClosed)?;
        sender.send(command).map_err(|_| MpsgemmError::QueueClosed)
    }

    /// Enqueue a kernel. The geometry is checked by the caller against the device.
    pub fn launch<F>(&self, config: &LaunchConfig, label: impl Into<String>, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!(
            stream = %self.name,
            kernel = %label,
            grid = ?config.grid,
            block = ?config.block,
            shared_mem = config.shared_mem_bytes,
            "launching kernel"
        );
        self.submit(Command::Run { label, job: Box::new(kernel) })?;
        self.shared.kernel_launches.fetch_add(1, Ordering::SeqCst);
        if cfg!(feature = "launch-check") {
            self.synchronize()?;
        }
        Ok(())
    }

    /// Enqueue a memory operation (copy, fill).
    pub fn enqueue<F>(&self, label: impl Into<String>, op: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(Command::Run { label: label.into(), job: Box::new(op) })
    }

    /// Block until all queued work has run, then report the first failure, if any.
    pub fn synchronize(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.submit(Command::Fence(done))?;
        wait.recv().map_err(|_| MpsgemmError::QueueClosed)?;
        let failure =
            self.shared.sticky_error.lock().unwrap_or_else(PoisonError::into_inner).take();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Kernels launched on this stream so far.
    pub fn kernel_launches(&self) -> u64 {
        self.shared.kernel_launches.load(Ordering::SeqCst)
    }

    /// Queued items (kernels and memory operations) that have finished.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit on its own.
        self.sender.take();
        debug!(stream = %self.name, "destroyed stream");
    }
}
