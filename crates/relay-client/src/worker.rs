//! Background delivery of observations to the collector.
//!
//! A [`DeliveryWorker`] owns one OS thread and at most one TCP connection. Callers only
//! push into a bounded in-memory queue; the thread drains it in order, frames each
//! observation with [`RecordCodec`] and writes it to the socket.
//!
//! # Failure handling
//!
//! Connect and write errors never leave the thread. The connection is dropped, the
//! unsent observations go back to the head of the queue and the thread retries after
//! `reconnect_delay`. When the queue is full the oldest observation is discarded.
//!
//! # Fork safety
//!
//! Neither the thread nor the socket survive `fork(2)` in a usable state. The child
//! either calls [`DeliveryWorker::after_fork`] from its post-fork hook, or the worker
//! notices the changed process id on the next observation. Both paths discard the
//! inherited connection and queue, release locks whose owner thread is gone and spawn
//! a fresh thread on demand. A delivery thread that exited for any other reason is
//! respawned the same way.

use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use relay_protocol::Observation;
use relay_protocol::RecordCodec;
use relay_protocol::TransportError;
use tokio_util::codec::Encoder;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config::ClientConfig;
use crate::ObservationSink;

const THREAD_NAME: &str = "metrics-relay-delivery";
/// Marks the short window in which one thread is rebuilding state after a fork.
const RECLAIMING: u32 = 0;

/// Connection state of the delivery thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum ConnectionState {
    #[display("disconnected")]
    Disconnected = 0,
    #[display("connecting")]
    Connecting = 1,
    #[display("connected")]
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Counters describing the worker's activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// observations written to the socket
    pub sent: u64,
    /// observations discarded: queue overflow, encode failure, fork or shutdown
    pub dropped: u64,
    /// successful connects
    pub connects: u64,
    /// delivery threads spawned
    pub spawns: u64,
    /// observations waiting in the queue
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    connects: AtomicU64,
    spawns: AtomicU64,
}

/// State shared between the owning [`DeliveryWorker`] and its thread.
struct Shared {
    config: ClientConfig,
    codec: RecordCodec,
    queue: Mutex<VecDeque<Observation>>,
    wakeup: Condvar,
    connection: Mutex<Option<TcpStream>>,
    state: AtomicU8,
    started: AtomicBool,
    stopped: AtomicBool,
    /// bumped whenever the current thread must be abandoned
    generation: AtomicU64,
    /// process that owns this state, [`RECLAIMING`] while a fork is being handled
    pid: AtomicU32,
    /// set after a connect failure has been logged at warn level
    failure_reported: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        let codec = RecordCodec::new().with_max_frame_length(config.max_frame_length);
        Self {
            config,
            codec,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            connection: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            pid: AtomicU32::new(std::process::id()),
            failure_reported: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn push(&self, observation: Observation) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queue_size {
            queue.pop_front();
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(max_queue_size = self.config.max_queue_size, "Queue full, dropped oldest observation");
        }
        queue.push_back(observation);
        drop(queue);
        self.wakeup.notify_one();
    }

    /// Puts undelivered observations back in front of anything queued meanwhile.
    fn requeue(&self, unsent: Vec<Observation>) {
        let mut queue = self.queue.lock();
        for observation in unsent.into_iter().rev() {
            queue.push_front(observation);
        }
        let mut dropped = 0;
        while queue.len() > self.config.max_queue_size {
            queue.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(dropped, "Queue overflow while disconnected");
        }
    }

    /// Waits up to one flush interval for work, then takes everything queued.
    /// An abandoned thread takes nothing, so observations queued after a reset stay
    /// for its replacement.
    fn next_batch(&self, generation: u64) -> Vec<Observation> {
        let mut queue = self.queue.lock();
        if queue.is_empty() && !self.is_stopped() {
            self.wakeup.wait_for(&mut queue, self.config.flush_interval);
        }
        if !self.is_current(generation) {
            return Vec::new();
        }
        queue.drain(..).collect()
    }

    fn take_all(&self) -> Vec<Observation> {
        self.queue.lock().drain(..).collect()
    }

    /// Opens a connection; state flags are only published while `generation` is current.
    fn connect(&self, generation: u64) -> io::Result<TcpStream> {
        if self.is_current(generation) {
            self.set_state(ConnectionState::Connecting);
        }
        let result = self.open_stream();
        if !self.is_current(generation) {
            return result;
        }
        match result {
            Ok(stream) => {
                self.set_state(ConnectionState::Connected);
                self.started.store(true, Ordering::Release);
                self.failure_reported.store(false, Ordering::Relaxed);
                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                info!(addr = %self.config.collector_addr, "Connected to metrics collector");
                Ok(stream)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn open_stream(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.config.collector_addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.config.write_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "collector address did not resolve",
            )
        }))
    }

    fn report_failure(&self, error: &TransportError) {
        if !self.failure_reported.swap(true, Ordering::Relaxed) {
            warn!(addr = %self.config.collector_addr, error = %error, "Metrics collector unreachable, buffering observations");
        } else {
            debug!(addr = %self.config.collector_addr, error = %error, "Metrics collector still unreachable");
        }
    }

    /// Writes `batch` in order. On failure the connection is dropped and the
    /// observations that were not written are handed back.
    fn deliver(&self, batch: Vec<Observation>, generation: u64) -> Result<(), Vec<Observation>> {
        let mut connection = self.connection.lock();
        if connection.is_none() {
            match self.connect(generation) {
                Ok(stream) if self.is_current(generation) => *connection = Some(stream),
                // abandoned while connecting, the replacement thread opens its own socket
                Ok(_) => return Err(batch),
                Err(e) => {
                    self.report_failure(&TransportError::Io(e));
                    return Err(batch);
                }
            }
        }
        let Some(stream) = connection.as_mut() else {
            return Err(batch);
        };

        let mut codec = self.codec;
        let mut buf = BytesMut::new();
        let mut records = batch.into_iter();
        while let Some(observation) = records.next() {
            buf.clear();
            if let Err(e) = codec.encode(&observation, &mut buf) {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(name = %observation.name, error = %e, "Dropping observation that cannot be encoded");
                continue;
            }
            if let Err(e) = stream.write_all(&buf) {
                *connection = None;
                self.set_state(ConnectionState::Disconnected);
                self.started.store(false, Ordering::Release);
                warn!(addr = %self.config.collector_addr, error = %e, "Lost connection to metrics collector");
                self.failure_reported.store(true, Ordering::Relaxed);

                let mut unsent = vec![observation];
                unsent.extend(records);
                return Err(unsent);
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.connection.lock().take().is_some() {
            debug!("Closed connection to metrics collector");
        }
        self.set_state(ConnectionState::Disconnected);
        self.started.store(false, Ordering::Release);
    }
}

/// Body of the delivery thread.
fn run(shared: Arc<Shared>, generation: u64) {
    debug!(generation, "Delivery thread started");

    while shared.is_current(generation) && !shared.is_stopped() {
        let batch = shared.next_batch(generation);
        if batch.is_empty() || !shared.is_current(generation) {
            continue;
        }
        if let Err(unsent) = shared.deliver(batch, generation) {
            shared.requeue(unsent);
            thread::park_timeout(shared.config.reconnect_delay);
        }
    }

    if shared.is_current(generation) {
        if shared.is_stopped() {
            let remaining = shared.take_all();
            if !remaining.is_empty() {
                if let Err(unsent) = shared.deliver(remaining, generation) {
                    shared
                        .counters
                        .dropped
                        .fetch_add(unsent.len() as u64, Ordering::Relaxed);
                    warn!(dropped = unsent.len(), "Dropping unflushed observations on shutdown");
                }
            }
        }
        shared.disconnect();
    }

    debug!(generation, "Delivery thread exiting");
}

struct WorkerThread {
    handle: JoinHandle<()>,
    generation: u64,
}

/// Owner of the delivery thread and its connection.
pub struct DeliveryWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<WorkerThread>>,
}

impl DeliveryWorker {
    /// Creates an idle worker; the thread is spawned by the first observation.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True once a connection has been established and not lost since.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// True while a delivery thread of the current generation is running.
    pub fn is_alive(&self) -> bool {
        let generation = self.shared.generation.load(Ordering::Acquire);
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.generation == generation && !worker.handle.is_finished())
    }

    pub fn stats(&self) -> WorkerStats {
        let counters = &self.shared.counters;
        WorkerStats {
            sent: counters.sent.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            connects: counters.connects.load(Ordering::Relaxed),
            spawns: counters.spawns.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().len(),
        }
    }

    /// Queues an observation. Never blocks on the network.
    pub fn enqueue(&self, observation: Observation) {
        if self.shared.is_stopped() {
            trace!(name = %observation.name, "Worker stopped, dropping observation");
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.detect_fork();
        self.shared.push(observation);
        self.ensure_running();
    }

    /// Post-fork hook. Call it in the child right after `fork(2)`.
    ///
    /// Discards the inherited connection, queue and thread handle and resets the
    /// `started` flag; the next observation spawns a fresh thread with a fresh
    /// connection. Calling it in the process that created the worker abandons the
    /// running thread the same way, which is how tests reproduce a fork.
    pub fn after_fork(&self) {
        let current = std::process::id();
        loop {
            let recorded = self.shared.pid.load(Ordering::Acquire);
            if recorded == RECLAIMING {
                thread::yield_now();
                continue;
            }
            if self
                .shared
                .pid
                .compare_exchange(recorded, RECLAIMING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.reset(recorded != current);
                self.shared.pid.store(current, Ordering::Release);
                return;
            }
        }
    }

    /// Stops the delivery thread, giving it up to `timeout` to flush the queue.
    ///
    /// Returns false if the thread was still running when the timeout expired.
    /// A stopped worker drops every later observation.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();

        let Some(worker) = self.thread.lock().take() else {
            return true;
        };
        worker.handle.thread().unpark();

        let deadline = Instant::now() + timeout;
        while !worker.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(timeout_ms = timeout.as_millis() as u64, "Delivery thread did not stop in time");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if worker.handle.join().is_err() {
            warn!("Delivery thread panicked");
        }
        info!("Metrics delivery stopped");
        true
    }

    fn detect_fork(&self) {
        let current = std::process::id();
        loop {
            let recorded = self.shared.pid.load(Ordering::Acquire);
            if recorded == current {
                return;
            }
            if recorded == RECLAIMING {
                thread::yield_now();
                continue;
            }
            if self
                .shared
                .pid
                .compare_exchange(recorded, RECLAIMING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                info!(parent_pid = recorded, pid = current, "Process fork detected, resetting metrics delivery");
                self.reset(true);
                self.shared.pid.store(current, Ordering::Release);
                return;
            }
        }
    }

    /// Abandons the current thread and connection. `in_child` means the owning
    /// threads of any held lock no longer exist.
    fn reset(&self, in_child: bool) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);

        let mut thread_slot = lock_after_fork(&self.thread, in_child);
        if let Some(worker) = thread_slot.take() {
            if in_child {
                // the thread behind this handle only exists in the parent
                std::mem::forget(worker.handle);
            } else {
                worker.handle.thread().unpark();
            }
        }
        drop(thread_slot);
        self.shared.wakeup.notify_all();

        let mut queue = lock_after_fork(&self.shared.queue, in_child);
        let inherited = std::mem::take(&mut *queue);
        drop(queue);
        self.shared
            .counters
            .dropped
            .fetch_add(inherited.len() as u64, Ordering::Relaxed);
        if in_child {
            // may have been mid-update in the parent
            std::mem::forget(inherited);
        }

        // closing our copy of the descriptor leaves the parent's socket open
        lock_after_fork(&self.shared.connection, in_child).take();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.started.store(false, Ordering::Release);
        self.shared.failure_reported.store(false, Ordering::Relaxed);
    }

    /// Spawns a delivery thread unless one of the current generation is running.
    fn ensure_running(&self) {
        let generation = self.shared.generation.load(Ordering::Acquire);
        let mut thread_slot = self.thread.lock();
        if let Some(worker) = thread_slot.as_ref() {
            if worker.generation == generation && !worker.handle.is_finished() {
                return;
            }
            if worker.handle.is_finished() {
                warn!("Delivery thread exited unexpectedly, respawning");
            }
        }
        if self.shared.is_stopped() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(shared, generation))
        {
            Ok(handle) => {
                self.shared.counters.spawns.fetch_add(1, Ordering::Relaxed);
                *thread_slot = Some(WorkerThread { handle, generation });
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn delivery thread, will retry on next observation");
            }
        }
    }
}

impl ObservationSink for DeliveryWorker {
    fn submit(&self, observation: Observation) {
        self.enqueue(observation);
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.thread.get_mut().as_ref() {
            worker.handle.thread().unpark();
        }
    }
}

/// Locks `mutex`; in a forked child a lock still held belongs to a thread that was
/// not copied and is released first.
fn lock_after_fork<T>(mutex: &Mutex<T>, in_child: bool) -> MutexGuard<'_, T> {
    if in_child && mutex.is_locked() {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        // SAFETY: only the forking thread runs in the child and it does not hold this
        // lock, so the recorded owner no longer exists.
        unsafe { mutex.force_unlock() };
    }
    mutex.lock()
}
