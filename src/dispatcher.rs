//! Public scheduler handle and the pinned dispatcher.
//!
//! At startup the scheduler core moves into a dedicated thread pinned to
//! the configured CPU and raised to realtime priority; from then on it is
//! the sole mutator of scheduler state. Everything else holds an `Arc` of
//! the shared half: the class index and filter chain, the per-executor
//! activation queues, admission accounting under the tree lock, and the
//! statistics mirrors.
//!
//! Configuration operations validate synchronously on the caller, then
//! travel to the dispatcher over a control channel. The dispatcher drains
//! control commands before activation records in every loop iteration, so
//! a command sent before an activation was posted is always applied first.

use crate::class::ClassShared;
use crate::classify::{Classifier, FilterId, PacketFilter};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ClassConfig, SchedulerConfig};
use crate::error::QfqError;
use crate::fixed::MAX_WSUM;
use crate::packet::Packet;
use crate::scheduler::QfqScheduler;
use crate::stats::{ClassSnapshot, SchedCounters, SchedSnapshot};
use crate::threading::{pin_current_thread, set_realtime_priority};
use crate::activation::ActivationQueues;
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

static SCHED_IDS: AtomicU64 = AtomicU64::new(1);

/// Result of handing a packet to the transmit device.
pub enum TxOutcome {
    Sent,
    /// Device frozen or stopped; the dispatcher keeps the packet and
    /// retries without dequeuing another.
    Busy(Packet),
}

/// The network-device transmit path the dispatcher submits packets to.
pub trait TxDevice: Send {
    fn transmit(&mut self, packet: Packet) -> TxOutcome;
}

/// Sink that drops everything; useful for benchmarks and soak tests.
pub struct DiscardTx;

impl TxDevice for DiscardTx {
    fn transmit(&mut self, _packet: Packet) -> TxOutcome {
        TxOutcome::Sent
    }
}

/// Forwards transmitted packets into a channel. A full bounded channel
/// reads as device backpressure.
pub struct ChannelTx(pub Sender<Packet>);

impl TxDevice for ChannelTx {
    fn transmit(&mut self, packet: Packet) -> TxOutcome {
        match self.0.try_send(packet) {
            Ok(()) => TxOutcome::Sent,
            Err(TrySendError::Full(packet)) => TxOutcome::Busy(packet),
            // Receiver gone: behave like a link that eats frames.
            Err(TrySendError::Disconnected(_)) => TxOutcome::Sent,
        }
    }
}

/// What became of an enqueued packet. Drops are not errors: they are
/// counted and the producer moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Queued,
    /// No class matched and no filter claimed the packet.
    DroppedNoMatch,
    /// The class's inner queue was full.
    DroppedQueueFull,
}

enum Command {
    Register {
        class: Arc<ClassShared>,
        inv_w: u64,
        lmax: u32,
    },
    Reconfigure {
        classid: u64,
        inv_w: u64,
        lmax: u32,
    },
    Remove {
        classid: u64,
    },
    Reset,
}

struct TreeState {
    /// Admission-control weight sum over all classes, active or not.
    wsum: u64,
}

struct Shared {
    classifier: Classifier,
    activations: ActivationQueues,
    counters: Arc<SchedCounters>,
    shutdown: AtomicBool,
    tree: Mutex<TreeState>,
    clock: Arc<dyn Clock>,
    class_queue_limit: usize,
}

/// Handle to a running QFQ-RL scheduler.
///
/// Dropping the handle shuts the dispatcher down cooperatively and joins
/// it.
pub struct Qfq {
    shared: Arc<Shared>,
    ctrl: Sender<Command>,
    spinner: Option<JoinHandle<()>>,
}

/// A producer endpoint bound to one executor slot. Each producer thread
/// should own its own `Producer` so activation records stay on its local
/// queue.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
    executor: usize,
}

impl Qfq {
    /// Start a scheduler whose transmit path discards packets.
    pub fn new(config: SchedulerConfig) -> Qfq {
        Self::with_device(config, Box::new(DiscardTx))
    }

    /// Start a scheduler feeding `device`.
    pub fn with_device(config: SchedulerConfig, device: Box<dyn TxDevice>) -> Qfq {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let counters = Arc::new(SchedCounters::default());
        let shared = Arc::new(Shared {
            classifier: Classifier::new(SCHED_IDS.fetch_add(1, Ordering::Relaxed)),
            activations: ActivationQueues::new(config.executors),
            counters: counters.clone(),
            shutdown: AtomicBool::new(false),
            tree: Mutex::new(TreeState { wsum: 0 }),
            clock: clock.clone(),
            class_queue_limit: config.class_queue_limit,
        });

        let core = QfqScheduler::new(clock, counters);
        let (ctrl_tx, ctrl_rx) = unbounded();
        let spin_cpu = config.spin_cpu;
        let shared_for_spinner = shared.clone();
        let spinner = std::thread::Builder::new()
            .name("qfq-spinner".to_string())
            .spawn(move || spinner_loop(core, shared_for_spinner, ctrl_rx, device, spin_cpu))
            .expect("failed to spawn qfq-spinner");

        Qfq {
            shared,
            ctrl: ctrl_tx,
            spinner: Some(spinner),
        }
    }

    /// Create a class; it starts idle.
    pub fn create_class(&self, classid: u64, config: ClassConfig) -> Result<(), QfqError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(QfqError::Shutdown);
        }
        let (inv_w, weight, lmax) = config.resolve()?;

        let mut tree = self.shared.tree.lock();
        if tree.wsum + weight > MAX_WSUM {
            return Err(QfqError::WsumExceeded {
                requested: tree.wsum + weight,
                limit: MAX_WSUM,
            });
        }
        let class = Arc::new(ClassShared::new(
            classid,
            weight as u32,
            lmax,
            self.shared.class_queue_limit,
        ));
        self.shared.classifier.insert_class(class.clone())?;
        tree.wsum += weight;

        if self
            .ctrl
            .send(Command::Register { class, inv_w, lmax })
            .is_err()
        {
            self.shared.classifier.remove_class(classid);
            tree.wsum -= weight;
            return Err(QfqError::Shutdown);
        }
        Ok(())
    }

    /// Change a class's weight and/or lmax. A no-op change is accepted
    /// without touching scheduling state.
    pub fn change_class(&self, classid: u64, config: ClassConfig) -> Result<(), QfqError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(QfqError::Shutdown);
        }
        let (inv_w, weight, lmax) = config.resolve()?;

        let mut tree = self.shared.tree.lock();
        let class = self
            .shared
            .classifier
            .find_class(classid)
            .ok_or(QfqError::NoSuchClass(classid))?;
        let old_weight = class.weight() as u64;
        if old_weight == weight && class.lmax() == lmax {
            return Ok(());
        }
        let new_wsum = tree.wsum - old_weight + weight;
        if new_wsum > MAX_WSUM {
            return Err(QfqError::WsumExceeded {
                requested: new_wsum,
                limit: MAX_WSUM,
            });
        }
        tree.wsum = new_wsum;
        class.set_params(weight as u32, lmax);

        self.ctrl
            .send(Command::Reconfigure {
                classid,
                inv_w,
                lmax,
            })
            .map_err(|_| QfqError::Shutdown)
    }

    /// Delete a class. Refused while filters are bound to it.
    pub fn delete_class(&self, classid: u64) -> Result<(), QfqError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(QfqError::Shutdown);
        }
        let mut tree = self.shared.tree.lock();
        let class = self
            .shared
            .classifier
            .find_class(classid)
            .ok_or(QfqError::NoSuchClass(classid))?;
        if class.filter_cnt() > 0 {
            return Err(QfqError::ClassBusy(classid));
        }
        self.shared.classifier.remove_class(classid);
        tree.wsum -= class.weight() as u64;

        self.ctrl
            .send(Command::Remove { classid })
            .map_err(|_| QfqError::Shutdown)
    }

    /// Append a filter to the classify chain, optionally binding it to a
    /// class so that class cannot be deleted while the filter is attached.
    pub fn attach_filter(
        &self,
        filter: Box<dyn PacketFilter>,
        bind_to: Option<u64>,
    ) -> Result<FilterId, QfqError> {
        self.shared.classifier.attach_filter(filter, bind_to)
    }

    pub fn detach_filter(&self, id: FilterId) {
        self.shared.classifier.detach_filter(id);
    }

    /// Deactivate everything and purge all class queues.
    pub fn reset(&self) -> Result<(), QfqError> {
        self.ctrl.send(Command::Reset).map_err(|_| QfqError::Shutdown)
    }

    /// Look up a class handle, e.g. to inspect its counters.
    pub fn find_class(&self, classid: u64) -> Option<Arc<ClassShared>> {
        self.shared.classifier.find_class(classid)
    }

    /// A producer endpoint bound to executor slot `executor`.
    pub fn producer(&self, executor: usize) -> Producer {
        assert!(
            executor < self.shared.activations.executors(),
            "executor {executor} out of range"
        );
        Producer {
            shared: self.shared.clone(),
            executor,
        }
    }

    pub fn executors(&self) -> usize {
        self.shared.activations.executors()
    }

    /// Snapshot scheduler and per-class statistics.
    pub fn stats(&self) -> SchedSnapshot {
        let now = self.shared.clock.now_ns();
        let mut classes: Vec<ClassSnapshot> = self
            .shared
            .classifier
            .classes()
            .iter()
            .map(|c| ClassSnapshot::capture(c, now))
            .collect();
        classes.sort_by_key(|c| c.classid);
        let counters = &self.shared.counters;
        SchedSnapshot {
            wsum: self.shared.tree.lock().wsum,
            wsum_active: counters.wsum_active.load(Ordering::Relaxed),
            active_classes: counters.active_classes.load(Ordering::Relaxed),
            classify_drops: counters.classify_drops.load(Ordering::Relaxed),
            enqueue_drops: counters.enqueue_drops.load(Ordering::Relaxed),
            tx_packets: counters.tx_packets.load(Ordering::Relaxed),
            tx_bytes: counters.tx_bytes.load(Ordering::Relaxed),
            classes,
        }
    }

    /// Ask the dispatcher to exit and join it.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.spinner.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Qfq {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Producer {
    /// Classify and enqueue one packet, posting an activation record on
    /// the idle -> backlogged edge. Activation itself always happens on
    /// the dispatcher.
    pub fn enqueue(&self, packet: Packet) -> EnqueueStatus {
        let len = packet.len();
        let Some(class) = self.shared.classifier.classify(&packet) else {
            self.shared
                .counters
                .classify_drops
                .fetch_add(1, Ordering::Relaxed);
            return EnqueueStatus::DroppedNoMatch;
        };

        let outcome = class.push(packet);
        if !outcome.queued {
            self.shared
                .counters
                .enqueue_drops
                .fetch_add(1, Ordering::Relaxed);
            return EnqueueStatus::DroppedQueueFull;
        }

        // Only the 0 -> 1 transition activates; a disabled class waits for
        // a weight change instead.
        if outcome.qlen == 1 && !class.is_disabled() {
            self.shared
                .activations
                .post(self.executor, class.classid, len);
        }
        EnqueueStatus::Queued
    }

    pub fn executor(&self) -> usize {
        self.executor
    }
}

fn apply_command(core: &mut QfqScheduler, shared: &Shared, cmd: Command) {
    match cmd {
        Command::Register {
            class,
            inv_w,
            lmax,
        } => core.register_class(class, inv_w, lmax),
        Command::Reconfigure {
            classid,
            inv_w,
            lmax,
        } => core.reconfigure_class(classid, inv_w, lmax),
        Command::Remove { classid } => core.remove_class(classid),
        Command::Reset => {
            // Records posted before this point must not survive the purge;
            // anything posted afterwards re-observes an empty queue.
            shared.activations.clear();
            core.reset();
        }
    }
}

fn spinner_loop(
    mut core: QfqScheduler,
    shared: Arc<Shared>,
    ctrl: Receiver<Command>,
    mut device: Box<dyn TxDevice>,
    spin_cpu: i32,
) {
    if spin_cpu >= 0 {
        pin_current_thread(spin_cpu as usize);
    }
    set_realtime_priority();

    let mut pending_tx: Option<Packet> = None;
    let mut schedule_counter: u32 = 0;

    while !shared.shutdown.load(Ordering::Relaxed) {
        // Idle wait: backlog empty and nothing posted. Yield periodically
        // so the host scheduler is not starved on an unisolated CPU.
        if pending_tx.is_none() && !core.has_backlog() {
            let mut spins: u32 = 0;
            while !core.has_backlog()
                && !shared.activations.has_work()
                && ctrl.is_empty()
                && !shared.shutdown.load(Ordering::Relaxed)
            {
                spins += 1;
                if spins >= 10_000 {
                    spins = 0;
                    std::thread::yield_now();
                }
                std::hint::spin_loop();
            }
        }

        // Control first: a registration always lands before any activation
        // record that refers to it.
        while let Ok(cmd) = ctrl.try_recv() {
            apply_command(&mut core, &shared, cmd);
        }

        if shared.activations.has_work() {
            core.update_system_time();
            shared
                .activations
                .drain(|record| core.activate_from_record(record.classid, record.pkt_len));
        }

        if pending_tx.is_none() {
            pending_tx = core.dequeue();
        }
        if let Some(packet) = pending_tx.take() {
            let len = packet.len() as u64;
            match device.transmit(packet) {
                TxOutcome::Sent => {
                    shared.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                    shared.counters.tx_bytes.fetch_add(len, Ordering::Relaxed);
                }
                TxOutcome::Busy(packet) => pending_tx = Some(packet),
            }
        }

        // Even with a steady backlog, yield once in a while.
        schedule_counter += 1;
        if schedule_counter >= 100_000 {
            schedule_counter = 0;
            std::thread::yield_now();
        }
    }

    shared.activations.clear();
}
