//! Per-port frame transmitter.
//!
//! One task owns the raw AF_PACKET socket for exactly one device and a
//! min-heap of scheduled frames keyed on due-time. Frames with earlier
//! due-times are written first; ties fall back to enqueue order. TX
//! counters are bumped only after the kernel accepts the write.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::port::{interface_index, link_is_up, Port, PortCounterSnapshot, PortCounters};
use crate::monotonic_micros;

pub const TX_QUEUE_DEPTH: usize = 4096;

/// Bounded grace for `shutdown` before queued frames are abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// EAGAIN-like write errors retry this many times with growing backoff.
const WRITE_RETRIES: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_micros(50);

/// Kernel link state is re-read at this cadence.
const LINK_POLL: Duration = Duration::from_secs(1);

/// Destination for raw frame writes; the production implementation is an
/// AF_PACKET socket bound to the device, tests substitute a recorder.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
    /// Kernel carrier state for the bound device.
    fn carrier(&self) -> bool;
}

/// AF_PACKET socket bound to one device so writes always leave the
/// intended physical port.
pub struct RawSocket {
    fd: RawFd,
    device: String,
}

impl RawSocket {
    pub fn open(device: &str) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(CoreError::Interface(io::Error::last_os_error()));
        }

        let ifindex = match interface_index(device) {
            Ok(idx) => idx,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex;

        let ret = unsafe {
            libc::bind(
                fd,
                &sll as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(CoreError::Interface(err));
        }

        Ok(Self {
            fd,
            device: device.to_string(),
        })
    }

    /// Request hardware TX timestamping on the socket. Returns whether
    /// the device accepted it; on refusal the monotonic software clock
    /// read before each write stands in.
    pub fn try_enable_hw_timestamps(&self) -> bool {
        const SOF_TIMESTAMPING_TX_HARDWARE: libc::c_int = 1 << 0;
        const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_int = 1 << 6;
        let flags = SOF_TIMESTAMPING_TX_HARDWARE | SOF_TIMESTAMPING_RAW_HARDWARE;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMPING,
                &flags as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        ret == 0
    }
}

impl FrameSink for RawSocket {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::send(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    fn carrier(&self) -> bool {
        link_is_up(&self.device)
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

enum TxCommand {
    Frame { frame: Vec<u8>, due: Instant },
    Shutdown { done: oneshot::Sender<()> },
}

struct Scheduled {
    due: Instant,
    order: u64,
    frame: Vec<u8>,
}

// BinaryHeap is a max-heap; invert so the earliest due-time (then the
// earliest enqueue) pops first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then(other.order.cmp(&self.order))
    }
}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}
impl Eq for Scheduled {}

/// Cheap, cloneable handle to one port's transmitter task.
#[derive(Clone)]
pub struct TxHandle {
    port: String,
    tx: mpsc::Sender<TxCommand>,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
    max_frame: usize,
}

impl TxHandle {
    /// Enqueue a frame to be written at or after `due`.
    ///
    /// Frames refused for a down link or a saturated queue are counted
    /// on the port's `dropped` counter; the caller sees the error but
    /// owes no accounting.
    pub fn send(&self, frame: Vec<u8>, due: Instant) -> Result<()> {
        if frame.len() > self.max_frame {
            return Err(CoreError::Oversize {
                port: self.port.clone(),
                size: frame.len(),
                max: self.max_frame,
            });
        }
        if !self.link_up.load(Ordering::Acquire) {
            self.counters.record_dropped(1);
            return Err(CoreError::PortUnavailable(self.port.clone()));
        }
        self.tx
            .try_send(TxCommand::Frame { frame, due })
            .map_err(|e| {
                self.counters.record_dropped(1);
                match e {
                    mpsc::error::TrySendError::Full(_) => CoreError::Overflow(self.port.clone()),
                    mpsc::error::TrySendError::Closed(_) => {
                        CoreError::PortUnavailable(self.port.clone())
                    }
                }
            })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn counters(&self) -> PortCounterSnapshot {
        self.counters.snapshot()
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    /// Drain within the grace period, then force-close the task.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(TxCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

/// Spawn the transmitter task for one port. `link_up` is shared with the
/// registry so port views reflect carrier state without asking the task.
pub fn spawn(
    port: &Port,
    sink: Box<dyn FrameSink>,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
    queue_depth: usize,
) -> TxHandle {
    link_up.store(sink.carrier(), Ordering::Release);
    let (tx, rx) = mpsc::channel(queue_depth);
    let handle = TxHandle {
        port: port.name.clone(),
        tx,
        counters: counters.clone(),
        link_up: link_up.clone(),
        max_frame: port.max_frame_len(),
    };
    let name = port.name.clone();
    tokio::spawn(run(name, sink, rx, counters, link_up));
    handle
}

async fn run(
    port: String,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<TxCommand>,
    counters: Arc<PortCounters>,
    link_up: Arc<AtomicBool>,
) {
    let mut heap: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut order: u64 = 0;
    let mut link_poll = tokio::time::interval(LINK_POLL);
    link_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(port = %port, "transmitter up");

    loop {
        let next_due = heap.peek().map(|s| s.due);
        let sleep_target = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(TxCommand::Frame { frame, due }) => {
                    if link_up.load(Ordering::Acquire) {
                        heap.push(Scheduled { due, order, frame });
                        order += 1;
                    } else {
                        // Down link: accept and immediately drop.
                        counters.record_dropped(1);
                    }
                }
                Some(TxCommand::Shutdown { done }) => {
                    drain(&port, &mut sink, &mut heap, &counters).await;
                    let _ = done.send(());
                    info!(port = %port, "transmitter shut down");
                    return;
                }
                None => {
                    drain(&port, &mut sink, &mut heap, &counters).await;
                    return;
                }
            },
            _ = sleep_until(sleep_target.into()), if next_due.is_some() => {
                flush_due(&port, &mut sink, &mut heap, &counters, &link_up).await;
            }
            _ = link_poll.tick() => {
                let up = sink.carrier();
                let was_up = link_up.swap(up, Ordering::AcqRel);
                if was_up && !up {
                    // Fatal for pending contents beyond the retry window
                    let pending = heap.len() as u64;
                    if pending > 0 {
                        counters.record_dropped(pending);
                        heap.clear();
                    }
                    warn!(port = %port, pending, "link down, queue flushed");
                } else if !was_up && up {
                    info!(port = %port, "link restored");
                }
            }
        }
    }
}

/// Write every frame whose due-time has arrived.
async fn flush_due(
    port: &str,
    sink: &mut Box<dyn FrameSink>,
    heap: &mut BinaryHeap<Scheduled>,
    counters: &PortCounters,
    link_up: &AtomicBool,
) {
    let now = Instant::now();
    while let Some(head) = heap.peek() {
        if head.due > now {
            break;
        }
        let entry = heap.pop().expect("peeked entry");
        if !write_with_retry(port, sink, &entry.frame, counters).await {
            if !sink.carrier() {
                link_up.store(false, Ordering::Release);
                let pending = heap.len() as u64;
                if pending > 0 {
                    counters.record_dropped(pending);
                    heap.clear();
                }
                warn!(port = %port, "link lost mid-write, queue flushed");
                return;
            }
        }
    }
}

/// One frame to the kernel, retrying transient pressure. Returns whether
/// the write succeeded; failures are already counted.
async fn write_with_retry(
    port: &str,
    sink: &mut Box<dyn FrameSink>,
    frame: &[u8],
    counters: &PortCounters,
) -> bool {
    for attempt in 0..=WRITE_RETRIES {
        // Timestamp read immediately before the write stands in for a
        // hardware capture when the NIC offers none.
        let tx_micros = monotonic_micros();
        match sink.send_frame(frame) {
            Ok(n) => {
                counters.record_tx(n as u64, tx_micros);
                return true;
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(libc::ENOBUFS) =>
            {
                if attempt < WRITE_RETRIES {
                    tokio::time::sleep(WRITE_BACKOFF * (attempt + 1)).await;
                }
            }
            Err(e) => {
                debug!(port = %port, error = %e, "send failed");
                break;
            }
        }
    }
    counters.record_dropped(1);
    false
}

/// Best-effort drain on shutdown, bounded by the grace period.
async fn drain(
    port: &str,
    sink: &mut Box<dyn FrameSink>,
    heap: &mut BinaryHeap<Scheduled>,
    counters: &PortCounters,
) {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while let Some(head) = heap.peek() {
        let due = head.due;
        if due > deadline {
            break;
        }
        if due > Instant::now() {
            sleep_until(due.into()).await;
        }
        let entry = heap.pop().expect("peeked entry");
        write_with_retry(port, sink, &entry.frame, counters).await;
    }
    let abandoned = heap.len() as u64;
    if abandoned > 0 {
        counters.record_dropped(abandoned);
        debug!(port = %port, abandoned, "grace expired, abandoning queue");
    }
}
