//! Transmit scheduler: one worker thread paces sends for every
//! connection on an endpoint.
//!
//! Connections live in a min-heap keyed by their next allowed send time;
//! equal deadlines are served in insertion order. The worker pops the
//! head, asks the connection to transmit one datagram (retransmissions
//! first), and reinserts it at the pacer's next deadline while work
//! remains. New work and shutdown cut the sleep short through the
//! scheduler's event.

use crate::connection::Connection;
use crate::sync::{Clock, SyncEvent};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

struct Node {
    time_us: u64,
    /// FIFO tie-break for equal deadlines.
    order: u64,
    conn: Arc<Connection>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.time_us == other.time_us && self.order == other.order
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we need the earliest first.
        other
            .time_us
            .cmp(&self.time_us)
            .then(other.order.cmp(&self.order))
    }
}

struct SchedShared {
    heap: Mutex<BinaryHeap<Node>>,
    event: SyncEvent,
    running: AtomicBool,
    counter: AtomicU64,
    clock: Clock,
}

pub struct SendScheduler {
    shared: Arc<SchedShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SendScheduler {
    pub fn new(clock: Clock) -> Arc<Self> {
        let shared = Arc::new(SchedShared {
            heap: Mutex::new(BinaryHeap::new()),
            event: SyncEvent::new(),
            running: AtomicBool::new(true),
            counter: AtomicU64::new(0),
            clock,
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("garnet-snd".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn the send worker");
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues a connection to transmit no earlier than `time_us`.
    pub fn schedule(&self, conn: Arc<Connection>, time_us: u64) {
        let order = self.shared.counter.fetch_add(1, Ordering::Relaxed);
        self.shared.heap.lock().unwrap().push(Node {
            time_us,
            order,
            conn,
        });
        self.shared.event.notify();
    }

    /// Queues a connection if it has anything to send, honoring its
    /// pacer. Used after ingress events that may have created work.
    pub fn schedule_if_pending(&self, conn: &Arc<Connection>) {
        if !conn.has_pending_output() {
            return;
        }
        let now = self.shared.clock.now_us();
        let at = conn.next_send_time_us().max(now);
        self.schedule(Arc::clone(conn), at);
    }

    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.event.interrupt();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<SchedShared>) {
    while shared.running.load(Ordering::SeqCst) {
        let now = shared.clock.now_us();
        let head_time = shared.heap.lock().unwrap().peek().map(|n| n.time_us);

        match head_time {
            None => {
                // Nothing queued; sleep until someone schedules.
                shared.event.wait_for(Duration::from_millis(100));
            }
            Some(t) if t > now => {
                shared.event.wait_until(shared.clock.instant_at(t));
            }
            Some(_) => {
                let node = shared.heap.lock().unwrap().pop();
                let Some(node) = node else {
                    continue;
                };
                if node.conn.is_defunct() {
                    continue;
                }
                match node.conn.transmit_one(now) {
                    Some(next_time) => {
                        let order = shared.counter.fetch_add(1, Ordering::Relaxed);
                        shared.heap.lock().unwrap().push(Node {
                            time_us: next_time,
                            order,
                            conn: node.conn,
                        });
                    }
                    None => {
                        // Drained or blocked by the window; the endpoint
                        // requeues it when new work or an ACK arrives.
                    }
                }
            }
        }
    }
}
