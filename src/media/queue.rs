//! Bounded leaky queue between a tee branch and a viewer's RTP sink
//!
//! Overflow drops the oldest buffer so a slow viewer never propagates
//! back-pressure to the shared encoder or to any other viewer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use webrtc::rtp::packet::Packet;

/// Bounded drop-oldest packet queue
///
/// `push` never blocks; `pop` waits until a packet is available or the
/// queue is closed.
pub struct LeakyQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct Inner {
    buf: VecDeque<Packet>,
    closed: bool,
}

impl LeakyQueue {
    /// Create a queue holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a packet, evicting the oldest one on overflow
    ///
    /// Packets pushed after `close` are discarded.
    pub fn push(&self, packet: Packet) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return;
            }
            if inner.buf.len() >= self.capacity {
                inner.buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.buf.push_back(packet);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest packet; `None` once closed and drained
    pub async fn pop(&self) -> Option<Packet> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(packet) = inner.buf.pop_front() {
                    return Some(packet);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue, waking all waiting consumers
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of packets currently buffered
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).buf.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total packets evicted due to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
