//! Fan-out hub duplicating one RTP stream to N downstream branches
//!
//! Each downstream link is acquired as a request pad and must be released
//! exactly once. Unlinked pads discard silently (`allow-not-linked`
//! semantics), so the upstream push never stalls on a branch that is still
//! being wired up or torn down.

use crate::media::queue::LeakyQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};
use webrtc::rtp::packet::Packet;

/// Log a buffer-count probe line every this many packets
const PROBE_LOG_INTERVAL: u64 = 100;

/// Fan-out element for one media stream
pub struct Tee {
    name: String,
    branches: Mutex<HashMap<u32, Branch>>,
    next_pad: AtomicU32,
    next_probe: AtomicU64,
    buffers_in: AtomicU64,
}

#[derive(Default)]
struct Branch {
    queue: Option<Arc<LeakyQueue>>,
    probes: HashMap<u64, Arc<AtomicU64>>,
}

/// Request pad handle for one tee branch
///
/// Dropping the handle does NOT release the pad; callers release through
/// the graph so that allocation and release stay paired.
pub struct TeePad {
    tee: Arc<Tee>,
    id: u32,
}

/// Buffer-count probe registered on a tee pad
pub struct ProbeHandle {
    id: u64,
    counter: Arc<AtomicU64>,
}

impl ProbeHandle {
    /// Packets observed by this probe
    pub fn packets(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Tee {
    /// Create a named tee with no branches
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            branches: Mutex::new(HashMap::new()),
            next_pad: AtomicU32::new(0),
            next_probe: AtomicU64::new(1),
            buffers_in: AtomicU64::new(0),
        })
    }

    /// Allocate a new request pad
    ///
    /// The pad starts unlinked; data flows through it only after
    /// [`TeePad::link`].
    pub fn request_pad(self: &Arc<Self>) -> TeePad {
        let id = self.next_pad.fetch_add(1, Ordering::Relaxed);
        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Branch::default());
        trace!(tee = %self.name, pad = id, "request pad allocated");
        TeePad {
            tee: Arc::clone(self),
            id,
        }
    }

    /// Release a request pad, dropping its branch
    pub fn release_pad(&self, pad: TeePad) {
        let removed = self
            .branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pad.id);
        if removed.is_none() {
            warn!(tee = %self.name, pad = pad.id, "released pad was not allocated");
        }
        trace!(tee = %self.name, pad = pad.id, "request pad released");
    }

    /// Duplicate one packet to every linked branch; never blocks
    pub fn push(&self, packet: Packet) {
        let seen = self.buffers_in.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % PROBE_LOG_INTERVAL == 0 {
            trace!(tee = %self.name, buffers = seen, "buffers at tee");
        }

        let branches = self.branches.lock().unwrap_or_else(|e| e.into_inner());
        for branch in branches.values() {
            if let Some(queue) = &branch.queue {
                for counter in branch.probes.values() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                queue.push(packet.clone());
            }
        }
    }

    /// Number of currently allocated request pads
    pub fn pad_count(&self) -> usize {
        self.branches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total packets pushed into this tee
    pub fn buffers_in(&self) -> u64 {
        self.buffers_in.load(Ordering::Relaxed)
    }
}

impl TeePad {
    /// Pad identifier within its tee
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Connect this pad to a downstream queue; data starts flowing here
    pub fn link(&self, queue: Arc<LeakyQueue>) {
        let mut branches = self.tee.branches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(branch) = branches.get_mut(&self.id) {
            branch.queue = Some(queue);
        }
    }

    /// Disconnect the downstream queue; the pad stays allocated
    pub fn unlink(&self) {
        let mut branches = self.tee.branches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(branch) = branches.get_mut(&self.id) {
            branch.queue = None;
        }
    }

    /// Whether a downstream queue is connected
    pub fn is_linked(&self) -> bool {
        let branches = self.tee.branches.lock().unwrap_or_else(|e| e.into_inner());
        branches
            .get(&self.id)
            .map(|b| b.queue.is_some())
            .unwrap_or(false)
    }

    /// Register a buffer-count probe on this pad
    pub fn add_probe(&self) -> ProbeHandle {
        let id = self.tee.next_probe.fetch_add(1, Ordering::Relaxed);
        let counter = Arc::new(AtomicU64::new(0));
        let mut branches = self.tee.branches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(branch) = branches.get_mut(&self.id) {
            branch.probes.insert(id, Arc::clone(&counter));
        }
        ProbeHandle { id, counter }
    }

    /// Remove a previously registered probe
    pub fn remove_probe(&self, probe: &ProbeHandle) {
        let mut branches = self.tee.branches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(branch) = branches.get_mut(&self.id) {
            branch.probes.remove(&probe.id);
        }
    }
}
