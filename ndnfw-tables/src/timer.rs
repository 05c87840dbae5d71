use ndnfw_core::TscTime;

/// Sentinel for "no id" in the intrusive links.
pub const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    prev: u32,
    next: u32,
    /// Wheel slot this node sits in; `NIL` when unscheduled.
    slot: u32,
}

const DETACHED: TimerNode = TimerNode {
    prev: NIL,
    next: NIL,
    slot: NIL,
};

/// Fixed-resolution timer wheel over arena ids.
///
/// Nodes are preallocated one per schedulable id (PCCT slot); slot lists are
/// intrusive doubly-linked chains of u32 ids, so there are no pointers and
/// the whole wheel drops with its shard. Deadlines beyond one revolution are
/// clamped into the furthest slot; the owner re-arms on premature firing.
pub struct TimerWheel {
    nodes: Vec<TimerNode>,
    heads: Vec<u32>,
    slot_mask: usize,
    interval: u64,
    last_slot: usize,
    next_time: TscTime,
    n_triggered: u64,
}

impl TimerWheel {
    /// `capacity` ids, `2^slot_bits` slots of `interval` nanoseconds each.
    pub fn new(capacity: usize, slot_bits: u32, interval: u64, now: TscTime) -> Self {
        let n_slots = 1usize << slot_bits;
        Self {
            nodes: vec![DETACHED; capacity],
            heads: vec![NIL; n_slots],
            slot_mask: n_slots - 1,
            interval: interval.max(1),
            last_slot: n_slots - 1,
            next_time: now,
            n_triggered: 0,
        }
    }

    pub fn n_triggered(&self) -> u64 {
        self.n_triggered
    }

    pub fn is_scheduled(&self, id: u32) -> bool {
        self.nodes[id as usize].slot != NIL
    }

    /// Schedule `id` to fire at `expiry`, replacing any earlier schedule.
    pub fn schedule(&mut self, id: u32, expiry: TscTime, _now: TscTime) {
        self.cancel(id);
        let n_slots = self.slot_mask + 1;
        let ahead = if expiry <= self.next_time {
            1
        } else {
            (1 + (expiry - self.next_time) / self.interval).min((n_slots - 1) as u64) as usize
        };
        let target = (self.last_slot + ahead) & self.slot_mask;

        let head = self.heads[target];
        {
            let node = &mut self.nodes[id as usize];
            node.prev = NIL;
            node.next = head;
            node.slot = target as u32;
        }
        if head != NIL {
            self.nodes[head as usize].prev = id;
        }
        self.heads[target] = id;
    }

    pub fn cancel(&mut self, id: u32) {
        let node = self.nodes[id as usize];
        if node.slot == NIL {
            return;
        }
        if node.prev == NIL {
            self.heads[node.slot as usize] = node.next;
        } else {
            self.nodes[node.prev as usize].next = node.next;
        }
        if node.next != NIL {
            self.nodes[node.next as usize].prev = node.prev;
        }
        self.nodes[id as usize] = DETACHED;
    }

    /// Advance the wheel to `now`, collecting every fired id into `out`.
    /// Fired nodes are detached before delivery so the owner may reschedule.
    pub fn advance(&mut self, now: TscTime, out: &mut Vec<u32>) {
        while self.next_time <= now {
            self.last_slot = (self.last_slot + 1) & self.slot_mask;
            self.next_time += self.interval;

            let mut id = self.heads[self.last_slot];
            self.heads[self.last_slot] = NIL;
            while id != NIL {
                let next = self.nodes[id as usize].next;
                self.nodes[id as usize] = DETACHED;
                self.n_triggered += 1;
                out.push(id);
                id = next;
            }
        }
    }
}
