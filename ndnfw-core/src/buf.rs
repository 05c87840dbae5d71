use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use log::debug;

/// Headroom reserved at the front of freshly allocated TX buffers, sized for
/// a worst-case LPv2 header (32-byte PIT token included).
pub const DEFAULT_HEADROOM: usize = 96;

/// Fixed-size packet buffer pool.
///
/// Storage is pre-allocated and recycled through a lock-free bounded free
/// list; one pool exists per NUMA socket. Exhaustion is reported to the
/// caller and counted - the data plane drops the packet, it never waits.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: ArrayQueue<Box<[u8]>>,
    seg_size: usize,
    socket: u32,
    outstanding: AtomicU64,
    n_alloc_errs: AtomicU64,
}

/// Snapshot of pool health counters.
#[derive(Debug, Clone, Default)]
pub struct PoolCounters {
    pub capacity: u64,
    pub available: u64,
    pub outstanding: u64,
    pub n_alloc_errs: u64,
}

impl BufferPool {
    pub fn new(seg_size: usize, count: usize, socket: u32) -> Self {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(vec![0u8; seg_size].into_boxed_slice());
        }
        debug!(
            "buffer pool created: socket={} segs={} seg_size={}",
            socket, count, seg_size
        );
        Self {
            inner: Arc::new(PoolInner {
                free,
                seg_size,
                socket,
                outstanding: AtomicU64::new(0),
                n_alloc_errs: AtomicU64::new(0),
            }),
        }
    }

    pub fn socket(&self) -> u32 {
        self.inner.socket
    }

    pub fn seg_size(&self) -> usize {
        self.inner.seg_size
    }

    /// Allocate one segment with an empty window. Returns `None` (and counts)
    /// when the pool is exhausted.
    pub fn alloc_seg(&self) -> Option<Seg> {
        match self.inner.free.pop() {
            Some(bytes) => {
                self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
                Some(Seg {
                    inner: Arc::new(SegInner {
                        bytes,
                        pool: Some(self.inner.clone()),
                    }),
                    head: 0,
                    tail: 0,
                })
            }
            None => {
                self.inner.n_alloc_errs.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            capacity: self.inner.free.capacity() as u64,
            available: self.inner.free.len() as u64,
            outstanding: self.inner.outstanding.load(Ordering::Relaxed),
            n_alloc_errs: self.inner.n_alloc_errs.load(Ordering::Relaxed),
        }
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SegInner {
    bytes: Box<[u8]>,
    pool: Option<Arc<PoolInner>>,
}

impl Drop for SegInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.outstanding.fetch_sub(1, Ordering::Relaxed);
            let bytes = std::mem::take(&mut self.bytes);
            let _ = pool.free.push(bytes);
        }
    }
}

/// A reference-counted window into one buffer segment.
///
/// The `Arc` is the segment reference count: clones share storage read-only,
/// and the storage returns to its pool when the last clone drops. Mutation
/// (headroom pushes, appends) is only possible while the segment is uniquely
/// owned.
pub struct Seg {
    inner: Arc<SegInner>,
    head: u32,
    tail: u32,
}

impl Seg {
    /// A pool-less segment owning `data` outright; used for reassembled
    /// packets whose size is not known up front.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let tail = data.len() as u32;
        Seg {
            inner: Arc::new(SegInner {
                bytes: data.into_boxed_slice(),
                pool: None,
            }),
            head: 0,
            tail,
        }
    }

    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn capacity(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn headroom(&self) -> usize {
        self.head as usize
    }

    pub fn tailroom(&self) -> usize {
        self.inner.bytes.len() - self.tail as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.bytes[self.head as usize..self.tail as usize]
    }

    fn reserve_headroom(&mut self, headroom: usize) {
        debug_assert!(self.is_empty() && headroom <= self.capacity());
        self.head = headroom as u32;
        self.tail = self.head;
    }

    /// Prepend `data` into the headroom. Fails if the segment is shared or
    /// the headroom is too small.
    pub fn push_front(&mut self, data: &[u8]) -> bool {
        if data.len() > self.head as usize {
            return false;
        }
        let head = self.head as usize;
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.bytes[head - data.len()..head].copy_from_slice(data);
                self.head -= data.len() as u32;
                true
            }
            None => false,
        }
    }

    /// Append `data` into the tailroom. Fails if the segment is shared or
    /// the tailroom is too small.
    pub fn append(&mut self, data: &[u8]) -> bool {
        if data.len() > self.tailroom() {
            return false;
        }
        let tail = self.tail as usize;
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.bytes[tail..tail + data.len()].copy_from_slice(data);
                self.tail += data.len() as u32;
                true
            }
            None => false,
        }
    }

    /// Narrow the window to a sub-range of the current payload (zero-copy).
    pub fn narrow(&mut self, start: usize, len: usize) -> bool {
        if start + len > self.len() {
            return false;
        }
        self.head += start as u32;
        self.tail = self.head + len as u32;
        true
    }

    /// Number of live references to the underlying storage.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Clone for Seg {
    fn clone(&self) -> Self {
        Seg {
            inner: self.inner.clone(),
            head: self.head,
            tail: self.tail,
        }
    }
}

impl std::fmt::Debug for Seg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seg")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// A scatter-gather chain of segments holding one packet's wire bytes.
///
/// A `PacketBuf` moves between queues; `clone()` is zero-copy and shares the
/// underlying segments read-only.
#[derive(Clone, Debug, Default)]
pub struct PacketBuf {
    segs: Vec<Seg>,
}

impl PacketBuf {
    /// Allocate an empty buffer with headroom from `pool`.
    pub fn with_headroom(pool: &BufferPool, headroom: usize) -> Option<Self> {
        let mut seg = pool.alloc_seg()?;
        seg.reserve_headroom(headroom.min(seg.capacity()));
        Some(Self { segs: vec![seg] })
    }

    /// Copy `data` into a pooled buffer with default headroom, falling back
    /// to a heap segment when `data` exceeds the pool segment size.
    pub fn copy_from(pool: &BufferPool, data: &[u8]) -> Option<Self> {
        if data.len() + DEFAULT_HEADROOM <= pool.seg_size() {
            let mut buf = Self::with_headroom(pool, DEFAULT_HEADROOM)?;
            let ok = buf.segs[0].append(data);
            debug_assert!(ok);
            Some(buf)
        } else {
            Some(Self::from_vec(data.to_vec()))
        }
    }

    /// Wrap an owned byte vector as a single heap segment.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            segs: vec![Seg::from_vec(data)],
        }
    }

    pub fn len(&self) -> usize {
        self.segs.iter().map(Seg::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_segs(&self) -> usize {
        self.segs.len()
    }

    /// The whole payload as one slice, available when the chain has a single
    /// segment (always true for received and reassembled L3 packets).
    pub fn contiguous(&self) -> Option<&[u8]> {
        match self.segs.len() {
            1 => Some(self.segs[0].as_slice()),
            _ => None,
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Seg::as_slice)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segs {
            out.extend_from_slice(seg.as_slice());
        }
        out
    }

    /// Prepend `data` in place when the first segment is uniquely owned and
    /// has room; otherwise the caller must chain a fresh header segment.
    pub fn push_headroom(&mut self, data: &[u8]) -> bool {
        match self.segs.first_mut() {
            Some(seg) => seg.push_front(data),
            None => false,
        }
    }

    /// Chain a segment in front (header segment for shared payloads).
    pub fn prepend_seg(&mut self, seg: Seg) {
        self.segs.insert(0, seg);
    }

    pub fn append_slice(&mut self, data: &[u8]) -> bool {
        match self.segs.last_mut() {
            Some(seg) => seg.append(data),
            None => false,
        }
    }

    /// Narrow a single-segment buffer to `len` bytes starting at `start`,
    /// without copying. Fails on chains.
    pub fn trim(&mut self, start: usize, len: usize) -> bool {
        match self.segs.as_mut_slice() {
            [seg] => seg.narrow(start, len),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_recycles_segments() {
        let pool = BufferPool::new(256, 2, 0);
        let a = pool.alloc_seg().unwrap();
        let _b = pool.alloc_seg().unwrap();
        assert!(pool.alloc_seg().is_none());
        assert_eq!(pool.counters().n_alloc_errs, 1);
        drop(a);
        assert!(pool.alloc_seg().is_some());
    }

    #[test]
    fn test_clone_blocks_mutation() {
        let pool = BufferPool::new(256, 4, 0);
        let mut buf = PacketBuf::with_headroom(&pool, 32).unwrap();
        assert!(buf.append_slice(b"payload"));
        let shared = buf.clone();
        assert!(!buf.push_headroom(b"hdr"));
        assert!(!buf.append_slice(b"more"));
        drop(shared);
        assert!(buf.push_headroom(b"hdr"));
        assert_eq!(buf.to_vec(), b"hdrpayload");
    }

    #[test]
    fn test_shared_payload_header_chain() {
        let pool = BufferPool::new(256, 4, 0);
        let mut buf = PacketBuf::with_headroom(&pool, 16).unwrap();
        assert!(buf.append_slice(b"data"));
        let mut clone = buf.clone();
        let mut hdr = pool.alloc_seg().unwrap();
        assert!(hdr.append(b"lp:"));
        clone.prepend_seg(hdr);
        assert_eq!(clone.num_segs(), 2);
        assert_eq!(clone.to_vec(), b"lp:data");
        assert!(clone.contiguous().is_none());
        // the original is untouched
        assert_eq!(buf.to_vec(), b"data");
    }

    #[test]
    fn test_outstanding_accounting() {
        let pool = BufferPool::new(128, 4, 1);
        let a = pool.alloc_seg().unwrap();
        let b = a.clone();
        assert_eq!(pool.counters().outstanding, 1);
        drop(a);
        assert_eq!(pool.counters().outstanding, 1);
        drop(b);
        assert_eq!(pool.counters().outstanding, 0);
        assert_eq!(pool.counters().available, 4);
    }

    #[test]
    fn test_copy_from_large_falls_back_to_heap() {
        let pool = BufferPool::new(128, 2, 0);
        let big = vec![0xABu8; 4096];
        let buf = PacketBuf::copy_from(&pool, &big).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.counters().outstanding, 0);
    }
}
