use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use log::trace;

use crate::buf::{BufferPool, PacketBuf};
use crate::packets::{tlv_types, NackReason};
use crate::tlv::{self, TlvReader};

/// NDNLPv2 TLV types.
pub mod lp_types {
    pub const LP_PACKET: u32 = 100;
    pub const LP_PAYLOAD: u32 = 80;
    pub const LP_SEQ_NUM: u32 = 81;
    pub const FRAG_INDEX: u32 = 82;
    pub const FRAG_COUNT: u32 = 83;
    pub const PIT_TOKEN: u32 = 98;
    pub const NACK: u32 = 800;
    pub const NACK_REASON: u32 = 801;
    pub const CONGESTION_MARK: u32 = 832;
}

/// Maximum PitToken length in bytes.
pub const MAX_PIT_TOKEN_LEN: usize = 32;

/// Per-frame overhead of a fragmented LpPacket: outer TL, LpSeqNum,
/// FragIndex, FragCount, and the LpPayload TL.
const FRAGMENT_OVERHEAD: usize = (1 + 3) + (1 + 1 + 8) + (1 + 1 + 2) + (1 + 1 + 2) + (1 + 3);

/// Smallest MTU at which the fragmenter can make progress.
pub const MIN_MTU: usize = FRAGMENT_OVERHEAD + 2 + MAX_PIT_TOKEN_LEN + 1;

/// An unrecognised LP header field must be dropped unless its type is in
/// [800, 959] and divisible by 4.
fn is_critical(typ: u32) -> bool {
    !(800..=959).contains(&typ) || typ % 4 != 0
}

/// Errors from LP framing and reassembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LpError {
    #[error("TLV error: {0}")]
    Tlv(#[from] tlv::TlvError),
    #[error("unknown critical LP field {0}")]
    CriticalField(u32),
    #[error("fragment index {index} out of range for count {count}")]
    FragRange { index: usize, count: usize },
    #[error("fragment count conflict: had {had}, got {got}")]
    FragCountConflict { had: usize, got: usize },
    #[error("duplicate fragment {0}")]
    DuplicateFragment(usize),
    #[error("PitToken longer than {MAX_PIT_TOKEN_LEN} bytes")]
    TokenTooLong,
    #[error("MTU too small to fragment")]
    MtuTooSmall,
    #[error("buffer allocation failed")]
    Alloc,
}

/// Opaque PIT token, at most 32 bytes. Tokens originated by this forwarder
/// are 8 bytes with the forwarder id in the high byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PitToken {
    len: u8,
    bytes: [u8; MAX_PIT_TOKEN_LEN],
}

impl PitToken {
    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_PIT_TOKEN_LEN],
        }
    }

    pub fn from_u64(v: u64) -> Self {
        let mut t = Self::empty();
        t.bytes[..8].copy_from_slice(&v.to_be_bytes());
        t.len = 8;
        t
    }

    pub fn from_slice(v: &[u8]) -> Result<Self, LpError> {
        if v.len() > MAX_PIT_TOKEN_LEN {
            return Err(LpError::TokenTooLong);
        }
        let mut t = Self::empty();
        t.bytes[..v.len()].copy_from_slice(v);
        t.len = v.len() as u8;
        Ok(t)
    }

    /// Read back an internally originated 8-byte token.
    pub fn as_u64(&self) -> Option<u64> {
        if self.len != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[..8]);
        Some(u64::from_be_bytes(buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PitToken {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for PitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_slice() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Link-layer L3 fields carried alongside a packet: PIT token, nack reason,
/// and congestion mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LpL3 {
    pub pit_token: PitToken,
    pub nack_reason: Option<NackReason>,
    pub cong_mark: u8,
}

impl LpL3 {
    pub fn is_empty(&self) -> bool {
        self.pit_token.is_empty() && self.nack_reason.is_none() && self.cong_mark == 0
    }

    fn encode_fields(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.pit_token.is_empty() {
            tlv::append_tlv(&mut out, lp_types::PIT_TOKEN, self.pit_token.as_slice());
        }
        match self.nack_reason {
            None => {}
            Some(NackReason::Unspecified) => {
                tlv::append_tlv(&mut out, lp_types::NACK, &[]);
            }
            Some(reason) => {
                let mut inner = Vec::new();
                tlv::append_tlv(&mut inner, lp_types::NACK_REASON, &tlv::encode_nni(reason.to_nni()));
                tlv::append_tlv(&mut out, lp_types::NACK, &inner);
            }
        }
        if self.cong_mark != 0 {
            tlv::append_tlv(
                &mut out,
                lp_types::CONGESTION_MARK,
                &tlv::encode_nni(self.cong_mark as u64),
            );
        }
        out
    }
}

/// Fragmentation header of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    pub seq: u64,
    pub index: usize,
    pub count: usize,
}

/// A decoded LP frame: link fields, optional fragmentation header, and the
/// payload range within the frame wire.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub lp: LpL3,
    pub frag: Option<FragHeader>,
    /// Byte range of the L3 payload within the frame; `None` for frames that
    /// carry no payload (keep-alive style frames, dropped silently).
    pub payload: Option<Range<usize>>,
}

fn slice_range(base: &[u8], part: &[u8]) -> Range<usize> {
    let start = part.as_ptr() as usize - base.as_ptr() as usize;
    start..start + part.len()
}

/// Decode one frame from the wire. Bare Interest/Data frames (no LP shell)
/// are accepted as-is.
pub fn decode_frame(wire: &[u8]) -> Result<ParsedFrame, LpError> {
    let mut outer = TlvReader::new(wire);
    match outer.peek_type() {
        Some(tlv_types::INTEREST) | Some(tlv_types::DATA) => {
            return Ok(ParsedFrame {
                lp: LpL3::default(),
                frag: None,
                payload: Some(0..wire.len()),
            });
        }
        _ => {}
    }
    let body = outer.expect(lp_types::LP_PACKET)?;

    let mut lp = LpL3::default();
    let mut seq = None;
    let mut frag_index = 0usize;
    let mut frag_count = 1usize;
    let mut payload = None;

    let mut rd = TlvReader::new(body);
    while !rd.is_empty() {
        let (typ, value) = rd.read()?;
        match typ {
            lp_types::LP_SEQ_NUM => {
                seq = Some(tlv::decode_nni(value).unwrap_or_default());
                if value.len() == 8 {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(value);
                    seq = Some(u64::from_be_bytes(buf));
                }
            }
            lp_types::FRAG_INDEX => frag_index = tlv::decode_nni(value)? as usize,
            lp_types::FRAG_COUNT => frag_count = tlv::decode_nni(value)? as usize,
            lp_types::PIT_TOKEN => lp.pit_token = PitToken::from_slice(value)?,
            lp_types::NACK => {
                let mut inner = TlvReader::new(value);
                let mut reason = NackReason::Unspecified;
                while !inner.is_empty() {
                    let (it, iv) = inner.read()?;
                    if it == lp_types::NACK_REASON {
                        reason = NackReason::from_nni(tlv::decode_nni(iv)?);
                    }
                }
                lp.nack_reason = Some(reason);
            }
            lp_types::CONGESTION_MARK => {
                lp.cong_mark = tlv::decode_nni(value)?.min(u8::MAX as u64) as u8;
            }
            lp_types::LP_PAYLOAD => payload = Some(slice_range(wire, value)),
            t if is_critical(t) => return Err(LpError::CriticalField(t)),
            _ => {}
        }
    }

    let frag = if frag_count > 1 {
        if frag_index >= frag_count {
            return Err(LpError::FragRange {
                index: frag_index,
                count: frag_count,
            });
        }
        Some(FragHeader {
            seq: seq.unwrap_or_default(),
            index: frag_index,
            count: frag_count,
        })
    } else {
        None
    };

    Ok(ParsedFrame { lp, frag, payload })
}

/// Splits outgoing L3 packets into LP frames sized to the face MTU.
///
/// One fragmenter exists per face, owned by the face's TX core; the sequence
/// number is monotonic within it.
pub struct LpFragmenter {
    mtu: usize,
    room: usize,
    next_seq: u64,
}

impl LpFragmenter {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            room: mtu.saturating_sub(FRAGMENT_OVERHEAD),
            next_seq: rand::random::<u64>(),
        }
    }

    /// Frame `l3` (a full L3 wire) with its LP fields, fragmenting as needed.
    pub fn fragment(
        &mut self,
        l3: PacketBuf,
        lp: &LpL3,
        pool: &BufferPool,
    ) -> Result<Vec<PacketBuf>, LpError> {
        let fields = lp.encode_fields();
        let l3_len = l3.len();

        if fields.is_empty() && l3_len <= self.mtu {
            return Ok(vec![l3]);
        }

        let payload_tl = 1 + tlv::varnum_size(l3_len as u64);
        let inner_len = fields.len() + payload_tl + l3_len;
        let single_len = 1 + tlv::varnum_size(inner_len as u64) + inner_len;
        if single_len <= self.mtu {
            return Ok(vec![self.wrap_single(l3, &fields, pool)?]);
        }

        let flat;
        let payload: &[u8] = match l3.contiguous() {
            Some(s) => s,
            None => {
                flat = l3.to_vec();
                &flat
            }
        };

        let first_room = self.room.checked_sub(fields.len()).unwrap_or(0);
        if first_room == 0 || self.room == 0 {
            return Err(LpError::MtuTooSmall);
        }
        let rest = payload.len() - first_room.min(payload.len());
        let count = 1 + (rest + self.room - 1) / self.room;

        let mut frames = Vec::with_capacity(count);
        let mut offset = 0usize;
        for index in 0..count {
            let take = if index == 0 { first_room } else { self.room };
            let end = (offset + take).min(payload.len());

            let mut body = Vec::with_capacity(self.mtu);
            tlv::append_tlv(&mut body, lp_types::LP_SEQ_NUM, &self.next_seq.to_be_bytes());
            self.next_seq = self.next_seq.wrapping_add(1);
            tlv::append_tlv(&mut body, lp_types::FRAG_INDEX, &tlv::encode_nni(index as u64));
            tlv::append_tlv(&mut body, lp_types::FRAG_COUNT, &tlv::encode_nni(count as u64));
            if index == 0 {
                body.extend_from_slice(&fields);
            }
            tlv::append_tlv(&mut body, lp_types::LP_PAYLOAD, &payload[offset..end]);

            let mut frame = Vec::with_capacity(body.len() + 4);
            tlv::append_tlv(&mut frame, lp_types::LP_PACKET, &body);
            frames.push(PacketBuf::copy_from(pool, &frame).ok_or(LpError::Alloc)?);
            offset = end;
        }
        trace!("fragmented {} bytes into {} frames", l3_len, count);
        Ok(frames)
    }

    /// Wrap without fragmenting: push the LP header into the payload
    /// headroom when the buffer is uniquely owned, otherwise chain a header
    /// segment in front of the shared payload.
    fn wrap_single(
        &mut self,
        mut l3: PacketBuf,
        fields: &[u8],
        pool: &BufferPool,
    ) -> Result<PacketBuf, LpError> {
        let payload_tl = {
            let mut tl = Vec::with_capacity(5);
            tlv::encode_varnum(lp_types::LP_PAYLOAD as u64, &mut tl);
            tlv::encode_varnum(l3.len() as u64, &mut tl);
            tl
        };
        let inner_len = fields.len() + payload_tl.len() + l3.len();
        let mut header = Vec::with_capacity(8 + inner_len - l3.len());
        tlv::encode_varnum(lp_types::LP_PACKET as u64, &mut header);
        tlv::encode_varnum(inner_len as u64, &mut header);
        header.extend_from_slice(fields);
        header.extend_from_slice(&payload_tl);

        if !l3.push_headroom(&header) {
            let mut seg = pool.alloc_seg().ok_or(LpError::Alloc)?;
            if !seg.append(&header) {
                return Err(LpError::Alloc);
            }
            l3.prepend_seg(seg);
        }
        Ok(l3)
    }
}

struct PartialPacket {
    frags: Vec<Option<Vec<u8>>>,
    lp: LpL3,
    accepted: usize,
}

impl PartialPacket {
    fn new(count: usize) -> Self {
        Self {
            frags: (0..count).map(|_| None).collect(),
            lp: LpL3::default(),
            accepted: 0,
        }
    }
}

/// Counters kept by one reassembler instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblerCounters {
    pub n_accepted: u64,
    pub n_delivered: u64,
    pub n_evicted: u64,
    pub n_discarded: u64,
}

/// Reassembles fragmented LP frames.
///
/// Partial packets are keyed by `seqnum - frag_index` and held in a
/// bounded LRU; one reassembler exists per face per RX core, exclusively
/// owned by that core.
pub struct LpReassembler {
    capacity: usize,
    parts: HashMap<u64, PartialPacket>,
    order: VecDeque<u64>,
    counters: ReassemblerCounters,
}

impl LpReassembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            parts: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            counters: ReassemblerCounters::default(),
        }
    }

    pub fn counters(&self) -> ReassemblerCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Accept one fragment. Returns the reassembled L3 wire and the LP
    /// fields of fragment 0 once all fragments have arrived.
    pub fn accept(
        &mut self,
        frag: FragHeader,
        lp: LpL3,
        payload: &[u8],
    ) -> Result<Option<(Vec<u8>, LpL3)>, LpError> {
        let key = frag.seq.wrapping_sub(frag.index as u64);
        self.counters.n_accepted += 1;

        if !self.parts.contains_key(&key) {
            if self.parts.len() >= self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.parts.remove(&old);
                    self.counters.n_evicted += 1;
                }
            }
            self.parts.insert(key, PartialPacket::new(frag.count));
            self.order.push_back(key);
        } else {
            self.touch(key);
        }

        let part = self.parts.get_mut(&key).expect("partial just ensured");
        if part.frags.len() != frag.count {
            let had = part.frags.len();
            self.discard(key);
            return Err(LpError::FragCountConflict {
                had,
                got: frag.count,
            });
        }
        if part.frags[frag.index].is_some() {
            return Err(LpError::DuplicateFragment(frag.index));
        }
        if frag.index == 0 {
            part.lp = lp;
        }
        part.frags[frag.index] = Some(payload.to_vec());
        part.accepted += 1;

        if part.accepted < part.frags.len() {
            return Ok(None);
        }

        let part = self.parts.remove(&key).expect("complete partial");
        self.order.retain(|&k| k != key);
        let mut wire = Vec::with_capacity(part.frags.iter().map(|f| f.as_ref().map_or(0, Vec::len)).sum());
        for frag in part.frags {
            wire.extend_from_slice(&frag.expect("all fragments accepted"));
        }
        self.counters.n_delivered += 1;
        Ok(Some((wire, part.lp)))
    }

    fn touch(&mut self, key: u64) {
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key);
        }
    }

    fn discard(&mut self, key: u64) {
        self.parts.remove(&key);
        self.order.retain(|&k| k != key);
        self.counters.n_discarded += 1;
    }
}
