use crate::buf::PacketBuf;
use crate::lp::LpL3;
use crate::name::{Name, NameError, PName, TT_NAME};
use crate::tlv::{self, TlvError, TlvReader};
use crate::TscTime;

/// Face identifier. Allocated densely from a fixed-size face table; 0 is
/// never a valid face.
pub type FaceId = u16;

pub const INVALID_FACE: FaceId = 0;

/// TLV type constants for NDN L3 packets.
pub mod tlv_types {
    pub const INTEREST: u32 = 0x05;
    pub const DATA: u32 = 0x06;
    pub const NAME: u32 = 0x07;
    pub const CAN_BE_PREFIX: u32 = 0x21;
    pub const MUST_BE_FRESH: u32 = 0x12;
    pub const FORWARDING_HINT: u32 = 0x1E;
    pub const NONCE: u32 = 0x0A;
    pub const INTEREST_LIFETIME: u32 = 0x0C;
    pub const HOP_LIMIT: u32 = 0x22;
    pub const APPLICATION_PARAMETERS: u32 = 0x24;
    pub const META_INFO: u32 = 0x14;
    pub const CONTENT: u32 = 0x15;
    pub const SIGNATURE_INFO: u32 = 0x16;
    pub const SIGNATURE_VALUE: u32 = 0x17;
    pub const CONTENT_TYPE: u32 = 0x18;
    pub const FRESHNESS_PERIOD: u32 = 0x19;
    pub const FINAL_BLOCK_ID: u32 = 0x1A;
    pub const SIGNATURE_TYPE: u32 = 0x1B;
}

/// Default InterestLifetime when the field is absent (milliseconds).
pub const DEFAULT_INTEREST_LIFETIME_MS: u32 = 4000;

/// Errors from L3 packet decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),
    #[error("name error: {0}")]
    Name(#[from] NameError),
    #[error("unexpected L3 packet type {0}")]
    BadType(u32),
    #[error("Interest has no Nonce")]
    MissingNonce,
    #[error("field value out of range")]
    BadField,
}

/// NackReason assignments from NDNLPv2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    Congestion,
    Duplicate,
    NoRoute,
    Unspecified,
}

impl NackReason {
    pub fn to_nni(self) -> u64 {
        match self {
            NackReason::Congestion => 50,
            NackReason::Duplicate => 100,
            NackReason::NoRoute => 150,
            NackReason::Unspecified => 0,
        }
    }

    pub fn from_nni(v: u64) -> Self {
        match v {
            50 => NackReason::Congestion,
            100 => NackReason::Duplicate,
            150 => NackReason::NoRoute,
            _ => NackReason::Unspecified,
        }
    }
}

impl std::fmt::Display for NackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NackReason::Congestion => "congestion",
            NackReason::Duplicate => "duplicate",
            NackReason::NoRoute => "no-route",
            NackReason::Unspecified => "unspecified",
        };
        write!(f, "{}", s)
    }
}

/// Parsed Interest metadata. The wire bytes stay in the owning
/// [`PacketBuf`]; this carries what the forwarding path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: PName,
    pub can_be_prefix: bool,
    pub must_be_fresh: bool,
    pub fwd_hints: Vec<PName>,
    /// Index into `fwd_hints` selected by the forwarding stage.
    pub active_hint: Option<usize>,
    pub nonce: u32,
    pub lifetime_ms: u32,
    pub hop_limit: Option<u8>,
}

impl Interest {
    pub fn new(name: &Name, nonce: u32) -> Self {
        Self {
            name: PName::from_name(name).expect("name within depth bound"),
            can_be_prefix: false,
            must_be_fresh: false,
            fwd_hints: Vec::new(),
            active_hint: None,
            nonce,
            lifetime_ms: DEFAULT_INTEREST_LIFETIME_MS,
            hop_limit: None,
        }
    }

    /// Decode from the full Interest element wire.
    pub fn decode(wire: &[u8]) -> Result<Self, PacketError> {
        let mut outer = TlvReader::new(wire);
        let body = outer.expect(tlv_types::INTEREST)?;
        Self::decode_body(body)
    }

    fn decode_body(body: &[u8]) -> Result<Self, PacketError> {
        let mut rd = TlvReader::new(body);
        let name_value = rd.expect(TT_NAME)?;
        let name = PName::from_wire_value(name_value.to_vec())?;

        let mut can_be_prefix = false;
        let mut must_be_fresh = false;
        let mut fwd_hints = Vec::new();
        let mut nonce = None;
        let mut lifetime_ms = DEFAULT_INTEREST_LIFETIME_MS;
        let mut hop_limit = None;

        while !rd.is_empty() {
            let (typ, value) = rd.read()?;
            match typ {
                tlv_types::CAN_BE_PREFIX => can_be_prefix = true,
                tlv_types::MUST_BE_FRESH => must_be_fresh = true,
                tlv_types::FORWARDING_HINT => {
                    let mut hints = TlvReader::new(value);
                    while !hints.is_empty() {
                        let (ht, hv) = hints.read()?;
                        if ht == TT_NAME {
                            fwd_hints.push(PName::from_wire_value(hv.to_vec())?);
                        }
                    }
                }
                tlv_types::NONCE => {
                    if value.len() != 4 {
                        return Err(PacketError::BadField);
                    }
                    nonce = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                tlv_types::INTEREST_LIFETIME => {
                    lifetime_ms = tlv::decode_nni(value)?.min(u32::MAX as u64) as u32;
                }
                tlv_types::HOP_LIMIT => {
                    if value.len() != 1 {
                        return Err(PacketError::BadField);
                    }
                    hop_limit = Some(value[0]);
                }
                // ApplicationParameters and anything newer are opaque here.
                _ => {}
            }
        }

        Ok(Self {
            name,
            can_be_prefix,
            must_be_fresh,
            fwd_hints,
            active_hint: None,
            nonce: nonce.ok_or(PacketError::MissingNonce)?,
            lifetime_ms,
            hop_limit,
        })
    }

    /// Encode the full Interest element.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        tlv::append_tlv(&mut body, TT_NAME, self.name.wire());
        if self.can_be_prefix {
            tlv::append_tlv(&mut body, tlv_types::CAN_BE_PREFIX, &[]);
        }
        if self.must_be_fresh {
            tlv::append_tlv(&mut body, tlv_types::MUST_BE_FRESH, &[]);
        }
        if !self.fwd_hints.is_empty() {
            let mut hints = Vec::new();
            for hint in &self.fwd_hints {
                tlv::append_tlv(&mut hints, TT_NAME, hint.wire());
            }
            tlv::append_tlv(&mut body, tlv_types::FORWARDING_HINT, &hints);
        }
        tlv::append_tlv(&mut body, tlv_types::NONCE, &self.nonce.to_be_bytes());
        tlv::append_tlv(
            &mut body,
            tlv_types::INTEREST_LIFETIME,
            &tlv::encode_nni(self.lifetime_ms as u64),
        );
        if let Some(hl) = self.hop_limit {
            tlv::append_tlv(&mut body, tlv_types::HOP_LIMIT, &[hl]);
        }
        let mut out = Vec::with_capacity(body.len() + 4);
        tlv::append_tlv(&mut out, tlv_types::INTEREST, &body);
        out
    }

    /// Absolute expiry of a downstream record created now.
    pub fn expiry(&self, now: TscTime) -> TscTime {
        now + self.lifetime_ms as u64 * 1_000_000
    }
}

/// Parsed Data metadata. Content and signature stay opaque in the wire; the
/// forwarder never inspects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub name: PName,
    /// FreshnessPeriod in milliseconds; 0 when absent (never satisfies
    /// MustBeFresh).
    pub freshness_ms: u32,
}

impl Data {
    pub fn decode(wire: &[u8]) -> Result<Self, PacketError> {
        let mut outer = TlvReader::new(wire);
        let body = outer.expect(tlv_types::DATA)?;
        let mut rd = TlvReader::new(body);
        let name_value = rd.expect(TT_NAME)?;
        let name = PName::from_wire_value(name_value.to_vec())?;

        let mut freshness_ms = 0u32;
        while !rd.is_empty() {
            let (typ, value) = rd.read()?;
            if typ == tlv_types::META_INFO {
                let mut meta = TlvReader::new(value);
                while !meta.is_empty() {
                    let (mt, mv) = meta.read()?;
                    if mt == tlv_types::FRESHNESS_PERIOD {
                        freshness_ms = tlv::decode_nni(mv)?.min(u32::MAX as u64) as u32;
                    }
                }
            }
        }
        Ok(Self { name, freshness_ms })
    }

    /// Build a Data packet wire with a null (digest) signature; used by tests
    /// and traffic tooling.
    pub fn build(name: &Name, freshness_ms: u32, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        tlv::append_tlv(&mut body, TT_NAME, &name.encode_value());
        if freshness_ms > 0 {
            let mut meta = Vec::new();
            tlv::append_tlv(
                &mut meta,
                tlv_types::FRESHNESS_PERIOD,
                &tlv::encode_nni(freshness_ms as u64),
            );
            tlv::append_tlv(&mut body, tlv_types::META_INFO, &meta);
        }
        tlv::append_tlv(&mut body, tlv_types::CONTENT, content);
        let mut siginfo = Vec::new();
        tlv::append_tlv(&mut siginfo, tlv_types::SIGNATURE_TYPE, &[0x00]);
        tlv::append_tlv(&mut body, tlv_types::SIGNATURE_INFO, &siginfo);
        tlv::append_tlv(&mut body, tlv_types::SIGNATURE_VALUE, &[0u8; 32]);
        let mut out = Vec::with_capacity(body.len() + 4);
        tlv::append_tlv(&mut out, tlv_types::DATA, &body);
        out
    }

    /// Absolute freshness deadline for a CS entry stored now.
    pub fn fresh_until(&self, now: TscTime) -> TscTime {
        now + self.freshness_ms as u64 * 1_000_000
    }
}

/// A Nack is an Interest returned by an upstream with a reason carried in
/// the LP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub reason: NackReason,
    pub interest: Interest,
}

/// The L3 packet variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L3Packet {
    Interest(Interest),
    Data(Data),
    Nack(Nack),
}

impl L3Packet {
    /// Classify and parse an L3 wire. `nack_reason` comes from the LP header
    /// and turns an Interest into a Nack.
    pub fn decode(wire: &[u8], nack_reason: Option<NackReason>) -> Result<Self, PacketError> {
        let mut rd = TlvReader::new(wire);
        match rd.peek_type() {
            Some(tlv_types::INTEREST) => {
                let interest = Interest::decode(wire)?;
                match nack_reason {
                    Some(reason) => Ok(L3Packet::Nack(Nack { reason, interest })),
                    None => Ok(L3Packet::Interest(interest)),
                }
            }
            Some(tlv_types::DATA) => {
                if nack_reason.is_some() {
                    return Err(PacketError::BadType(tlv_types::DATA));
                }
                Ok(L3Packet::Data(Data::decode(wire)?))
            }
            Some(t) => Err(PacketError::BadType(t)),
            None => Err(PacketError::Tlv(TlvError::BufferTooShort)),
        }
    }

    pub fn name(&self) -> &PName {
        match self {
            L3Packet::Interest(i) => &i.name,
            L3Packet::Data(d) => &d.name,
            L3Packet::Nack(n) => &n.interest.name,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            L3Packet::Interest(_) => "interest",
            L3Packet::Data(_) => "data",
            L3Packet::Nack(_) => "nack",
        }
    }
}

/// A packet in flight through the data plane: the L3 wire bytes, the parsed
/// metadata, and the LP link-layer fields.
///
/// A `Packet` lives in exactly one queue at a time and moves by value;
/// reference counting exists only on the underlying buffer segments.
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: PacketBuf,
    pub lp: LpL3,
    pub l3: L3Packet,
    /// Arrival timestamp, set by the input stage at enqueue.
    pub timestamp: TscTime,
    pub rx_face: FaceId,
}
