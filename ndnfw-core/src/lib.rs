pub mod buf;
pub mod error;
pub mod lp;
pub mod name;
pub mod packets;
pub mod tlv;

pub use buf::{BufferPool, PacketBuf};
pub use error::FwdError;
pub use lp::{LpFragmenter, LpL3, LpReassembler, PitToken};
pub use name::{Name, PName};
pub use packets::{Data, FaceId, Interest, L3Packet, Nack, NackReason, Packet};

/// Nanosecond timestamp on the data-plane clock.
///
/// Workers read the clock once per burst and thread the value through; table
/// code never reads the clock itself so tests can drive time explicitly.
pub type TscTime = u64;
