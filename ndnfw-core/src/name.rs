use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;

use crate::tlv::{self, TlvReader};

/// TLV types used inside a Name element.
pub const TT_NAME: u32 = 0x07;
pub const TT_GENERIC_COMPONENT: u32 = 0x08;
pub const TT_IMPLICIT_DIGEST_COMPONENT: u32 = 0x01;

/// Maximum number of name components the forwarder tracks.
pub const MAX_NAME_DEPTH: usize = 32;

/// Errors from name parsing and canonicalisation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("malformed name: {0}")]
    Malformed(#[from] tlv::TlvError),
    #[error("name has more than {MAX_NAME_DEPTH} components")]
    TooDeep,
}

/// A hierarchical NDN name: an ordered list of component byte strings.
///
/// This is the management-side representation; the data plane works with
/// [`PName`] which carries the wire bytes and precomputed prefix hashes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name {
    pub components: Vec<Vec<u8>>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a URI-style path such as `/a/b/c`. An empty or `/` path yields
    /// the empty name.
    pub fn from_str(path: &str) -> Self {
        let mut name = Name::new();
        for component in path.split('/') {
            if !component.is_empty() {
                name.components.push(component.as_bytes().to_vec());
            }
        }
        name
    }

    pub fn append(&mut self, component: Vec<u8>) -> &mut Self {
        self.components.push(component);
        self
    }

    pub fn append_str(&mut self, component: &str) -> &mut Self {
        self.components.push(component.as_bytes().to_vec());
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.len() <= other.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }

    pub fn get_prefix(&self, length: usize) -> Name {
        Name {
            components: self.components.iter().take(length).cloned().collect(),
        }
    }

    /// Encode the TLV-VALUE of the Name element: the concatenation of
    /// component TLVs, without the outer Name header.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.components {
            tlv::append_tlv(&mut out, TT_GENERIC_COMPONENT, component);
        }
        out
    }

    /// Encode the full Name element.
    pub fn encode(&self) -> Vec<u8> {
        let value = self.encode_value();
        let mut out = Vec::with_capacity(value.len() + 4);
        tlv::append_tlv(&mut out, TT_NAME, &value);
        out
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{}", String::from_utf8_lossy(component))?;
        }
        Ok(())
    }
}

/// Canonical parsed name: raw wire bytes of the Name TLV-VALUE plus the end
/// offset of every component and one 64-bit hash per prefix length.
///
/// `hashes[i]` covers the wire bytes of the first `i` components; the hash is
/// advisory and all table comparisons fall back to comparing the stored wire
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PName {
    value: Vec<u8>,
    comp_end: Vec<u16>,
    hashes: Vec<u64>,
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(bytes);
    h.finish()
}

impl PName {
    /// Canonicalise the TLV-VALUE of a Name element.
    pub fn from_wire_value(value: Vec<u8>) -> Result<Self, NameError> {
        let mut comp_end = Vec::new();
        let mut rd = TlvReader::new(&value);
        while !rd.is_empty() {
            let _ = rd.read()?;
            if comp_end.len() >= MAX_NAME_DEPTH {
                return Err(NameError::TooDeep);
            }
            comp_end.push(rd.position() as u16);
        }
        let mut hashes = Vec::with_capacity(comp_end.len() + 1);
        hashes.push(hash_bytes(&[]));
        for &end in &comp_end {
            hashes.push(hash_bytes(&value[..end as usize]));
        }
        Ok(Self {
            value,
            comp_end,
            hashes,
        })
    }

    pub fn from_name(name: &Name) -> Result<Self, NameError> {
        Self::from_wire_value(name.encode_value())
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.comp_end.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comp_end.is_empty()
    }

    /// The full Name TLV-VALUE.
    pub fn wire(&self) -> &[u8] {
        &self.value
    }

    /// Wire bytes of the first `n` components. `n` must not exceed `len()`.
    pub fn prefix_wire(&self, n: usize) -> &[u8] {
        if n == 0 {
            &[]
        } else {
            &self.value[..self.comp_end[n - 1] as usize]
        }
    }

    /// Hash of the first `n` components.
    pub fn prefix_hash(&self, n: usize) -> u64 {
        self.hashes[n]
    }

    /// Dispatch hash for NDT lookup: the hash over the first
    /// `min(prefix_len, len)` components. Shorter names hash everything they
    /// have.
    pub fn dispatch_hash(&self, prefix_len: usize) -> u64 {
        self.hashes[prefix_len.min(self.len())]
    }

    /// Whether the first `n` components of `self` equal `prefix_wire`.
    pub fn has_prefix(&self, prefix_wire: &[u8]) -> bool {
        self.value.len() >= prefix_wire.len()
            && &self.value[..prefix_wire.len()] == prefix_wire
            && (prefix_wire.is_empty()
                || self.comp_end.iter().any(|&e| e as usize == prefix_wire.len()))
    }

    /// Rebuild the component list (management/diagnostic use).
    pub fn to_name(&self) -> Name {
        let mut name = Name::new();
        let mut rd = TlvReader::new(&self.value);
        while !rd.is_empty() {
            if let Ok((_, v)) = rd.read() {
                name.components.push(v.to_vec());
            }
        }
        name
    }
}

impl fmt::Display for PName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_str() {
        let name = Name::from_str("/hello/world");
        assert_eq!(name.len(), 2);
        assert_eq!(name.components[0], b"hello");
        assert_eq!(name.to_string(), "/hello/world");
        assert_eq!(Name::from_str("/").len(), 0);
        assert_eq!(Name::from_str("").to_string(), "/");
    }

    #[test]
    fn test_name_prefix() {
        let a = Name::from_str("/a/b");
        let b = Name::from_str("/a/b/c");
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(a.is_prefix_of(&a));
        assert_eq!(b.get_prefix(2), a);
    }

    #[test]
    fn test_pname_roundtrip() {
        let name = Name::from_str("/a/bb/ccc");
        let pname = PName::from_name(&name).unwrap();
        assert_eq!(pname.len(), 3);
        assert_eq!(pname.to_name(), name);
        assert_eq!(pname.wire(), name.encode_value().as_slice());
    }

    #[test]
    fn test_prefix_hashes_consistent() {
        let long = PName::from_name(&Name::from_str("/a/b/c/d")).unwrap();
        let short = PName::from_name(&Name::from_str("/a/b")).unwrap();
        assert_eq!(long.prefix_hash(2), short.prefix_hash(2));
        assert_eq!(long.prefix_wire(2), short.wire());
        assert_ne!(long.prefix_hash(2), long.prefix_hash(3));
    }

    #[test]
    fn test_dispatch_hash_truncation() {
        // Shorter names hash all available components.
        let one = PName::from_name(&Name::from_str("/a")).unwrap();
        assert_eq!(one.dispatch_hash(2), one.prefix_hash(1));
        let three = PName::from_name(&Name::from_str("/a/b/c")).unwrap();
        assert_eq!(three.dispatch_hash(2), three.prefix_hash(2));
        // Names sharing the first two components dispatch identically.
        let sib = PName::from_name(&Name::from_str("/a/b/d")).unwrap();
        assert_eq!(three.dispatch_hash(2), sib.dispatch_hash(2));
    }

    #[test]
    fn test_has_prefix_component_boundary() {
        let pname = PName::from_name(&Name::from_str("/ab/c")).unwrap();
        let prefix = PName::from_name(&Name::from_str("/ab")).unwrap();
        assert!(pname.has_prefix(prefix.wire()));
        assert!(pname.has_prefix(&[]));
        // A byte prefix that does not end on a component boundary is not a
        // name prefix.
        assert!(!pname.has_prefix(&pname.wire()[..1]));
    }

    #[test]
    fn test_too_deep_rejected() {
        let mut name = Name::new();
        for i in 0..MAX_NAME_DEPTH + 1 {
            name.append_str(&format!("c{}", i));
        }
        assert_eq!(PName::from_name(&name), Err(NameError::TooDeep));
    }
}
