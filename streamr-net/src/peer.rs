// SPDX-License-Identifier: MIT OR Apache-2.0

//! Peer identities and the peer book.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("unknown peer type: {0}")]
    UnknownPeerType(String),

    #[error("no address known for peer {0}")]
    UnknownPeerId(String),

    #[error("no peer known at address {0}")]
    UnknownAddress(String),

    #[error("address {address} is already bound to peer {peer_id}")]
    AddressTaken { address: String, peer_id: String },
}

/// Role a peer advertises during the handshake.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PeerType {
    Node,
    Storage,
    Tracker,
    Unknown,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Node => "node",
            PeerType::Storage => "storage",
            PeerType::Tracker => "tracker",
            PeerType::Unknown => "unknown",
        }
    }
}

impl FromStr for PeerType {
    type Err = PeerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "node" => Ok(PeerType::Node),
            "storage" => Ok(PeerType::Storage),
            "tracker" => Ok(PeerType::Tracker),
            "unknown" => Ok(PeerType::Unknown),
            other => Err(PeerError::UnknownPeerType(other.to_string())),
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one peer: an opaque id plus its advertised role.
///
/// Equality is by id only; the role is descriptive.
#[derive(Clone, Debug, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub peer_type: PeerType,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>, peer_type: PeerType) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_type,
        }
    }

    pub fn node(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, PeerType::Node)
    }

    pub fn storage(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, PeerType::Storage)
    }

    pub fn tracker(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, PeerType::Tracker)
    }

    /// Storage peers are nodes too.
    pub fn is_node(&self) -> bool {
        matches!(self.peer_type, PeerType::Node | PeerType::Storage)
    }

    pub fn is_storage(&self) -> bool {
        self.peer_type == PeerType::Storage
    }

    pub fn is_tracker(&self) -> bool {
        self.peer_type == PeerType::Tracker
    }
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.peer_id, self.peer_type)
    }
}

/// Bijective mapping between peer ids and transport addresses.
///
/// Both directions are functions: a peer has exactly one address and an
/// address belongs to exactly one peer. Lookups fail explicitly when absent.
#[derive(Debug, Default)]
pub struct PeerBook {
    id_to_address: HashMap<String, String>,
    address_to_id: HashMap<String, String>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a peer id to an address, replacing the peer's previous address.
    ///
    /// Fails when the address is already bound to a different peer.
    pub fn insert(&mut self, peer_id: &str, address: &str) -> Result<(), PeerError> {
        if let Some(existing) = self.address_to_id.get(address) {
            if existing != peer_id {
                return Err(PeerError::AddressTaken {
                    address: address.to_string(),
                    peer_id: existing.clone(),
                });
            }
        }
        if let Some(previous) = self.id_to_address.insert(peer_id.to_string(), address.to_string())
        {
            self.address_to_id.remove(&previous);
        }
        self.address_to_id
            .insert(address.to_string(), peer_id.to_string());
        Ok(())
    }

    pub fn address(&self, peer_id: &str) -> Result<&str, PeerError> {
        self.id_to_address
            .get(peer_id)
            .map(String::as_str)
            .ok_or_else(|| PeerError::UnknownPeerId(peer_id.to_string()))
    }

    pub fn peer_id(&self, address: &str) -> Result<&str, PeerError> {
        self.address_to_id
            .get(address)
            .map(String::as_str)
            .ok_or_else(|| PeerError::UnknownAddress(address.to_string()))
    }

    pub fn remove(&mut self, peer_id: &str) {
        if let Some(address) = self.id_to_address.remove(peer_id) {
            self.address_to_id.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PeerBook, PeerError, PeerInfo, PeerType};

    #[test]
    fn peer_type_parses_only_known_values() {
        assert_eq!("storage".parse::<PeerType>().unwrap(), PeerType::Storage);
        assert!(matches!(
            "satellite".parse::<PeerType>(),
            Err(PeerError::UnknownPeerType(_))
        ));
    }

    #[test]
    fn storage_is_a_node() {
        let storage = PeerInfo::storage("s1");
        assert!(storage.is_node());
        assert!(storage.is_storage());
        assert!(!storage.is_tracker());
        assert!(!PeerInfo::tracker("t1").is_node());
    }

    #[test]
    fn equality_is_by_id() {
        assert_eq!(PeerInfo::node("a"), PeerInfo::storage("a"));
        assert_ne!(PeerInfo::node("a"), PeerInfo::node("b"));
    }

    #[test]
    fn peer_book_is_a_bijection() {
        let mut book = PeerBook::new();
        book.insert("a", "ws://127.0.0.1:1000").unwrap();
        assert_eq!(book.address("a").unwrap(), "ws://127.0.0.1:1000");
        assert_eq!(book.peer_id("ws://127.0.0.1:1000").unwrap(), "a");

        // Same address for another peer is refused.
        assert!(matches!(
            book.insert("b", "ws://127.0.0.1:1000"),
            Err(PeerError::AddressTaken { .. })
        ));

        // Re-binding a peer releases its previous address.
        book.insert("a", "ws://127.0.0.1:2000").unwrap();
        assert!(book.peer_id("ws://127.0.0.1:1000").is_err());
        assert_eq!(book.peer_id("ws://127.0.0.1:2000").unwrap(), "a");
    }

    #[test]
    fn lookups_fail_explicitly() {
        let book = PeerBook::new();
        assert!(matches!(book.address("nope"), Err(PeerError::UnknownPeerId(_))));
        assert!(matches!(
            book.peer_id("ws://nowhere"),
            Err(PeerError::UnknownAddress(_))
        ));
    }
}
