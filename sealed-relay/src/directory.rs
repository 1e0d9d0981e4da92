//! Client-side view of who is connected to the relay.
//!
//! The relay's own directory is authoritative; this one is rebuilt from the
//! `peer_list`, `peer_joined` and `peer_left`/`quit` envelopes it pushes.
//! Entries are replaced wholesale, never patched in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use rsa::RsaPublicKey;
use tokio::sync::Mutex;

use crate::{
    crypto::{self, CryptoError},
    envelope::PeerInfo,
};

/// Directory shared by the receive loop and the send path.
pub type SharedDirectory = Arc<Mutex<PeerDirectory>>;

#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub public_key: RsaPublicKey,
    pub fingerprint: String,
}

/// A peer entry that could not be applied, with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub username: String,
    pub error: CryptoError,
}

#[derive(Debug)]
pub struct PeerDirectory {
    own_username: String,
    peers: BTreeMap<String, KnownPeer>,
}

impl PeerDirectory {
    pub fn new(own_username: impl Into<String>) -> Self {
        Self {
            own_username: own_username.into(),
            peers: BTreeMap::new(),
        }
    }

    pub fn shared(own_username: impl Into<String>) -> SharedDirectory {
        Arc::new(Mutex::new(Self::new(own_username)))
    }

    /// Inserts or replaces `username`. Our own name is ignored.
    ///
    /// Returns `Ok(false)` when the entry was skipped because it is ourselves.
    pub fn insert(&mut self, username: &str, public_key_pem: &str) -> Result<bool, CryptoError> {
        if username == self.own_username {
            return Ok(false);
        }
        let public_key = crypto::parse_public_key(public_key_pem)?;
        let fingerprint = crypto::fingerprint(&public_key)?;
        self.peers.insert(
            username.to_string(),
            KnownPeer {
                public_key,
                fingerprint,
            },
        );
        Ok(true)
    }

    /// Merges a `peer_list` snapshot. Bad keys are skipped and reported; the
    /// rest of the snapshot is still applied.
    pub fn merge(&mut self, peers: &[PeerInfo]) -> Vec<Rejected> {
        let mut rejected = Vec::new();
        for peer in peers {
            if let Err(error) = self.insert(&peer.username, &peer.public_key) {
                rejected.push(Rejected {
                    username: peer.username.clone(),
                    error,
                });
            }
        }
        rejected
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.peers.remove(username).is_some()
    }

    pub fn get(&self, username: &str) -> Option<&KnownPeer> {
        self.peers.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.peers.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn own_username(&self) -> &str {
        &self.own_username
    }

    /// Everyone a message should be sealed for.
    pub fn recipients(&self) -> impl Iterator<Item = (&str, &RsaPublicKey)> {
        self.peers
            .iter()
            .map(|(username, peer)| (username.as_str(), &peer.public_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnownPeer)> {
        self.peers
            .iter()
            .map(|(username, peer)| (username.as_str(), peer))
    }
}
