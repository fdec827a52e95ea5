//! Shared peer types.

use std::collections::{HashMap, HashSet};

use crate::common::addr::OverlayAddr;
use crate::net::time::LocalTime;

/// Reported-peer store.
///
/// Used to store gossiped peer addresses and metadata. The overlay keeps this
/// in memory only; the trait is the seam for alternative backings.
pub trait Store {
    /// Get a known peer address.
    fn get(&self, addr: &OverlayAddr) -> Option<&KnownAddress>;

    /// Get a known peer address mutably.
    fn get_mut(&mut self, addr: &OverlayAddr) -> Option<&mut KnownAddress>;

    /// Insert a *new* address into the store. Returns `true` if the address
    /// was inserted, or `false` if it was already known.
    fn insert(&mut self, addr: &OverlayAddr, ka: KnownAddress) -> bool;

    /// Remove an address from the store.
    fn remove(&mut self, addr: &OverlayAddr) -> Option<KnownAddress>;

    /// Return an iterator over the known addresses.
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&OverlayAddr, &KnownAddress)> + 'a>;

    /// Returns the number of addresses.
    fn len(&self) -> usize;

    /// Returns true if there are no addresses.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the store of all addresses.
    fn clear(&mut self);
}

/// Implementation of [`Store`] for [`std::collections::HashMap`].
impl Store for HashMap<OverlayAddr, KnownAddress> {
    fn get(&self, addr: &OverlayAddr) -> Option<&KnownAddress> {
        self.get(addr)
    }

    fn get_mut(&mut self, addr: &OverlayAddr) -> Option<&mut KnownAddress> {
        self.get_mut(addr)
    }

    fn insert(&mut self, addr: &OverlayAddr, ka: KnownAddress) -> bool {
        use ::std::collections::hash_map::Entry;

        match self.entry(addr.clone()) {
            Entry::Vacant(v) => {
                v.insert(ka);
            }
            Entry::Occupied(_) => return false,
        }
        true
    }

    fn remove(&mut self, addr: &OverlayAddr) -> Option<KnownAddress> {
        self.remove(addr)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&OverlayAddr, &KnownAddress)> + 'a> {
        Box::new(self.iter())
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn clear(&mut self) {
        self.clear()
    }
}

/// Address source. Specifies where an address originated from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// An address that was shared by another peer.
    Peer,
    /// An address that came from some source external to the system, eg.
    /// specified by the user or added directly to the address manager.
    Imported,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer => write!(f, "peer"),
            Self::Imported => write!(f, "imported"),
        }
    }
}

/// A known address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAddress {
    /// Network address.
    pub addr: OverlayAddr,
    /// How we learned about this address.
    pub source: Source,
    /// Last time this address was reported to us.
    pub last_seen: Option<LocalTime>,
}

impl KnownAddress {
    /// Create a new known address.
    pub fn new(addr: OverlayAddr, source: Source, last_seen: Option<LocalTime>) -> Self {
        Self {
            addr,
            source,
            last_seen,
        }
    }
}

/// Source of candidate peer addresses.
pub trait AddressSource {
    /// Sample a uniformly random known address not in `exclude`. Returns
    /// `None` if there are no eligible addresses.
    fn sample(&mut self, exclude: &HashSet<OverlayAddr>) -> Option<OverlayAddr>;
    /// Record an address of ours as seen by a remote peer.
    fn record_local_address(&mut self, addr: OverlayAddr);
    /// Add addresses to the source.
    fn insert(&mut self, addrs: impl IntoIterator<Item = OverlayAddr>, source: Source);
    /// Whether the source knows no addresses at all.
    fn is_empty(&self) -> bool;
}
