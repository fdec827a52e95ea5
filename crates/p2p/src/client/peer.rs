//! Client-related peer functionality.
use crate::common::addr::OverlayAddr;
use crate::common::peer::{KnownAddress, Store};
use std::collections::HashMap;

/// In-memory reported-address store.
#[derive(Debug)]
pub struct Cache(HashMap<OverlayAddr, KnownAddress>);

impl Cache {
    /// Create a new cache.
    pub fn new() -> Self {
        Self(HashMap::new())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Cache {
    fn get(&self, addr: &OverlayAddr) -> Option<&KnownAddress> {
        self.0.get(addr)
    }

    fn get_mut(&mut self, addr: &OverlayAddr) -> Option<&mut KnownAddress> {
        self.0.get_mut(addr)
    }

    fn insert(&mut self, addr: &OverlayAddr, known_address: KnownAddress) -> bool {
        <HashMap<_, _> as Store>::insert(&mut self.0, addr, known_address)
    }

    fn remove(&mut self, addr: &OverlayAddr) -> Option<KnownAddress> {
        self.0.remove(addr)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&OverlayAddr, &KnownAddress)> + 'a> {
        Box::new(self.0.iter())
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn clear(&mut self) {
        self.0.clear()
    }
}
