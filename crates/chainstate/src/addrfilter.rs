//! Registered-address filter.
//!
//! The in-memory source of truth for "is this address interesting",
//! consulted per transaction output and used to seed the bloom filter
//! instead of reloading the address store every time.

use std::collections::HashSet;
use std::sync::Mutex;

use elaspv_consensus::Hash168;

#[derive(Debug, Default)]
pub struct AddrFilter {
    addrs: Mutex<HashSet<Hash168>>,
}

impl AddrFilter {
    pub fn new(addrs: impl IntoIterator<Item = Hash168>) -> Self {
        Self {
            addrs: Mutex::new(addrs.into_iter().collect()),
        }
    }

    /// Replace the whole set, e.g. after reloading the address store.
    pub fn load_addrs(&self, addrs: impl IntoIterator<Item = Hash168>) {
        if let Ok(mut set) = self.addrs.lock() {
            *set = addrs.into_iter().collect();
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.addrs.lock().map(|set| !set.is_empty()).unwrap_or(false)
    }

    pub fn add_addr(&self, addr: Hash168) -> bool {
        self.addrs
            .lock()
            .map(|mut set| set.insert(addr))
            .unwrap_or(false)
    }

    pub fn delete_addr(&self, addr: &Hash168) -> bool {
        self.addrs
            .lock()
            .map(|mut set| set.remove(addr))
            .unwrap_or(false)
    }

    pub fn contains(&self, addr: &Hash168) -> bool {
        self.addrs
            .lock()
            .map(|set| set.contains(addr))
            .unwrap_or(false)
    }

    pub fn addrs(&self) -> Vec<Hash168> {
        self.addrs
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_contains_delete() {
        let filter = AddrFilter::default();
        assert!(!filter.is_loaded());

        let addr = [0x21; 21];
        assert!(filter.add_addr(addr));
        assert!(!filter.add_addr(addr));
        assert!(filter.contains(&addr));
        assert!(filter.is_loaded());

        assert!(filter.delete_addr(&addr));
        assert!(!filter.contains(&addr));
    }

    #[test]
    fn load_replaces_existing() {
        let filter = AddrFilter::new([[0x01; 21]]);
        filter.load_addrs([[0x02; 21], [0x03; 21]]);
        assert!(!filter.contains(&[0x01; 21]));
        assert!(filter.contains(&[0x02; 21]));
        assert_eq!(filter.addrs().len(), 2);
    }
}
