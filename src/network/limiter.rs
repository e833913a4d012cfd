//! Per-address connection counting
//!
//! Servers use this from `on_client_connect` to cap how many sockets a
//! single remote IP may hold open.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Counts live connections per remote IP address
#[derive(Debug, Default)]
pub struct AddressCounter {
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl AddressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for `ip` and return the new value
    pub fn increment(&self, ip: IpAddr) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(ip).or_insert(0);
        *count += 1;
        *count
    }

    /// Increment only if the count is below `limit`; returns whether it was
    pub fn try_acquire(&self, ip: IpAddr, limit: u32) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(ip).or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Decrement the count for `ip`, forgetting the address at zero
    pub fn decrement(&self, ip: IpAddr) -> u32 {
        let mut counts = self.counts.lock();
        match counts.get_mut(&ip) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(&ip);
                0
            }
            None => 0,
        }
    }

    pub fn get(&self, ip: IpAddr) -> u32 {
        self.counts.lock().get(&ip).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}
