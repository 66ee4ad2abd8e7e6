//! Per-source-address connection accounting, shared by all three ports.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct ConnCaps {
    inner: Mutex<HashMap<IpAddr, u32>>,
}

impl ConnCaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a connection slot for `ip`, or `None` when the address is at
    /// its cap. The slot is released when the guard drops.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr, max: u32) -> Option<ConnGuard> {
        let mut map = self.inner.lock().expect("caps lock poisoned");
        let count = map.entry(ip).or_insert(0);
        if *count >= max {
            return None;
        }
        *count += 1;
        Some(ConnGuard {
            caps: self.clone(),
            ip,
        })
    }
}

#[derive(Debug)]
pub struct ConnGuard {
    caps: Arc<ConnCaps>,
    ip: IpAddr,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut map = self.caps.inner.lock().expect("caps lock poisoned");
        if let Some(count) = map.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_are_per_ip_and_released_on_drop() {
        let caps = Arc::new(ConnCaps::new());
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        let g1 = caps.try_acquire(a, 2).unwrap();
        let _g2 = caps.try_acquire(a, 2).unwrap();
        assert!(caps.try_acquire(a, 2).is_none());

        // Another address is unaffected.
        assert!(caps.try_acquire(b, 2).is_some());

        drop(g1);
        assert!(caps.try_acquire(a, 2).is_some());
    }
}
