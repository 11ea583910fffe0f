use std::collections::HashMap;

use log::info;

/// Per-device /30 pool under 10.11.0.0/16. Index 0 is reserved as the
/// "no subnet" marker, so at most 255 distinct ports can be served over
/// the lifetime of the process.
pub struct SubnetPool {
    subnets: HashMap<String, u8>,
    next: u8,
}

impl SubnetPool {
    pub fn new() -> Self {
        Self { subnets: HashMap::new(), next: 1 }
    }

    /// Returns the subnet index bound to `port_id`, allocating one on first
    /// sight. A port keeps its index for the whole process lifetime, so a
    /// phone that re-enumerates on the same physical port gets the same
    /// addresses back. `None` once the counter has wrapped.
    pub fn allocate(&mut self, port_id: &str) -> Option<u8> {
        if let Some(&index) = self.subnets.get(port_id) {
            return Some(index);
        }
        let index = self.next;
        if index == 0 {
            return None;
        }
        self.next = self.next.wrapping_add(1);
        self.subnets.insert(port_id.to_string(), index);
        info!("subnet mapping added: {} --> {}", port_id, network_base(index));
        Some(index)
    }
}

pub fn network_base(index: u8) -> String {
    format!("10.11.{}.0", index)
}

pub fn host_address(index: u8) -> String {
    format!("10.11.{}.1", index)
}

/// Address the phone takes inside its /30; also pushed as the AOA serial
/// string so the companion app knows what to configure.
pub fn phone_address(index: u8) -> String {
    format!("10.11.{}.2", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_stable_per_port() {
        let mut pool = SubnetPool::new();
        let a = pool.allocate("/p/1-1").unwrap();
        let b = pool.allocate("/p/1-2").unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate("/p/1-1").unwrap(), a);
        assert_eq!(pool.allocate("/p/1-2").unwrap(), b);
    }

    #[test]
    fn test_allocate_monotonic() {
        let mut pool = SubnetPool::new();
        assert_eq!(pool.allocate("a"), Some(1));
        assert_eq!(pool.allocate("b"), Some(2));
        assert_eq!(pool.allocate("c"), Some(3));
    }

    #[test]
    fn test_exhaustion_after_255_ports() {
        let mut pool = SubnetPool::new();
        for i in 0..255u32 {
            assert_eq!(pool.allocate(&format!("port-{}", i)), Some((i + 1) as u8));
        }
        assert_eq!(pool.allocate("one-too-many"), None);
        // Existing mappings survive exhaustion.
        assert_eq!(pool.allocate("port-0"), Some(1));
        assert_eq!(pool.allocate("port-254"), Some(255));
        assert_eq!(pool.allocate("another"), None);
    }

    #[test]
    fn test_addresses() {
        assert_eq!(network_base(5), "10.11.5.0");
        assert_eq!(host_address(5), "10.11.5.1");
        assert_eq!(phone_address(5), "10.11.5.2");
    }
}
