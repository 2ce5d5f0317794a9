//! Pool of TCP ports handed out to devices.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use simfleet_core::{AllocatedPorts, PortRange};

use crate::error::{DeviceError, DeviceResult};

pub struct PortAllocator {
    available: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Pool holding every port in `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            available: Mutex::new((start..=end).collect()),
        }
    }

    pub fn from_range(range: PortRange) -> Self {
        Self::new(range.start, range.end)
    }

    /// Take `count` ports out of the pool, all or nothing.
    pub fn allocate(&self, count: usize) -> DeviceResult<Vec<u16>> {
        let mut available = self.lock();
        if available.len() < count {
            return Err(DeviceError::PortsExhausted {
                requested: count,
                available: available.len(),
            });
        }
        let ports: Vec<u16> = available.iter().take(count).copied().collect();
        for port in &ports {
            available.remove(port);
        }
        debug!(?ports, remaining = available.len(), "ports allocated");
        Ok(ports)
    }

    /// The fixed port set of one device.
    pub fn allocate_device_ports(&self) -> DeviceResult<AllocatedPorts> {
        let ports = self.allocate(AllocatedPorts::COUNT)?;
        Ok(AllocatedPorts {
            driver: ports[0],
            companion: ports[1],
            video: ports[2],
            instrumentation: ports[3],
        })
    }

    pub fn deallocate(&self, ports: &[u16]) {
        let mut available = self.lock();
        available.extend(ports.iter().copied());
        debug!(?ports, remaining = available.len(), "ports returned");
    }

    pub fn deallocate_device_ports(&self, ports: &AllocatedPorts) {
        self.deallocate(&ports.to_vec());
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::from_range(PortRange::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fourth_allocation_of_three_exhausts_ten_ports() {
        let allocator = PortAllocator::new(1, 10);
        allocator.allocate(3).unwrap();
        allocator.allocate(3).unwrap();
        allocator.allocate(3).unwrap();
        let err = allocator.allocate(3).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::PortsExhausted {
                requested: 3,
                available: 1
            }
        ));
        // A failed request takes nothing.
        assert_eq!(allocator.available(), 1);
    }

    #[test]
    fn deallocate_restores_pool() {
        let allocator = PortAllocator::new(100, 109);
        let before: BTreeSet<u16> = allocator.lock().clone();
        let ports = allocator.allocate(4).unwrap();
        assert_eq!(allocator.available(), 6);
        allocator.deallocate(&ports);
        assert_eq!(*allocator.lock(), before);
    }

    #[test]
    fn device_ports_are_distinct() {
        let allocator = PortAllocator::default();
        let ports = allocator.allocate_device_ports().unwrap();
        let unique: HashSet<u16> = ports.to_vec().into_iter().collect();
        assert_eq!(unique.len(), AllocatedPorts::COUNT);
        assert_eq!(allocator.available(), 710 - AllocatedPorts::COUNT);
        allocator.deallocate_device_ports(&ports);
        assert_eq!(allocator.available(), 710);
    }

    #[test]
    fn concurrent_allocations_never_overlap() {
        let allocator = Arc::new(PortAllocator::new(1, 400));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| allocator.allocate(5).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for group in handle.join().unwrap() {
                for port in group {
                    assert!(seen.insert(port), "port {port} handed out twice");
                }
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(allocator.available(), 0);
    }
}
