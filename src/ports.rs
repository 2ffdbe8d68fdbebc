use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::PortExhaustionError;

/// Inclusive range of host ports instances may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8000,
            end: 9000,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Hands out host ports for incoming instances.
///
/// Scanning resumes one past the last allocated port and wraps around, so
/// consecutive deployments rotate through the range instead of reusing the
/// port that was just retired. Nothing is bound here; the container runtime
/// owns the actual socket.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    reserved: BTreeSet<u16>,
    last: Option<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: BTreeSet::new(),
            last: None,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Pick a port that is neither in `exclude` nor already reserved, and reserve it.
    pub fn allocate(&mut self, exclude: &[u16]) -> Result<u16, PortExhaustionError> {
        let exhausted = PortExhaustionError {
            start: self.range.start,
            end: self.range.end,
        };
        if self.range.start > self.range.end {
            return Err(exhausted);
        }

        let start = u32::from(self.range.start);
        let end = u32::from(self.range.end);
        let span = end - start + 1;
        let first = match self.last {
            Some(last) if self.range.contains(last) => u32::from(last) + 1,
            _ => start,
        };

        let port = (0..span)
            .map(|offset| start + (first - start + offset) % span)
            .filter_map(|candidate| u16::try_from(candidate).ok())
            .find(|candidate| !exclude.contains(candidate) && !self.reserved.contains(candidate))
            .ok_or(exhausted)?;

        self.reserved.insert(port);
        self.last = Some(port);
        Ok(port)
    }

    /// Mark a port as in use without allocating it, e.g. one adopted from a running instance.
    pub fn reserve(&mut self, port: u16) {
        if self.range.contains(port) {
            self.reserved.insert(port);
        }
    }

    /// Return a port to the free pool. Returns false if it was not reserved.
    pub fn release(&mut self, port: u16) -> bool {
        self.reserved.remove(&port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u16, end: u16) -> PortRange {
        PortRange { start, end }
    }

    #[test]
    fn allocates_from_range_start() {
        let mut ports = PortAllocator::new(range(8000, 8010));
        assert_eq!(ports.allocate(&[]).unwrap(), 8000);
    }

    #[test]
    fn skips_excluded_ports() {
        let mut ports = PortAllocator::new(range(8000, 8003));
        assert_eq!(ports.allocate(&[8000, 8001]).unwrap(), 8002);
    }

    #[test]
    fn rotates_past_last_allocation() {
        let mut ports = PortAllocator::new(range(8000, 8002));
        assert_eq!(ports.allocate(&[]).unwrap(), 8000);
        assert!(ports.release(8000));
        assert_eq!(ports.allocate(&[]).unwrap(), 8001);
        assert!(ports.release(8001));
        assert_eq!(ports.allocate(&[]).unwrap(), 8002);
        assert!(ports.release(8002));
        // wraps back to the start
        assert_eq!(ports.allocate(&[]).unwrap(), 8000);
    }

    #[test]
    fn reserved_ports_are_not_handed_out_twice() {
        let mut ports = PortAllocator::new(range(8000, 8001));
        let a = ports.allocate(&[]).unwrap();
        let b = ports.allocate(&[]).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            ports.allocate(&[]),
            Err(PortExhaustionError {
                start: 8000,
                end: 8001
            })
        );
        ports.release(a);
        assert_eq!(ports.allocate(&[]).unwrap(), a);
    }

    #[test]
    fn exhausted_only_when_exclusions_cover_range() {
        let all: Vec<u16> = (8000..=8004).collect();
        for skip in 0..all.len() {
            let mut exclude = all.clone();
            let free = exclude.remove(skip);
            let mut ports = PortAllocator::new(range(8000, 8004));
            assert_eq!(ports.allocate(&exclude).unwrap(), free);
        }

        let mut ports = PortAllocator::new(range(8000, 8004));
        assert!(ports.allocate(&all).is_err());
    }

    #[test]
    fn single_port_range() {
        let mut ports = PortAllocator::new(range(9000, 9000));
        assert_eq!(ports.allocate(&[]).unwrap(), 9000);
        assert!(ports.allocate(&[]).is_err());
        assert!(PortAllocator::new(range(9000, 9000)).allocate(&[9000]).is_err());
    }

    #[test]
    fn range_ending_at_u16_max_does_not_overflow() {
        let mut ports = PortAllocator::new(range(65534, 65535));
        assert_eq!(ports.allocate(&[]).unwrap(), 65534);
        assert_eq!(ports.allocate(&[]).unwrap(), 65535);
        ports.release(65534);
        assert_eq!(ports.allocate(&[]).unwrap(), 65534);
    }

    #[test]
    fn inverted_range_is_exhausted() {
        let mut ports = PortAllocator::new(range(9000, 8000));
        assert!(ports.allocate(&[]).is_err());
    }

    #[test]
    fn reserve_ignores_out_of_range_ports() {
        let mut ports = PortAllocator::new(range(8000, 8001));
        ports.reserve(7000);
        assert!(!ports.is_reserved(7000));
        ports.reserve(8000);
        assert_eq!(ports.allocate(&[]).unwrap(), 8001);
    }
}
