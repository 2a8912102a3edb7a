//! Physical memory zones.
//!
//! Physical memory is split by address range into two zones: legacy DMA
//! devices can only address the first 16 MiB, so those pages are kept in a
//! separate zone and handed out only on request. Every physical address
//! belongs to exactly one zone.

use norn_core::addr::PhysAddr;

/// Upper bound of the DMA zone.
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// A physical memory zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Zone {
    /// Physical range `[0, 16 MiB)`, reachable by legacy DMA.
    Dma = 0,
    /// Physical range `[16 MiB, ∞)`.
    Normal = 1,
}

/// Number of zones.
pub const NUM_ZONES: usize = 2;

impl Zone {
    /// Returns the zone containing `addr`.
    pub const fn of(addr: PhysAddr) -> Self {
        if addr.as_u64() < DMA_LIMIT {
            Self::Dma
        } else {
            Self::Normal
        }
    }

    /// Clamps `[start, end)` to this zone's range.
    ///
    /// Returns `None` when the intersection is empty.
    pub fn clamp(self, start: PhysAddr, end: PhysAddr) -> Option<(PhysAddr, PhysAddr)> {
        let (zone_start, zone_end) = match self {
            Self::Dma => (0, DMA_LIMIT),
            Self::Normal => (DMA_LIMIT, u64::MAX),
        };
        let s = start.as_u64().max(zone_start);
        let e = end.as_u64().min(zone_end);
        if s < e {
            Some((PhysAddr::new(s), PhysAddr::new(e)))
        } else {
            None
        }
    }

    /// Iterates over all zones.
    pub fn all() -> [Zone; NUM_ZONES] {
        [Zone::Dma, Zone::Normal]
    }
}
