//! Resource accounting: the CPU/memory/GPU triple and the global ledger
//! that admits container launches against the configured allocation limits.

use parking_lot::RwLock;
use serde::Deserialize;
use std::ops::{Add, Sub};

/// A CPU/memory/GPU resource triple. All values are non-negative;
/// arithmetic is componentwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Resources {
    /// CPU in milli-cores
    #[serde(default)]
    pub mcpu: i64,

    /// Memory in MiB
    #[serde(rename = "memoryMi", default)]
    pub memory_mi: i64,

    /// GPU memory in MiB
    #[serde(rename = "gpuMemoryMi", default)]
    pub gpu_memory_mi: i64,
}

impl Resources {
    /// True when every dimension is zero.
    pub fn is_zero(&self) -> bool {
        *self == Resources::default()
    }

    /// True when every dimension of `self` fits within `limit`.
    pub fn fits_within(&self, limit: &Resources) -> bool {
        self.mcpu <= limit.mcpu
            && self.memory_mi <= limit.memory_mi
            && self.gpu_memory_mi <= limit.gpu_memory_mi
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            mcpu: self.mcpu + rhs.mcpu,
            memory_mi: self.memory_mi + rhs.memory_mi,
            gpu_memory_mi: self.gpu_memory_mi + rhs.gpu_memory_mi,
        }
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            mcpu: self.mcpu - rhs.mcpu,
            memory_mi: self.memory_mi - rhs.memory_mi,
            gpu_memory_mi: self.gpu_memory_mi - rhs.gpu_memory_mi,
        }
    }
}

/// The resource dimension that caused an admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    MilliCpu,
    MemoryMi,
    GpuMemoryMi,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::MilliCpu => write!(f, "mcpu"),
            Dimension::MemoryMi => write!(f, "memoryMi"),
            Dimension::GpuMemoryMi => write!(f, "gpuMemoryMi"),
        }
    }
}

/// Admission failure: reserving would push `tracked` past the limit on
/// the named dimension.
#[derive(Debug, Clone, Copy)]
pub struct InsufficientResources {
    /// First dimension (in mcpu, memory, GPU order) that did not fit
    pub dimension: Dimension,
    /// Amount the reservation asked for on that dimension
    pub requested: i64,
    /// Amount still unreserved on that dimension
    pub available: i64,
}

impl std::fmt::Display for InsufficientResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insufficient {}: requested {}, available {}",
            self.dimension, self.requested, self.available
        )
    }
}

impl std::error::Error for InsufficientResources {}

/// Global reservation ledger. `tracked` is the sum of the reservations of
/// currently admitted services and never exceeds `limits` on any dimension.
pub struct ResourceLedger {
    limits: Resources,
    tracked: RwLock<Resources>,
}

impl ResourceLedger {
    pub fn new(limits: Resources) -> Self {
        Self {
            limits,
            tracked: RwLock::new(Resources::default()),
        }
    }

    /// Atomically reserve `request` if every dimension of `tracked + request`
    /// fits within the limits. On failure `tracked` is left unchanged and the
    /// first failing dimension is reported.
    pub fn try_reserve(&self, request: Resources) -> Result<(), InsufficientResources> {
        let mut tracked = self.tracked.write();
        let next = *tracked + request;

        if next.mcpu > self.limits.mcpu {
            return Err(InsufficientResources {
                dimension: Dimension::MilliCpu,
                requested: request.mcpu,
                available: self.limits.mcpu - tracked.mcpu,
            });
        }
        if next.memory_mi > self.limits.memory_mi {
            return Err(InsufficientResources {
                dimension: Dimension::MemoryMi,
                requested: request.memory_mi,
                available: self.limits.memory_mi - tracked.memory_mi,
            });
        }
        if next.gpu_memory_mi > self.limits.gpu_memory_mi {
            return Err(InsufficientResources {
                dimension: Dimension::GpuMemoryMi,
                requested: request.gpu_memory_mi,
                available: self.limits.gpu_memory_mi - tracked.gpu_memory_mi,
            });
        }

        *tracked = next;
        Ok(())
    }

    /// Return a reservation. Releasing more than is tracked is a programmer
    /// error and panics.
    pub fn release(&self, request: Resources) {
        let mut tracked = self.tracked.write();
        assert!(
            request.fits_within(&tracked),
            "ledger release of {:?} exceeds tracked {:?}",
            request,
            *tracked
        );
        *tracked = *tracked - request;
    }

    /// Snapshot of the currently reserved total.
    pub fn tracked(&self) -> Resources {
        *self.tracked.read()
    }

    pub fn limits(&self) -> Resources {
        self.limits
    }
}
