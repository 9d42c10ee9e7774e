use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Resource envelope of a node or a deployment.
///
/// `cru` counts virtual cores; `mru`, `sru` and `hru` are bytes of memory, SSD
/// and HDD.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Capacity {
    pub cru: u64,
    pub mru: u64,
    pub sru: u64,
    pub hru: u64,
}

impl Capacity {
    pub fn is_zero(&self) -> bool {
        *self == Capacity::default()
    }

    /// True when `needed` fits entirely inside `self`.
    pub fn fits(&self, needed: &Capacity) -> bool {
        self.cru >= needed.cru
            && self.mru >= needed.mru
            && self.sru >= needed.sru
            && self.hru >= needed.hru
    }

    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cru: self.cru.saturating_sub(other.cru),
            mru: self.mru.saturating_sub(other.mru),
            sru: self.sru.saturating_sub(other.sru),
            hru: self.hru.saturating_sub(other.hru),
        }
    }
}

impl Add for Capacity {
    type Output = Capacity;

    fn add(self, rhs: Capacity) -> Capacity {
        Capacity {
            cru: self.cru.saturating_add(rhs.cru),
            mru: self.mru.saturating_add(rhs.mru),
            sru: self.sru.saturating_add(rhs.sru),
            hru: self.hru.saturating_add(rhs.hru),
        }
    }
}

impl AddAssign for Capacity {
    fn add_assign(&mut self, rhs: Capacity) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cru={} mru={}MiB sru={}MiB hru={}MiB",
            self.cru,
            self.mru / MIB,
            self.sru / MIB,
            self.hru / MIB
        )
    }
}
