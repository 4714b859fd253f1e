//! Backpressure demand.

use std::fmt;
use std::ops::{Add, AddAssign};

/// Number of values a consumer is willing to accept.
///
/// One unit of demand buys exactly one emission. Addition saturates at
/// [`Demand::Unlimited`], which is never consumed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Demand {
    Max(u64),
    Unlimited,
}

impl Demand {
    /// No demand.
    pub const NONE: Demand = Demand::Max(0);

    pub fn none() -> Self {
        Demand::NONE
    }

    pub fn max(n: u64) -> Self {
        Demand::Max(n)
    }

    pub fn unlimited() -> Self {
        Demand::Unlimited
    }

    pub fn is_zero(self) -> bool {
        self == Demand::NONE
    }

    pub fn is_unlimited(self) -> bool {
        self == Demand::Unlimited
    }

    /// Finite remaining count, `None` when unlimited.
    pub fn count(self) -> Option<u64> {
        match self {
            Demand::Max(n) => Some(n),
            Demand::Unlimited => None,
        }
    }

    /// Demand left after one emission. Saturates at zero.
    pub fn consume_one(self) -> Self {
        match self {
            Demand::Max(n) => Demand::Max(n.saturating_sub(1)),
            Demand::Unlimited => Demand::Unlimited,
        }
    }
}

impl Default for Demand {
    fn default() -> Self {
        Demand::NONE
    }
}

impl From<u64> for Demand {
    fn from(n: u64) -> Self {
        Demand::Max(n)
    }
}

impl Add for Demand {
    type Output = Demand;

    fn add(self, rhs: Demand) -> Demand {
        match (self, rhs) {
            (Demand::Max(a), Demand::Max(b)) => a.checked_add(b).map_or(Demand::Unlimited, Demand::Max),
            _ => Demand::Unlimited,
        }
    }
}

impl AddAssign for Demand {
    fn add_assign(&mut self, rhs: Demand) {
        *self = *self + rhs;
    }
}

impl fmt::Debug for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Demand::Max(n) => write!(f, "Demand::Max({})", n),
            Demand::Unlimited => write!(f, "Demand::Unlimited"),
        }
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Demand::Max(n) => write!(f, "{}", n),
            Demand::Unlimited => write!(f, "unlimited"),
        }
    }
}
