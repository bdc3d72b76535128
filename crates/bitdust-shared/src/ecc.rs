//! Redundancy plans. The ECC map name fixes how many suppliers a customer
//! hires and how many must stay reachable before a share degrades.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EccMap {
    Ecc2x2,
    Ecc4x4,
    Ecc7x7,
    Ecc18x18,
}

impl EccMap {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ecc/2x2" => Some(Self::Ecc2x2),
            "ecc/4x4" => Some(Self::Ecc4x4),
            "ecc/7x7" => Some(Self::Ecc7x7),
            "ecc/18x18" => Some(Self::Ecc18x18),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ecc2x2 => "ecc/2x2",
            Self::Ecc4x4 => "ecc/4x4",
            Self::Ecc7x7 => "ecc/7x7",
            Self::Ecc18x18 => "ecc/18x18",
        }
    }

    /// Slate length: one supplier per stripe.
    pub fn suppliers_count(&self) -> usize {
        match self {
            Self::Ecc2x2 => 2,
            Self::Ecc4x4 => 4,
            Self::Ecc7x7 => 7,
            Self::Ecc18x18 => 18,
        }
    }

    /// Reachable suppliers required for a share to stay connected.
    pub fn min_suppliers(&self) -> usize {
        self.suppliers_count().div_ceil(2)
    }

    /// The smallest map able to hold `count` suppliers.
    pub fn for_count(count: usize) -> Option<Self> {
        [Self::Ecc2x2, Self::Ecc4x4, Self::Ecc7x7, Self::Ecc18x18]
            .into_iter()
            .find(|m| m.suppliers_count() >= count)
    }
}

impl std::fmt::Display for EccMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_name_round_trip() {
        for m in [EccMap::Ecc2x2, EccMap::Ecc4x4, EccMap::Ecc7x7, EccMap::Ecc18x18] {
            assert_eq!(EccMap::parse(m.name()), Some(m));
        }
        assert_eq!(EccMap::parse("ecc/3x3"), None);
    }

    #[test]
    fn thresholds() {
        assert_eq!(EccMap::Ecc2x2.suppliers_count(), 2);
        assert_eq!(EccMap::Ecc2x2.min_suppliers(), 1);
        assert_eq!(EccMap::Ecc7x7.min_suppliers(), 4);
    }

    #[test]
    fn smallest_fitting_map() {
        assert_eq!(EccMap::for_count(2), Some(EccMap::Ecc2x2));
        assert_eq!(EccMap::for_count(3), Some(EccMap::Ecc4x4));
        assert_eq!(EccMap::for_count(19), None);
    }
}
