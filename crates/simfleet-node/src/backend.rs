//! What varies between node kinds.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use simfleet_core::{Criteria, NodeKind, UnitInfo};
use simfleet_device::UnitControl;

use crate::error::NodeResult;

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Whether this backend can ever satisfy `criteria`.
    fn supports(&self, criteria: &Criteria) -> bool;

    /// Upper bound on units regardless of configured capacity.
    fn unit_limit(&self) -> Option<u32> {
        None
    }

    /// Check tooling and clean up leftovers from a previous run.
    async fn prepare_node(&self) -> NodeResult<()>;

    /// Pick a free unit matching `criteria`, skipping serials in `in_use`.
    async fn provide_unit(&self, criteria: &Criteria, in_use: &HashSet<String>) -> NodeResult<UnitInfo>;

    fn control(&self) -> Arc<dyn UnitControl>;
}

/// Case-insensitive match of an optional criterion against a value.
pub(crate) fn matches(wanted: Option<&str>, actual: &str) -> bool {
    wanted.is_none_or(|w| actual.eq_ignore_ascii_case(w))
}

pub(crate) fn describe(criteria: &Criteria) -> String {
    let mut parts = Vec::new();
    if let Some(model) = &criteria.model {
        parts.push(format!("model={model}"));
    }
    if let Some(os) = &criteria.os {
        parts.push(format!("os={os}"));
    }
    if let Some(serial) = &criteria.serial {
        parts.push(format!("serial={serial}"));
    }
    if parts.is_empty() {
        "any unit".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_criterion_matches_anything() {
        assert!(matches(None, "iPhone 15"));
        assert!(matches(Some("iphone 15"), "iPhone 15"));
        assert!(!matches(Some("iPhone 14"), "iPhone 15"));
    }

    #[test]
    fn describe_lists_set_fields() {
        assert_eq!(describe(&Criteria::default()), "any unit");
        let criteria = Criteria::default().with_model("Pixel 7").with_os("14");
        assert_eq!(describe(&criteria), "model=Pixel 7, os=14");
    }
}
