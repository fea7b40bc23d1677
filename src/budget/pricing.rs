//! Estimated unit costs per (service, operation).

use std::collections::BTreeMap;

/// Operation key matching any operation of a service.
pub const ANY_OPERATION: &str = "*";

/// Lookup table of estimated costs in USD.
///
/// An exact `(service, operation)` entry wins; otherwise a service-level
/// `"*"` entry applies. Unknown combinations have no estimate at all rather
/// than a silent zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostTable {
    entries: BTreeMap<String, BTreeMap<String, f64>>,
}

impl CostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nested(nested: &BTreeMap<String, BTreeMap<String, f64>>) -> Self {
        Self {
            entries: nested.clone(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, service: &str, operation: &str, cost_usd: f64) -> Self {
        self.insert(service, operation, cost_usd);
        self
    }

    pub fn insert(&mut self, service: &str, operation: &str, cost_usd: f64) {
        self.entries
            .entry(service.to_string())
            .or_default()
            .insert(operation.to_string(), cost_usd);
    }

    pub fn get(&self, service: &str, operation: &str) -> Option<f64> {
        let ops = self.entries.get(service)?;
        ops.get(operation).or_else(|| ops.get(ANY_OPERATION)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    /// All entries as `(service, operation, cost)`, sorted.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.entries.iter().flat_map(|(service, ops)| {
            ops.iter()
                .map(move |(op, cost)| (service.as_str(), op.as_str(), *cost))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_entry_beats_wildcard() {
        let table = CostTable::new()
            .with("image-gen", "generate", 0.04)
            .with("image-gen", ANY_OPERATION, 0.10);
        assert_eq!(table.get("image-gen", "generate"), Some(0.04));
        assert_eq!(table.get("image-gen", "upscale"), Some(0.10));
    }

    #[test]
    fn test_unknown_has_no_estimate() {
        let table = CostTable::new().with("doc-render", "render", 0.01);
        assert_eq!(table.get("doc-render", "convert"), None);
        assert_eq!(table.get("vision", "analyze"), None);
        assert!(!table.is_empty());
        assert!(CostTable::new().is_empty());
    }

    #[test]
    fn test_entries_sorted() {
        let table = CostTable::new().with("b", "x", 2.0).with("a", "y", 1.0);
        let entries: Vec<_> = table.entries().collect();
        assert_eq!(entries, vec![("a", "y", 1.0), ("b", "x", 2.0)]);
    }
}
