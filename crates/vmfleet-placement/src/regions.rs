//! Region table loaded from configuration.

use vmfleet_core::RegionConfig;

#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: Vec<RegionConfig>,
}

impl RegionTable {
    /// Build the table from configured regions, keeping their order.
    pub fn new(regions: Vec<RegionConfig>) -> Self {
        Self { regions }
    }

    /// Look up a region by code.
    pub fn get(&self, code: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.code == code)
    }

    /// Region codes in declaration order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.code.as_str())
    }

    /// Fallback chain for `code`; empty for unknown regions.
    pub fn fallbacks(&self, code: &str) -> &[String] {
        self.get(code)
            .map(|r| r.fallback_regions.as_slice())
            .unwrap_or(&[])
    }

    pub fn regions(&self) -> &[RegionConfig] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::catalog::default_regions;

    #[test]
    fn fallbacks_follow_declared_order() {
        let table = RegionTable::new(default_regions());
        assert_eq!(table.fallbacks("us-east-1"), ["us-west-2", "eu-west-1"]);
        assert!(table.fallbacks("mars-1").is_empty());
        assert_eq!(table.codes().next(), Some("us-east-1"));
    }
}
