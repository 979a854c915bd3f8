//! Hardware templates, region table, and workload profiles.
//!
//! The built-in catalog mirrors the GPU classes offered in production;
//! both tables can be overridden from `fleet.toml`.

use serde::{Deserialize, Serialize};

/// Inclusive min/max pair for streaming suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedRange {
    pub min: u32,
    pub max: u32,
}

/// Immutable hardware profile a VM is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: String,
    pub name: String,
    /// GPU class, e.g. `L4-360`, `A10`, `RTX-4090`.
    pub gpu_class: String,
    pub vcpu: u32,
    pub ram_gb: u32,
    pub vram_gb: u32,
    pub max_concurrent_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fps: Option<SuggestedRange>,
    /// Kbit/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_bitrate_kbps: Option<SuggestedRange>,
}

impl VmTemplate {
    /// GPU classes suited to 4K or high-refresh streaming.
    pub fn is_high_end(&self) -> bool {
        const HIGH_END: [&str; 4] = ["A16", "A10", "RTX-4090", "RTX-4080"];
        HIGH_END.iter().any(|class| self.gpu_class.contains(class))
    }
}

/// Static routing information for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub continent: String,
    /// Tried in declared order when this region has no capacity.
    #[serde(default)]
    pub fallback_regions: Vec<String>,
    /// Country codes that may not be served from this region.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legal_constraints: Vec<String>,
}

/// What a session needs from its VM; drives template selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub target_fps: u32,
    /// 4K or similar.
    pub high_resolution: bool,
    /// Sessions the workload expects to share one VM with.
    pub sessions_per_vm: u32,
}

impl Default for WorkloadProfile {
    fn default() -> Self {
        Self {
            target_fps: 60,
            high_resolution: false,
            sessions_per_vm: 1,
        }
    }
}

impl WorkloadProfile {
    /// High resolution or at least 120fps.
    pub fn wants_high_end(&self) -> bool {
        self.high_resolution || self.target_fps >= 120
    }
}

fn template(
    id: &str,
    name: &str,
    gpu_class: &str,
    (vcpu, ram_gb, vram_gb): (u32, u32, u32),
    max_concurrent_sessions: u32,
    fps: (u32, u32),
    bitrate: (u32, u32),
) -> VmTemplate {
    VmTemplate {
        id: id.to_string(),
        name: name.to_string(),
        gpu_class: gpu_class.to_string(),
        vcpu,
        ram_gb,
        vram_gb,
        max_concurrent_sessions,
        suggested_fps: Some(SuggestedRange { min: fps.0, max: fps.1 }),
        suggested_bitrate_kbps: Some(SuggestedRange { min: bitrate.0, max: bitrate.1 }),
    }
}

/// Built-in template catalog, seeded at startup.
pub fn default_templates() -> Vec<VmTemplate> {
    vec![
        template("l4-360", "NVIDIA L4 360GB", "L4-360", (8, 32, 24), 4, (60, 120), (8_000, 15_000)),
        template("l4-90", "NVIDIA L4 90GB", "L4-90", (4, 16, 12), 2, (60, 60), (5_000, 10_000)),
        template("a10", "NVIDIA A10", "A10", (12, 48, 24), 4, (60, 120), (10_000, 20_000)),
        template("a16", "NVIDIA A16", "A16", (16, 64, 64), 6, (120, 240), (15_000, 30_000)),
        template("rtx-4060", "NVIDIA RTX 4060", "RTX-4060", (6, 16, 8), 2, (60, 60), (5_000, 8_000)),
        template("rtx-4080", "NVIDIA RTX 4080", "RTX-4080", (12, 32, 16), 4, (60, 120), (10_000, 20_000)),
        template("rtx-4090", "NVIDIA RTX 4090", "RTX-4090", (16, 48, 24), 4, (120, 240), (15_000, 30_000)),
    ]
}

fn region(code: &str, name: &str, continent: &str, fallbacks: [&str; 2]) -> RegionConfig {
    RegionConfig {
        code: code.to_string(),
        name: name.to_string(),
        continent: continent.to_string(),
        fallback_regions: fallbacks.iter().map(|s| s.to_string()).collect(),
        legal_constraints: Vec::new(),
    }
}

/// Built-in region table with fallback chains.
pub fn default_regions() -> Vec<RegionConfig> {
    vec![
        region("us-east-1", "US East (N. Virginia)", "NA", ["us-west-2", "eu-west-1"]),
        region("us-west-2", "US West (Oregon)", "NA", ["us-east-1", "us-west-1"]),
        region("eu-west-1", "EU (Ireland)", "EU", ["eu-central-1", "us-east-1"]),
        region("eu-central-1", "EU (Frankfurt)", "EU", ["eu-west-1", "us-east-1"]),
        region("ap-southeast-1", "Asia Pacific (Singapore)", "AS", ["ap-northeast-1", "us-west-2"]),
        region("ap-northeast-1", "Asia Pacific (Tokyo)", "AS", ["ap-southeast-1", "us-west-2"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_unique_ids() {
        let templates = default_templates();
        let mut ids: Vec<_> = templates.iter().map(|t| t.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), templates.len());
        assert!(templates.iter().all(|t| t.max_concurrent_sessions > 0));
    }

    #[test]
    fn high_end_classes() {
        let templates = default_templates();
        let high: Vec<_> = templates.iter().filter(|t| t.is_high_end()).map(|t| t.id.as_str()).collect();
        assert_eq!(high, vec!["a10", "a16", "rtx-4080", "rtx-4090"]);
    }

    #[test]
    fn workload_high_end_threshold() {
        assert!(!WorkloadProfile::default().wants_high_end());
        assert!(WorkloadProfile { target_fps: 120, ..Default::default() }.wants_high_end());
        assert!(WorkloadProfile { high_resolution: true, ..Default::default() }.wants_high_end());
    }
}
