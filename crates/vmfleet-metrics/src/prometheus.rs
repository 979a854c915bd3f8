//! Prometheus text exposition format.
//!
//! Renders a fleet snapshot for scraping by a Prometheus server or
//! compatible agent.

use std::fmt::Write;

use vmfleet_state::OrchestratorMetrics;

fn header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

/// Render one snapshot as gauges. Per-status, per-region and
/// per-region-capacity series carry `status` / `region` labels.
pub fn render_prometheus(metrics: &OrchestratorMetrics) -> String {
    let mut out = String::new();

    header(&mut out, "vmfleet_vms_total", "Number of VM records, terminated included.");
    let _ = writeln!(out, "vmfleet_vms_total {}", metrics.total_vms);

    header(&mut out, "vmfleet_vms_by_status", "Number of VMs in each lifecycle status.");
    for (status, count) in &metrics.vms_by_status {
        let _ = writeln!(out, "vmfleet_vms_by_status{{status=\"{status}\"}} {count}");
    }

    header(&mut out, "vmfleet_vms_by_region", "Number of VMs in each region.");
    for (region, count) in &metrics.vms_by_region {
        let _ = writeln!(out, "vmfleet_vms_by_region{{region=\"{region}\"}} {count}");
    }

    header(&mut out, "vmfleet_session_capacity_total", "Session slots on live VMs.");
    let _ = writeln!(out, "vmfleet_session_capacity_total {}", metrics.total_capacity);

    header(&mut out, "vmfleet_session_capacity_used", "Session slots currently bound.");
    let _ = writeln!(out, "vmfleet_session_capacity_used {}", metrics.used_capacity);

    header(&mut out, "vmfleet_session_capacity_available", "Free session slots on live VMs.");
    let _ = writeln!(out, "vmfleet_session_capacity_available {}", metrics.available_capacity);

    header(&mut out, "vmfleet_utilization_percent", "Used over total session capacity (0-100).");
    let _ = writeln!(out, "vmfleet_utilization_percent {:.2}", metrics.utilization_percent);

    header(&mut out, "vmfleet_region_available_vms", "READY VMs with a free slot.");
    for c in &metrics.region_capacities {
        let _ = writeln!(out, "vmfleet_region_available_vms{{region=\"{}\"}} {}", c.region, c.available_vms);
    }

    header(&mut out, "vmfleet_region_provisioning_vms", "VMs provisioning or booting.");
    for c in &metrics.region_capacities {
        let _ = writeln!(
            out,
            "vmfleet_region_provisioning_vms{{region=\"{}\"}} {}",
            c.region, c.vms_in_provisioning
        );
    }

    header(&mut out, "vmfleet_region_queue_seconds", "Estimated wait for capacity in seconds.");
    for c in &metrics.region_capacities {
        let _ = writeln!(
            out,
            "vmfleet_region_queue_seconds{{region=\"{}\"}} {}",
            c.region, c.average_queue_time_secs
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use vmfleet_state::RegionCapacity;

    fn snapshot() -> OrchestratorMetrics {
        OrchestratorMetrics {
            timestamp: 1000,
            total_vms: 3,
            vms_by_status: BTreeMap::from([("READY".to_string(), 2), ("IN_USE".to_string(), 1)]),
            vms_by_region: BTreeMap::from([("us-east-1".to_string(), 3)]),
            total_capacity: 12,
            used_capacity: 3,
            available_capacity: 9,
            utilization_percent: 25.0,
            region_capacities: vec![RegionCapacity {
                region: "us-east-1".to_string(),
                available_vms: 2,
                vms_in_provisioning: 1,
                average_queue_time_secs: 15,
            }],
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&OrchestratorMetrics::default());
        assert!(output.contains("# HELP vmfleet_vms_total"));
        assert!(output.contains("# TYPE vmfleet_vms_by_status gauge"));
        assert!(output.contains("vmfleet_vms_total 0\n"));
    }

    #[test]
    fn render_snapshot_values() {
        let output = render_prometheus(&snapshot());
        assert!(output.contains("vmfleet_vms_by_status{status=\"READY\"} 2"));
        assert!(output.contains("vmfleet_vms_by_status{status=\"IN_USE\"} 1"));
        assert!(output.contains("vmfleet_vms_by_region{region=\"us-east-1\"} 3"));
        assert!(output.contains("vmfleet_session_capacity_available 9"));
        assert!(output.contains("vmfleet_utilization_percent 25.00"));
        assert!(output.contains("vmfleet_region_provisioning_vms{region=\"us-east-1\"} 1"));
        assert!(output.contains("vmfleet_region_queue_seconds{region=\"us-east-1\"} 15"));
    }

    #[test]
    fn every_sample_line_has_a_declared_metric() {
        let output = render_prometheus(&snapshot());
        let declared: Vec<&str> = output
            .lines()
            .filter_map(|l| l.strip_prefix("# TYPE "))
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        for line in output.lines().filter(|l| !l.starts_with('#')) {
            let name = line.split(['{', ' ']).next().unwrap();
            assert!(declared.contains(&name), "undeclared metric: {line}");
        }
    }
}
