//! Pick a hardware template for a workload.

use vmfleet_core::{VmTemplate, WorkloadProfile};

/// Choose the template a new VM for `workload` should be built from.
///
/// High-resolution or high-refresh workloads prefer a high-end GPU class
/// that fits the requested sessions per VM. Otherwise the first template
/// with enough session slots wins, then simply the first template.
pub fn select_template_for_workload<'a>(
    templates: &'a [VmTemplate],
    workload: &WorkloadProfile,
) -> Option<&'a VmTemplate> {
    let fits = |t: &&VmTemplate| t.max_concurrent_sessions >= workload.sessions_per_vm.max(1);

    let high_end = workload
        .wants_high_end()
        .then(|| templates.iter().filter(fits).find(|t| t.is_high_end()))
        .flatten();
    high_end
        .or_else(|| templates.iter().find(fits))
        .or_else(|| templates.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::catalog::default_templates;

    #[test]
    fn default_workload_gets_first_fitting_template() {
        let templates = default_templates();
        let chosen = select_template_for_workload(&templates, &WorkloadProfile::default()).unwrap();
        assert_eq!(chosen.id, "l4-360");
    }

    #[test]
    fn high_refresh_prefers_high_end_class() {
        let templates = default_templates();
        let workload = WorkloadProfile { target_fps: 144, ..Default::default() };
        let chosen = select_template_for_workload(&templates, &workload).unwrap();
        assert!(chosen.is_high_end());
        assert_eq!(chosen.id, "a10");
    }

    #[test]
    fn session_density_narrows_choice() {
        let templates = default_templates();
        let workload = WorkloadProfile {
            high_resolution: true,
            sessions_per_vm: 6,
            ..Default::default()
        };
        assert_eq!(select_template_for_workload(&templates, &workload).unwrap().id, "a16");
    }

    #[test]
    fn falls_back_to_first_template() {
        let templates = default_templates();
        let workload = WorkloadProfile { sessions_per_vm: 64, ..Default::default() };
        assert_eq!(select_template_for_workload(&templates, &workload).unwrap().id, "l4-360");
        assert!(select_template_for_workload(&[], &workload).is_none());
    }
}
