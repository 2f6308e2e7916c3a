//! Node usage aggregation (§4.7.5): per-node resource request totals, sent
//! as a `resource_usage` message. Pure functions operate on a flattened
//! `PodRequest` view so they're testable without constructing full
//! `k8s_openapi::api::core::v1::Pod` values.

use std::collections::HashMap;

pub const CPU_KEY: &str = "cpu";
pub const MEMORY_KEY: &str = "memory";
pub const EPHEMERAL_STORAGE_KEY: &str = "ephemeral-storage";
pub const GPU_KEY: &str = "nvidia.com/gpu";

/// One pod's resource requests on the node being aggregated, already summed
/// across its containers.
#[derive(Debug, Clone)]
pub struct PodRequest {
    pub namespace: String,
    pub cpu_millicores: i64,
    pub memory_bytes: f64,
    pub ephemeral_storage_bytes: f64,
    pub gpu: f64,
}

/// Parses a Kubernetes resource quantity string into bytes. Supports the
/// binary (`Ki`/`Mi`/`Gi`/`Ti`/`Pi`/`Ei`) and decimal (`n`/`u`/`m`/`k`/`M`/
/// `G`/`T`/`P`/`E`) SI suffixes; a bare number is already in bytes/units.
pub fn quantity_to_bytes(raw: &str) -> f64 {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ];
    for (suffix, multiplier) in BINARY {
        if let Some(num) = raw.strip_suffix(suffix) {
            return num.trim().parse::<f64>().unwrap_or(0.0) * multiplier;
        }
    }
    const DECIMAL: [(&str, f64); 9] =
        [("n", 1e-9), ("u", 1e-6), ("m", 1e-3), ("k", 1e3), ("M", 1e6), ("G", 1e9), ("T", 1e12), ("P", 1e15), ("E", 1e18)];
    for (suffix, multiplier) in DECIMAL {
        if let Some(num) = raw.strip_suffix(suffix) {
            return num.trim().parse::<f64>().unwrap_or(0.0) * multiplier;
        }
    }
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

/// Parses a cpu quantity into millicores (exact; no rounding yet — rounding
/// to whole cores happens once, on the aggregated total).
pub fn cpu_quantity_to_millicores(raw: &str) -> i64 {
    if let Some(num) = raw.strip_suffix('m') {
        return num.trim().parse::<f64>().unwrap_or(0.0).round() as i64;
    }
    (raw.trim().parse::<f64>().unwrap_or(0.0) * 1000.0).round() as i64
}

fn bytes_to_ki(bytes: f64) -> f64 {
    bytes / 1024.0
}

fn millicores_to_cores_rounded_up(millicores: i64) -> f64 {
    (millicores as f64 / 1000.0).ceil()
}

/// Sums every pod's requests into `{cpu, memory, ephemeral-storage,
/// nvidia.com/gpu}`, normalized per §4.7.5 (memory/storage in Ki, cpu in
/// whole cores rounded up). Returns `(overall, excluding_namespaces)`.
pub fn aggregate(
    pods: &[PodRequest],
    workflow_namespace: &str,
    include_namespace_usage: &[String],
) -> (HashMap<String, f64>, HashMap<String, f64>) {
    let mut overall_cpu = 0i64;
    let mut overall_memory = 0.0;
    let mut overall_storage = 0.0;
    let mut overall_gpu = 0.0;

    let mut excl_cpu = 0i64;
    let mut excl_memory = 0.0;
    let mut excl_storage = 0.0;
    let mut excl_gpu = 0.0;

    let excluded_namespaces: std::collections::HashSet<&str> =
        std::iter::once(workflow_namespace).chain(include_namespace_usage.iter().map(String::as_str)).collect();

    for pod in pods {
        overall_cpu += pod.cpu_millicores;
        overall_memory += pod.memory_bytes;
        overall_storage += pod.ephemeral_storage_bytes;
        overall_gpu += pod.gpu;

        if !excluded_namespaces.contains(pod.namespace.as_str()) {
            excl_cpu += pod.cpu_millicores;
            excl_memory += pod.memory_bytes;
            excl_storage += pod.ephemeral_storage_bytes;
            excl_gpu += pod.gpu;
        }
    }

    let overall = HashMap::from([
        (CPU_KEY.to_string(), millicores_to_cores_rounded_up(overall_cpu)),
        (MEMORY_KEY.to_string(), bytes_to_ki(overall_memory)),
        (EPHEMERAL_STORAGE_KEY.to_string(), bytes_to_ki(overall_storage)),
        (GPU_KEY.to_string(), overall_gpu),
    ]);
    let excluding_workflow_namespaces = HashMap::from([
        (CPU_KEY.to_string(), millicores_to_cores_rounded_up(excl_cpu)),
        (MEMORY_KEY.to_string(), bytes_to_ki(excl_memory)),
        (EPHEMERAL_STORAGE_KEY.to_string(), bytes_to_ki(excl_storage)),
        (GPU_KEY.to_string(), excl_gpu),
    ]);

    (overall, excluding_workflow_namespaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_memory_suffixes() {
        assert_eq!(quantity_to_bytes("1Ki"), 1024.0);
        assert_eq!(quantity_to_bytes("1Mi"), 1024.0 * 1024.0);
        assert_eq!(quantity_to_bytes("1k"), 1000.0);
        assert_eq!(quantity_to_bytes("512"), 512.0);
    }

    #[test]
    fn parses_cpu_millicore_and_bare_core_quantities() {
        assert_eq!(cpu_quantity_to_millicores("500m"), 500);
        assert_eq!(cpu_quantity_to_millicores("2"), 2000);
        assert_eq!(cpu_quantity_to_millicores("0.5"), 500);
    }

    #[test]
    fn cpu_total_is_rounded_up_to_whole_cores() {
        let pods = vec![
            PodRequest { namespace: "ns-a".into(), cpu_millicores: 250, memory_bytes: 0.0, ephemeral_storage_bytes: 0.0, gpu: 0.0 },
            PodRequest { namespace: "ns-a".into(), cpu_millicores: 300, memory_bytes: 0.0, ephemeral_storage_bytes: 0.0, gpu: 0.0 },
        ];
        let (overall, _) = aggregate(&pods, "osmo-workflows", &[]);
        // 550m -> 0.55 cores -> rounded up to 1.
        assert_eq!(overall[CPU_KEY], 1.0);
    }

    #[test]
    fn excludes_workflow_and_configured_namespaces_from_the_second_total() {
        let pods = vec![
            PodRequest { namespace: "osmo-workflows".into(), cpu_millicores: 1000, memory_bytes: 1024.0, ephemeral_storage_bytes: 0.0, gpu: 0.0 },
            PodRequest { namespace: "kube-system".into(), cpu_millicores: 1000, memory_bytes: 1024.0, ephemeral_storage_bytes: 0.0, gpu: 0.0 },
            PodRequest { namespace: "customer-a".into(), cpu_millicores: 1000, memory_bytes: 1024.0, ephemeral_storage_bytes: 0.0, gpu: 0.0 },
        ];
        let (overall, excluding) =
            aggregate(&pods, "osmo-workflows", &["kube-system".to_string()]);

        assert_eq!(overall[CPU_KEY], 3.0);
        assert_eq!(excluding[CPU_KEY], 1.0); // only "customer-a" remains
        assert_eq!(excluding[MEMORY_KEY], 1.0); // 1024 bytes -> 1 Ki
    }

    #[test]
    fn empty_pod_list_yields_zeroed_totals() {
        let (overall, excluding) = aggregate(&[], "osmo-workflows", &[]);
        assert_eq!(overall[GPU_KEY], 0.0);
        assert_eq!(excluding[GPU_KEY], 0.0);
    }
}
