//! Resource quantities and backend quantization
//!
//! The backend accepts CPU in steps of 0.01 cores and memory in steps of
//! 0.1 GB, both with a floor. Orchestrator quantities are parsed from their
//! string form (`500m`, `2`, `128Mi`, `1.5G`, `1e3`).

use crate::aci;
use crate::error::{ProviderError, Result};
use crate::models::GPU_RESOURCE_NAME;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const DEFAULT_CPU_CORES: f64 = 1.0;
pub const DEFAULT_MEMORY_GB: f64 = 1.5;
pub const MIN_CPU_CORES: f64 = 0.01;
pub const MIN_MEMORY_GB: f64 = 0.1;

const CPU: &str = "cpu";
const MEMORY: &str = "memory";

/// Parse a quantity string into its value in base units
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProviderError::validation("empty resource quantity"));
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ProviderError::validation(format!("invalid resource quantity {raw:?}")))?;

    // fractional suffixes divide to keep values like 500m exact
    let divisor = match suffix {
        "n" => Some(1e9),
        "u" => Some(1e6),
        "m" => Some(1e3),
        _ => None,
    };
    if let Some(divisor) = divisor {
        return Ok(value / divisor);
    }

    let multiplier = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(|c: char| c == 'e' || c == 'E') => {
            let power: i32 = exp[1..].parse().map_err(|_| {
                ProviderError::validation(format!("invalid resource quantity {raw:?}"))
            })?;
            10f64.powi(power)
        }
        _ => {
            return Err(ProviderError::validation(format!(
                "invalid resource quantity {raw:?}"
            )))
        }
    };

    Ok(value * multiplier)
}

/// Quantity in thousandths of a unit, rounded up
pub fn milli_value(quantity: &Quantity) -> Result<i64> {
    Ok((parse_quantity(&quantity.0)? * 1000.0).ceil() as i64)
}

/// Quantity in whole units, rounded up
pub fn value(quantity: &Quantity) -> Result<i64> {
    Ok(parse_quantity(&quantity.0)?.ceil() as i64)
}

/// CPU request in cores: multiples of 0.01, never below 0.01
pub fn quantize_cpu(milli_cpu: i64) -> f64 {
    let cores = (milli_cpu as f64 / 10.0).round() / 100.0;
    cores.max(MIN_CPU_CORES)
}

/// Memory request in GB: multiples of 0.1, never below 0.1
pub fn quantize_memory(bytes: i64) -> f64 {
    let gb = (bytes as f64 / 1e8).round() / 10.0;
    gb.max(MIN_MEMORY_GB)
}

/// Pick the GPU SKU for a pod from the region's supported list
pub fn resolve_gpu_sku(supported: &[String], requested: Option<&str>, region: &str) -> Result<String> {
    let Some(first) = supported.first() else {
        return Err(ProviderError::validation(format!(
            "the pod requires GPU resource, but no GPU enabled container group is available in region {region}"
        )));
    };

    match requested {
        Some(desired) => supported
            .iter()
            .find(|sku| sku.eq_ignore_ascii_case(desired))
            .cloned()
            .ok_or_else(|| {
                ProviderError::validation(format!(
                    "the pod requires GPU SKU {desired}, but only SKUs {supported:?} are supported in region {region}"
                ))
            }),
        None => Ok(first.clone()),
    }
}

/// GPU parameters resolved from the pod and the provider
#[derive(Debug, Clone, Copy)]
pub struct GpuContext<'a> {
    pub supported_skus: &'a [String],
    pub requested_sku: Option<&'a str>,
    pub region: &'a str,
}

/// Translate a container's requests and limits
pub fn translate_resources(
    resources: Option<&ResourceRequirements>,
    gpu: GpuContext<'_>,
) -> Result<aci::ResourceRequirements> {
    let empty = BTreeMap::new();
    let requests = resources
        .and_then(|r| r.requests.as_ref())
        .unwrap_or(&empty);

    let cpu_request = match requests.get(CPU) {
        Some(q) => quantize_cpu(milli_value(q)?),
        None => DEFAULT_CPU_CORES,
    };
    let memory_request = match requests.get(MEMORY) {
        Some(q) => quantize_memory(value(q)?),
        None => DEFAULT_MEMORY_GB,
    };

    let mut translated = aci::ResourceRequirements {
        requests: aci::ResourceRequests {
            cpu: cpu_request,
            memory_in_gb: memory_request,
            gpu: None,
        },
        limits: None,
    };

    let Some(limits) = resources.and_then(|r| r.limits.as_ref()) else {
        return Ok(translated);
    };

    let cpu_limit = match limits.get(CPU) {
        Some(q) => milli_value(q)? as f64 / 1000.0,
        None => cpu_request,
    };
    let memory_limit = match limits.get(MEMORY) {
        Some(q) => quantize_memory(value(q)?),
        None => memory_request,
    };

    let mut aci_limits = aci::ResourceLimits {
        cpu: Some(cpu_limit),
        memory_in_gb: Some(memory_limit),
        gpu: None,
    };

    if let Some(gpu_quantity) = limits.get(GPU_RESOURCE_NAME) {
        let sku = resolve_gpu_sku(gpu.supported_skus, gpu.requested_sku, gpu.region)?;
        let count = value(gpu_quantity)?;
        if count <= 0 {
            return Err(ProviderError::validation("GPU limit must be a positive integer"));
        }
        let count = i32::try_from(count).map_err(|_| {
            ProviderError::validation(format!("GPU limit {count} is out of range"))
        })?;

        let resource = aci::GpuResource { count, sku };
        translated.requests.gpu = Some(resource.clone());
        aci_limits.gpu = Some(resource);
    }

    translated.limits = Some(aci_limits);
    Ok(translated)
}
