//! Compute device discovery.
//!
//! NVML is optional: on a host without NVIDIA drivers the server still
//! starts, with a single slot.

use nvml_wrapper::Nvml;

/// Number of NVIDIA devices visible to NVML, or 1 if NVML is unavailable
/// or reports none.
pub fn detect_device_count() -> usize {
    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            tracing::warn!(error = %e, "NVML unavailable, defaulting to one device slot");
            return 1;
        }
    };

    match nvml.device_count() {
        Ok(0) => {
            tracing::warn!("NVML reports no devices, defaulting to one device slot");
            1
        }
        Ok(count) => {
            tracing::info!(devices = count, "Detected compute devices");
            count as usize
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count devices, defaulting to one device slot");
            1
        }
    }
}
