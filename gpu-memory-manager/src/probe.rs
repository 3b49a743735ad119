//! Sizing of the device memory budget.

use anyhow::{bail, Result};
use tracing::{info, warn};

/// Budget used when neither an explicit size nor a CUDA device is given.
pub const DEFAULT_HOST_BUDGET: usize = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetRequest {
    /// Explicit budget in bytes; wins over probing.
    pub explicit: Option<usize>,
    /// CUDA device ordinal to probe for free memory.
    pub cuda_device: Option<usize>,
    /// Fraction of probed free memory left untouched for other users.
    pub reserve_fraction: f64,
}

/// Work out how many bytes the memory manager may hand out.
pub fn resolve_budget(request: &BudgetRequest) -> Result<usize> {
    if !(0.0..1.0).contains(&request.reserve_fraction) {
        bail!(
            "reserve fraction must be in [0, 1), got {}",
            request.reserve_fraction
        );
    }

    if let Some(explicit) = request.explicit {
        info!("Using explicit device memory budget of {} bytes", explicit);
        return Ok(explicit);
    }

    match request.cuda_device {
        Some(ordinal) => {
            let (free, total) = probe_device(ordinal)?;
            let budget = (free as f64 * (1.0 - request.reserve_fraction)) as usize;
            info!(
                "Device {}: {} of {} bytes free, budget {} bytes",
                ordinal, free, total, budget
            );
            Ok(budget)
        }
        None => Ok(DEFAULT_HOST_BUDGET),
    }
}

#[cfg(feature = "cuda")]
fn probe_device(ordinal: usize) -> Result<(usize, usize)> {
    use anyhow::Context;
    use cudarc::driver::CudaDevice;

    // Creating the device binds its primary context to this thread, which
    // the memory query needs.
    let _device = CudaDevice::new(ordinal)
        .with_context(|| format!("Failed to open CUDA device {}", ordinal))?;
    let (free, total) = cudarc::driver::result::mem_get_info()
        .context("Failed to query CUDA memory info")?;
    Ok((free, total))
}

#[cfg(not(feature = "cuda"))]
fn probe_device(ordinal: usize) -> Result<(usize, usize)> {
    warn!(
        "CUDA device {} requested but built without the `cuda` feature; using host budget",
        ordinal
    );
    Ok((DEFAULT_HOST_BUDGET, DEFAULT_HOST_BUDGET))
}
