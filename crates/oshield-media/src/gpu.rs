//! Accelerator probing and detection strategy selection.

use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Execution strategy for the detector pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyMode {
    /// One model at a time; small batches
    Sequential,
    /// Models run concurrently on the accelerator
    Parallel,
}

/// Model size tier, mapping to the weight files loaded per detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelSize {
    Nano,
    Small,
    Medium,
}

impl ModelSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Nano => "nano",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
        }
    }

    /// Weight file suffix for this tier.
    pub fn suffix(&self) -> &'static str {
        match self {
            ModelSize::Nano => "n",
            ModelSize::Small => "s",
            ModelSize::Medium => "m",
        }
    }
}

/// Selected detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorStrategy {
    pub mode: StrategyMode,
    pub model_size: ModelSize,
    pub batch_size: usize,
}

impl DetectorStrategy {
    /// Pick a strategy from the probed accelerator memory.
    pub fn select(memory_mb: Option<u64>) -> Self {
        let memory_gb = memory_mb.map(|mb| mb as f64 / 1024.0).unwrap_or(0.0);

        if memory_gb < 8.0 {
            if memory_gb > 0.0 {
                warn!("Accelerator has less than 8GB ({memory_gb:.0}GB); sequential nano profile");
            }
            Self {
                mode: StrategyMode::Sequential,
                model_size: ModelSize::Nano,
                batch_size: 8,
            }
        } else if memory_gb < 16.0 {
            Self {
                mode: StrategyMode::Parallel,
                model_size: ModelSize::Small,
                batch_size: 32,
            }
        } else if memory_gb < 32.0 {
            Self {
                mode: StrategyMode::Parallel,
                model_size: ModelSize::Medium,
                batch_size: 64,
            }
        } else {
            let batch = 128.min((memory_gb * 3.0) as usize);
            info!("High-memory accelerator ({memory_gb:.0}GB), batch_size={batch}");
            Self {
                mode: StrategyMode::Parallel,
                model_size: ModelSize::Medium,
                batch_size: batch,
            }
        }
    }
}

/// Probe total accelerator memory in MB via `nvidia-smi`, if present.
pub async fn probe_accelerator_memory_mb() -> Option<u64> {
    which::which("nvidia-smi").ok()?;

    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let memory = text.lines().next()?.trim().parse::<u64>().ok()?;
    info!(vram_total_mb = memory, "Accelerator detected");
    Some(memory)
}
