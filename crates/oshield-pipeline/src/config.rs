//! Hierarchical pipeline configuration.
//!
//! Loaded from a YAML file with `${VAR:default}` interpolation applied to
//! the raw text before parsing. A reference without a default whose variable
//! is unset keeps its raw placeholder, which downstream validation treats as
//! a misconfiguration signal rather than silently substituting something.

use std::path::Path;

use config::{Config, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};

/// Detector section tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    pub models_dir: String,
    pub confidence_threshold: f64,
    pub input_size: u32,
    pub nms_threshold: f64,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            models_dir: "models".to_string(),
            confidence_threshold: 0.5,
            input_size: 640,
            nms_threshold: 0.45,
        }
    }
}

/// Tracking section tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSection {
    pub iou_threshold: f64,
    pub max_age: u32,
    pub min_hits: u32,
}

impl Default for TrackingSection {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 30,
            min_hits: 0,
        }
    }
}

/// Processing section tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSection {
    /// Phase-1 deadline in seconds
    pub timeout_seconds: u64,
    pub capture_interval: f64,
    pub stability_threshold: f64,
    pub stability_frames: u32,
}

impl Default for ProcessingSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            capture_interval: 1.0,
            stability_threshold: 0.5,
            stability_frames: 3,
        }
    }
}

/// Storage section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: "storage".to_string(),
        }
    }
}

/// Edition (anonymization) section tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EditionSection {
    pub kernel_size: u32,
    pub pixelate_blocks: u32,
    pub scramble_seed: u64,
}

impl Default for EditionSection {
    fn default() -> Self {
        Self {
            kernel_size: 31,
            pixelate_blocks: 10,
            scramble_seed: 42,
        }
    }
}

/// Verification section tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSection {
    /// Bound on concurrent vision-model calls
    pub max_workers: usize,
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorSection,
    pub tracking: TrackingSection,
    pub processing: ProcessingSection,
    pub storage: StorageSection,
    pub edition: EditionSection,
    pub verification: VerificationSection,
}

impl PipelineConfig {
    /// Load from a YAML file; defaults apply when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Resource(format!("cannot read config: {e}")))?;
        Self::from_yaml(&raw)
    }

    /// Parse YAML after env-var interpolation.
    pub fn from_yaml(raw: &str) -> PipelineResult<Self> {
        let interpolated = interpolate_env(raw);
        let config = Config::builder()
            .add_source(File::from_str(&interpolated, FileFormat::Yaml))
            .build()
            .map_err(|e| PipelineError::Internal(format!("config parse failed: {e}")))?;
        config
            .try_deserialize()
            .map_err(|e| PipelineError::Internal(format!("config deserialize failed: {e}")))
    }
}

/// Substitute `${VAR}` and `${VAR:default}` in raw config text.
///
/// Unset variables without a default keep the raw placeholder.
pub fn interpolate_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").expect("static regex");
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.processing.timeout_seconds, 3600);
        assert_eq!(config.verification.max_workers, 4);
        assert_eq!(config.tracking.min_hits, 0);
        assert!((config.tracking.iou_threshold - 0.3).abs() < 1e-9);
        assert_eq!(config.edition.scramble_seed, 42);
    }

    #[test]
    fn test_interpolation_with_default() {
        std::env::remove_var("OSHIELD_TEST_UNSET");
        let out = interpolate_env("root: ${OSHIELD_TEST_UNSET:fallback}");
        assert_eq!(out, "root: fallback");
    }

    #[test]
    fn test_interpolation_with_env_value() {
        std::env::set_var("OSHIELD_TEST_SET", "from_env");
        let out = interpolate_env("root: ${OSHIELD_TEST_SET:fallback}");
        assert_eq!(out, "root: from_env");
        std::env::remove_var("OSHIELD_TEST_SET");
    }

    #[test]
    fn test_unset_without_default_keeps_placeholder() {
        std::env::remove_var("OSHIELD_TEST_MISSING");
        let out = interpolate_env("root: ${OSHIELD_TEST_MISSING}");
        assert_eq!(out, "root: ${OSHIELD_TEST_MISSING}");
    }

    #[test]
    fn test_yaml_sections_parse() {
        let yaml = r#"
detector:
  confidence_threshold: 0.6
tracking:
  max_age: 15
verification:
  max_workers: 2
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert!((config.detector.confidence_threshold - 0.6).abs() < 1e-9);
        assert_eq!(config.tracking.max_age, 15);
        assert_eq!(config.verification.max_workers, 2);
        // Untouched sections keep defaults.
        assert_eq!(config.processing.timeout_seconds, 3600);
    }

    #[test]
    fn test_yaml_with_interpolation() {
        std::env::set_var("OSHIELD_TEST_ROOT", "/data/storage");
        let yaml = "storage:\n  root: ${OSHIELD_TEST_ROOT:storage}\n";
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.storage.root, "/data/storage");
        std::env::remove_var("OSHIELD_TEST_ROOT");
    }
}
