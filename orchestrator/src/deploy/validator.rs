//! Artifact and manifest validation
//!
//! The model file is never deserialized: the framework is inferred from the
//! file extension and its on-disk signature, and the requirements manifest is
//! checked for dependencies a build can resolve.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::models::deployment::Framework;
use crate::storage::artifacts::{Artifact, ArtifactStore};

const PICKLE_PROTO: u8 = 0x80;
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const HDF5_MAGIC: &[u8] = b"\x89HDF\r\n\x1a\n";

/// Packages that mark a pickle as a scikit-learn model
const SKLEARN_PACKAGES: &[&str] = &["scikit-learn", "sklearn"];
const PYTORCH_PACKAGES: &[&str] = &["torch"];
const TENSORFLOW_PACKAGES: &[&str] = &["tensorflow", "tensorflow-cpu", "tensorflow-gpu", "keras"];

/// Successful validation
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub framework: Framework,
    pub manifest: Manifest,
}

/// Validator settings
#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    pub max_artifact_bytes: u64,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Inspects artifacts before any build work starts
pub struct Validator {
    store: Arc<dyn ArtifactStore>,
    options: ValidatorOptions,
}

impl Validator {
    pub fn new(store: Arc<dyn ArtifactStore>, options: ValidatorOptions) -> Self {
        Self { store, options }
    }

    /// Validate an artifact.
    ///
    /// `expected` is the framework already recorded for the deployment; a
    /// redeploy may not change it.
    pub async fn validate(
        &self,
        artifact_ref: &str,
        expected: Option<Framework>,
    ) -> Result<Validation, OrchestratorError> {
        let meta = self.store.head(artifact_ref).await.map_err(|e| match e {
            OrchestratorError::NotFound(_) => {
                OrchestratorError::InvalidArtifact(format!("artifact {} not found", artifact_ref))
            }
            other => other,
        })?;

        if meta.size > self.options.max_artifact_bytes {
            return Err(OrchestratorError::ArtifactTooLarge {
                size: meta.size,
                limit: self.options.max_artifact_bytes,
            });
        }

        let artifact = self.store.get(artifact_ref).await?;
        let validation = inspect(&artifact)?;

        if let Some(expected) = expected {
            if expected != validation.framework {
                return Err(OrchestratorError::UnsupportedFramework(format!(
                    "deployment serves {} models, artifact is {}",
                    expected, validation.framework
                )));
            }
        }

        for warning in &validation.manifest.warnings {
            warn!(artifact_ref = %artifact_ref, "{}", warning);
        }
        debug!(
            artifact_ref = %artifact_ref,
            framework = %validation.framework,
            packages = validation.manifest.requirements.len(),
            "Artifact validated"
        );
        Ok(validation)
    }
}

/// Validate an artifact that is already in memory
pub fn inspect(artifact: &Artifact) -> Result<Validation, OrchestratorError> {
    let manifest = match &artifact.manifest {
        Some(text) => parse_manifest(text)?,
        None => Manifest::default(),
    };

    let framework = detect_framework(&artifact.meta.filename, &artifact.model, &manifest)?;

    match framework {
        Framework::Pytorch if !manifest.lists_any(PYTORCH_PACKAGES) => {
            return Err(OrchestratorError::ManifestUnresolvable(
                "pytorch model requires torch in requirements.txt".to_string(),
            ));
        }
        Framework::Tensorflow if !manifest.lists_any(TENSORFLOW_PACKAGES) => {
            return Err(OrchestratorError::ManifestUnresolvable(
                "tensorflow model requires tensorflow in requirements.txt".to_string(),
            ));
        }
        _ => {}
    }

    Ok(Validation {
        framework,
        manifest,
    })
}

// ================================ SIGNATURES ===================================== //

fn is_pickle(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == PICKLE_PROTO && (2..=5).contains(&bytes[1])
}

fn is_zlib(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x78 && matches!(bytes[1], 0x01 | 0x5e | 0x9c | 0xda)
}

/// Infer the framework from extension and signature
pub fn detect_framework(
    filename: &str,
    model: &[u8],
    manifest: &Manifest,
) -> Result<Framework, OrchestratorError> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mismatch = || {
        OrchestratorError::UnsupportedFramework(format!(
            "{} does not carry a known .{} signature",
            filename, extension
        ))
    };

    match extension.as_str() {
        "pkl" | "pickle" | "joblib" => {
            let recognised = is_pickle(model) || (extension == "joblib" && is_zlib(model));
            if !recognised {
                return Err(mismatch());
            }
            if manifest.lists_any(SKLEARN_PACKAGES) {
                Ok(Framework::Sklearn)
            } else {
                Ok(Framework::Custom)
            }
        }
        "pt" | "pth" => {
            if model.starts_with(ZIP_MAGIC) || is_pickle(model) {
                Ok(Framework::Pytorch)
            } else {
                Err(mismatch())
            }
        }
        "h5" | "hdf5" => {
            if model.starts_with(HDF5_MAGIC) {
                Ok(Framework::Tensorflow)
            } else {
                Err(mismatch())
            }
        }
        "keras" => {
            if model.starts_with(ZIP_MAGIC) || model.starts_with(HDF5_MAGIC) {
                Ok(Framework::Tensorflow)
            } else {
                Err(mismatch())
            }
        }
        _ => Err(OrchestratorError::UnsupportedFramework(format!(
            "unsupported model format: {}",
            filename
        ))),
    }
}

// ================================= MANIFEST ====================================== //

/// One requirement line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Normalized package name
    pub name: String,

    /// Version specifier, e.g. `==1.3.0` or `>=2,<3`
    pub specifier: Option<String>,
}

impl Requirement {
    /// Exact version when the requirement is pinned with `==`
    pub fn pinned_version(&self) -> Option<&str> {
        let specifier = self.specifier.as_deref()?;
        let version = specifier.strip_prefix("==")?;
        if version.contains(',') || version.contains('*') {
            return None;
        }
        Some(version.trim())
    }
}

/// Parsed requirements manifest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub requirements: Vec<Requirement>,
    pub warnings: Vec<String>,
}

impl Manifest {
    pub fn lists(&self, package: &str) -> bool {
        let package = normalize_name(package);
        self.requirements.iter().any(|r| r.name == package)
    }

    pub fn lists_any(&self, packages: &[&str]) -> bool {
        packages.iter().any(|p| self.lists(p))
    }
}

/// PEP 503 name normalization
fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn unresolvable(line_no: usize, line: &str, reason: &str) -> OrchestratorError {
    OrchestratorError::ManifestUnresolvable(format!("line {}: {} ({})", line_no, reason, line))
}

/// Parse `requirements.txt`
pub fn parse_manifest(text: &str) -> Result<Manifest, OrchestratorError> {
    let mut manifest = Manifest::default();
    let mut pins: HashMap<String, String> = HashMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = match raw.find(" #") {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('-') {
            let reason = if line.starts_with("-e") || line.starts_with("--editable") {
                "editable installs cannot be built"
            } else if line.starts_with("-r") || line.starts_with("--requirement") {
                "nested requirement files are not uploaded"
            } else if line.starts_with("-c") || line.starts_with("--constraint") {
                "constraint files are not uploaded"
            } else {
                "pip options are not supported"
            };
            return Err(unresolvable(line_no, line, reason));
        }

        if line.contains("://") || line.contains(" @ ") || line.starts_with("git+") {
            return Err(unresolvable(line_no, line, "direct URL and VCS requirements are not supported"));
        }

        // environment markers do not affect resolvability here
        let line = line.split(';').next().unwrap_or(line).trim();

        let spec_start = line
            .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '['))
            .unwrap_or(line.len());
        let raw_name = line[..spec_start].trim();
        let mut rest = line[spec_start..].trim();

        if !is_valid_name(raw_name) {
            return Err(unresolvable(line_no, line, "invalid package name"));
        }

        if rest.starts_with('[') {
            match rest.find(']') {
                Some(end) => rest = rest[end + 1..].trim(),
                None => return Err(unresolvable(line_no, line, "unterminated extras")),
            }
        }

        let name = normalize_name(raw_name);
        let requirement = Requirement {
            name: name.clone(),
            specifier: if rest.is_empty() {
                None
            } else {
                Some(rest.replace(' ', ""))
            },
        };

        match (&requirement.specifier, requirement.pinned_version()) {
            (None, _) => manifest
                .warnings
                .push(format!("Package without version: {}", raw_name)),
            (Some(_), None) => manifest
                .warnings
                .push(format!("Package with version range: {}", line)),
            (Some(_), Some(version)) => {
                if let Some(previous) = pins.get(&name) {
                    if previous != version {
                        return Err(unresolvable(
                            line_no,
                            line,
                            &format!("conflicts with {}=={}", name, previous),
                        ));
                    }
                }
                pins.insert(name.clone(), version.to_string());
            }
        }

        manifest.requirements.push(requirement);
    }

    if manifest.lists("tensorflow") && manifest.lists("tensorflow-gpu") {
        return Err(OrchestratorError::ManifestUnresolvable(
            "both tensorflow and tensorflow-gpu specified".to_string(),
        ));
    }

    Ok(manifest)
}
