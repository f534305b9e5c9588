//! Models this node knows how to run or verify.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::InferenceError;

/// Artifacts for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    /// Compiled circuit, needed to prove
    pub compiled: Bytes,
    /// Circuit settings, needed to verify and decode outputs
    pub settings: Option<Bytes>,
}

impl ModelArtifacts {
    /// Read artifacts from disk
    pub fn load(compiled: &Path, settings: Option<&Path>) -> Result<Self, InferenceError> {
        let compiled = Bytes::from(std::fs::read(compiled)?);
        let settings = match settings {
            Some(path) => Some(Bytes::from(std::fs::read(path)?)),
            None => None,
        };
        Ok(Self { compiled, settings })
    }
}

/// Named models
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelArtifacts>,
}

impl ModelCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model
    pub fn insert(&mut self, name: impl Into<String>, artifacts: ModelArtifacts) {
        let name = name.into();
        info!(
            "Registered model {} ({} bytes compiled, settings: {})",
            name,
            artifacts.compiled.len(),
            artifacts.settings.is_some()
        );
        self.models.insert(name, artifacts);
    }

    /// Artifacts for `name`
    pub fn get(&self, name: &str) -> Option<&ModelArtifacts> {
        self.models.get(name)
    }

    /// Artifacts for `name`, or [`InferenceError::UnknownModel`]
    pub fn require(&self, name: &str) -> Result<&ModelArtifacts, InferenceError> {
        self.get(name)
            .ok_or_else(|| InferenceError::UnknownModel(name.to_string()))
    }

    /// Model names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of models
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_artifacts_from_disk() {
        let dir = TempDir::new().unwrap();
        let compiled = dir.path().join("network.compiled");
        let settings = dir.path().join("settings.json");
        fs::write(&compiled, b"circuit").unwrap();
        fs::write(&settings, br#"{"model_output_scales":[7]}"#).unwrap();

        let artifacts = ModelArtifacts::load(&compiled, Some(&settings)).unwrap();
        assert_eq!(&artifacts.compiled[..], b"circuit");
        assert!(artifacts.settings.is_some());

        let without_settings = ModelArtifacts::load(&compiled, None).unwrap();
        assert!(without_settings.settings.is_none());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = ModelArtifacts::load(&dir.path().join("absent"), None);
        assert!(matches!(result, Err(InferenceError::Io(_))));
    }

    #[test]
    fn test_lookup() {
        let mut catalog = ModelCatalog::new();
        catalog.insert(
            "mnist",
            ModelArtifacts {
                compiled: Bytes::from_static(b"circuit"),
                settings: None,
            },
        );

        assert_eq!(catalog.names(), vec!["mnist".to_string()]);
        assert!(catalog.require("mnist").is_ok());
        assert!(matches!(
            catalog.require("resnet"),
            Err(InferenceError::UnknownModel(_))
        ));
    }
}
