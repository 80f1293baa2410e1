//! Tool packages as stored in the content store.
//!
//! A package is a file map holding a `component.json` manifest and the
//! source file it names as entry point. Files may sit under a common
//! directory (`echo/component.json`, `echo/echo.py`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PackageError;
use crate::storage::Files;

/// File name of a package manifest.
pub const MANIFEST_FILE: &str = "component.json";

/// Package manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// File holding the tool source, relative to the manifest.
    pub entry_point: String,
    /// Executable the package binds to.
    pub callable: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ToolManifest {
    /// Model used when a request does not name one.
    pub fn default_model(&self) -> Option<&str> {
        self.params.get("default_model").and_then(Value::as_str)
    }
}

/// A decoded tool package.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPackage {
    pub manifest: ToolManifest,
    /// Contents of the entry point file.
    pub source: Vec<u8>,
}

impl ToolPackage {
    /// Decode a package from the files of a content-store blob.
    pub fn load(files: &Files) -> Result<Self, PackageError> {
        let (manifest_path, manifest_bytes) = files
            .iter()
            .find(|(name, _)| {
                name.as_str() == MANIFEST_FILE || name.ends_with(&format!("/{MANIFEST_FILE}"))
            })
            .ok_or(PackageError::MissingManifest)?;
        let manifest: ToolManifest = serde_json::from_slice(manifest_bytes)?;

        let dir = &manifest_path[..manifest_path.len() - MANIFEST_FILE.len()];
        let entry_path = format!("{dir}{}", manifest.entry_point);
        let source = files
            .get(&entry_path)
            .cloned()
            .ok_or_else(|| PackageError::MissingEntryPoint { file: entry_path })?;

        Ok(Self { manifest, source })
    }

    /// Encode the package as a flat file map.
    pub fn to_files(&self) -> Files {
        let manifest = serde_json::to_vec_pretty(&self.manifest).unwrap_or_default();
        Files::from([
            (MANIFEST_FILE.to_string(), manifest),
            (self.manifest.entry_point.clone(), self.source.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ToolManifest {
        ToolManifest {
            name: "echo".into(),
            description: "Echo tool".into(),
            entry_point: "echo.py".into(),
            callable: "echo".into(),
            params: serde_json::from_str(r#"{"default_model": "tiny"}"#).unwrap(),
        }
    }

    #[test]
    fn loads_flat_package() {
        let package = ToolPackage {
            manifest: manifest(),
            source: b"def run(**kwargs): ...".to_vec(),
        };
        let loaded = ToolPackage::load(&package.to_files()).unwrap();
        assert_eq!(loaded, package);
        assert_eq!(loaded.manifest.default_model(), Some("tiny"));
    }

    #[test]
    fn loads_nested_package() {
        let files = Files::from([
            (
                "echo/component.json".to_string(),
                serde_json::to_vec(&manifest()).unwrap(),
            ),
            ("echo/echo.py".to_string(), b"src".to_vec()),
        ]);
        assert_eq!(ToolPackage::load(&files).unwrap().source, b"src");
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            ToolPackage::load(&Files::new()),
            Err(PackageError::MissingManifest)
        ));

        let files = Files::from([("component.json".to_string(), b"{".to_vec())]);
        assert!(matches!(
            ToolPackage::load(&files),
            Err(PackageError::InvalidManifest(_))
        ));

        let files = Files::from([(
            "component.json".to_string(),
            serde_json::to_vec(&manifest()).unwrap(),
        )]);
        assert!(matches!(
            ToolPackage::load(&files),
            Err(PackageError::MissingEntryPoint { ref file }) if file == "echo.py"
        ));
    }
}
