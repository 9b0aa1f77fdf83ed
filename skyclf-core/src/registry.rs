//! Model registry: discovery of versioned model exports on disk.
//!
//! Layout: `<models_root>/<task>/<version>/{model.onnx, classes.json, meta.json}`.
//!
//! "Latest" is the lexicographically greatest version directory name. This is
//! only correct while version numbers share a digit width (`v09` < `v10`, but
//! `v9` > `v10`); operators exporting more than nine versions should zero-pad.

use crate::error::SkyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Version directories must start with this prefix.
pub const VERSION_PREFIX: &str = "v";
/// Default model family directory.
pub const DEFAULT_TASK: &str = "skystate";
/// Default artifact file consumed by the inference engine.
pub const DEFAULT_ARTIFACT: &str = "model.onnx";
pub const CLASSES_FILE: &str = "classes.json";
pub const META_FILE: &str = "meta.json";

/// Artifact files advertised by [`list_versions`].
const KNOWN_ARTIFACTS: [&str; 2] = ["model.onnx", "model.pt"];

/// One discovered, validated model export. Never mutated after a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: String,
    pub dir: PathBuf,
    pub artifact_path: PathBuf,
    /// Class name -> index, as exported.
    pub classes: HashMap<String, usize>,
    /// Index -> class name, dense over `0..n`.
    pub class_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ModelVersion {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// Summary row for a version directory, valid or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    pub dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Artifact file names present in the directory.
    pub artifacts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelMeta {
    #[serde(default)]
    created_at: Option<serde_json::Value>,
}

/// Locates model versions for one task below a models root.
#[derive(Debug, Clone)]
pub struct ModelLocator {
    task: String,
    artifact_file: String,
}

impl Default for ModelLocator {
    fn default() -> Self {
        Self::new(DEFAULT_TASK, DEFAULT_ARTIFACT)
    }
}

impl ModelLocator {
    pub fn new(task: impl Into<String>, artifact_file: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            artifact_file: artifact_file.into(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn task_root(&self, models_root: &Path) -> PathBuf {
        models_root.join(&self.task)
    }

    /// Resolve `version` (or the latest when `None`/empty) to a usable model.
    ///
    /// `Ok(None)` means "not trained yet": no task directory, no matching
    /// version, or no artifact file. Broken exports are `Err`.
    pub fn find(
        &self,
        models_root: &Path,
        version: Option<&str>,
    ) -> Result<Option<ModelVersion>, SkyError> {
        let mut versions = self.version_dirs(models_root)?;
        if versions.is_empty() {
            return Ok(None);
        }

        let version = match version.filter(|v| !v.is_empty()) {
            Some(requested) => {
                if !versions.iter().any(|v| v == requested) {
                    debug!(version = requested, "Requested model version not present");
                    return Ok(None);
                }
                requested.to_string()
            }
            None => {
                versions.sort();
                match versions.pop() {
                    Some(latest) => latest,
                    None => return Ok(None),
                }
            }
        };

        let dir = self.task_root(models_root).join(&version);
        let artifact_path = dir.join(&self.artifact_file);
        if !artifact_path.is_file() {
            debug!(version = %version, path = %artifact_path.display(), "No artifact in version directory");
            return Ok(None);
        }

        let classes_path = dir.join(CLASSES_FILE);
        let raw = std::fs::read_to_string(&classes_path).map_err(|e| {
            SkyError::corrupt(format!("read {}: {e}", classes_path.display()))
        })?;
        let (classes, class_names) = parse_class_map(&raw)?;
        let created_at = read_created_at(&dir);

        Ok(Some(ModelVersion {
            version,
            dir,
            artifact_path,
            classes,
            class_names,
            created_at,
        }))
    }

    /// Every version directory, newest first by the same ordering as [`Self::find`].
    pub fn list(&self, models_root: &Path) -> Result<Vec<VersionEntry>, SkyError> {
        let root = self.task_root(models_root);
        let mut versions = self.version_dirs(models_root)?;
        versions.sort_by(|a, b| b.cmp(a));

        Ok(versions
            .into_iter()
            .map(|version| {
                let dir = root.join(&version);
                let artifacts = KNOWN_ARTIFACTS
                    .iter()
                    .filter(|name| dir.join(name).is_file())
                    .map(|name| name.to_string())
                    .collect();
                VersionEntry {
                    created_at: read_created_at(&dir),
                    version,
                    dir,
                    artifacts,
                }
            })
            .collect())
    }

    fn version_dirs(&self, models_root: &Path) -> Result<Vec<String>, SkyError> {
        let root = self.task_root(models_root);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(VERSION_PREFIX) {
                versions.push(name);
            }
        }
        Ok(versions)
    }
}

/// Find a model for the default task and artifact name.
pub fn find_model(
    models_root: &Path,
    version: Option<&str>,
) -> Result<Option<ModelVersion>, SkyError> {
    ModelLocator::default().find(models_root, version)
}

/// List version directories for the default task.
pub fn list_versions(models_root: &Path) -> Result<Vec<VersionEntry>, SkyError> {
    ModelLocator::default().list(models_root)
}

/// Parse `classes.json` (name -> index) and build the dense index -> name table.
pub fn parse_class_map(raw: &str) -> Result<(HashMap<String, usize>, Vec<String>), SkyError> {
    let parsed: HashMap<String, i64> = serde_json::from_str(raw)
        .map_err(|e| SkyError::corrupt(format!("parse {CLASSES_FILE}: {e}")))?;
    if parsed.is_empty() {
        return Err(SkyError::corrupt(format!("{CLASSES_FILE} is empty")));
    }

    let mut classes = HashMap::with_capacity(parsed.len());
    for (name, id) in parsed {
        let id = usize::try_from(id).map_err(|_| {
            SkyError::corrupt(format!("{CLASSES_FILE} has negative index {id} for {name:?}"))
        })?;
        if name.is_empty() {
            return Err(SkyError::corrupt(format!(
                "{CLASSES_FILE} missing name for id {id}"
            )));
        }
        classes.insert(name, id);
    }

    let mut slots: Vec<Option<&String>> = vec![None; classes.len()];
    for (name, &id) in &classes {
        let Some(slot) = slots.get_mut(id) else {
            continue;
        };
        if let Some(other) = slot {
            // Report the pair in a stable order.
            let (a, b) = if *other < name { (*other, name) } else { (name, *other) };
            return Err(SkyError::corrupt(format!(
                "{CLASSES_FILE} assigns index {id} to both {a:?} and {b:?}"
            )));
        }
        *slot = Some(name);
    }
    if let Some(gap) = slots.iter().position(Option::is_none) {
        return Err(SkyError::corrupt(format!(
            "{CLASSES_FILE} missing name for id {gap}"
        )));
    }
    let names: Vec<String> = slots.into_iter().flatten().cloned().collect();

    Ok((classes, names))
}

fn read_created_at(dir: &Path) -> Option<String> {
    let path = dir.join(META_FILE);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<ModelMeta>(&raw) {
        Ok(meta) => meta.created_at.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed model metadata");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_version(root: &Path, version: &str, classes: Option<&str>, artifact: bool) -> PathBuf {
        let dir = root.join(DEFAULT_TASK).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        if artifact {
            std::fs::write(dir.join(DEFAULT_ARTIFACT), b"onnx").unwrap();
        }
        if let Some(classes) = classes {
            std::fs::write(dir.join(CLASSES_FILE), classes).unwrap();
        }
        dir
    }

    #[test]
    fn test_single_version_is_latest() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v1", Some(r#"{"clear":0,"cloudy":1}"#), true);

        let model = find_model(tmp.path(), None).unwrap().unwrap();
        assert_eq!(model.version, "v1");
        assert_eq!(model.class_names, vec!["clear", "cloudy"]);
        assert_eq!(
            model.artifact_path,
            tmp.path().join("skystate/v1/model.onnx")
        );
        assert_eq!(model.created_at, None);
    }

    #[test]
    fn test_missing_root_is_no_model() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_model(&tmp.path().join("nope"), None).unwrap().is_none());
        assert!(list_versions(&tmp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_missing_artifact_is_no_model_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        // classes.json is even broken: the artifact check comes first
        write_version(tmp.path(), "v1", Some("not json"), false);
        assert!(find_model(tmp.path(), None).unwrap().is_none());
    }

    #[test]
    fn test_missing_classes_is_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v1", None, true);
        let err = find_model(tmp.path(), None).unwrap_err();
        assert!(matches!(err, SkyError::DataCorruption(_)));
    }

    #[test]
    fn test_explicit_version_pin() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v1", Some(r#"{"a":0}"#), true);
        write_version(tmp.path(), "v2", Some(r#"{"a":0,"b":1}"#), true);

        assert_eq!(find_model(tmp.path(), Some("v1")).unwrap().unwrap().version, "v1");
        assert_eq!(find_model(tmp.path(), Some("")).unwrap().unwrap().version, "v2");
        assert!(find_model(tmp.path(), Some("v7")).unwrap().is_none());
    }

    #[test]
    fn test_latest_is_lexicographic() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v9", Some(r#"{"a":0}"#), true);
        write_version(tmp.path(), "v10", Some(r#"{"a":0}"#), true);
        // Not numeric ordering: "v9" sorts after "v10".
        assert_eq!(find_model(tmp.path(), None).unwrap().unwrap().version, "v9");
    }

    #[test]
    fn test_non_version_entries_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "v1", Some(r#"{"a":0}"#), true);
        std::fs::create_dir_all(tmp.path().join("skystate/tmp-export")).unwrap();
        std::fs::write(tmp.path().join("skystate/v99"), b"a file, not a dir").unwrap();

        assert_eq!(find_model(tmp.path(), None).unwrap().unwrap().version, "v1");
    }

    #[test]
    fn test_class_map_gap() {
        let err = parse_class_map(r#"{"clear":0,"rain":2}"#).unwrap_err();
        assert!(err.to_string().contains("missing name for id 1"));
    }

    #[test]
    fn test_class_map_rejects_negative_and_duplicates() {
        assert!(matches!(
            parse_class_map(r#"{"clear":-1}"#),
            Err(SkyError::DataCorruption(_))
        ));
        assert!(matches!(
            parse_class_map(r#"{"clear":0,"also_clear":0}"#),
            Err(SkyError::DataCorruption(_))
        ));
        assert!(matches!(parse_class_map("{}"), Err(SkyError::DataCorruption(_))));
    }

    #[test]
    fn test_class_map_empty_name_is_gap() {
        let err = parse_class_map(r#"{"":0}"#).unwrap_err();
        assert!(err.to_string().contains("missing name for id 0"));
    }

    #[test]
    fn test_class_map_empty_name_sharing_index_is_rejected() {
        // HashMap iteration order varies per instance; repeat to cover both orders.
        for _ in 0..64 {
            assert!(matches!(
                parse_class_map(r#"{"":0,"clear":0}"#),
                Err(SkyError::DataCorruption(_))
            ));
            let err = parse_class_map(r#"{"clear":0,"cloudy":1,"fog":1}"#).unwrap_err();
            assert!(err.to_string().contains(r#"index 1 to both "cloudy" and "fog""#));
        }
    }

    #[test]
    fn test_list_versions_with_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = write_version(tmp.path(), "v1", Some(r#"{"a":0}"#), true);
        std::fs::write(v1.join(META_FILE), r#"{"created_at":"2026-01-02T03:04:05Z"}"#).unwrap();
        let v2 = write_version(tmp.path(), "v2", None, false);
        std::fs::write(v2.join("model.pt"), b"pt").unwrap();
        std::fs::write(v2.join(META_FILE), "{broken").unwrap();

        let entries = list_versions(tmp.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].version, "v2");
        assert_eq!(entries[0].artifacts, vec!["model.pt"]);
        assert_eq!(entries[0].created_at, None);
        assert_eq!(entries[1].version, "v1");
        assert_eq!(entries[1].artifacts, vec!["model.onnx"]);
        assert_eq!(entries[1].created_at.as_deref(), Some("2026-01-02T03:04:05Z"));
    }

    #[test]
    fn test_custom_locator() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cloudcover/v3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("net.onnx"), b"onnx").unwrap();
        std::fs::write(dir.join(CLASSES_FILE), r#"{"low":0,"high":1}"#).unwrap();

        let locator = ModelLocator::new("cloudcover", "net.onnx");
        let model = locator.find(tmp.path(), None).unwrap().unwrap();
        assert_eq!(model.version, "v3");
        assert_eq!(model.num_classes(), 2);
    }
}
