// ABOUTME: Template and data file loading for the sandbox
// ABOUTME: Directory-backed and in-memory loaders with path confinement

use crate::error::{EngineError, Result};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

pub const TEMPLATE_SUFFIX: &str = ".tpl.rhai";
pub const DATA_DIR_SUFFIX: &str = ".tpl.data";

/// A template script together with its data files
#[derive(Clone)]
pub struct TemplateSource {
    pub name: String,
    pub script: String,
    pub data: Arc<dyn DataSource>,
}

/// One file read from a template's data directory
#[derive(Debug, Clone, PartialEq)]
pub struct DataFile {
    /// Path relative to the data directory root
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

/// Read-only view of a template's data directory.
///
/// Paths are always normalized with [`normalize_path`] by the caller.
pub trait DataSource: Send + Sync {
    /// Read one regular file, `None` if it does not exist
    fn read(&self, path: &str) -> io::Result<Option<DataFile>>;

    /// Every file at or below `path` (`""` is the whole directory)
    fn collect(&self, path: &str) -> io::Result<Vec<DataFile>>;
}

pub trait TemplateLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<TemplateSource>;

    /// Names of every template this loader can load
    fn list(&self) -> Result<Vec<String>>;
}

/// Normalize a relative slash-separated path, rejecting `..` and empty names
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in path.trim().split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.contains('\\') => return None,
            p => parts.push(p),
        }
    }
    Some(parts.join("/"))
}

fn template_name(name: &str) -> Result<String> {
    match normalize_path(name) {
        Some(normalized) if !normalized.is_empty() => Ok(normalized),
        _ => Err(EngineError::template(name, "invalid template name")),
    }
}

/// Loads `<name>.tpl.rhai` scripts below a base directory
pub struct DirTemplateLoader {
    base: PathBuf,
}

impl DirTemplateLoader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl TemplateLoader for DirTemplateLoader {
    fn load(&self, name: &str) -> Result<TemplateSource> {
        let name = template_name(name)?;
        let script_path = self.base.join(format!("{}{}", name, TEMPLATE_SUFFIX));

        debug!("Loading template {} from {}", name, script_path.display());

        let script = match std::fs::read_to_string(&script_path) {
            Ok(script) => script,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(format!("template '{}'", name)))
            }
            Err(e) => return Err(e.into()),
        };

        let data = DirDataSource::new(self.base.join(format!("{}{}", name, DATA_DIR_SUFFIX)));

        Ok(TemplateSource {
            name,
            script,
            data: Arc::new(data),
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in WalkDir::new(&self.base).sort_by_file_name() {
            let entry = entry.map_err(|e| EngineError::Io(io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            if let Some(name) = relative.strip_suffix(TEMPLATE_SUFFIX) {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }
}

/// Data directory on disk. Symlinks are not followed.
pub struct DirDataSource {
    root: PathBuf,
}

impl DirDataSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

impl DataSource for DirDataSource {
    fn read(&self, path: &str) -> io::Result<Option<DataFile>> {
        let full = self.root.join(path);
        let metadata = match std::fs::symlink_metadata(&full) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(DataFile {
            path: path.to_string(),
            content: std::fs::read(&full)?,
            mode: file_mode(&metadata),
        }))
    }

    fn collect(&self, path: &str) -> io::Result<Vec<DataFile>> {
        let start = self.root.join(path);
        if std::fs::symlink_metadata(&start).is_err() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&start).sort_by_file_name() {
            let entry = entry.map_err(|e| io::Error::other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| io::Error::other(e.to_string()))?;
            files.push(DataFile {
                path: self.relative(entry.path()),
                content: std::fs::read(entry.path())?,
                mode: file_mode(&metadata),
            });
        }

        Ok(files)
    }
}

#[derive(Default, Clone)]
struct MemoryTemplate {
    script: String,
    files: BTreeMap<String, (Vec<u8>, u32)>,
}

/// Templates held in memory, used for built-in templates and tests
#[derive(Default, Clone)]
pub struct MemoryTemplateLoader {
    templates: HashMap<String, MemoryTemplate>,
}

impl MemoryTemplateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: &str, script: impl Into<String>) -> Self {
        self.templates.entry(name.to_string()).or_default().script = script.into();
        self
    }

    pub fn with_data(self, name: &str, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.with_data_mode(name, path, content, 0o644)
    }

    pub fn with_data_mode(
        mut self,
        name: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
        mode: u32,
    ) -> Self {
        self.templates
            .entry(name.to_string())
            .or_default()
            .files
            .insert(path.to_string(), (content.into(), mode));
        self
    }
}

impl TemplateLoader for MemoryTemplateLoader {
    fn load(&self, name: &str) -> Result<TemplateSource> {
        let name = template_name(name)?;
        let template = self
            .templates
            .get(&name)
            .ok_or_else(|| EngineError::NotFound(format!("template '{}'", name)))?;

        Ok(TemplateSource {
            name,
            script: template.script.clone(),
            data: Arc::new(MemoryDataSource {
                files: template.files.clone(),
            }),
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

struct MemoryDataSource {
    files: BTreeMap<String, (Vec<u8>, u32)>,
}

impl DataSource for MemoryDataSource {
    fn read(&self, path: &str) -> io::Result<Option<DataFile>> {
        Ok(self.files.get(path).map(|(content, mode)| DataFile {
            path: path.to_string(),
            content: content.clone(),
            mode: *mode,
        }))
    }

    fn collect(&self, path: &str) -> io::Result<Vec<DataFile>> {
        let prefix = format!("{}/", path);
        Ok(self
            .files
            .iter()
            .filter(|(p, _)| path.is_empty() || p.as_str() == path || p.starts_with(&prefix))
            .map(|(p, (content, mode))| DataFile {
                path: p.clone(),
                content: content.clone(),
                mode: *mode,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/./b/"), Some("a/b".to_string()));
        assert_eq!(normalize_path("*"), Some("*".to_string()));
        assert_eq!(normalize_path(""), Some(String::new()));
        assert_eq!(normalize_path("a/../../etc/passwd"), None);
        assert_eq!(normalize_path(".."), None);
    }

    #[test]
    fn test_dir_loader_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let loader = DirTemplateLoader::new(dir.path());

        assert!(matches!(
            loader.load("../secret"),
            Err(EngineError::Template { .. })
        ));
    }

    #[test]
    fn test_dir_loader_loads_script_and_data() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("db/mongo.tpl.data/init")).unwrap();
        std::fs::write(dir.path().join("db/mongo.tpl.rhai"), "fn execute(tpl, params) {}").unwrap();
        std::fs::write(dir.path().join("db/mongo.tpl.data/init/a.js"), "a").unwrap();
        std::fs::write(dir.path().join("db/mongo.tpl.data/init/b.js"), "b").unwrap();

        let loader = DirTemplateLoader::new(dir.path());
        let source = loader.load("/db/mongo").unwrap();

        assert_eq!(source.name, "db/mongo");
        assert!(source.script.contains("execute"));

        let files: Vec<String> = source
            .data
            .collect("init")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(files, vec!["init/a.js", "init/b.js"]);

        assert!(source.data.read("init/missing.js").unwrap().is_none());
        assert_eq!(loader.list().unwrap(), vec!["db/mongo"]);
    }

    #[test]
    fn test_missing_template_is_not_found() {
        let dir = TempDir::new().unwrap();
        let loader = DirTemplateLoader::new(dir.path());

        assert!(matches!(loader.load("nope"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_memory_loader_collects_by_prefix() {
        let loader = MemoryTemplateLoader::new()
            .with_template("app", "fn execute(tpl, params) {}")
            .with_data("app", "ws/Dockerfile", "FROM alpine")
            .with_data("app", "ws/run.sh", "#!/bin/sh")
            .with_data("app", "wsx", "other");

        let source = loader.load("app").unwrap();
        assert_eq!(source.data.collect("ws").unwrap().len(), 2);
        assert_eq!(source.data.collect("").unwrap().len(), 3);
    }
}
