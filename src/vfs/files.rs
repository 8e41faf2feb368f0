//! Generated file records handed over by the code-generation pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Generation status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Content has fully arrived
    Completed,
    /// Generation failed for this file
    #[serde(alias = "error")]
    Errored,
}

/// A file produced by the upstream generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// POSIX-style relative path
    #[serde(default)]
    pub path: String,
    /// File content, absent while still streaming or after an error
    #[serde(default)]
    pub content: Option<String>,
    /// Generation status
    pub status: FileStatus,
    /// Error reported by the generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GeneratedFile {
    /// Create a completed file
    pub fn completed(path: impl Into<String>, content: impl Into<String>) -> Self {
        GeneratedFile {
            path: path.into(),
            content: Some(content.into()),
            status: FileStatus::Completed,
            error: None,
        }
    }

    /// Create an errored file
    pub fn errored(path: impl Into<String>, error: impl Into<String>) -> Self {
        GeneratedFile {
            path: path.into(),
            content: None,
            status: FileStatus::Errored,
            error: Some(error.into()),
        }
    }

    /// Content of a file that is ready to be mounted
    pub fn mountable_content(&self) -> Option<&str> {
        match (self.status, self.content.as_deref()) {
            (FileStatus::Completed, Some(content)) if !content.is_empty() => Some(content),
            _ => None,
        }
    }
}

/// Generated files keyed by path, iterated in lexicographic order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedFileSet {
    files: BTreeMap<String, GeneratedFile>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileSetDocument {
    Keyed(BTreeMap<String, GeneratedFile>),
    List(Vec<GeneratedFile>),
}

impl GeneratedFileSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, replacing any previous entry at the same path
    pub fn insert(&mut self, file: GeneratedFile) {
        self.files.insert(file.path.clone(), file);
    }

    /// Return a new set with `file` added, leaving `self` untouched
    pub fn with_file(&self, file: GeneratedFile) -> Self {
        let mut next = self.clone();
        next.insert(file);
        next
    }

    /// Look up a file by path
    pub fn get(&self, path: &str) -> Option<&GeneratedFile> {
        self.files.get(path)
    }

    /// Number of entries, including errored ones
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All entries in path order
    pub fn iter(&self) -> impl Iterator<Item = &GeneratedFile> {
        self.files.values()
    }

    /// Completed entries with content, in path order
    pub fn completed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .filter_map(|(path, file)| file.mountable_content().map(|c| (path.as_str(), c)))
    }

    /// Parse a JSON document, either `{ "path": { ... } }` or `[ { "path": ... } ]`
    pub fn from_json(raw: &str) -> Result<Self> {
        let document: FileSetDocument = serde_json::from_str(raw)?;
        let mut set = GeneratedFileSet::new();
        match document {
            FileSetDocument::Keyed(map) => {
                for (path, mut file) in map {
                    file.path = path;
                    set.insert(file);
                }
            }
            FileSetDocument::List(list) => {
                for file in list {
                    if file.path.is_empty() {
                        return Err(Error::InvalidInput(
                            "File record without a path".to_string(),
                        ));
                    }
                    set.insert(file);
                }
            }
        }
        Ok(set)
    }

    /// Read a JSON document from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }
}

impl FromIterator<GeneratedFile> for GeneratedFileSet {
    fn from_iter<I: IntoIterator<Item = GeneratedFile>>(iter: I) -> Self {
        let mut set = GeneratedFileSet::new();
        for file in iter {
            set.insert(file);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_skips_errored_and_empty() {
        let set: GeneratedFileSet = vec![
            GeneratedFile::completed("b.js", "b"),
            GeneratedFile::completed("a.js", "a"),
            GeneratedFile::completed("empty.js", ""),
            GeneratedFile::errored("broken.js", "model stopped"),
        ]
        .into_iter()
        .collect();

        let paths: Vec<&str> = set.completed().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a.js", "b.js"]);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_with_file_is_immutable() {
        let base = GeneratedFileSet::new().with_file(GeneratedFile::completed("a.js", "1"));
        let next = base.with_file(GeneratedFile::completed("a.js", "2"));

        assert_eq!(base.get("a.js").unwrap().content.as_deref(), Some("1"));
        assert_eq!(next.get("a.js").unwrap().content.as_deref(), Some("2"));
    }

    #[test]
    fn test_from_json_keyed() {
        let raw = r#"{
            "index.html": { "content": "<html></html>", "status": "completed" },
            "app.jsx": { "status": "error", "error": "timeout" }
        }"#;
        let set = GeneratedFileSet::from_json(raw).unwrap();

        assert_eq!(set.get("index.html").unwrap().path, "index.html");
        assert_eq!(set.get("app.jsx").unwrap().status, FileStatus::Errored);
        assert_eq!(set.completed().count(), 1);
    }

    #[test]
    fn test_from_json_list_requires_path() {
        let ok = r#"[{ "path": "a.css", "content": "body{}", "status": "completed" }]"#;
        assert_eq!(GeneratedFileSet::from_json(ok).unwrap().len(), 1);

        let missing = r#"[{ "content": "body{}", "status": "completed" }]"#;
        assert!(GeneratedFileSet::from_json(missing).is_err());
    }
}
