//! Virtual filesystem builder
//!
//! Turns a flat set of generated files into the project layout the sandbox
//! serves: the HTML entry under `public/`, everything else under `src/`, an
//! entry document when the generator did not produce one, and a manifest the
//! orchestrator controls. Pure and deterministic: the same completed files
//! always produce the same tree.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::files::GeneratedFileSet;
use super::tree::MountNode;

/// Root-level path of the generator's HTML entry
pub const ENTRY_SOURCE_PATH: &str = "index.html";
/// Where the HTML entry lives inside the mount tree
pub const ENTRY_MOUNT_PATH: &str = "public/index.html";
/// Directory receiving every non-entry source file
pub const SOURCE_DIR: &str = "src";
/// Directory receiving the HTML entry
pub const PUBLIC_DIR: &str = "public";
/// Project manifest written at the mount root
pub const MANIFEST_PATH: &str = "package.json";

/// Script bundle referenced by a synthesized entry
const SCRIPT_BUNDLE: &str = "../src/index.js";
/// Stylesheet referenced by a synthesized entry
const STYLE_BUNDLE: &str = "../src/styles.css";

/// Component-source extensions rewritten to plain scripts
const COMPONENT_EXTENSIONS: &[&str] = &["jsx", "tsx"];
const SCRIPT_EXTENSION: &str = "js";
const STYLE_EXTENSION: &str = "css";

/// Knobs for the synthesized manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Port the static server listens on
    pub port: u16,
    /// Version requirement of the `serve` package
    pub serve_version: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            port: 3000,
            serve_version: "^14.0.0".to_string(),
        }
    }
}

#[derive(Serialize)]
struct PackageManifest<'a> {
    name: &'a str,
    version: &'a str,
    description: &'a str,
    #[serde(rename = "type")]
    module_type: &'a str,
    scripts: BTreeMap<&'a str, String>,
    dependencies: BTreeMap<&'a str, &'a str>,
}

/// Build the mount tree with default options
pub fn build(files: &GeneratedFileSet) -> MountNode {
    build_with(files, &BuildOptions::default())
}

/// Build the mount tree for the completed subset of `files`
pub fn build_with(files: &GeneratedFileSet, options: &BuildOptions) -> MountNode {
    let mut root = MountNode::directory();
    insert(&mut root, SOURCE_DIR, None);
    insert(&mut root, PUBLIC_DIR, None);

    let mut has_script = false;
    let mut has_style = false;

    for (path, content) in files.completed() {
        let Some(segments) = normalize(path) else {
            warn!("Skipping generated file with unsafe path: {}", path);
            continue;
        };
        let relative = segments.join("/");

        if relative == MANIFEST_PATH {
            debug!("Dropping caller-supplied manifest; it is always synthesized");
            continue;
        }

        let target = if relative == ENTRY_SOURCE_PATH {
            ENTRY_MOUNT_PATH.to_string()
        } else {
            format!("{}/{}", SOURCE_DIR, rewrite_extension(&relative))
        };

        match extension(&target) {
            Some(SCRIPT_EXTENSION) => has_script = true,
            Some(STYLE_EXTENSION) => has_style = true,
            _ => {}
        }

        if !insert(&mut root, &target, Some(content.as_bytes())) {
            warn!("Skipping {}: conflicts with an existing entry at {}", path, target);
        }
    }

    if root.get(ENTRY_MOUNT_PATH).is_none() {
        debug!(has_script, has_style, "Synthesizing HTML entry");
        insert(
            &mut root,
            ENTRY_MOUNT_PATH,
            Some(entry_document(has_script, has_style).as_bytes()),
        );
    }

    insert(&mut root, MANIFEST_PATH, Some(manifest(options).as_bytes()));
    root
}

/// Split a path into safe segments; `None` for paths escaping the root
fn normalize(path: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        None
    } else {
        Some(ext)
    }
}

fn rewrite_extension(path: &str) -> String {
    match extension(path) {
        Some(ext) if COMPONENT_EXTENSIONS.contains(&ext) => {
            format!("{}.{}", &path[..path.len() - ext.len() - 1], SCRIPT_EXTENSION)
        }
        _ => path.to_string(),
    }
}

/// Insert a file (`Some`) or directory (`None`) at `path`, creating parents.
/// Returns false when the path collides with an entry of the other kind.
fn insert(root: &mut MountNode, path: &str, contents: Option<&[u8]>) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut node = root;
    for segment in parents {
        let MountNode::Directory { children } = node else {
            return false;
        };
        node = children
            .entry((*segment).to_string())
            .or_insert_with(MountNode::directory);
    }

    let MountNode::Directory { children } = node else {
        return false;
    };
    match contents {
        Some(bytes) => {
            if children.get(*last).is_some_and(MountNode::is_directory) {
                return false;
            }
            children.insert((*last).to_string(), MountNode::file(bytes));
            true
        }
        None => {
            let entry = children
                .entry((*last).to_string())
                .or_insert_with(MountNode::directory);
            entry.is_directory()
        }
    }
}

fn entry_document(has_script: bool, has_style: bool) -> String {
    let style = if has_style {
        format!("<link rel=\"stylesheet\" href=\"{}\">", STYLE_BUNDLE)
    } else {
        String::new()
    };
    let script = if has_script {
        format!("<script type=\"module\" src=\"{}\"></script>", SCRIPT_BUNDLE)
    } else {
        String::new()
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Preview</title>
  {style}
  {script}
</head>
<body>
  <div id="app"></div>
</body>
</html>
"#
    )
}

fn manifest(options: &BuildOptions) -> String {
    let mut scripts = BTreeMap::new();
    scripts.insert("start", format!("npx serve . -p {}", options.port));
    let mut dependencies = BTreeMap::new();
    dependencies.insert("serve", options.serve_version.as_str());

    let manifest = PackageManifest {
        name: "generated-app",
        version: "1.0.0",
        description: "Generated by AI",
        module_type: "module",
        scripts,
        dependencies,
    };
    // Serializing a struct of strings and string maps cannot fail.
    serde_json::to_string_pretty(&manifest).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::GeneratedFile;

    fn set(files: &[(&str, &str)]) -> GeneratedFileSet {
        files
            .iter()
            .map(|(p, c)| GeneratedFile::completed(*p, *c))
            .collect()
    }

    fn text(tree: &MountNode, path: &str) -> String {
        String::from_utf8(tree.file_contents(path).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_index_html_is_placed_under_public() {
        let html = "<html><body>hi</body></html>";
        let tree = build(&set(&[("index.html", html)]));

        assert_eq!(text(&tree, "public/index.html"), html);
        assert!(tree.get("src").unwrap().is_directory());
        assert!(tree.get("src/index.html").is_none());
    }

    #[test]
    fn test_component_source_is_rewritten() {
        let tree = build(&set(&[("app.jsx", "export default () => null;")]));

        assert_eq!(text(&tree, "src/app.js"), "export default () => null;");
        assert!(tree.get("src/app.jsx").is_none());
        let entry = text(&tree, "public/index.html");
        assert!(entry.contains("<script type=\"module\" src=\"../src/index.js\"></script>"));
        assert!(!entry.contains("stylesheet"));
    }

    #[test]
    fn test_tsx_rewrite_in_nested_directory() {
        let tree = build(&set(&[("components/Button.tsx", "x")]));
        assert_eq!(text(&tree, "src/components/Button.js"), "x");
    }

    #[test]
    fn test_synthesized_entry_tags_follow_file_kinds() {
        let cases: &[(&[(&str, &str)], bool, bool)] = &[
            (&[("readme.md", "x")], false, false),
            (&[("main.js", "x")], true, false),
            (&[("styles.css", "x")], false, true),
            (&[("main.js", "x"), ("theme/app.css", "y")], true, true),
            (&[("view.tsx", "x")], true, false),
        ];

        for (files, script, style) in cases {
            let entry = text(&build(&set(files)), ENTRY_MOUNT_PATH);
            assert_eq!(entry.contains("<script"), *script, "files: {:?}", files);
            assert_eq!(entry.contains("stylesheet"), *style, "files: {:?}", files);
        }
    }

    #[test]
    fn test_caller_entry_wins() {
        let tree = build(&set(&[("index.html", "mine"), ("main.js", "x")]));
        assert_eq!(text(&tree, ENTRY_MOUNT_PATH), "mine");
    }

    #[test]
    fn test_manifest_always_synthesized() {
        let tree = build(&set(&[("package.json", "{\"name\":\"theirs\"}")]));
        let manifest: serde_json::Value =
            serde_json::from_str(&text(&tree, MANIFEST_PATH)).unwrap();

        assert_eq!(manifest["name"], "generated-app");
        assert_eq!(manifest["scripts"]["start"], "npx serve . -p 3000");
        assert_eq!(manifest["dependencies"]["serve"], "^14.0.0");
        assert!(tree.get("src/package.json").is_none());
    }

    #[test]
    fn test_manifest_uses_configured_port() {
        let options = BuildOptions {
            port: 4173,
            ..Default::default()
        };
        let tree = build_with(&set(&[("a.js", "x")]), &options);
        assert!(text(&tree, MANIFEST_PATH).contains("npx serve . -p 4173"));
    }

    #[test]
    fn test_skips_errored_and_unsafe_paths() {
        let mut files = set(&[("../escape.js", "x"), ("./ok/./file.js", "y")]);
        files.insert(GeneratedFile::errored("bad.js", "boom"));
        let tree = build(&files);

        assert_eq!(text(&tree, "src/ok/file.js"), "y");
        assert!(tree.get("src/bad.js").is_none());
        assert!(tree.get("escape.js").is_none());
        let entry = text(&tree, ENTRY_MOUNT_PATH);
        assert!(entry.contains("<script"));
    }

    #[test]
    fn test_file_directory_conflict_is_deterministic() {
        let tree = build(&set(&[("lib", "file"), ("lib/a.js", "nested")]));
        assert_eq!(text(&tree, "src/lib"), "file");
        assert!(tree.get("src/lib/a.js").is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let forward = set(&[("b.css", "b"), ("a.jsx", "a"), ("x/y/z.txt", "z")]);
        let reverse = set(&[("x/y/z.txt", "z"), ("a.jsx", "a"), ("b.css", "b")]);

        assert_eq!(build(&forward), build(&forward));
        assert_eq!(build(&forward), build(&reverse));
    }
}
