//! Mount tree: the nested file/directory layout written into the sandbox

use std::collections::BTreeMap;

/// A node of the mount tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountNode {
    /// Regular file
    File {
        /// Raw file contents
        contents: Vec<u8>,
    },
    /// Directory with named children
    Directory {
        /// Children keyed by entry name
        children: BTreeMap<String, MountNode>,
    },
}

impl MountNode {
    /// Create an empty directory node
    pub fn directory() -> Self {
        MountNode::Directory {
            children: BTreeMap::new(),
        }
    }

    /// Create a file node
    pub fn file(contents: impl Into<Vec<u8>>) -> Self {
        MountNode::File {
            contents: contents.into(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, MountNode::Directory { .. })
    }

    /// Look up a node by slash-separated path relative to this node
    pub fn get(&self, path: &str) -> Option<&MountNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node {
                MountNode::Directory { children } => node = children.get(segment)?,
                MountNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    /// Contents of the file at `path`, if it is a file
    pub fn file_contents(&self, path: &str) -> Option<&[u8]> {
        match self.get(path)? {
            MountNode::File { contents } => Some(contents),
            MountNode::Directory { .. } => None,
        }
    }

    /// Flatten into `(path, contents)` pairs in depth-first, name-sorted order
    pub fn files(&self) -> Vec<(String, &[u8])> {
        let mut out = Vec::new();
        self.walk("", &mut |path, node| {
            if let MountNode::File { contents } = node {
                out.push((path.to_string(), contents.as_slice()));
            }
        });
        out
    }

    /// All directory paths below this node, parents before children
    pub fn directories(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk("", &mut |path, node| {
            if node.is_directory() && !path.is_empty() {
                out.push(path.to_string());
            }
        });
        out
    }

    fn walk<'a, F: FnMut(&str, &'a MountNode)>(&'a self, prefix: &str, visit: &mut F) {
        visit(prefix, self);
        if let MountNode::Directory { children } = self {
            for (name, child) in children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                child.walk(&path, visit);
            }
        }
    }
}

impl Default for MountNode {
    fn default() -> Self {
        MountNode::directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MountNode {
        let mut src = BTreeMap::new();
        src.insert("app.js".to_string(), MountNode::file("x"));
        src.insert("lib".to_string(), MountNode::directory());
        let mut root = BTreeMap::new();
        root.insert("src".to_string(), MountNode::Directory { children: src });
        root.insert("package.json".to_string(), MountNode::file("{}"));
        MountNode::Directory { children: root }
    }

    #[test]
    fn test_get_and_contents() {
        let tree = sample();
        assert_eq!(tree.file_contents("src/app.js"), Some(&b"x"[..]));
        assert!(tree.get("src/lib").unwrap().is_directory());
        assert!(tree.get("package.json/nope").is_none());
        assert!(tree.file_contents("src").is_none());
    }

    #[test]
    fn test_flatten_order() {
        let tree = sample();
        let files: Vec<String> = tree.files().into_iter().map(|(p, _)| p).collect();
        assert_eq!(files, vec!["package.json", "src/app.js"]);
        assert_eq!(tree.directories(), vec!["src", "src/lib"]);
    }
}
