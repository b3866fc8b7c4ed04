//! Isolated manifest parsing and validation
//!
//! A manifest is a JSON document stored under its own digest:
//!
//! ```json
//! {
//!   "command": ["python", "run_test.py"],
//!   "files": {
//!     "run_test.py": "<digest>",
//!     "bin/tool": {"h": "<digest>", "s": 1024, "m": 493}
//!   },
//!   "includes": ["<digest>"],
//!   "relative_cwd": "bin"
//! }
//! ```
//!
//! Documents may include other documents. The merged view is built by
//! walking the root first, then each include depth-first in declaration
//! order. The first definition of a path, the command or the working
//! directory wins.
//!
//! Every path is validated here, before any file is fetched, so nothing in a
//! manifest can name a location outside the sandbox root.

use crate::digest::Digest;
use crate::error::{IsolateError, IsolateResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    files: BTreeMap<String, RawFile>,
    #[serde(default)]
    includes: Vec<Digest>,
    #[serde(default)]
    relative_cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFile {
    Digest(Digest),
    Detailed {
        h: Digest,
        #[serde(default)]
        s: Option<u64>,
        #[serde(default)]
        m: Option<u32>,
    },
}

/// Relative path that stays inside the sandbox root
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxPath(PathBuf);

impl SandboxPath {
    /// Validate a manifest path.
    ///
    /// `.` segments are dropped. Absolute paths, drive prefixes, `..`
    /// segments and paths naming the root itself are rejected.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut normalized = PathBuf::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(format!("path '{}' escapes the sandbox", raw));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("path '{}' is not relative", raw));
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(format!("path '{}' names the sandbox root", raw));
        }
        Ok(Self(normalized))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Location of this path under `root`
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for SandboxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One file to materialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub digest: Digest,
    /// Expected size in bytes, verified during fetch when present
    pub size: Option<u64>,
    /// POSIX mode bits as recorded by the producer
    pub mode: Option<u32>,
}

impl FileEntry {
    pub fn is_executable(&self) -> bool {
        self.mode.is_some_and(|mode| mode & 0o111 != 0)
    }
}

impl From<RawFile> for FileEntry {
    fn from(raw: RawFile) -> Self {
        match raw {
            RawFile::Digest(digest) => Self {
                digest,
                size: None,
                mode: None,
            },
            RawFile::Detailed { h, s, m } => Self {
                digest: h,
                size: s,
                mode: m,
            },
        }
    }
}

/// A single parsed manifest document, before includes are merged
#[derive(Debug, Clone, Default)]
pub struct ManifestDocument {
    pub command: Option<Vec<String>>,
    pub files: BTreeMap<SandboxPath, FileEntry>,
    pub includes: Vec<Digest>,
    pub relative_cwd: Option<SandboxPath>,
}

impl ManifestDocument {
    /// Parse and validate the document stored under `digest`
    pub fn parse(digest: &Digest, bytes: &[u8]) -> IsolateResult<Self> {
        let raw: RawDocument = serde_json::from_slice(bytes)
            .map_err(|e| IsolateError::manifest(digest, e.to_string()))?;

        let mut files = BTreeMap::new();
        for (path, file) in raw.files {
            let path = SandboxPath::parse(&path).map_err(|r| IsolateError::manifest(digest, r))?;
            if files.insert(path.clone(), FileEntry::from(file)).is_some() {
                return Err(IsolateError::manifest(
                    digest,
                    format!("path '{}' is listed twice", path),
                ));
            }
        }

        let relative_cwd = match raw.relative_cwd.as_deref() {
            None | Some("") | Some(".") => None,
            Some(cwd) => {
                Some(SandboxPath::parse(cwd).map_err(|r| IsolateError::manifest(digest, r))?)
            }
        };

        Ok(Self {
            command: raw.command,
            files,
            includes: raw.includes,
            relative_cwd,
        })
    }
}

/// Fully merged, validated manifest ready for building
#[derive(Debug, Clone)]
pub struct Manifest {
    pub digest: Digest,
    pub command: Vec<String>,
    pub files: BTreeMap<SandboxPath, FileEntry>,
    pub relative_cwd: Option<SandboxPath>,
}

impl Manifest {
    /// Merge `root` with everything it includes.
    ///
    /// `documents` must hold every document reachable from `root`. An include
    /// seen a second time, including through a cycle, is skipped.
    pub fn resolve(
        root: &Digest,
        documents: &HashMap<Digest, ManifestDocument>,
    ) -> IsolateResult<Self> {
        let mut command: Option<Vec<String>> = None;
        let mut relative_cwd: Option<SandboxPath> = None;
        let mut files: BTreeMap<SandboxPath, FileEntry> = BTreeMap::new();

        for digest in merge_order(root, documents)? {
            let document = &documents[&digest];
            if command.is_none() {
                command = document.command.clone();
            }
            if relative_cwd.is_none() {
                relative_cwd = document.relative_cwd.clone();
            }
            for (path, entry) in &document.files {
                files.entry(path.clone()).or_insert_with(|| entry.clone());
            }
        }

        let command = match command {
            Some(command) if command.first().is_some_and(|c| !c.is_empty()) => command,
            Some(_) => return Err(IsolateError::manifest(root, "'command' is empty")),
            None => return Err(IsolateError::manifest(root, "'command' is missing")),
        };

        check_collisions(root, &files, relative_cwd.as_ref())?;

        Ok(Self {
            digest: root.clone(),
            command,
            files,
            relative_cwd,
        })
    }

    /// Distinct file digests with their expected size, in path order
    pub fn unique_digests(&self) -> Vec<(Digest, Option<u64>)> {
        let mut seen = HashSet::new();
        self.files
            .values()
            .filter(|entry| seen.insert(entry.digest.clone()))
            .map(|entry| (entry.digest.clone(), entry.size))
            .collect()
    }
}

/// Root first, then includes depth-first in declaration order
fn merge_order(
    root: &Digest,
    documents: &HashMap<Digest, ManifestDocument>,
) -> IsolateResult<Vec<Digest>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root.clone()];

    while let Some(digest) = stack.pop() {
        if !visited.insert(digest.clone()) {
            continue;
        }
        let document = documents.get(&digest).ok_or_else(|| {
            IsolateError::manifest(root, format!("include {} was not loaded", digest.short()))
        })?;
        stack.extend(document.includes.iter().rev().cloned());
        order.push(digest);
    }

    Ok(order)
}

/// A path can't be both a file and the parent directory of something else
fn check_collisions(
    root: &Digest,
    files: &BTreeMap<SandboxPath, FileEntry>,
    relative_cwd: Option<&SandboxPath>,
) -> IsolateResult<()> {
    let file_paths: HashSet<&Path> = files.keys().map(SandboxPath::as_path).collect();
    let directories = files
        .keys()
        .map(|p| (p, p.as_path().parent()))
        .chain(relative_cwd.map(|cwd| (cwd, Some(cwd.as_path()))));

    for (path, mut ancestor) in directories {
        while let Some(dir) = ancestor.filter(|d| !d.as_os_str().is_empty()) {
            if file_paths.contains(dir) {
                return Err(IsolateError::manifest(
                    root,
                    format!("'{}' is a file but '{}' needs it as a directory", dir.display(), path),
                ));
            }
            ancestor = dir.parent();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn digest(content: &str) -> Digest {
        Digest::of(content.as_bytes())
    }

    fn document(value: serde_json::Value) -> (Digest, ManifestDocument) {
        let bytes = serde_json::to_vec(&value).unwrap();
        let id = Digest::of(&bytes);
        let document = ManifestDocument::parse(&id, &bytes).unwrap();
        (id, document)
    }

    /// Parse and resolve a document that includes nothing
    fn parse_single(id: &Digest, bytes: &[u8]) -> IsolateResult<Manifest> {
        let document = ManifestDocument::parse(id, bytes)?;
        Manifest::resolve(id, &HashMap::from([(id.clone(), document)]))
    }

    fn reason(err: IsolateError) -> String {
        match err {
            IsolateError::Manifest { reason, .. } => reason,
            other => panic!("expected manifest error, got {other:?}"),
        }
    }

    #[test]
    fn sandbox_paths() {
        assert_eq!(
            SandboxPath::parse("./a/./b.txt").unwrap().as_path(),
            Path::new("a/b.txt")
        );
        assert!(SandboxPath::parse("../escape").is_err());
        assert!(SandboxPath::parse("a/../../escape").is_err());
        assert!(SandboxPath::parse("/etc/passwd").is_err());
        assert!(SandboxPath::parse("").is_err());
        assert!(SandboxPath::parse(".").is_err());
    }

    #[test]
    fn parses_both_file_forms() {
        let text = json!({
            "command": ["./tool", "--flag"],
            "files": {
                "data.txt": digest("data"),
                "tool": {"h": digest("tool"), "s": 4, "m": 0o755},
            },
            "version": "1.4",
        });
        let id = digest("manifest");
        let manifest = parse_single(&id, text.to_string().as_bytes()).unwrap();

        assert_eq!(manifest.command, vec!["./tool", "--flag"]);
        let tool = &manifest.files[&SandboxPath::parse("tool").unwrap()];
        assert_eq!(tool.size, Some(4));
        assert!(tool.is_executable());
        assert!(!manifest.files[&SandboxPath::parse("data.txt").unwrap()].is_executable());
    }

    #[test]
    fn rejects_traversal() {
        let text = json!({"command": ["true"], "files": {"../outside": digest("x")}});
        let err = parse_single(&digest("m"), text.to_string().as_bytes()).unwrap_err();
        assert!(reason(err).contains("escapes"));
    }

    #[test]
    fn rejects_missing_or_empty_command() {
        let id = digest("m");
        let missing = parse_single(&id, br#"{"files": {}}"#).unwrap_err();
        assert!(reason(missing).contains("missing"));
        let empty = parse_single(&id, br#"{"command": []}"#).unwrap_err();
        assert!(reason(empty).contains("empty"));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_single(&digest("m"), b"{not json").unwrap_err();
        assert!(matches!(err, IsolateError::Manifest { .. }));
    }

    #[test]
    fn rejects_file_used_as_directory() {
        let text = json!({
            "command": ["true"],
            "files": {"a": digest("1"), "a/b": digest("2")},
        });
        let err = parse_single(&digest("m"), text.to_string().as_bytes()).unwrap_err();
        assert!(reason(err).contains("needs it as a directory"));
    }

    #[test]
    fn includes_merge_depth_first_and_first_wins() {
        let (leaf, leaf_doc) = document(json!({
            "files": {"shared.txt": digest("leaf"), "leaf.txt": digest("leaf")},
            "relative_cwd": "leaf",
        }));
        let (middle, middle_doc) = document(json!({
            "command": ["middle"],
            "files": {"shared.txt": digest("middle")},
            "includes": [leaf],
        }));
        let (sibling, sibling_doc) = document(json!({
            "files": {"shared.txt": digest("sibling"), "sibling.txt": digest("sibling")},
            "relative_cwd": "sibling",
        }));
        let (root, root_doc) = document(json!({
            "files": {"root.txt": digest("root")},
            "includes": [middle, sibling],
        }));

        let documents = HashMap::from([
            (leaf, leaf_doc),
            (middle, middle_doc),
            (sibling, sibling_doc),
            (root.clone(), root_doc),
        ]);
        let manifest = Manifest::resolve(&root, &documents).unwrap();

        assert_eq!(manifest.command, vec!["middle"]);
        // The leaf include is visited before the root's second include.
        assert_eq!(manifest.relative_cwd, Some(SandboxPath::parse("leaf").unwrap()));
        assert_eq!(
            manifest.files[&SandboxPath::parse("shared.txt").unwrap()].digest,
            digest("middle")
        );
        assert_eq!(manifest.files.len(), 4);
    }

    #[test]
    fn include_cycles_terminate() {
        let a = digest("a");
        let b = digest("b");
        let documents = HashMap::from([
            (
                a.clone(),
                ManifestDocument {
                    command: Some(vec!["true".into()]),
                    includes: vec![b.clone()],
                    ..Default::default()
                },
            ),
            (
                b.clone(),
                ManifestDocument {
                    includes: vec![a.clone()],
                    ..Default::default()
                },
            ),
        ]);
        assert!(Manifest::resolve(&a, &documents).is_ok());
    }

    #[test]
    fn unique_digests_deduplicate() {
        let same = digest("same");
        let text = json!({
            "command": ["true"],
            "files": {"a": same, "b": same, "c": {"h": digest("other"), "s": 5}},
        });
        let manifest = parse_single(&digest("m"), text.to_string().as_bytes()).unwrap();
        let digests = manifest.unique_digests();
        assert_eq!(digests.len(), 2);
        assert!(digests.contains(&(digest("other"), Some(5))));
    }
}
