//! Bundler adapter and entry synthesis.
//!
//! The concrete bundler is an external collaborator: it receives a
//! synthesized entry (imports for the setup file and every test file,
//! then the init event carrying the session UUID) plus any named extra
//! entry points, and produces the artifact map the bundle server serves.
//! [`PassthroughBundler`] is the built-in minimal implementation: it ships
//! plain ES modules untouched, which is enough for projects that need no
//! transformation.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Server path of the synthesized entry module.
pub const ENTRY_PATH: &str = "/__entry__.js";

/// What a build consumes.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub session_uuid: String,
    pub cwd: PathBuf,
    pub setup: Option<PathBuf>,
    pub tests: Vec<PathBuf>,
    /// Extra named entry points (`name=path` on the CLI).
    pub entry_points: IndexMap<String, PathBuf>,
}

/// One built artifact.
#[derive(Debug, Clone)]
pub struct BuiltFile {
    pub hash: String,
    pub content: Vec<u8>,
}

impl BuiltFile {
    pub fn new(content: Vec<u8>) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.hash(&mut hasher);
        Self {
            hash: format!("{:016x}", hasher.finish()),
            content,
        }
    }
}

/// What a build produces: server path to artifact.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub files: HashMap<String, BuiltFile>,
}

impl BuildOutput {
    /// Whether this output differs from a previous successful one.
    pub fn changed_from(&self, previous: &BuildOutput) -> bool {
        if self.files.len() != previous.files.len() {
            return true;
        }
        self.files.iter().any(|(path, file)| {
            previous
                .files
                .get(path)
                .map_or(true, |old| old.hash != file.hash)
        })
    }
}

/// The bundler seam.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput>;
}

/// Maps a file under `cwd` to its server path.
pub fn server_path(cwd: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(cwd).unwrap_or(file);
    let mut out = String::from("/");
    let parts: Vec<_> = relative
        .components()
        .filter_map(|component| component.as_os_str().to_str())
        .collect();
    out.push_str(&parts.join("/"));
    out
}

/// Synthesizes the entry module: setup import first, then every test file,
/// then the init event carrying the session UUID.
pub fn synthesize_entry(request: &BuildRequest) -> String {
    let mut out = String::new();
    if let Some(setup) = &request.setup {
        out.push_str(&format!(
            "import '{}';\n",
            server_path(&request.cwd, setup)
        ));
    }
    for test in &request.tests {
        out.push_str(&format!(
            "import '{}';\n",
            server_path(&request.cwd, test)
        ));
    }
    out.push_str(&format!(
        "const sessionId = \"{}\";\n",
        request.session_uuid
    ));
    out.push_str(
        "dispatchEvent(new CustomEvent('init', { detail: { sessionId } }));\n",
    );
    out
}

/// The HTML shell that loads the entry.
fn index_html() -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>wrightplay</title>\n</head>\n<body>\n\
         <script type=\"module\" src=\"{ENTRY_PATH}\"></script>\n\
         </body>\n</html>\n"
    )
}

/// Ships plain ES modules as-is: user files are copied verbatim to their
/// server paths and the synthesized entry imports them by absolute path.
pub struct PassthroughBundler;

#[async_trait]
impl Bundler for PassthroughBundler {
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput> {
        let mut files = HashMap::new();

        let mut inputs: Vec<(&Path, String)> = Vec::new();
        if let Some(setup) = &request.setup {
            inputs.push((setup, server_path(&request.cwd, setup)));
        }
        for test in &request.tests {
            inputs.push((test, server_path(&request.cwd, test)));
        }
        for (name, path) in &request.entry_points {
            inputs.push((path, format!("/{name}.js")));
        }

        for (path, target) in inputs {
            let content = tokio::fs::read(path).await.map_err(|err| {
                Error::Bundler(format!("cannot read {}: {err}", path.display()))
            })?;
            files.insert(target, BuiltFile::new(content));
        }

        files.insert(
            ENTRY_PATH.to_owned(),
            BuiltFile::new(synthesize_entry(request).into_bytes()),
        );
        files.insert(
            "/index.html".to_owned(),
            BuiltFile::new(index_html().into_bytes()),
        );

        Ok(BuildOutput { files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cwd: &Path) -> BuildRequest {
        BuildRequest {
            session_uuid: "u-u-i-d".into(),
            cwd: cwd.to_owned(),
            setup: Some(cwd.join("setup.js")),
            tests: vec![cwd.join("tests/a.test.js"), cwd.join("tests/b.test.js")],
            entry_points: IndexMap::new(),
        }
    }

    #[test]
    fn entry_imports_setup_then_tests_then_dispatches_init() {
        let entry = synthesize_entry(&request(Path::new("/proj")));
        let setup = entry.find("import '/setup.js';").unwrap();
        let a = entry.find("import '/tests/a.test.js';").unwrap();
        let b = entry.find("import '/tests/b.test.js';").unwrap();
        let init = entry.find("dispatchEvent(new CustomEvent('init'").unwrap();
        assert!(setup < a && a < b && b < init);
        assert!(entry.contains("const sessionId = \"u-u-i-d\";"));
    }

    #[test]
    fn server_paths_are_cwd_relative() {
        assert_eq!(
            server_path(Path::new("/proj"), Path::new("/proj/tests/a.js")),
            "/tests/a.js"
        );
    }

    #[tokio::test]
    async fn passthrough_build_copies_inputs_and_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setup.js"), "export {};").unwrap();
        std::fs::create_dir(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("tests/a.test.js"), "// a").unwrap();
        std::fs::write(dir.path().join("tests/b.test.js"), "// b").unwrap();

        let request = request(dir.path());
        let first = PassthroughBundler.build(&request).await.unwrap();
        assert!(first.files.contains_key(ENTRY_PATH));
        assert!(first.files.contains_key("/index.html"));
        assert!(first.files.contains_key("/tests/a.test.js"));

        let second = PassthroughBundler.build(&request).await.unwrap();
        assert!(!second.changed_from(&first));

        std::fs::write(dir.path().join("tests/a.test.js"), "// changed").unwrap();
        let third = PassthroughBundler.build(&request).await.unwrap();
        assert!(third.changed_from(&first));
    }

    #[tokio::test]
    async fn missing_inputs_are_bundle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let request = BuildRequest {
            session_uuid: "x".into(),
            cwd: dir.path().to_owned(),
            setup: None,
            tests: vec![dir.path().join("gone.test.js")],
            entry_points: IndexMap::new(),
        };
        assert!(matches!(
            PassthroughBundler.build(&request).await,
            Err(Error::Bundler(_))
        ));
    }
}
