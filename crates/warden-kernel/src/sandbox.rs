//! [`Sandbox`] – confines agent file paths.
//!
//! Path-shaped arguments are not validated, they are replaced: the agent's
//! directory components are discarded and only the final name is kept,
//! placed under the managed output directory.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::info;
use warden_types::ToolCall;

/// Argument keys treated as file paths.
pub const PATH_KEYS: [&str; 8] = [
    "path",
    "file_path",
    "filepath",
    "filename",
    "outputPath",
    "output_path",
    "savePath",
    "save_path",
];

/// Name used when the supplied path has no usable final component.
const FALLBACK_NAME: &str = "unnamed";

#[derive(Debug, Clone)]
pub struct Sandbox {
    output_dir: PathBuf,
    readable_paths: Vec<String>,
    working_dir: PathBuf,
}

impl Sandbox {
    /// Create a sandbox writing under `output_dir`, resolving relative paths
    /// against the process working directory.
    pub fn new(output_dir: impl Into<PathBuf>, readable_paths: Vec<String>) -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_working_dir(output_dir, readable_paths, working_dir)
    }

    /// Like [`Sandbox::new`] with an explicit working directory.
    pub fn with_working_dir(
        output_dir: impl Into<PathBuf>,
        readable_paths: Vec<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = normalize(&working_dir.into());
        let output_dir = output_dir.into();
        let output_dir = if output_dir.is_absolute() {
            normalize(&output_dir)
        } else {
            normalize(&working_dir.join(output_dir))
        };
        Self {
            output_dir,
            readable_paths,
            working_dir,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<output_dir>/<basename of raw>`.
    pub fn rewrite_path(&self, raw: &str) -> PathBuf {
        let name = raw
            .trim()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        let name = match name {
            "" | "." | ".." => FALLBACK_NAME,
            other => other,
        };
        self.output_dir.join(name)
    }

    /// Rewrite every string-valued path argument of `call`.
    pub fn sandbox_call(&self, call: &ToolCall) -> ToolCall {
        let mut rewritten = call.clone();
        for key in PATH_KEYS {
            let Some(Value::String(raw)) = rewritten.args.get(key) else {
                continue;
            };
            let target = self.rewrite_path(raw).to_string_lossy().into_owned();
            if *raw != target {
                info!(tool = %call.tool, key, from = %raw, to = %target, "sandboxed path argument");
            }
            rewritten.args.insert(key.to_string(), Value::String(target));
        }
        rewritten
    }

    /// Whether `raw` falls inside one of the readable path entries.
    ///
    /// `"."` stands for the working directory and `"output"` for the output
    /// directory; other entries are resolved like any relative path.
    pub fn is_path_readable(&self, raw: &str) -> bool {
        let target = self.resolve(raw.trim());
        self.readable_paths.iter().any(|entry| {
            let base = match entry.trim().trim_end_matches('/') {
                "" | "." => self.working_dir.clone(),
                "output" => self.output_dir.clone(),
                other => self.resolve(other),
            };
            target.starts_with(&base)
        })
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.working_dir.join(path))
        }
    }
}

/// First string-valued path argument of `call`, if any.
pub fn path_argument(call: &ToolCall) -> Option<&str> {
    PATH_KEYS.iter().find_map(|key| call.str_arg(key))
}

/// Lexically collapse `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
