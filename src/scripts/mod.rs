//! Analysis script registry.
//!
//! Scripts are drgn Python files discovered from the configured directories,
//! first directory wins on a name clash. Metadata is read from YAML
//! frontmatter at the top of the module docstring:
//!
//! ```text
//! """
//! ---
//! description: Walk a kernel linked list
//! category: inspection
//! params:
//!   head:
//!     type: str
//!     desc: Address or symbol of the list head
//!     required: true
//! ---
//! """
//! ```
//!
//! Files without frontmatter are still registered, described by the first
//! docstring line. Running a script prepends one assignment per parameter
//! and sends the result to drgn like any other command, so script output is
//! cached and paginated through the session's store.

mod report;

pub use report::{parse_report, CrashReport, ReportRunner, MIN_REPORT_TIMEOUT, REPORT_COMMAND, REPORT_TAG};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// One declared script parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub required: bool,
}

/// A discovered script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptInfo {
    pub name: String,
    pub description: String,
    pub category: String,
    pub params: BTreeMap<String, ParamSpec>,
    #[serde(skip)]
    pub file: PathBuf,
    #[serde(skip)]
    source: String,
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    params: Option<BTreeMap<String, RawParam>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParam {
    Detailed {
        #[serde(rename = "type", default = "default_kind")]
        kind: String,
        #[serde(default, alias = "description")]
        desc: String,
        #[serde(default)]
        required: bool,
    },
    Brief(String),
}

fn default_kind() -> String {
    "str".to_string()
}

impl From<RawParam> for ParamSpec {
    fn from(raw: RawParam) -> Self {
        match raw {
            RawParam::Detailed {
                kind,
                desc,
                required,
            } => Self {
                kind,
                description: desc,
                required,
            },
            RawParam::Brief(desc) => Self {
                kind: default_kind(),
                description: desc,
                required: false,
            },
        }
    }
}

/// Name to script map, built once at startup.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, ScriptInfo>,
}

impl ScriptRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan `dirs` for `*.py` scripts. Unreadable directories and files are
    /// skipped with a warning.
    pub fn discover(dirs: &[PathBuf]) -> Self {
        let patterns = Patterns::new();
        let mut scripts = BTreeMap::new();

        for dir in dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cannot read script directory");
                    continue;
                }
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_script_file(path))
                .collect();
            files.sort();

            for path in files {
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                    continue;
                };
                if scripts.contains_key(&name) {
                    debug!(script = %name, file = %path.display(), "Shadowed by an earlier directory");
                    continue;
                }
                match std::fs::read_to_string(&path) {
                    Ok(source) => {
                        let script = patterns.describe(name.clone(), path, source);
                        scripts.insert(name, script);
                    }
                    Err(e) => warn!(file = %path.display(), error = %e, "Cannot read script"),
                }
            }
        }

        info!(count = scripts.len(), "Discovered analysis scripts");
        Self { scripts }
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&ScriptInfo> {
        self.scripts
            .get(name)
            .ok_or_else(|| RelayError::ScriptNotFound(name.to_string()))
    }

    /// Scripts sorted by name, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<&ScriptInfo> {
        self.scripts
            .values()
            .filter(|s| category.map_or(true, |c| s.category == c))
            .collect()
    }

    /// Source of `name` with `params` injected as leading assignments.
    pub fn build(&self, name: &str, params: &Map<String, Value>) -> Result<String> {
        let script = self.get(name)?;

        for (param, spec) in &script.params {
            if spec.required && !params.contains_key(param) {
                return Err(RelayError::InvalidArgument(format!(
                    "missing required parameter '{}' for {} ({})",
                    param, name, spec.description
                )));
            }
        }

        let mut assignments = Vec::with_capacity(params.len());
        for (key, value) in params {
            if !is_identifier(key) {
                return Err(RelayError::InvalidArgument(format!(
                    "parameter name '{}' is not a Python identifier",
                    key
                )));
            }
            assignments.push(format!("{} = {}", key, py_literal(value)));
        }

        if assignments.is_empty() {
            return Ok(script.source.clone());
        }
        Ok(format!("{}\n\n{}", assignments.join("\n"), script.source))
    }
}

fn is_script_file(path: &Path) -> bool {
    let is_py = path.extension().is_some_and(|ext| ext == "py");
    let private = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('_'));
    is_py && !private && path.is_file()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Render a JSON value as a Python literal.
fn py_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => py_string(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(py_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", py_string(k), py_literal(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

fn py_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Category guessed from the script name when frontmatter has none.
fn categorize(name: &str) -> &'static str {
    match name {
        n if n.starts_with("lock_") => "lock",
        n if n.starts_with("net_") => "network",
        "memory" | "slab_dump" | "leak_scan" => "memory",
        "stack_trace" | "panic_info" | "hung_task" | "task_list" | "cpu_irq_stack" => "analysis",
        "struct_inspect" | "address_detect" | "list_traversal" | "rbtree_traversal" => "inspection",
        _ => "utility",
    }
}

struct Patterns {
    frontmatter: Option<Regex>,
    docstring: Option<Regex>,
}

impl Patterns {
    fn new() -> Self {
        Self {
            frontmatter: Regex::new(
                r#"(?s)\A(?:#![^\n]*\n)?(?:"""|''')[ \t]*\r?\n---[ \t]*\r?\n(.*?)\r?\n---[ \t]*\r?\n"#,
            )
            .ok(),
            docstring: Regex::new(r#"(?s)\A(?:#![^\n]*\n)?\s*(?:"""|''')(.*?)(?:"""|''')"#).ok(),
        }
    }

    fn describe(&self, name: String, file: PathBuf, source: String) -> ScriptInfo {
        if let Some(front) = self.frontmatter(&source, &file) {
            let category = front
                .category
                .unwrap_or_else(|| categorize(&name).to_string());
            let params = front
                .params
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, ParamSpec::from(v)))
                .collect();
            return ScriptInfo {
                category,
                description: front.description.unwrap_or_default(),
                params,
                name,
                file,
                source,
            };
        }

        ScriptInfo {
            description: self
                .first_doc_line(&source)
                .unwrap_or_else(|| "(No description)".to_string()),
            category: categorize(&name).to_string(),
            params: BTreeMap::new(),
            name,
            file,
            source,
        }
    }

    fn frontmatter(&self, source: &str, file: &Path) -> Option<Frontmatter> {
        let yaml = self.frontmatter.as_ref()?.captures(source)?.get(1)?.as_str();
        match serde_yaml::from_str::<Frontmatter>(yaml) {
            Ok(front) => Some(front),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Bad script frontmatter");
                None
            }
        }
    }

    fn first_doc_line(&self, source: &str) -> Option<String> {
        let doc = self.docstring.as_ref()?.captures(source)?.get(1)?.as_str();
        let lines: Vec<&str> = doc.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let body = match lines.first() {
            Some(&"---") => match lines.iter().skip(1).position(|l| *l == "---") {
                Some(end) => &lines[end + 2..],
                None => &lines[..],
            },
            _ => &lines[..],
        };
        body.first().map(|l| l.to_string())
    }
}
