//! Deterministic relationship extractor
//!
//! A cheap regex pre-pass over file content that emits import edges for
//! unambiguous syntactic patterns before any oracle call. These edges carry
//! full confidence and still flow through validation and reconciliation
//! like every other evidence row.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// An unambiguous file-to-file edge found by pattern matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicEdge {
    pub from_path: String,
    pub to_path: String,
    pub relationship_type: &'static str,
    pub line: usize,
}

fn es_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*(?:import\s+[^'"]*?from\s+|import\s+|export\s+[^'"]*?from\s+)['"]([^'"]+)['"]"#)
            .expect("es import regex")
    })
}

fn require_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require regex")
    })
}

fn python_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:from\s+([\w.]+)\s+import\s|import\s+([\w.]+))").expect("python import regex")
    })
}

/// Scan one file's content for import edges.
///
/// Only relative specifiers are resolved; package imports point outside the
/// analyzed tree and are left to the oracle scopes.
pub fn extract_imports(file_path: &str, content: &str) -> Vec<DeterministicEdge> {
    let mut edges = Vec::new();
    let extension = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;

        match extension {
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => {
                for captures in es_import_re()
                    .captures_iter(line)
                    .chain(require_re().captures_iter(line))
                {
                    let specifier = &captures[1];
                    if let Some(target) = resolve_relative(file_path, specifier, extension) {
                        edges.push(DeterministicEdge {
                            from_path: file_path.to_string(),
                            to_path: target,
                            relationship_type: "imports",
                            line: line_number,
                        });
                    }
                }
            }
            "py" => {
                if let Some(captures) = python_import_re().captures(line) {
                    let module = captures
                        .get(1)
                        .or_else(|| captures.get(2))
                        .map(|m| m.as_str())
                        .unwrap_or("");
                    if let Some(target) = resolve_python_module(file_path, module) {
                        edges.push(DeterministicEdge {
                            from_path: file_path.to_string(),
                            to_path: target,
                            relationship_type: "imports",
                            line: line_number,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    edges
}

/// Resolve `./x` / `../x` against the importing file's directory. The
/// specifier's own extension wins; otherwise the importer's is assumed.
fn resolve_relative(from_path: &str, specifier: &str, default_ext: &str) -> Option<String> {
    if !specifier.starts_with("./") && !specifier.starts_with("../") {
        return None;
    }

    let base = Path::new(from_path).parent()?;
    let mut joined = base.to_path_buf();
    for component in Path::new(specifier).components() {
        use std::path::Component;
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                joined.pop();
            }
            Component::Normal(part) => joined.push(part),
            _ => return None,
        }
    }

    let has_extension = joined.extension().is_some();
    if !has_extension {
        joined.set_extension(default_ext);
    }
    Some(joined.to_string_lossy().replace('\\', "/"))
}

/// Dotted module relative to the importing file's directory; only sibling
/// modules resolve deterministically.
fn resolve_python_module(from_path: &str, module: &str) -> Option<String> {
    if module.is_empty() || module.contains('.') {
        return None;
    }
    let base = Path::new(from_path).parent()?;
    Some(
        base.join(format!("{}.py", module))
            .to_string_lossy()
            .replace('\\', "/"),
    )
}
