//! Prompt store
//!
//! Prompt texts live in a YAML file grouped by category:
//!
//! ```yaml
//! version: "1"
//! generation:
//!   system_role: |
//!     You are a medical writer...
//! ```
//!
//! Keys are addressed as `category.name`. `{var}` placeholders are filled
//! from the caller's variables; `{{` and `}}` produce literal braces.

use crate::errors::{AppError, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct PromptFile {
    version: Option<String>,
    categories: BTreeMap<String, Value>,
}

/// Thread-safe, reloadable prompt registry
#[derive(Debug)]
pub struct PromptStore {
    path: Option<PathBuf>,
    inner: RwLock<PromptFile>,
}

impl PromptStore {
    /// Load prompts from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_file(&path)?;
        info!(
            path = %path.display(),
            version = file.version.as_deref().unwrap_or("unversioned"),
            categories = file.categories.len(),
            "Prompts loaded"
        );

        Ok(Self {
            path: Some(path),
            inner: RwLock::new(file),
        })
    }

    /// Build a store from YAML text (no backing file, cannot be reloaded)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(Self {
            path: None,
            inner: RwLock::new(parse_file(yaml)?),
        })
    }

    /// Re-read the backing file. The previous prompts stay active on failure.
    pub fn reload(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| AppError::Configuration {
            message: "prompt store has no backing file".to_string(),
        })?;
        let file = read_file(path)?;

        let mut guard = self.inner.write().map_err(|_| AppError::Internal {
            message: "prompt store lock poisoned".to_string(),
        })?;
        *guard = file;

        info!(path = %path.display(), "Prompts reloaded");
        Ok(())
    }

    /// Version label declared in the file
    pub fn version(&self) -> Option<String> {
        self.inner.read().ok().and_then(|f| f.version.clone())
    }

    /// Backing file path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Render `category.name` with the given variables
    pub fn get(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        let (category, name) = split_key(key)?;

        let guard = self.inner.read().map_err(|_| AppError::Internal {
            message: "prompt store lock poisoned".to_string(),
        })?;

        let prompts = guard.categories.get(category).ok_or_else(|| AppError::PromptNotFound {
            message: format!(
                "category '{}' (available: {})",
                category,
                join_keys(guard.categories.keys())
            ),
        })?;

        let names: Vec<&str> = match prompts {
            Value::Mapping(map) => map.keys().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };

        let template = match prompts.get(name) {
            Some(Value::String(template)) => template,
            Some(_) => {
                return Err(AppError::PromptNotFound {
                    message: format!("'{}' is not a string prompt", key),
                })
            }
            None => {
                return Err(AppError::PromptNotFound {
                    message: format!(
                        "'{}' in category '{}' (available: {})",
                        name,
                        category,
                        names.join(", ")
                    ),
                })
            }
        };

        render(key, template, vars)
    }
}

fn read_file(path: &Path) -> Result<PromptFile> {
    let text = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
        message: format!("Failed to read prompts from {}: {}", path.display(), e),
    })?;
    parse_file(&text)
}

fn parse_file(yaml: &str) -> Result<PromptFile> {
    let root: BTreeMap<String, Value> =
        serde_yaml::from_str(yaml).map_err(|e| AppError::Configuration {
            message: format!("Invalid prompts file: {}", e),
        })?;

    let mut file = PromptFile::default();
    for (key, value) in root {
        if key == "version" {
            file.version = match value {
                Value::String(v) => Some(v),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
        } else {
            file.categories.insert(key, value);
        }
    }
    Ok(file)
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('.') {
        Some((category, name)) if !category.is_empty() && !name.is_empty() && !name.contains('.') => {
            Ok((category, name))
        }
        _ => Err(AppError::PromptKeyFormat { key: key.to_string() }),
    }
}

fn join_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    keys.map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Substitute `{var}` placeholders; anything in braces that is not an
/// identifier is kept as written
fn render(key: &str, template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if let Some(name) = tail
            .strip_prefix('{')
            .and_then(|t| t.find('}').map(|end| &t[..end]))
            .filter(|name| is_identifier(name))
        {
            let value = vars
                .iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| *value)
                .ok_or_else(|| AppError::PromptVariableMissing {
                    key: key.to_string(),
                    variable: name.to_string(),
                })?;
            out.push_str(value);
            rest = &tail[name.len() + 2..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: "2"
generation:
  greeting: "Hello {name}, write {title}."
  json_hint: "Return {{\"Phase\": \"...\"}} only."
placeholders:
  manual_input: "<h1>{title}</h1>"
"#;

    #[test]
    fn test_render_variables() {
        let store = PromptStore::from_yaml_str(YAML).unwrap();
        let text = store
            .get("generation.greeting", &[("name", "Ana"), ("title", "Synopsis")])
            .unwrap();
        assert_eq!(text, "Hello Ana, write Synopsis.");
        assert_eq!(store.version().as_deref(), Some("2"));
    }

    #[test]
    fn test_escaped_braces() {
        let store = PromptStore::from_yaml_str(YAML).unwrap();
        let text = store.get("generation.json_hint", &[]).unwrap();
        assert_eq!(text, r#"Return {"Phase": "..."} only."#);
    }

    #[test]
    fn test_key_errors_are_distinct() {
        let store = PromptStore::from_yaml_str(YAML).unwrap();

        assert!(matches!(
            store.get("nodot", &[]),
            Err(AppError::PromptKeyFormat { .. })
        ));
        assert!(matches!(
            store.get("a.b.c", &[]),
            Err(AppError::PromptKeyFormat { .. })
        ));

        match store.get("generation.missing", &[]) {
            Err(AppError::PromptNotFound { message }) => {
                assert!(message.contains("greeting"));
                assert!(message.contains("json_hint"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            store.get("generation.greeting", &[("name", "Ana")]),
            Err(AppError::PromptVariableMissing { variable, .. }) if variable == "title"
        ));
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.yaml");
        std::fs::write(&path, "placeholders:\n  manual_input: \"v1 {title}\"\n").unwrap();

        let store = PromptStore::load(&path).unwrap();
        assert_eq!(
            store.get("placeholders.manual_input", &[("title", "A")]).unwrap(),
            "v1 A"
        );

        std::fs::write(&path, "placeholders:\n  manual_input: \"v2 {title}\"\n").unwrap();
        store.reload().unwrap();
        assert_eq!(
            store.get("placeholders.manual_input", &[("title", "A")]).unwrap(),
            "v2 A"
        );

        std::fs::write(&path, ": not yaml : [").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(
            store.get("placeholders.manual_input", &[("title", "A")]).unwrap(),
            "v2 A"
        );
    }

    #[test]
    fn test_shipped_prompts_have_required_keys() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../prompts.yaml");
        let store = PromptStore::load(path).unwrap();
        for key in [
            "generation.system_role",
            "generation.default_instruction",
            "extraction.system",
            "placeholders.no_globals",
        ] {
            assert!(store.get(key, &[]).is_ok(), "{}", key);
        }
        assert!(store
            .get(
                "generation.section_generation",
                &[
                    ("section_title", "t"),
                    ("globals", "g"),
                    ("instructions", "i"),
                    ("source_content", "s")
                ]
            )
            .is_ok());
        assert!(store.get("extraction.user", &[("content", "c")]).is_ok());
        assert!(store.get("placeholders.manual_input", &[("title", "t")]).is_ok());
        assert!(store.get("placeholders.no_source", &[("title", "t")]).is_ok());
    }
}
