//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::LanguageError;
use crate::materializer::NamingRule;

const SOURCE_PLACEHOLDER: &str = "{source}";
const STEM_PLACEHOLDER: &str = "{stem}";
const DEFAULT_ENTRY_POINT: &str = "Main";

/// Argument vector with `{source}` / `{stem}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    parts: Vec<String>,
}

impl CommandTemplate {
    fn parse(language: &str, command: &str) -> Result<Self, LanguageError> {
        let parts = into_command(command);
        if parts.is_empty() {
            return Err(LanguageError::Invalid {
                language: language.to_string(),
                reason: "empty command template".into(),
            });
        }

        for part in &parts {
            let stripped = part
                .replace(SOURCE_PLACEHOLDER, "")
                .replace(STEM_PLACEHOLDER, "");
            if stripped.contains('{') || stripped.contains('}') {
                return Err(LanguageError::Invalid {
                    language: language.to_string(),
                    reason: format!("unknown placeholder in {:?}", part),
                });
            }
        }

        Ok(Self { parts })
    }

    /// Render the argv for an artifact file name
    pub fn render(&self, source_file: &str) -> Vec<String> {
        let stem = source_file
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(source_file);

        self.parts
            .iter()
            .map(|part| {
                part.replace(SOURCE_PLACEHOLDER, source_file)
                    .replace(STEM_PLACEHOLDER, stem)
            })
            .collect()
    }
}

/// How a language turns an artifact into a running program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    Interpreted {
        run: CommandTemplate,
    },
    Compiled {
        compile: CommandTemplate,
        run: CommandTemplate,
    },
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub id: String,
    pub display_name: String,
    /// Extension including the leading dot (e.g. ".py")
    pub file_extension: String,
    pub naming: NamingRule,
    pub toolchain: Toolchain,
}

impl LanguageSpec {
    pub fn requires_compilation(&self) -> bool {
        matches!(self.toolchain, Toolchain::Compiled { .. })
    }

    pub fn compile_template(&self) -> Option<&CommandTemplate> {
        match &self.toolchain {
            Toolchain::Interpreted { .. } => None,
            Toolchain::Compiled { compile, .. } => Some(compile),
        }
    }

    pub fn run_template(&self) -> &CommandTemplate {
        match &self.toolchain {
            Toolchain::Interpreted { run } | Toolchain::Compiled { run, .. } => run,
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    name: String,
    extension: String,
    compile: Option<String>,
    run: String,
    #[serde(default)]
    naming: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Read-only table of supported languages.
///
/// Built once at start-up and shared behind an `Arc`; lookups need no locking.
#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, Arc<LanguageSpec>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Registry built from the table shipped with the crate
    pub fn builtin() -> Result<Self, LanguageError> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LanguageError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| LanguageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LanguageError> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, mut raw) in raw_configs {
            let id = name.to_lowercase();
            let aliases = std::mem::take(&mut raw.aliases);
            let spec = build_spec(&id, raw)?;

            for alias in &aliases {
                let alias = alias.to_lowercase();
                if alias == id {
                    continue;
                }
                if let Some(owner) = registry.aliases.insert(alias.clone(), id.clone()) {
                    return Err(LanguageError::Invalid {
                        language: id,
                        reason: format!("alias {:?} already used by {}", alias, owner),
                    });
                }
            }

            if registry.languages.insert(id.clone(), Arc::new(spec)).is_some() {
                return Err(LanguageError::Invalid {
                    language: id,
                    reason: "declared twice".into(),
                });
            }
        }

        if let Some((alias, owner)) = registry
            .aliases
            .iter()
            .find(|(alias, _)| registry.languages.contains_key(*alias))
        {
            return Err(LanguageError::Invalid {
                language: owner.clone(),
                reason: format!("alias {:?} shadows a language id", alias),
            });
        }

        Ok(registry)
    }

    /// Case-insensitive lookup by id or alias
    pub fn lookup(&self, language: &str) -> Option<Arc<LanguageSpec>> {
        let key = language.trim().to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.languages.get(id).cloned()
    }

    pub fn requires_compilation(&self, language: &str) -> bool {
        self.lookup(language)
            .map(|spec| spec.requires_compilation())
            .unwrap_or(false)
    }

    /// Canonical language ids, sorted
    pub fn supported_languages(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.languages.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn build_spec(id: &str, raw: RawLanguageConfig) -> Result<LanguageSpec, LanguageError> {
    if !raw.extension.starts_with('.') || raw.extension.len() < 2 {
        return Err(LanguageError::Invalid {
            language: id.to_string(),
            reason: format!("extension must look like \".ext\", got {:?}", raw.extension),
        });
    }

    let naming = match raw.naming.as_deref() {
        None | Some("random") => NamingRule::Random,
        Some("public-type") => NamingRule::PublicType {
            default_name: raw
                .entry_point
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
        },
        Some(other) => {
            return Err(LanguageError::Invalid {
                language: id.to_string(),
                reason: format!("unknown naming rule {:?}", other),
            })
        }
    };

    let run = CommandTemplate::parse(id, &raw.run)?;
    let toolchain = match raw.compile {
        Some(compile) => Toolchain::Compiled {
            compile: CommandTemplate::parse(id, &compile)?,
            run,
        },
        None => Toolchain::Interpreted { run },
    };

    Ok(LanguageSpec {
        id: id.to_string(),
        display_name: raw.name,
        file_extension: raw.extension,
        naming,
        toolchain,
    })
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
