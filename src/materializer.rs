//! Source materialization
//!
//! Turns submitted source text into an on-disk artifact:
//! - Every execution gets its own directory under the scratch directory
//! - Languages that bind the file name to a declared type (Java) derive the
//!   file name from the source, falling back to a default entry point
//!
//! The returned `Artifact` owns its directory; dropping it removes everything
//! the execution produced (source, compiled output, files written by the program).

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::languages::LanguageSpec;

/// Prefix of every execution-scoped directory
pub const EXECUTION_DIR_PREFIX: &str = "exec-";

const RANDOM_STEM_PREFIX: &str = "snippet_";

/// How the artifact file name is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingRule {
    /// Fresh random name with the language extension
    Random,
    /// File stem must equal the declared public type name
    PublicType { default_name: String },
}

/// Result of scanning a source for its entry-point type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint<'a> {
    /// A public type was declared; the file must carry its name
    Declared(&'a str),
    /// Types are declared but none is public
    Default,
    /// Bare statements with no type declaration at all
    Bare,
}

fn public_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\bpublic\s+(?:(?:final|abstract|sealed|static|strictfp)\s+)*(?:class|interface|enum|record)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .unwrap_or_else(|e| unreachable!("invalid public type pattern: {e}"))
    })
}

fn type_declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:class|interface|enum|record)\s+[A-Za-z_$]")
            .unwrap_or_else(|e| unreachable!("invalid type declaration pattern: {e}"))
    })
}

/// Scan a source for a top-level public type.
///
/// Comments and string/char literals are ignored, and nested types
/// (`public static class Inner` inside another body) do not count.
pub fn detect_entry_point(source: &str) -> EntryPoint<'_> {
    let masked = mask_comments_and_literals(source);

    let mut depth = 0i32;
    let mut scanned = 0;
    for caps in public_type_pattern().captures_iter(&masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        depth += brace_balance(&masked[scanned..whole.start()]);
        scanned = whole.start();
        if depth <= 0 {
            // Masking keeps byte offsets, so the range is valid in `source`.
            return EntryPoint::Declared(&source[name.range()]);
        }
    }

    if type_declaration_pattern().is_match(&masked) {
        EntryPoint::Default
    } else {
        EntryPoint::Bare
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    Code,
    LineComment,
    BlockComment,
    Str,
    TextBlock,
    Char,
}

/// Blank out comments and literals, keeping newlines and byte offsets
fn mask_comments_and_literals(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = Lexeme::Code;
    let mut chars = source.char_indices();

    while let Some((i, c)) = chars.next() {
        let rest = &source[i..];
        match state {
            Lexeme::Code => {
                if rest.starts_with("//") {
                    state = Lexeme::LineComment;
                    out.push(' ');
                } else if rest.starts_with("/*") {
                    state = Lexeme::BlockComment;
                    out.push_str("  ");
                    chars.next();
                } else if rest.starts_with("\"\"\"") {
                    state = Lexeme::TextBlock;
                    out.push_str("   ");
                    chars.nth(1);
                } else if c == '"' {
                    state = Lexeme::Str;
                    out.push(' ');
                } else if c == '\'' {
                    state = Lexeme::Char;
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            Lexeme::LineComment => {
                if c == '\n' {
                    state = Lexeme::Code;
                }
                blank(&mut out, c);
            }
            Lexeme::BlockComment => {
                if rest.starts_with("*/") {
                    state = Lexeme::Code;
                    out.push_str("  ");
                    chars.next();
                } else {
                    blank(&mut out, c);
                }
            }
            Lexeme::TextBlock => {
                if rest.starts_with("\"\"\"") {
                    state = Lexeme::Code;
                    out.push_str("   ");
                    chars.nth(1);
                } else if c == '\\' {
                    blank(&mut out, c);
                    if let Some((_, escaped)) = chars.next() {
                        blank(&mut out, escaped);
                    }
                } else {
                    blank(&mut out, c);
                }
            }
            Lexeme::Str | Lexeme::Char => {
                let closing = if state == Lexeme::Str { '"' } else { '\'' };
                if c == '\\' {
                    blank(&mut out, c);
                    if let Some((_, escaped)) = chars.next() {
                        blank(&mut out, escaped);
                    }
                } else if c == closing || c == '\n' {
                    state = Lexeme::Code;
                    blank(&mut out, c);
                } else {
                    blank(&mut out, c);
                }
            }
        }
    }

    out
}

fn blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        out.extend(std::iter::repeat(' ').take(c.len_utf8()));
    }
}

fn brace_balance(code: &str) -> i32 {
    code.bytes().fold(0, |depth, b| match b {
        b'{' => depth + 1,
        b'}' => depth - 1,
        _ => depth,
    })
}

/// Wrap bare statements into a minimal runnable class
pub fn wrap_in_entry_point(source: &str, class_name: &str) -> String {
    let body: Vec<String> = source
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("        {}", line)
            }
        })
        .collect();

    format!(
        "public class {} {{\n    public static void main(String[] args) {{\n{}\n    }}\n}}\n",
        class_name,
        body.join("\n")
    )
}

/// Resolve the file stem and the contents to write for a naming rule.
///
/// Returns `None` as the stem when a random name should be generated.
pub fn apply_naming_rule<'a>(
    rule: &NamingRule,
    source: &'a str,
) -> (Option<String>, Cow<'a, str>) {
    match rule {
        NamingRule::Random => (None, Cow::Borrowed(source)),
        NamingRule::PublicType { default_name } => match detect_entry_point(source) {
            EntryPoint::Declared(name) => (Some(name.to_string()), Cow::Borrowed(source)),
            EntryPoint::Default => (Some(default_name.clone()), Cow::Borrowed(source)),
            EntryPoint::Bare => (
                Some(default_name.clone()),
                Cow::Owned(wrap_in_entry_point(source, default_name)),
            ),
        },
    }
}

/// Materialized source owned by one execution
#[derive(Debug)]
pub struct Artifact {
    dir: TempDir,
    source_path: PathBuf,
    file_name: String,
}

impl Artifact {
    /// Execution-scoped working directory
    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Source file name relative to `work_dir`
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Remove the execution directory. Failures are logged, never returned.
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Removed execution directory {:?}", path),
            Err(e) => warn!("Failed to remove execution directory {:?}: {}", path, e),
        }
    }
}

/// Writes submitted sources into execution-scoped directories
#[derive(Debug, Clone)]
pub struct SourceMaterializer {
    scratch_dir: PathBuf,
}

impl SourceMaterializer {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    pub async fn materialize(
        &self,
        source: &str,
        language: &LanguageSpec,
    ) -> Result<Artifact, SandboxError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| SandboxError::ScratchDir {
                path: self.scratch_dir.clone(),
                source,
            })?;

        let dir = tempfile::Builder::new()
            .prefix(EXECUTION_DIR_PREFIX)
            .tempdir_in(&self.scratch_dir)
            .map_err(|source| SandboxError::ScratchDir {
                path: self.scratch_dir.clone(),
                source,
            })?;

        let (stem, contents) = apply_naming_rule(&language.naming, source);
        let (file_name, source_path) = match stem {
            Some(stem) => {
                let file_name = format!("{}{}", stem, language.file_extension);
                let path = dir.path().join(&file_name);
                (file_name, path)
            }
            None => random_source_path(dir.path(), &language.file_extension)?,
        };

        tokio::fs::write(&source_path, contents.as_bytes())
            .await
            .map_err(|source| SandboxError::Materialize {
                path: source_path.clone(),
                source,
            })?;

        debug!(
            "Materialized {} source at {:?}",
            language.id, source_path
        );

        Ok(Artifact {
            dir,
            source_path,
            file_name,
        })
    }
}

fn random_source_path(dir: &Path, extension: &str) -> Result<(String, PathBuf), SandboxError> {
    let file = tempfile::Builder::new()
        .prefix(RANDOM_STEM_PREFIX)
        .suffix(extension)
        .tempfile_in(dir)
        .map_err(|source| SandboxError::Materialize {
            path: dir.to_path_buf(),
            source,
        })?;

    // Keep the file: the execution directory owns its removal.
    let (_, path) = file.keep().map_err(|e| SandboxError::Materialize {
        path: dir.to_path_buf(),
        source: e.error,
    })?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok((file_name, path))
}

/// Remove execution directories older than `max_age` left behind by a killed worker.
///
/// Returns the number of directories removed.
pub fn sweep_stale_artifacts(scratch_dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(scratch_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Nothing to sweep in {:?}: {}", scratch_dir, e);
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(EXECUTION_DIR_PREFIX) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to sweep {:?}: {}", entry.path(), e),
        }
    }

    if removed > 0 {
        info!("Swept {} stale execution directories from {:?}", removed, scratch_dir);
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;

    const TEST_TABLE: &str = r#"
[shell]
name = "Shell"
extension = ".sh"
run = "sh {source}"

[java]
name = "Java"
extension = ".java"
naming = "public-type"
entry_point = "Main"
compile = "javac {source}"
run = "java -cp . {stem}"
"#;

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_toml_str(TEST_TABLE).unwrap()
    }

    #[test]
    fn test_detect_public_class() {
        let source = "import java.util.*;\n\npublic class HelloWorld {\n}\n";
        assert_eq!(detect_entry_point(source), EntryPoint::Declared("HelloWorld"));
    }

    #[test]
    fn test_detect_public_final_class_and_record() {
        assert_eq!(
            detect_entry_point("public final class Solver {}"),
            EntryPoint::Declared("Solver")
        );
        assert_eq!(
            detect_entry_point("public record Point(int x, int y) {}"),
            EntryPoint::Declared("Point")
        );
    }

    #[test]
    fn test_detect_ignores_comments_and_literals() {
        let source = "// public class Old\n/* public class Older */\npublic class Real {\n    String s = \"public class Quoted\";\n}\n";
        assert_eq!(detect_entry_point(source), EntryPoint::Declared("Real"));

        assert_eq!(
            detect_entry_point("/* public class X */ System.out.println(\"class A\");"),
            EntryPoint::Bare
        );
    }

    #[test]
    fn test_detect_skips_nested_public_types() {
        let source = "class Outer {\n    public static class Inner {}\n}\npublic class Solution {}\n";
        assert_eq!(detect_entry_point(source), EntryPoint::Declared("Solution"));

        assert_eq!(
            detect_entry_point("class Outer { public static class Inner {} }"),
            EntryPoint::Default
        );
    }

    #[test]
    fn test_masking_keeps_offsets() {
        let source = "int x; // héllo\nchar c = '{';\n";
        let masked = mask_comments_and_literals(source);
        assert_eq!(masked.len(), source.len());
        assert_eq!(brace_balance(&masked), 0);
        assert!(masked.starts_with("int x;"));
    }

    #[test]
    fn test_detect_non_public_and_bare() {
        assert_eq!(detect_entry_point("class Helper {}"), EntryPoint::Default);
        assert_eq!(
            detect_entry_point("System.out.println(\"hi\");"),
            EntryPoint::Bare
        );
    }

    #[test]
    fn test_wrap_bare_statements() {
        let (stem, contents) = apply_naming_rule(
            &NamingRule::PublicType {
                default_name: "Main".into(),
            },
            "System.out.println(\"hi\");",
        );

        assert_eq!(stem.as_deref(), Some("Main"));
        assert!(contents.starts_with("public class Main {"));
        assert!(contents.contains("public static void main(String[] args)"));
        assert!(contents.contains("        System.out.println(\"hi\");"));
    }

    #[test]
    fn test_random_rule_keeps_source() {
        let (stem, contents) = apply_naming_rule(&NamingRule::Random, "print(1)");
        assert!(stem.is_none());
        assert_eq!(contents, "print(1)");
    }

    #[tokio::test]
    async fn test_materialize_public_type_file_name() {
        let scratch = tempfile::tempdir().unwrap();
        let materializer = SourceMaterializer::new(scratch.path());
        let java = registry().lookup("java").unwrap();

        let artifact = materializer
            .materialize("public class Greeter { }", &java)
            .await
            .unwrap();

        assert_eq!(artifact.file_name(), "Greeter.java");
        assert!(artifact.source_path().exists());
        assert!(artifact.work_dir().starts_with(scratch.path()));
    }

    #[tokio::test]
    async fn test_materialize_random_name_with_extension() {
        let scratch = tempfile::tempdir().unwrap();
        let materializer = SourceMaterializer::new(scratch.path());
        let shell = registry().lookup("shell").unwrap();

        let artifact = materializer.materialize("echo hi", &shell).await.unwrap();

        assert!(artifact.file_name().starts_with(RANDOM_STEM_PREFIX));
        assert!(artifact.file_name().ends_with(".sh"));
        let written = std::fs::read_to_string(artifact.source_path()).unwrap();
        assert_eq!(written, "echo hi");
    }

    #[tokio::test]
    async fn test_fixed_names_do_not_collide() {
        let scratch = tempfile::tempdir().unwrap();
        let materializer = SourceMaterializer::new(scratch.path());
        let java = registry().lookup("java").unwrap();

        let first = materializer.materialize("int a = 1;", &java).await.unwrap();
        let second = materializer.materialize("int b = 2;", &java).await.unwrap();

        assert_eq!(first.file_name(), second.file_name());
        assert_ne!(first.source_path(), second.source_path());
    }

    #[tokio::test]
    async fn test_cleanup_removes_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let materializer = SourceMaterializer::new(scratch.path());
        let shell = registry().lookup("shell").unwrap();

        let artifact = materializer.materialize("echo hi", &shell).await.unwrap();
        std::fs::write(artifact.work_dir().join("a.out"), b"binary").unwrap();
        artifact.cleanup();

        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sweep_stale_artifacts() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir(scratch.path().join("exec-old")).unwrap();
        std::fs::create_dir(scratch.path().join("keep-me")).unwrap();

        assert_eq!(sweep_stale_artifacts(scratch.path(), Duration::ZERO), 1);
        assert!(!scratch.path().join("exec-old").exists());
        assert!(scratch.path().join("keep-me").exists());

        std::fs::create_dir(scratch.path().join("exec-fresh")).unwrap();
        assert_eq!(
            sweep_stale_artifacts(scratch.path(), Duration::from_secs(3600)),
            0
        );
    }
}
