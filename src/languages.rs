//! Language registry
//!
//! Maps a language identifier (or alias) to the toolchain profile used to
//! compile and run it. The registry is immutable once built and is shared
//! read-only between all components.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{EngineError, Result};

/// Languages the engine ships a profile for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinLanguage {
    C,
    Cpp,
    Python,
    Java,
    JavaScript,
    Rust,
    Go,
}

impl BuiltinLanguage {
    pub const ALL: [BuiltinLanguage; 7] = [
        BuiltinLanguage::C,
        BuiltinLanguage::Cpp,
        BuiltinLanguage::Python,
        BuiltinLanguage::Java,
        BuiltinLanguage::JavaScript,
        BuiltinLanguage::Rust,
        BuiltinLanguage::Go,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            BuiltinLanguage::C => "c",
            BuiltinLanguage::Cpp => "cpp",
            BuiltinLanguage::Python => "python",
            BuiltinLanguage::Java => "java",
            BuiltinLanguage::JavaScript => "javascript",
            BuiltinLanguage::Rust => "rust",
            BuiltinLanguage::Go => "go",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.id() == id)
    }
}

/// Registry key: a builtin language or a table-only custom entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LanguageId {
    Builtin(BuiltinLanguage),
    Custom(String),
}

impl LanguageId {
    /// Normalize a configured name into an id (case-insensitive)
    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        match BuiltinLanguage::from_id(&name) {
            Some(lang) => LanguageId::Builtin(lang),
            None => LanguageId::Custom(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LanguageId::Builtin(lang) => lang.id(),
            LanguageId::Custom(name) => name,
        }
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LanguageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Trivial program the health monitor runs through the full pipeline
#[derive(Debug, Clone, Serialize)]
pub struct SelfTest {
    pub source: String,
    pub expected_stdout: String,
}

/// Toolchain profile for a supported language
#[derive(Debug, Clone, Serialize)]
pub struct LanguageProfile {
    pub id: LanguageId,
    pub display_name: String,
    /// Toolchain image reference handed to the sandbox backend
    pub image_ref: String,
    /// Source file extension without the dot (e.g. "cpp")
    pub extension: String,
    /// Name of the source file written into the scratch area
    pub source_file: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    pub default_timeout_secs: u64,
    pub default_memory_mb: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip)]
    pub self_test: Option<SelfTest>,
}

impl LanguageProfile {
    pub fn builtin(&self) -> Option<BuiltinLanguage> {
        match self.id {
            LanguageId::Builtin(lang) => Some(lang),
            LanguageId::Custom(_) => None,
        }
    }

    /// Compile argv with `{source}` / `{stem}` expanded
    pub fn compile_argv(&self) -> Option<Vec<String>> {
        self.compile_command
            .as_ref()
            .map(|cmd| self.expand(cmd))
    }

    /// Run argv with `{source}` / `{stem}` expanded
    pub fn run_argv(&self) -> Vec<String> {
        self.expand(&self.run_command)
    }

    fn expand(&self, template: &[String]) -> Vec<String> {
        let stem = self
            .source_file
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.source_file);
        template
            .iter()
            .map(|part| part.replace("{source}", &self.source_file).replace("{stem}", stem))
            .collect()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    display_name: Option<String>,
    #[serde(default = "default_image")]
    image: String,
    extension: String,
    source_file: Option<String>,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default = "default_timeout_secs")]
    default_timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    default_memory_mb: u64,
    #[serde(default)]
    aliases: Vec<String>,
    self_test: Option<RawSelfTest>,
}

#[derive(Debug, Deserialize)]
struct RawSelfTest {
    source: String,
    expected_stdout: String,
}

fn default_image() -> String {
    "host".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_memory_mb() -> u64 {
    256
}

/// Immutable language table
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: Vec<Arc<LanguageProfile>>,
    /// Lowercased id or alias -> index into `profiles`
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    /// Registry built from the language table compiled into the binary
    pub fn builtin() -> Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Load a registry from a TOML file on disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw_configs: BTreeMap<String, RawLanguageConfig> = toml::from_str(content)
            .map_err(|e| EngineError::InvalidConfig(format!("language table: {}", e)))?;

        let profiles = raw_configs
            .into_iter()
            .map(|(name, raw)| into_profile(&name, raw))
            .collect::<Result<Vec<_>>>()?;

        Self::from_profiles(profiles)
    }

    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut stored = Vec::with_capacity(profiles.len());

        for (position, profile) in profiles.into_iter().enumerate() {
            let keys = std::iter::once(profile.id.as_str().to_string())
                .chain(profile.aliases.iter().map(|alias| alias.to_lowercase()));
            for key in keys {
                if index.insert(key.clone(), position).is_some() {
                    return Err(EngineError::InvalidConfig(format!(
                        "language name {:?} is registered twice",
                        key
                    )));
                }
            }
            stored.push(Arc::new(profile));
        }

        Ok(Self {
            profiles: stored,
            index,
        })
    }

    /// Look up a language by id or alias
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>> {
        self.index
            .get(&language.trim().to_lowercase())
            .map(|&position| Arc::clone(&self.profiles[position]))
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    /// Every registered profile, once each, in id order.
    ///
    /// The iterator is `Clone`, so a consumer can restart it at any point.
    pub fn list(&self) -> Languages<'_> {
        Languages {
            inner: self.profiles.iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Lazy iterator over registered profiles
#[derive(Clone)]
pub struct Languages<'a> {
    inner: std::slice::Iter<'a, Arc<LanguageProfile>>,
}

impl<'a> Iterator for Languages<'a> {
    type Item = &'a LanguageProfile;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|profile| profile.as_ref())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Languages<'_> {}

fn into_profile(name: &str, raw: RawLanguageConfig) -> Result<LanguageProfile> {
    let id = LanguageId::parse(name);
    let run_command = into_command(&raw.run_command);
    if run_command.is_empty() {
        return Err(EngineError::InvalidConfig(format!(
            "empty run command for {}",
            id
        )));
    }
    let compile_command = raw
        .compile_command
        .map(|cmd| into_command(&cmd))
        .filter(|cmd| !cmd.is_empty());
    if raw.default_timeout_secs == 0 || raw.default_memory_mb == 0 {
        return Err(EngineError::InvalidConfig(format!(
            "default limits for {} must be non-zero",
            id
        )));
    }
    let extension = raw.extension.trim_start_matches('.').to_string();
    let source_file = raw
        .source_file
        .unwrap_or_else(|| format!("main.{}", extension));

    Ok(LanguageProfile {
        display_name: raw.display_name.unwrap_or_else(|| id.to_string()),
        id,
        image_ref: raw.image,
        extension,
        source_file,
        compile_command,
        run_command,
        default_timeout_secs: raw.default_timeout_secs,
        default_memory_mb: raw.default_memory_mb,
        aliases: raw.aliases,
        self_test: raw.self_test.map(|t| SelfTest {
            source: t.source,
            expected_stdout: t.expected_stdout,
        }),
    })
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_TABLE: &str = r#"
[c]
extension = "c"
compile_command = "gcc -O2 -o main {source}"
run_command = "./main"

[python]
display_name = "Python 3"
extension = "py"
run_command = "python3 {source}"
default_timeout_secs = 3
aliases = ["py", "Python3"]

[brainfuck]
extension = "bf"
run_command = "bf {source}"
"#;

    #[test]
    fn test_load_languages() {
        let registry = LanguageRegistry::from_toml_str(TEST_TABLE).unwrap();

        assert_eq!(registry.len(), 3);
        let python = registry.resolve("python").unwrap();
        assert_eq!(python.display_name, "Python 3");
        assert_eq!(python.default_timeout_secs, 3);
        assert_eq!(python.default_memory_mb, 256);
        assert_eq!(python.builtin(), Some(BuiltinLanguage::Python));
        assert_eq!(python.run_argv(), vec!["python3", "main.py"]);
        assert!(python.compile_argv().is_none());

        let c = registry.resolve("C").unwrap();
        assert_eq!(
            c.compile_argv().unwrap(),
            vec!["gcc", "-O2", "-o", "main", "main.c"]
        );

        let custom = registry.resolve("brainfuck").unwrap();
        assert_eq!(custom.id, LanguageId::Custom("brainfuck".into()));
        assert_eq!(custom.builtin(), None);
    }

    #[test]
    fn test_aliases_resolve_to_same_profile() {
        let registry = LanguageRegistry::from_toml_str(TEST_TABLE).unwrap();

        let by_id = registry.resolve("python").unwrap();
        let by_alias = registry.resolve("py").unwrap();
        let by_mixed_case_alias = registry.resolve("PYTHON3").unwrap();
        assert!(Arc::ptr_eq(&by_id, &by_alias));
        assert!(Arc::ptr_eq(&by_id, &by_mixed_case_alias));
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = LanguageRegistry::from_toml_str(TEST_TABLE).unwrap();
        match registry.resolve("cobol") {
            Err(EngineError::UnsupportedLanguage(name)) => assert_eq!(name, "cobol"),
            other => panic!("expected UnsupportedLanguage, got {:?}", other),
        }
    }

    #[test]
    fn test_list_round_trips_through_resolve() {
        let registry = LanguageRegistry::builtin().unwrap();

        for lang in BuiltinLanguage::ALL {
            let matching: Vec<_> = registry
                .list()
                .filter(|profile| profile.id.as_str() == lang.id())
                .collect();
            assert_eq!(matching.len(), 1, "{} listed once", lang.id());

            let resolved = registry.resolve(lang.id()).unwrap();
            assert_eq!(resolved.id, matching[0].id);
            assert_eq!(resolved.run_command, matching[0].run_command);
        }
    }

    #[test]
    fn test_list_is_restartable() {
        let registry = LanguageRegistry::from_toml_str(TEST_TABLE).unwrap();
        let mut languages = registry.list();
        let first = languages.next().map(|p| p.id.clone());
        let restarted: Vec<_> = registry.list().map(|p| p.id.clone()).collect();
        let resumed_copy: Vec<_> = languages.clone().collect();

        assert_eq!(restarted.len(), 3);
        assert_eq!(resumed_copy.len(), 2);
        assert_eq!(first.as_ref(), restarted.first());
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let table = r#"
[python]
extension = "py"
run_command = "python3 {source}"
aliases = ["py"]

[pypy]
extension = "py"
run_command = "pypy3 {source}"
aliases = ["py"]
"#;
        assert!(matches!(
            LanguageRegistry::from_toml_str(table),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", TEST_TABLE).unwrap();

        let registry = LanguageRegistry::load(file.path()).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(LanguageRegistry::load("/nonexistent/languages.toml").is_err());
    }

    #[test]
    fn test_java_stem_placeholder() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.resolve("java").unwrap();
        assert_eq!(java.source_file, "Main.java");
        assert!(java.run_argv().contains(&"Main".to_string()));
    }
}
