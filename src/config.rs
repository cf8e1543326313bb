//! Configuration for scriptorium, read from `scriptorium.toml`.
//!
//! Layering is file → environment (`SCRIPTORIUM_*`, optionally from `.env`)
//! → CLI flags. Every field has a default, so an empty or missing file is a
//! valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [llm]
//! command = "claude"
//! model = "sonnet"
//! timeout_secs = 300
//!
//! [[tournament.generators]]
//! id = "lyrical"
//! temperature = 0.9
//! style = "lush, image-driven prose"
//!
//! [compliance]
//! threshold = 0.75
//! forbidden_words = ["suddenly", "very"]
//! rhythm_window = 3
//! repetition_check = true
//!
//! [correction]
//! max_attempts = 3
//!
//! [retake]
//! max_retakes = 2
//! min_score = 0.8
//! min_voice = 0.7
//!
//! [jury]
//! pass_threshold = 0.8
//!
//! [synthesis]
//! mode = "plan"
//!
//! [checkpoint]
//! db_path = ".scriptorium/checkpoints.db"
//!
//! [batch]
//! max_workers = 4
//! ```

use crate::jury::{CATEGORIES, Persona};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "scriptorium.toml";

/// How the tournament champion is blended with the other drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisMode {
    /// One rewrite call weaving in praised excerpts
    #[default]
    Simple,
    /// Analysis pass producing an improvement plan, then an execution pass
    Plan,
}

impl std::fmt::Display for SynthesisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisMode::Simple => write!(f, "simple"),
            SynthesisMode::Plan => write!(f, "plan"),
        }
    }
}

impl std::str::FromStr for SynthesisMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(SynthesisMode::Simple),
            "plan" => Ok(SynthesisMode::Plan),
            _ => anyhow::bail!("Invalid synthesis mode '{}'. Valid values: simple, plan", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSection {
    /// Model CLI command (default: "claude")
    #[serde(default = "default_command")]
    pub command: String,
    /// Model override passed to the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra arguments appended to every call
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            model: None,
            timeout_secs: default_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSpec {
    pub id: String,
    /// Sampling temperature for clients that accept one. The `claude` CLI
    /// has no such flag and logs the value as dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub style: String,
}

impl GeneratorSpec {
    fn new(id: &str, temperature: f32, style: &str) -> Self {
        Self {
            id: id.to_string(),
            temperature: Some(temperature),
            style: style.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSection {
    /// Competing generators; the count must be a power of two
    #[serde(default = "default_generators")]
    pub generators: Vec<GeneratorSpec>,
}

fn default_generators() -> Vec<GeneratorSpec> {
    vec![
        GeneratorSpec::new("lyrical", 0.9, "lush, image-driven prose with long cadences"),
        GeneratorSpec::new("spare", 0.7, "spare, declarative sentences and concrete nouns"),
        GeneratorSpec::new("dialogue", 0.8, "a scene carried mostly by dialogue"),
        GeneratorSpec::new("interior", 0.8, "close third-person interiority"),
    ]
}

impl Default for TournamentSection {
    fn default() -> Self {
        Self {
            generators: default_generators(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSection {
    #[serde(default = "default_compliance_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub forbidden_words: Vec<String>,
    /// Consecutive monotonous sentences that count as a rhythm violation
    #[serde(default = "default_rhythm_window")]
    pub rhythm_window: usize,
    /// Run the model-backed cross-chapter repetition rule
    #[serde(default = "default_true")]
    pub repetition_check: bool,
}

fn default_compliance_threshold() -> f64 {
    crate::compliance::DEFAULT_THRESHOLD
}

fn default_rhythm_window() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ComplianceSection {
    fn default() -> Self {
        Self {
            threshold: default_compliance_threshold(),
            forbidden_words: Vec::new(),
            rhythm_window: default_rhythm_window(),
            repetition_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    crate::correction::DEFAULT_MAX_ATTEMPTS
}

impl Default for CorrectionSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetakeSection {
    #[serde(default = "default_max_retakes")]
    pub max_retakes: u32,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_min_voice")]
    pub min_voice: f64,
}

fn default_max_retakes() -> u32 {
    crate::retake::DEFAULT_MAX_RETAKES
}

fn default_min_score() -> f64 {
    crate::retake::DEFAULT_MIN_SCORE
}

fn default_min_voice() -> f64 {
    crate::retake::DEFAULT_MIN_VOICE
}

impl Default for RetakeSection {
    fn default() -> Self {
        Self {
            max_retakes: default_max_retakes(),
            min_score: default_min_score(),
            min_voice: default_min_voice(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurySection {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "Persona::builtin")]
    pub personas: Vec<Persona>,
}

fn default_pass_threshold() -> f64 {
    crate::jury::DEFAULT_PASS_THRESHOLD
}

impl Default for JurySection {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            personas: Persona::builtin(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisSection {
    #[serde(default)]
    pub mode: SynthesisMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".scriptorium").join("checkpoints.db")
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    4
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptsSection {
    /// Directory of `<template>.system.md` / `<template>.user.md` overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides_dir: Option<PathBuf>,
}

/// Parsed scriptorium.toml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptoriumToml {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tournament: TournamentSection,
    #[serde(default)]
    pub compliance: ComplianceSection,
    #[serde(default)]
    pub correction: CorrectionSection,
    #[serde(default)]
    pub retake: RetakeSection,
    #[serde(default)]
    pub jury: JurySection,
    #[serde(default)]
    pub synthesis: SynthesisSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

impl ScriptoriumToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse scriptorium.toml")
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize scriptorium.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Apply `SCRIPTORIUM_*` overrides from `lookup` (normally the process
    /// environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(command) = lookup("SCRIPTORIUM_LLM_COMMAND") {
            self.llm.command = command;
        }
        if let Some(model) = lookup("SCRIPTORIUM_LLM_MODEL") {
            self.llm.model = Some(model).filter(|m| !m.is_empty());
        }
        if let Some(secs) = lookup("SCRIPTORIUM_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid SCRIPTORIUM_LLM_TIMEOUT_SECS '{}'", secs))?;
        }
        if let Some(mode) = lookup("SCRIPTORIUM_SYNTHESIS_MODE") {
            self.synthesis.mode = mode.parse()?;
        }
        if let Some(path) = lookup("SCRIPTORIUM_DB_PATH") {
            self.checkpoint.db_path = PathBuf::from(path);
        }
        if let Some(workers) = lookup("SCRIPTORIUM_MAX_WORKERS") {
            self.batch.max_workers = workers
                .parse()
                .with_context(|| format!("Invalid SCRIPTORIUM_MAX_WORKERS '{}'", workers))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.llm.command.trim().is_empty() {
            warnings.push("llm.command is empty".to_string());
        }
        if self.llm.timeout_secs == 0 {
            warnings.push("llm.timeout_secs is 0: every call will time out".to_string());
        }

        let generators = &self.tournament.generators;
        if generators.is_empty() || !generators.len().is_power_of_two() {
            warnings.push(format!(
                "tournament.generators has {} entries; a bracket needs a power of two",
                generators.len()
            ));
        }
        let mut seen = HashSet::new();
        for g in generators {
            if !seen.insert(g.id.as_str()) {
                warnings.push(format!("Duplicate generator id '{}'", g.id));
            }
        }

        for (name, value) in [
            ("compliance.threshold", self.compliance.threshold),
            ("retake.min_score", self.retake.min_score),
            ("retake.min_voice", self.retake.min_voice),
            ("jury.pass_threshold", self.jury.pass_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(format!("{} = {} is outside [0, 1]", name, value));
            }
        }

        if self.compliance.rhythm_window < 2 {
            warnings.push("compliance.rhythm_window below 2 is treated as 2".to_string());
        }
        if self.correction.max_attempts == 0 {
            warnings.push("correction.max_attempts = 0 is treated as 1".to_string());
        }
        if self.batch.max_workers == 0 {
            warnings.push("batch.max_workers = 0 is treated as 1".to_string());
        }

        if self.jury.personas.is_empty() {
            warnings.push("jury.personas is empty: every jury evaluation will fail".to_string());
        }
        for persona in &self.jury.personas {
            let total = persona.weight_total();
            if (total - 1.0).abs() > 0.01 {
                warnings.push(format!(
                    "Persona '{}' weights sum to {:.2}, expected 1.0",
                    persona.id, total
                ));
            }
            for category in persona.weights.keys() {
                if !CATEGORIES.contains(&category.as_str()) {
                    warnings.push(format!(
                        "Persona '{}' weights unknown category '{}'",
                        persona.id, category
                    ));
                }
            }
        }

        warnings
    }
}

/// Resolved configuration: the parsed file plus environment and CLI layers.
#[derive(Debug, Clone)]
pub struct Config {
    pub toml: ScriptoriumToml,
    /// File the configuration was read from, if any
    pub source: Option<PathBuf>,
    /// CLI override: verbose output
    pub verbose: bool,
}

impl Config {
    /// Resolve the config file and apply environment overrides.
    ///
    /// An explicit path must exist; otherwise `scriptorium.toml` in the
    /// working directory is used when present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let source = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => Some(PathBuf::from(CONFIG_FILE_NAME)).filter(|p| p.exists()),
        };

        let mut toml = match source {
            Some(ref path) => ScriptoriumToml::load(path)?,
            None => ScriptoriumToml::default(),
        };
        toml.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            toml,
            source,
            verbose: false,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn db_path(&self) -> &Path {
        &self.toml.checkpoint.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ScriptoriumToml::parse("").unwrap();
        assert_eq!(config, ScriptoriumToml::default());
        assert_eq!(config.llm.command, "claude");
        assert_eq!(config.tournament.generators.len(), 4);
        assert_eq!(config.compliance.threshold, 0.75);
        assert_eq!(config.correction.max_attempts, 3);
        assert_eq!(config.retake.max_retakes, 2);
        assert_eq!(config.jury.personas.len(), 4);
        assert_eq!(config.synthesis.mode, SynthesisMode::Simple);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let config = ScriptoriumToml::parse(
            r#"
            [llm]
            model = "opus"
            timeout_secs = 60

            [[tournament.generators]]
            id = "a"

            [[tournament.generators]]
            id = "b"
            temperature = 1.0
            style = "terse"

            [compliance]
            forbidden_words = ["suddenly"]

            [synthesis]
            mode = "plan"

            [[jury.personas]]
            id = "solo"
            name = "Solo"
            description = "only reader"
            weights = { engagement = 0.5, prose = 0.5 }
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.model.as_deref(), Some("opus"));
        assert_eq!(config.llm.command, "claude");
        assert_eq!(config.tournament.generators.len(), 2);
        assert_eq!(config.tournament.generators[1].temperature, Some(1.0));
        assert_eq!(config.compliance.forbidden_words, vec!["suddenly"]);
        assert_eq!(config.synthesis.mode, SynthesisMode::Plan);
        assert_eq!(config.jury.personas[0].weights["prose"], 0.5);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = ScriptoriumToml::default();
        config.tournament.generators.truncate(3);
        config.tournament.generators.push(config.tournament.generators[0].clone());
        config.jury.pass_threshold = 1.5;
        config.jury.personas[0].weights.insert("plot".to_string(), 0.2);

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Duplicate generator id 'lyrical'")));
        assert!(warnings.iter().any(|w| w.contains("jury.pass_threshold")));
        assert!(warnings.iter().any(|w| w.contains("unknown category 'plot'")));
        assert!(warnings.iter().any(|w| w.contains("sum to 1.20")));

        config.tournament.generators.pop();
        assert!(config.validate().iter().any(|w| w.contains("power of two")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCRIPTORIUM_LLM_MODEL", "haiku"),
            ("SCRIPTORIUM_SYNTHESIS_MODE", "PLAN"),
            ("SCRIPTORIUM_MAX_WORKERS", "8"),
            ("SCRIPTORIUM_DB_PATH", "/tmp/x.db"),
        ]);
        let mut config = ScriptoriumToml::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.llm.model.as_deref(), Some("haiku"));
        assert_eq!(config.synthesis.mode, SynthesisMode::Plan);
        assert_eq!(config.batch.max_workers, 8);
        assert_eq!(config.checkpoint.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_env_rejects_bad_numbers() {
        let mut config = ScriptoriumToml::default();
        let err = config
            .apply_env(|k| (k == "SCRIPTORIUM_MAX_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SCRIPTORIUM_MAX_WORKERS"));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = ScriptoriumToml::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[llm]"));
        assert_eq!(ScriptoriumToml::parse(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/scriptorium.toml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut toml = ScriptoriumToml::default();
        toml.batch.max_workers = 2;
        toml.save(&path).unwrap();
        assert_eq!(ScriptoriumToml::load(&path).unwrap().batch.max_workers, 2);
    }

    #[test]
    fn test_synthesis_mode_from_str() {
        assert_eq!("Simple".parse::<SynthesisMode>().unwrap(), SynthesisMode::Simple);
        assert!("fancy".parse::<SynthesisMode>().is_err());
        assert_eq!(SynthesisMode::Plan.to_string(), "plan");
    }
}
