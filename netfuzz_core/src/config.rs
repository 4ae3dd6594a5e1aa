use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusFormat {
    #[default]
    Bincode,
    Json,
}

impl CorpusFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusFormat::Bincode => "bincode",
            CorpusFormat::Json => "json",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_inputs_dir")]
    pub inputs: PathBuf,
    #[serde(default)]
    pub format: CorpusFormat,
}

pub fn default_inputs_dir() -> PathBuf {
    PathBuf::from("./in")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            inputs: default_inputs_dir(),
            format: CorpusFormat::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ObserverType {
    #[default]
    Notify,
    Scan,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub observer: ObserverType,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            observer: ObserverType::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DebuggerConfig {
    #[serde(default = "default_debugger_path")]
    pub path: PathBuf,
    #[serde(default = "default_debugger_args")]
    pub args: Vec<String>,
    pub target_bin: PathBuf,
    /// Arguments for the `run` command. `{port}` is replaced with the live port.
    #[serde(default)]
    pub target_args: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub fn default_debugger_path() -> PathBuf {
    PathBuf::from("/usr/bin/gdb")
}

pub fn default_debugger_args() -> Vec<String> {
    vec!["-q".to_string()]
}

pub fn default_prompt() -> String {
    "(gdb)".to_string()
}

impl DebuggerConfig {
    /// Default gdb settings for running `target_bin` with `target_args`,
    /// where `target_args` may contain a `{port}` placeholder.
    pub fn for_target(target_bin: impl Into<PathBuf>, target_args: impl Into<String>) -> Self {
        Self {
            path: default_debugger_path(),
            args: default_debugger_args(),
            target_bin: target_bin.into(),
            target_args: target_args.into(),
            prompt: default_prompt(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SanitizerConfig {
    pub log_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
}

fn default_log_prefix() -> String {
    "asan".to_string()
}

impl SanitizerConfig {
    /// Base path handed to the sanitizer runtime; it appends `.<pid>` itself.
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_prefix)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct NetfuzzConfig {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub debugger: Option<DebuggerConfig>,
    #[serde(default)]
    pub sanitizer: Option<SanitizerConfig>,
}

impl NetfuzzConfig {
    /// Loads and parses a TOML configuration file.
    ///
    /// # Arguments
    /// * `path`: Location of the file.
    ///
    /// # Returns
    /// The parsed configuration, or an error naming the file if it could not
    /// be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Environment exported to the debugger and, through it, to the target.
    pub fn debugger_environment(&self) -> BTreeMap<String, String> {
        let mut env = self
            .debugger
            .as_ref()
            .map(|d| d.env.clone())
            .unwrap_or_default();
        if let Some(sanitizer) = &self.sanitizer {
            let log_path = format!("log_path={}", sanitizer.log_path().display());
            env.entry("ASAN_OPTIONS".to_string())
                .and_modify(|opts| {
                    if !opts.contains("log_path=") {
                        opts.push(':');
                        opts.push_str(&log_path);
                    }
                })
                .or_insert(log_path);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = NetfuzzConfig::from_toml_str("").unwrap();
        assert_eq!(config.corpus.inputs, PathBuf::from("./in"));
        assert_eq!(config.corpus.format, CorpusFormat::Bincode);
        assert_eq!(config.sync.observer, ObserverType::Notify);
        assert_eq!(config.sync.poll_timeout_ms, 10);
        assert!(config.debugger.is_none());
        assert!(config.sanitizer.is_none());
    }

    #[test]
    fn full_document_parses_kebab_case_keys() {
        let config = NetfuzzConfig::from_toml_str(
            r#"
            [corpus]
            inputs = "/tmp/ffw/in"
            format = "json"

            [sync]
            observer = "scan"
            poll-timeout-ms = 250

            [debugger]
            target-bin = "/opt/target/server"
            target-args = "--port {port} --foreground"
            env = { MALLOC_CHECK_ = "3" }

            [sanitizer]
            log-dir = "/tmp/ffw/asan"
            "#,
        )
        .unwrap();

        assert_eq!(config.corpus.format, CorpusFormat::Json);
        assert_eq!(config.sync.observer, ObserverType::Scan);
        assert_eq!(config.sync.poll_timeout_ms, 250);
        let debugger = config.debugger.as_ref().unwrap();
        assert_eq!(debugger.path, PathBuf::from("/usr/bin/gdb"));
        assert_eq!(debugger.args, vec!["-q".to_string()]);
        assert_eq!(debugger.prompt, "(gdb)");
        assert_eq!(debugger.target_args, "--port {port} --foreground");

        let env = config.debugger_environment();
        assert_eq!(env.get("MALLOC_CHECK_").map(String::as_str), Some("3"));
        assert_eq!(
            env.get("ASAN_OPTIONS").map(String::as_str),
            Some("log_path=/tmp/ffw/asan/asan")
        );
    }

    #[test]
    fn sanitizer_log_path_is_appended_to_existing_options() {
        let config = NetfuzzConfig::from_toml_str(
            r#"
            [debugger]
            target-bin = "/bin/true"
            env = { ASAN_OPTIONS = "detect_leaks=0" }

            [sanitizer]
            log-dir = "/var/log/asan"
            log-prefix = "srv"
            "#,
        )
        .unwrap();
        let env = config.debugger_environment();
        assert_eq!(
            env.get("ASAN_OPTIONS").map(String::as_str),
            Some("detect_leaks=0:log_path=/var/log/asan/srv")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = NetfuzzConfig::from_toml_str(
            r#"
            [corpus]
            inputz = "./in"
            "#,
        );
        assert!(result.is_err());
    }
}
