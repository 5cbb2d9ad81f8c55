use std::path::PathBuf;
use std::time::Duration;

use retexturity_core::template::list_template_files;

use crate::error::BridgeError;

/// Default ComfyUI address.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Default directory generated artifacts are staged into.
pub const DEFAULT_OUTPUT_DIR: &str = "retexturity_outputs";

/// Default directory workflow templates are listed from.
pub const DEFAULT_WORKFLOWS_DIR: &str = "workflows";

/// Bridge configuration.
///
/// All fields have defaults suitable for a ComfyUI instance running on the
/// same machine. Hosts override them via environment variables or by
/// building the struct directly from their own preferences.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// ComfyUI base URL (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    /// Where finished artifacts are staged (default: `retexturity_outputs`).
    pub output_dir: PathBuf,
    /// ComfyUI's own output folder, when it is on this machine. Enables the
    /// copy fast path and the filesystem fallback.
    pub comfyui_output_dir: Option<PathBuf>,
    /// Folder scanned for `.json` workflow templates.
    pub workflows_dir: PathBuf,
    /// Delay between status checks (default: 2 seconds).
    pub poll_interval: Duration,
    /// Status checks before a run gives up (default: `900`).
    pub max_poll_attempts: u32,
    /// Whether the completion notifier is invoked (default: `true`).
    pub notify_on_finish: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            comfyui_output_dir: None,
            workflows_dir: PathBuf::from(DEFAULT_WORKFLOWS_DIR),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 900,
            notify_on_finish: true,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// A `.env` file in the working directory is read first, if present.
    ///
    /// | Env Var                     | Default                  |
    /// |-----------------------------|--------------------------|
    /// | `COMFYUI_URL`               | `http://127.0.0.1:8188`  |
    /// | `RETEXTURITY_OUTPUT_DIR`    | `retexturity_outputs`    |
    /// | `COMFYUI_OUTPUT_DIR`        | unset                    |
    /// | `RETEXTURITY_WORKFLOWS_DIR` | `workflows`              |
    /// | `POLL_INTERVAL_SECS`        | `2`                      |
    /// | `MAX_POLL_ATTEMPTS`         | `900`                    |
    /// | `NOTIFY_ON_FINISH`          | `true`                   |
    pub fn from_env() -> Result<Self, BridgeError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BridgeError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let api_url = get("COMFYUI_URL").unwrap_or(defaults.api_url);
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(BridgeError::Config(format!(
                "COMFYUI_URL must be an http(s) URL, got {api_url:?}"
            )));
        }

        let output_dir = get("RETEXTURITY_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);
        let comfyui_output_dir = get("COMFYUI_OUTPUT_DIR").map(PathBuf::from);
        let workflows_dir = get("RETEXTURITY_WORKFLOWS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.workflows_dir);

        let poll_interval = match get("POLL_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_positive(&raw, "POLL_INTERVAL_SECS")?),
            None => defaults.poll_interval,
        };
        let max_poll_attempts = match get("MAX_POLL_ATTEMPTS") {
            Some(raw) => u32::try_from(parse_positive(&raw, "MAX_POLL_ATTEMPTS")?).map_err(|_| {
                BridgeError::Config(format!("MAX_POLL_ATTEMPTS is too large: {raw}"))
            })?,
            None => defaults.max_poll_attempts,
        };
        let notify_on_finish = match get("NOTIFY_ON_FINISH") {
            Some(raw) => parse_bool(&raw, "NOTIFY_ON_FINISH")?,
            None => defaults.notify_on_finish,
        };

        Ok(Self {
            api_url,
            output_dir,
            comfyui_output_dir,
            workflows_dir,
            poll_interval,
            max_poll_attempts,
            notify_on_finish,
        })
    }

    /// Workflow templates available in `workflows_dir`, sorted by name.
    ///
    /// A missing folder yields an empty list.
    pub fn template_files(&self) -> Result<Vec<PathBuf>, BridgeError> {
        Ok(list_template_files(&self.workflows_dir)?)
    }
}

fn parse_positive(raw: &str, key: &str) -> Result<u64, BridgeError> {
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(BridgeError::Config(format!(
            "{key} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn parse_bool(raw: &str, key: &str) -> Result<bool, BridgeError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::Config(format!("{key} must be a boolean, got {raw:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<BridgeConfig, BridgeError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert!(config.comfyui_output_dir.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_poll_attempts, 900);
        assert!(config.notify_on_finish);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("COMFYUI_URL", "http://gpu-box:8188"),
            ("COMFYUI_OUTPUT_DIR", "/srv/comfy/output"),
            ("POLL_INTERVAL_SECS", "5"),
            ("MAX_POLL_ATTEMPTS", "10"),
            ("NOTIFY_ON_FINISH", "off"),
        ])
        .unwrap();
        assert_eq!(config.api_url, "http://gpu-box:8188");
        assert_eq!(
            config.comfyui_output_dir,
            Some(PathBuf::from("/srv/comfy/output"))
        );
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_poll_attempts, 10);
        assert!(!config.notify_on_finish);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("COMFYUI_OUTPUT_DIR", "  "), ("COMFYUI_URL", "")]).unwrap();
        assert!(config.comfyui_output_dir.is_none());
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(load(&[("POLL_INTERVAL_SECS", "0")]), Err(BridgeError::Config(_)));
        assert_matches!(load(&[("MAX_POLL_ATTEMPTS", "many")]), Err(BridgeError::Config(_)));
        assert_matches!(load(&[("NOTIFY_ON_FINISH", "maybe")]), Err(BridgeError::Config(_)));
        assert_matches!(load(&[("COMFYUI_URL", "127.0.0.1:8188")]), Err(BridgeError::Config(_)));
    }

    #[test]
    fn template_files_come_from_workflows_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("texture.json"), "{}").unwrap();
        std::fs::write(dir.path().join("mesh.JSON"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let config = load(&[("RETEXTURITY_WORKFLOWS_DIR", dir.path().to_str().unwrap())]).unwrap();

        assert_eq!(
            config.template_files().unwrap(),
            vec![dir.path().join("mesh.JSON"), dir.path().join("texture.json")]
        );

        let missing = BridgeConfig {
            workflows_dir: dir.path().join("absent"),
            ..BridgeConfig::default()
        };
        assert!(missing.template_files().unwrap().is_empty());
    }
}
