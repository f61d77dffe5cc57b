use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

static SETTINGS_PATH_ENV: &str = "REGISTRY_PROXY_CONFIG";
static DEFAULT_SETTINGS_PATH: &str = "/etc/registry-proxy/config.yaml";

/// Process settings. The proxy rules themselves live in the watched ConfigMap.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub webserver: Webserver,
    pub config_map: ConfigMapRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub address: IpAddr,
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8443,
        }
    }
}

/// Location of the registry proxy configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl Default for ConfigMapRef {
    fn default() -> Self {
        Self {
            namespace: "registry-proxy".to_string(),
            name: "registry-proxy".to_string(),
            key: "config.yaml".to_string(),
        }
    }
}

pub fn settings_path() -> PathBuf {
    env::var_os(SETTINGS_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path = path.as_ref();
    if !path.exists() {
        info!(
            "No settings file at {}, using built-in settings",
            path.display()
        );
        return Ok(Settings::default());
    }

    info!("Loading settings from file {}", path.display());
    let yaml_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let settings = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML settings after environment variable expansion")?;

    Ok(settings)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("REGISTRY_PROXY_TEST_VAR", "value123");
        }
        let input = "This is a test: ${REGISTRY_PROXY_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("REGISTRY_PROXY_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${REGISTRY_PROXY_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: REGISTRY_PROXY_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        unsafe {
            env::set_var("REGISTRY_PROXY_VAR1", "foo");
            env::set_var("REGISTRY_PROXY_VAR2", "bar");
        }
        let input = "${REGISTRY_PROXY_VAR1} and ${REGISTRY_PROXY_VAR2}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("REGISTRY_PROXY_VAR1");
            env::remove_var("REGISTRY_PROXY_VAR2");
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_settings_file() {
        unsafe {
            env::set_var("REGISTRY_PROXY_TEST_NAMESPACE", "proxy-system");
        }
        let yaml_content = r#"
        webserver:
          address: 127.0.0.1
          port: 9443
        configMap:
          namespace: ${REGISTRY_PROXY_TEST_NAMESPACE}
          name: proxy-config
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let settings = load_settings(path).expect("Should load settings");

        assert_eq!(settings.webserver.port, 9443);
        assert_eq!(settings.webserver.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.config_map.namespace, "proxy-system");
        assert_eq!(settings.config_map.name, "proxy-config");
        assert_eq!(settings.config_map.key, "config.yaml");
        unsafe {
            env::remove_var("REGISTRY_PROXY_TEST_NAMESPACE");
        }
    }

    #[test]
    fn test_load_settings_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let settings = load_settings(dir.path().join("absent.yaml")).expect("Should fall back");
        assert_eq!(settings.webserver.port, 8443);
        assert_eq!(settings.config_map, ConfigMapRef::default());
    }
}
