// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::services::templates;
use crate::app::types::ResourceLimits;

const APP_DIR_NAME: &str = "skylift";
const CONFIG_FILE_NAME: &str = "skylift.toml";
const CONFIG_ENV_VAR: &str = "SKYLIFT_CONFIG_PATH";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_JOB_NAME: &str = "annotat3dweb";
const DEFAULT_MAX_CPUS: u32 = 32;
const DEFAULT_GPU_OPTIONS: &[u32] = &[1, 2, 4];
const DEFAULT_PORT_RANGE: (u16, u16) = (8800, 8900);
const DEFAULT_SESSION_TTL_SECS: u64 = 300;

const DEFAULT_SBATCH_TEMPLATE: &str = include_str!("../templates/instance.sbatch");
const DEFAULT_PARTITIONS_TEMPLATE: &str = include_str!("../templates/user-partitions.sh");

/// Token sets the two script templates must carry, no more and no less.
/// A site-supplied template that drifted from these fails at load time
/// instead of producing a half-substituted script on the cluster.
pub const SBATCH_TOKENS: &[&str] = &[
    "ANNOTATION_PATH",
    "CLASS_MODEL_PATH",
    "CONTAINER_PATH",
    "CPUS",
    "GPUS",
    "IMAGE_PATH",
    "JOB_NAME",
    "LABEL_PATH",
    "OUTPUT_DIR",
    "PARTITION",
    "PORT_RANGE0",
    "PORT_RANGE1",
    "SUPERPIXEL_PATH",
];
pub const PARTITIONS_TOKENS: &[&str] = &["INPUT_USERNAME"];

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    ssh_passphrase: Option<String>,
    container_path: Option<String>,
    instance_port_range: Option<(u16, u16)>,
    job_name: Option<String>,
    max_cpus: Option<u32>,
    gpu_options: Option<Vec<u32>>,
    session_ttl_secs: Option<u64>,
    sbatch_template_path: Option<String>,
    partitions_template_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_passphrase: Option<String>,
    pub container_path: String,
    pub instance_port_range: (u16, u16),
    pub job_name: String,
    pub limits: ResourceLimits,
    pub session_ttl: Duration,
    pub sbatch_template: String,
    pub partitions_template: String,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_passphrase: Option<String>,
    pub container_path: Option<String>,
    pub instance_port_range: Option<(u16, u16)>,
    pub job_name: Option<String>,
    pub max_cpus: Option<u32>,
    pub gpu_options: Option<Vec<u32>>,
    pub session_ttl_secs: Option<u64>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<LauncherConfig> {
    let (config_path, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), true),
            None => (default_config_path(), false),
        },
    };

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let ssh_host = overrides
        .ssh_host
        .or(file_config.ssh_host)
        .context("ssh_host is required; set it in the config file or overrides")?;
    let container_path = overrides
        .container_path
        .or(file_config.container_path)
        .context("container_path is required; set it in the config file or overrides")?;

    let ssh_port = overrides
        .ssh_port
        .or(file_config.ssh_port)
        .unwrap_or(DEFAULT_SSH_PORT);
    if ssh_port == 0 {
        anyhow::bail!("ssh_port must be between 1 and 65535");
    }

    let instance_port_range = overrides
        .instance_port_range
        .or(file_config.instance_port_range)
        .unwrap_or(DEFAULT_PORT_RANGE);
    if instance_port_range.0 >= instance_port_range.1 {
        anyhow::bail!(
            "instance_port_range start {} must be below end {}",
            instance_port_range.0,
            instance_port_range.1
        );
    }

    let job_name = overrides
        .job_name
        .or(file_config.job_name)
        .unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());
    if job_name.is_empty()
        || !job_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        anyhow::bail!("job_name '{job_name}' must match [A-Za-z0-9_-]+");
    }

    let max_cpus = overrides
        .max_cpus
        .or(file_config.max_cpus)
        .unwrap_or(DEFAULT_MAX_CPUS);
    if max_cpus == 0 {
        anyhow::bail!("max_cpus must be at least 1");
    }
    let gpu_options = overrides
        .gpu_options
        .or(file_config.gpu_options)
        .unwrap_or_else(|| DEFAULT_GPU_OPTIONS.to_vec());
    if gpu_options.is_empty() {
        anyhow::bail!("gpu_options must list at least one allowed GPU count");
    }

    let session_ttl_secs = overrides
        .session_ttl_secs
        .or(file_config.session_ttl_secs)
        .unwrap_or(DEFAULT_SESSION_TTL_SECS);
    if session_ttl_secs == 0 {
        anyhow::bail!("session_ttl_secs must be at least 1");
    }

    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let sbatch_template = load_template(
        file_config.sbatch_template_path.as_deref(),
        base_dir,
        DEFAULT_SBATCH_TEMPLATE,
        SBATCH_TOKENS,
        "sbatch template",
    )?;
    let partitions_template = load_template(
        file_config.partitions_template_path.as_deref(),
        base_dir,
        DEFAULT_PARTITIONS_TEMPLATE,
        PARTITIONS_TOKENS,
        "partitions template",
    )?;

    Ok(LauncherConfig {
        ssh_host,
        ssh_port,
        ssh_passphrase: overrides.ssh_passphrase.or(file_config.ssh_passphrase),
        container_path,
        instance_port_range,
        job_name,
        limits: ResourceLimits {
            max_cpus,
            gpu_options,
        },
        session_ttl: Duration::from_secs(session_ttl_secs),
        sbatch_template,
        partitions_template,
        config_path,
    })
}

fn load_template(
    override_path: Option<&str>,
    base_dir: Option<&Path>,
    default_body: &str,
    expected_tokens: &[&str],
    what: &str,
) -> Result<String> {
    let body = match override_path {
        Some(raw) => {
            let path = resolve_path(raw, base_dir);
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read {what} {}", path.display()))?
        }
        None => default_body.to_string(),
    };
    let tokens = templates::collect_tokens(&body);
    let expected: std::collections::BTreeSet<String> =
        expected_tokens.iter().map(|token| token.to_string()).collect();
    if tokens != expected {
        let missing: Vec<&String> = expected.difference(&tokens).collect();
        let surplus: Vec<&String> = tokens.difference(&expected).collect();
        anyhow::bail!("{what} token set is wrong: missing {missing:?}, unexpected {surplus:?}");
    }
    Ok(body)
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn default_config_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::set_var(self.key, value);
                    }
                }
                None => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::remove_var(self.key);
                    }
                }
            }
        }
    }

    fn minimal_overrides() -> Overrides {
        Overrides {
            ssh_host: Some("cluster.example.org".to_string()),
            container_path: Some("/opt/annotat3d.sif".to_string()),
            ..Overrides::default()
        }
    }

    #[test]
    fn defaults_fill_everything_optional() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let config = load(None, minimal_overrides()).unwrap();
        assert_eq!(config.ssh_port, DEFAULT_SSH_PORT);
        assert_eq!(config.job_name, DEFAULT_JOB_NAME);
        assert_eq!(config.limits.max_cpus, DEFAULT_MAX_CPUS);
        assert_eq!(config.limits.gpu_options, DEFAULT_GPU_OPTIONS.to_vec());
        assert_eq!(config.session_ttl, Duration::from_secs(300));
        assert!(config.sbatch_template.contains("${PARTITION}"));
    }

    #[test]
    fn missing_host_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let err = load(None, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("ssh_host"));
    }

    #[test]
    fn file_values_apply_and_overrides_win() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("skylift.toml");
        fs::write(
            &config_path,
            "ssh_host = \"file.example.org\"\nssh_port = 2222\ncontainer_path = \"/opt/a.sif\"\nmax_cpus = 16\n",
        )
        .unwrap();

        let config = load(Some(config_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.ssh_host, "file.example.org");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.limits.max_cpus, 16);
        assert_eq!(config.config_path, Some(config_path.clone()));

        let config = load(
            Some(config_path),
            Overrides {
                ssh_port: Some(22),
                ..minimal_overrides()
            },
        )
        .unwrap();
        assert_eq!(config.ssh_host, "cluster.example.org");
        assert_eq!(config.ssh_port, 22);
    }

    #[test]
    fn env_var_points_at_config_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("skylift.toml");
        fs::write(
            &config_path,
            "ssh_host = \"env.example.org\"\ncontainer_path = \"/opt/a.sif\"\n",
        )
        .unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, config_path.to_str().unwrap());
        let config = load(None, Overrides::default()).unwrap();
        assert_eq!(config.ssh_host, "env.example.org");
    }

    #[test]
    fn missing_required_config_file_errors() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let err = load(Some(dir.path().join("missing.toml")), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let err = load(
            None,
            Overrides {
                instance_port_range: Some((9000, 9000)),
                ..minimal_overrides()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("instance_port_range"));
    }

    #[test]
    fn drifted_template_fails_at_load() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let template_path = dir.path().join("broken.sbatch");
        fs::write(&template_path, "#!/bin/bash\necho ${PARTITION} ${TYPO}\n").unwrap();
        let config_path = dir.path().join("skylift.toml");
        fs::write(
            &config_path,
            format!(
                "ssh_host = \"h\"\ncontainer_path = \"/opt/a.sif\"\nsbatch_template_path = \"{}\"\n",
                template_path.display()
            ),
        )
        .unwrap();
        let err = load(Some(config_path), Overrides::default()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("token set is wrong"), "{text}");
        assert!(text.contains("TYPO"), "{text}");
    }

    #[test]
    fn embedded_partitions_template_has_only_the_username_token() {
        let tokens = templates::collect_tokens(DEFAULT_PARTITIONS_TEMPLATE);
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains("INPUT_USERNAME"));
    }
}
