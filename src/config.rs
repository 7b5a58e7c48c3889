//! Configuration loading for vvtest.
//!
//! Configuration is read from a TOML file (by default `vvtest.toml`). All
//! settings have defaults, see [`schema`].

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.expand_paths()?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use vvtest::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [vvtest]
///     postclean = true
///
///     [platform]
///     type = "local"
///     num_procs = 4
/// "#)?;
///
/// assert!(config.vvtest.postclean);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths()?;

    Ok(config)
}

impl Config {
    /// Expands `~` and environment variables in configured paths.
    fn expand_paths(&mut self) -> Result<()> {
        self.vvtest.test_dir = expand(&self.vvtest.test_dir)?;
        self.report.output_dir = expand(&self.report.output_dir)?;
        Ok(())
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.vvtest.test_dir, PathBuf::from("TestResults"));
        assert_eq!(config.vvtest.tick_millis, 1000);
        assert_eq!(config.vvtest.interrupt_to_kill_secs, 30);
        assert!(config.vvtest.logfile);
        assert!(config.vvtest.preclean);
        assert!(!config.vvtest.postclean);
        assert!(matches!(config.platform, PlatformConfig::Local(_)));
        assert!(!config.report.junit);
    }

    #[test]
    fn test_mpi_platform() {
        let config = load_config_str(
            r#"
            [platform]
            type = "mpi"
            num_procs = 8
            mpifile = "machinefile"
            mpi_opts = "--bind-to none"
            "#,
        )
        .unwrap();

        match config.platform {
            PlatformConfig::Mpi(mpi) => {
                assert_eq!(mpi.num_procs, Some(8));
                assert_eq!(mpi.mpifile, MpiFileStyle::Machinefile);
                assert_eq!(mpi.mpi_opts, "--bind-to none");
            }
            other => panic!("unexpected platform {:?}", other),
        }
    }

    #[test]
    fn test_ssh_platform_default_ssh() {
        let config = load_config_str(
            r#"
            [platform]
            type = "ssh"
            hosts = ["a", "b"]
            "#,
        )
        .unwrap();

        match config.platform {
            PlatformConfig::Ssh(ssh) => {
                assert_eq!(ssh.hosts, vec!["a", "b"]);
                assert_eq!(ssh.ssh[0], "ssh");
            }
            other => panic!("unexpected platform {:?}", other),
        }
    }

    #[test]
    fn test_unknown_platform_rejected() {
        assert!(load_config_str("[platform]\ntype = \"cloud\"").is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vvtest.toml");
        std::fs::write(&path, "[vvtest]\ntest_dir = \"out\"\npostclean = true\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.vvtest.test_dir, PathBuf::from("out"));
        assert!(config.vvtest.postclean);
    }
}
