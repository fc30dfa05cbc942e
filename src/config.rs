use std::env;
use std::path::PathBuf;

use crate::cli::Cli;

/// Log file used when neither the CLI nor the environment names one.
pub const DEFAULT_LOG_FILE: &str = "treeswap.log";

/// Defaults sourced from `TREESWAP_*` environment variables. Explicit CLI
/// flags always win over these.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub log_path: Option<PathBuf>,
    pub threads: Option<usize>,
    pub exclude: Vec<String>,
}

pub fn from_env() -> EnvOverrides {
    read(|key| env::var(key).ok())
}

fn read(get: impl Fn(&str) -> Option<String>) -> EnvOverrides {
    EnvOverrides {
        log_path: get("TREESWAP_LOG").map(PathBuf::from),
        threads: get("TREESWAP_THREADS").and_then(|v| parse_usize(&v)),
        exclude: get("TREESWAP_EXCLUDE")
            .map(|v| parse_list(&v))
            .unwrap_or_default(),
    }
}

/// Fill gaps in the parsed CLI from the environment.
pub fn apply(cli: &mut Cli, overrides: EnvOverrides) {
    if cli.log_path.is_none() {
        cli.log_path = overrides.log_path;
    }
    if cli.threads.is_none() {
        cli.threads = overrides.threads;
    }
    if cli.exclude.is_empty() {
        cli.exclude = overrides.exclude;
    }
}

fn parse_usize(val: &str) -> Option<usize> {
    val.trim().parse::<usize>().ok()
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn env_with(pairs: &[(&str, &str)]) -> EnvOverrides {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        read(move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
    }

    #[test]
    fn reads_known_variables() {
        let overrides = env_with(&[
            ("TREESWAP_LOG", "/tmp/t.log"),
            ("TREESWAP_THREADS", "8"),
            ("TREESWAP_EXCLUDE", r"\.cfg$, \.ini$"),
        ]);
        assert_eq!(overrides.log_path, Some(PathBuf::from("/tmp/t.log")));
        assert_eq!(overrides.threads, Some(8));
        assert_eq!(overrides.exclude, vec![r"\.cfg$", r"\.ini$"]);
    }

    #[test]
    fn ignores_unparseable_values() {
        let overrides = env_with(&[("TREESWAP_THREADS", "many"), ("TREESWAP_EXCLUDE", " , ")]);
        assert_eq!(overrides.threads, None);
        assert!(overrides.exclude.is_empty());
    }

    #[test]
    fn cli_flags_win_over_environment() {
        let mut cli = Cli::parse_from([
            "treeswap",
            "--install-path",
            "/tmp/install",
            "--threads",
            "2",
        ]);
        apply(
            &mut cli,
            EnvOverrides {
                log_path: Some(PathBuf::from("/tmp/env.log")),
                threads: Some(16),
                exclude: vec![r"\.cfg$".into()],
            },
        );

        assert_eq!(cli.threads, Some(2));
        assert_eq!(cli.log_path, Some(PathBuf::from("/tmp/env.log")));
        assert_eq!(cli.exclude, vec![r"\.cfg$"]);
    }
}
