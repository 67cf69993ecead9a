//! QuranLab agent: runs the policy services outside the app
//!
//! - `replay`: feeds a JSONL script of learner/expert events through the
//!   progression and correction services on an in-memory store
//! - `load_config` / `level_table`: helpers behind the CLI subcommands

pub mod replay;

use std::fmt::Write as _;
use std::path::Path;

use quranlab_policy::config::ConfigResult;
use quranlab_policy::progression::LEVEL_THRESHOLDS;
use quranlab_policy::PolicyConfig;

/// Environment defaults, overlaid by `path` when given. Always validated.
pub fn load_config(path: Option<&Path>) -> ConfigResult<PolicyConfig> {
    match path {
        Some(path) => PolicyConfig::from_toml_file(path),
        None => {
            let config = PolicyConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// The level ladder as a fixed-width table
pub fn level_table() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<6} {:>10}  {:<18} {}", "LEVEL", "POINTS", "NAME", "COLOR");
    for t in LEVEL_THRESHOLDS {
        let _ = writeln!(out, "{:<6} {:>10}  {:<18} {}", t.level, t.points, t.name, t.color);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_table_lists_every_level() {
        let table = level_table();
        assert_eq!(table.lines().count(), LEVEL_THRESHOLDS.len() + 1);
        assert!(table.lines().nth(2).unwrap().contains("1000"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "[experts]\nresponse_guarantee_minutes = 45\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.experts.response_guarantee_minutes, 45);
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "[analysis]\ncorrection_threshold = 140.0\n").unwrap();

        assert!(load_config(Some(&path)).is_err());
    }
}
