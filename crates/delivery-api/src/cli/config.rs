//! `dsvc config`: print the effective configuration.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use delivery_infra::config::{load_config, load_config_strict, to_toml};

/// Show the configuration loaded from `path`.
///
/// With `check`, a missing or invalid file is an error instead of falling
/// back to defaults.
pub async fn show(path: &Path, check: bool, json: bool) -> Result<()> {
    let config = if check {
        load_config_strict(path)
            .await
            .with_context(|| format!("configuration check failed for {}", path.display()))?
    } else {
        load_config(path).await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!();
    if check {
        println!(
            "  {} {} is valid",
            style("✓").green(),
            style(path.display()).cyan()
        );
    } else {
        println!("  {} {}", style("Config:").dim(), style(path.display()).dim());
    }
    println!();
    println!("{}", to_toml(&config).context("failed to render configuration")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn check_fails_on_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = show(&tmp.path().join("delivery.toml"), true, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("configuration check failed"));
    }

    #[tokio::test]
    async fn show_without_check_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        assert!(show(&tmp.path().join("delivery.toml"), false, true).await.is_ok());
    }
}
