//! `replychain config`: configuration management commands.

use std::path::Path;

use anyhow::{Context, bail};
use replychain_config::AppConfig;

use super::config_path;

const REDACTED: &str = "[REDACTED]";

/// Print the effective configuration as TOML, secrets redacted.
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path(path);
    let config = AppConfig::load_with_overrides(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    println!("# {}", path.display());
    println!("{}", redacted_toml(&config)?);
    Ok(())
}

/// Write the default configuration to `path`.
pub fn init(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_path(path);
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(&path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

pub fn validate(path: Option<&Path>) -> anyhow::Result<()> {
    println!("🔍 Validating configuration...");
    let path = config_path(path);

    let config = match AppConfig::load_with_overrides(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = check(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    match config.selected_model() {
        Ok(selection) => {
            let capabilities = selection.capabilities();
            println!("   Model:     {selection}");
            println!("   Images:    {}", config.effective_max_images(capabilities));
            println!("   Usernames: {}", capabilities.accept_usernames);
        }
        Err(e) => println!("   Model:     ({e})"),
    }
    println!("   Messages:  {} turns, {} chars each", config.max_messages, config.max_text);
    println!(
        "   Replies:   {}",
        if config.use_plain_responses { "plain" } else { "embeds" }
    );
    println!("   Providers: {}", config.providers.len());
    Ok(())
}

/// Problems that don't stop the config from loading but will stop replies.
fn check(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.bot_token.is_none() {
        warnings.push("No bot token set (set bot_token or DISCORD_BOT_TOKEN)".to_string());
    }

    match config.selected_model() {
        Ok(selection) => match config.provider(&selection) {
            Ok(provider) if provider.base_url.is_empty() => {
                warnings.push(format!("Provider '{}' has no base_url", selection.provider));
            }
            Ok(_) => {}
            Err(e) => warnings.push(e.to_string()),
        },
        Err(e) => warnings.push(e.to_string()),
    }

    if let Some(pattern) = &config.block_response_regex {
        if let Err(e) = regex::Regex::new(pattern) {
            warnings.push(format!("block_response_regex does not compile: {e}"));
        }
    }

    warnings
}

fn redacted_toml(config: &AppConfig) -> anyhow::Result<String> {
    let mut config = config.clone();
    if config.bot_token.is_some() {
        config.bot_token = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use replychain_config::ProviderConfig;

    fn configured() -> AppConfig {
        let mut config = AppConfig {
            bot_token: Some("discord-secret".into()),
            model: Some("openai/gpt-4o".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                base_url: "https://api.openai.com/v1".into(),
                api_key: Some("sk-secret".into()),
                extra_headers: Default::default(),
                extra_query: Default::default(),
                extra_body: Default::default(),
            },
        );
        config
    }

    #[test]
    fn show_never_prints_secrets() {
        let toml = redacted_toml(&configured()).unwrap();
        assert!(!toml.contains("discord-secret"));
        assert!(!toml.contains("sk-secret"));
        assert!(toml.contains(REDACTED));
        assert!(toml.contains("https://api.openai.com/v1"));
    }

    #[test]
    fn complete_config_has_no_warnings() {
        assert!(check(&configured()).is_empty());
    }

    #[test]
    fn missing_pieces_are_reported() {
        let config = AppConfig {
            bot_token: None,
            model: Some("lmstudio/qwen3".into()),
            block_response_regex: Some("(".into()),
            ..configured()
        };
        let warnings = check(&config);
        assert_eq!(warnings.len(), 3, "{warnings:?}");
        assert!(warnings[0].contains("bot token"));
        assert!(warnings[1].contains("lmstudio"));
        assert!(warnings[2].contains("block_response_regex"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init(Some(&path), false).unwrap();
        let written = AppConfig::load_from(&path).unwrap();
        assert_eq!(written.max_messages, AppConfig::default().max_messages);

        assert!(init(Some(&path), false).is_err());
        assert!(init(Some(&path), true).is_ok());
    }
}
