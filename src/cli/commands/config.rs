//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, TimestampFormat};
use crate::error::{BlobdirError, BlobdirResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "store.root",
    "store.container",
    "cache.dir",
    "cache.chunk_size",
    "cache.compress_blobs",
    "cache.compressed_extensions",
    "cache.timestamp_format",
    "lock.lease_duration_secs",
    "lock.renewal_interval_secs",
    "lock.max_hold_secs",
    "remote.call_timeout_secs",
];

/// Execute the config command
pub async fn execute(
    args: ConfigArgs,
    manager: &ConfigManager,
    config: &Config,
) -> BlobdirResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> BlobdirResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> BlobdirResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());

    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> BlobdirResult<()> {
    let ctx = UiContext::detect();
    let mut config = config.clone();

    let parts: Vec<&str> = key.split('.').collect();
    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),

        ["store", "root"] => config.store.root = PathBuf::from(value),
        ["store", "container"] => config.store.container = value.to_string(),

        ["cache", "dir"] => config.cache.dir = PathBuf::from(value),
        ["cache", "chunk_size"] => config.cache.chunk_size = parse_number(value)?,
        ["cache", "compress_blobs"] => config.cache.compress_blobs = parse_bool(value)?,
        ["cache", "compressed_extensions"] => {
            config.cache.compressed_extensions = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        ["cache", "timestamp_format"] => {
            config.cache.timestamp_format = parse_timestamp_format(value)?
        }

        ["lock", "lease_duration_secs"] => config.lock.lease_duration_secs = parse_number(value)?,
        ["lock", "renewal_interval_secs"] => {
            config.lock.renewal_interval_secs = parse_number(value)?
        }
        ["lock", "max_hold_secs"] => config.lock.max_hold_secs = parse_number(value)?,

        ["remote", "call_timeout_secs"] => config.remote.call_timeout_secs = parse_number(value)?,

        _ => {
            ui::step_error(&ctx, &format!("Unknown config key: {}", key));
            ui::remark(&ctx, "Valid keys:");
            for key in VALID_KEYS {
                ui::remark(&ctx, key);
            }
            return Err(BlobdirError::User(format!("Unknown config key: {}", key)));
        }
    }

    config.validate().map_err(|reason| BlobdirError::ConfigInvalid {
        path: manager.path().to_path_buf(),
        reason,
    })?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));

    Ok(())
}

fn parse_bool(value: &str) -> BlobdirResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(BlobdirError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> BlobdirResult<T> {
    value
        .parse()
        .map_err(|_| BlobdirError::User(format!("Invalid number: {}", value)))
}

fn parse_timestamp_format(value: &str) -> BlobdirResult<TimestampFormat> {
    match value {
        "dotnet-ticks" => Ok(TimestampFormat::DotnetTicks),
        "unix-millis" => Ok(TimestampFormat::UnixMillis),
        _ => Err(BlobdirError::User(format!(
            "Invalid timestamp format: {}. Use dotnet-ticks or unix-millis",
            value
        ))),
    }
}
