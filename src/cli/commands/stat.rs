//! Stat command - show cache state of an object

use crate::cache::CachedInput;
use crate::cli::args::{OutputFormat, StatArgs};
use crate::config::Config;
use crate::directory::BlobDirectory;
use crate::error::BlobdirResult;
use crate::ui::{self, UiContext};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Stat output for one object
#[derive(Debug, Serialize)]
pub struct ObjectStat {
    pub name: String,
    pub length: u64,
    /// Freshness before the open refreshed the cache
    pub freshness: String,
    pub was_fresh: bool,
    pub sha256: String,
    pub cache_path: String,
}

/// Execute the stat command
pub async fn execute(args: StatArgs, config: &Config) -> BlobdirResult<()> {
    let directory = BlobDirectory::from_config(config).await?;

    let freshness = directory.freshness(&args.name).await?;
    let mut input = directory.open_input(&args.name).await?;
    let sha256 = digest(&mut input, config.cache.chunk_size).await?;

    let stat = ObjectStat {
        name: args.name,
        length: input.length(),
        freshness: freshness.to_string(),
        was_fresh: freshness.is_fresh(),
        sha256,
        cache_path: input.path().display().to_string(),
    };
    input.close().await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stat)?),
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::key_value(&ctx, "name", &stat.name);
            ui::key_value(&ctx, "length", &stat.length.to_string());
            ui::key_value_status(&ctx, "freshness", &stat.freshness, stat.was_fresh);
            ui::key_value(&ctx, "sha256", &stat.sha256);
            ui::key_value(&ctx, "cache", &stat.cache_path);
        }
    }

    Ok(())
}

/// Hex SHA-256 of the input's bytes from the start
async fn digest(input: &mut CachedInput, chunk_size: usize) -> BlobdirResult<String> {
    input.seek(0).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = input.length();

    while remaining > 0 {
        let take = remaining.min(buf.len() as u64) as usize;
        input.read_bytes(&mut buf[..take]).await?;
        hasher.update(&buf[..take]);
        remaining -= take as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}
