//! Cat command - print an object through the cache

use crate::cli::args::CatArgs;
use crate::config::Config;
use crate::directory::BlobDirectory;
use crate::error::{BlobdirError, BlobdirResult};
use tokio::io::AsyncWriteExt;

/// Execute the cat command
pub async fn execute(args: CatArgs, config: &Config) -> BlobdirResult<()> {
    let directory = BlobDirectory::from_config(config).await?;
    let mut input = directory.open_input(&args.name).await?;

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; config.cache.chunk_size.max(1)];
    let mut remaining = input.length();

    while remaining > 0 {
        let take = remaining.min(buf.len() as u64) as usize;
        input.read_bytes(&mut buf[..take]).await?;
        stdout
            .write_all(&buf[..take])
            .await
            .map_err(|e| BlobdirError::io("writing to stdout", e))?;
        remaining -= take as u64;
    }

    stdout
        .flush()
        .await
        .map_err(|e| BlobdirError::io("flushing stdout", e))?;
    input.close().await
}
