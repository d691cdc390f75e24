//! Put command - publish a local file

use crate::cli::args::PutArgs;
use crate::config::Config;
use crate::directory::BlobDirectory;
use crate::error::{BlobdirError, BlobdirResult};
use crate::ui::{TaskSpinner, UiContext};
use bytes::Bytes;
use tokio::fs;

/// Execute the put command
pub async fn execute(args: PutArgs, config: &Config) -> BlobdirResult<()> {
    let ctx = UiContext::detect();

    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BlobdirError::User(format!("Cannot derive a name from {}", args.file.display()))
            })?,
    };

    let data = fs::read(&args.file)
        .await
        .map_err(|e| BlobdirError::io(format!("reading {}", args.file.display()), e))?;
    let size = data.len();

    let directory = BlobDirectory::from_config(config).await?;

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Publishing {}...", name));
    match directory.publish(&name, Bytes::from(data)).await {
        Ok(()) => {
            spinner.stop(&format!("Published {} ({} bytes)", name, size));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error(&format!("Failed to publish {}", name));
            Err(e)
        }
    }
}
