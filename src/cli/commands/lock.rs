//! Lock command - obtain, probe or break a lease lock

use crate::cli::args::{LockAction, LockArgs};
use crate::config::Config;
use crate::directory::BlobDirectory;
use crate::error::{BlobdirError, BlobdirResult};
use crate::lock::LockState;
use crate::ui::{self, TaskSpinner, UiContext};
use std::time::Duration;
use tracing::debug;

/// Execute the lock command
pub async fn execute(args: LockArgs, config: &Config) -> BlobdirResult<()> {
    let directory = BlobDirectory::from_config(config).await?;
    let ctx = UiContext::detect();

    match args.action {
        LockAction::Obtain { name, hold, wait } => {
            obtain(&directory, &ctx, &name, Duration::from_secs(hold), Duration::from_secs(wait))
                .await
        }
        LockAction::Probe { name } => {
            let locked = directory.make_lock(&name).is_locked().await;
            let state = if locked { "locked" } else { "unlocked" };
            ui::key_value_status(&ctx, &name, state, !locked);
            Ok(())
        }
        LockAction::Break { name } => {
            directory.make_lock(&name).break_lock().await?;
            ui::step_ok_detail(&ctx, "Lock broken", &name);
            Ok(())
        }
    }
}

async fn obtain(
    directory: &BlobDirectory,
    ctx: &UiContext,
    name: &str,
    hold: Duration,
    wait: Duration,
) -> BlobdirResult<()> {
    let lock = directory.make_lock(name);

    let obtained = if wait.is_zero() {
        lock.obtain().await
    } else {
        lock.obtain_timeout(wait).await
    };
    if !obtained {
        return Err(BlobdirError::User(format!(
            "Lock {} is held elsewhere",
            name
        )));
    }
    ui::step_ok_detail(ctx, "Lock obtained", name);

    if !hold.is_zero() {
        let mut spinner = TaskSpinner::new(ctx);
        spinner.start(&format!("Holding {} for {}s...", name, hold.as_secs()));
        tokio::select! {
            _ = tokio::time::sleep(hold) => {}
            _ = tokio::signal::ctrl_c() => debug!("interrupted, releasing lock"),
        }
        match lock.state() {
            LockState::Broken => spinner.stop_warn("Lease was broken before release"),
            state => spinner.stop(&format!("Held {} ({})", name, state)),
        }
    }

    lock.release().await?;
    ui::step_ok_detail(ctx, "Lock released", name);
    Ok(())
}
