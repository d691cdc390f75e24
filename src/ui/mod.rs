//! Terminal output helpers
//!
//! Styled output via `console` and spinners via `indicatif`, with plain
//! `[OK]` / `[WARN]` prefixes when not attached to a terminal.
//!
//! # Example
//!
//! ```rust,ignore
//! use blobdir::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Uploading segments.gen...");
//! spinner.stop("Published segments.gen");
//!
//! ui::key_value(&ctx, "length", "20");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    key_value, key_value_status, remark, step_error, step_ok, step_ok_detail,
    step_warn_hint,
};
pub use progress::TaskSpinner;
