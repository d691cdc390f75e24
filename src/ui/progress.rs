//! Spinner with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
                spinner.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(120));
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Update the spinner message
    pub fn message(&mut self, message: &str) {
        if let Some(ref spinner) = self.spinner {
            spinner.set_message(message.to_string());
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        self.finish(style("✓").green(), style("[OK]").green(), message);
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        self.finish(style("✗").red(), style("[FAIL]").red(), message);
    }

    /// Stop with warning message
    pub fn stop_warn(&mut self, message: &str) {
        self.finish(style("!").yellow(), style("[WARN]").yellow(), message);
    }

    fn finish(
        &mut self,
        fancy: console::StyledObject<&str>,
        plain: console::StyledObject<&str>,
        message: &str,
    ) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        if self.interactive {
            println!("{} {}", fancy, message);
        } else {
            println!("{} {}", plain, message);
        }
    }
}

impl Drop for TaskSpinner {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}
