use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown on stderr while a long step runs. Hidden when stderr is not a terminal.
pub struct Progress {
    spinner: Option<ProgressBar>,
    enabled: bool,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self { spinner: None, enabled }
    }

    pub fn spinner(&mut self, message: &str) {
        self.stop_and_clear();
        if !self.enabled {
            return;
        }

        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(spinner);
    }

    pub fn stop_and_clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop_and_clear();
    }
}
