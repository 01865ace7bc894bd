use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Create a spinner with consistent styling.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb
}

/// Run an operation with a spinner, showing success/failure.
///
/// The operation gets the bar so it can report progress with `set_message`;
/// the final line always shows the original message.
pub fn with_spinner<T, E, F>(msg: &str, op: F) -> Result<T, E>
where
    F: FnOnce(&ProgressBar) -> Result<T, E>,
{
    let pb = create_spinner(msg);
    let result = op(&pb);
    match &result {
        Ok(_) => pb.finish_with_message(format!("✔ {}", msg)),
        Err(_) => pb.finish_with_message(format!("✘ {}", msg)),
    }
    result
}
