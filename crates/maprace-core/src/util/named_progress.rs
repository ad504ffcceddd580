use indicatif::ProgressStyle;

/// Extension trait for creating named progress indicators.
pub trait NamedProgress {
    /// Creates a spinner style with a name label, for loops without a known length.
    ///
    /// # Arguments
    ///
    /// * `name` - Label to display with the spinner
    fn named_spinner(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_spinner(name: &str) -> Self {
        let fmt = format!("{:<31} ", name) + "{spinner:.cyan} {human_pos} [{elapsed_precise}] {msg}";
        ProgressStyle::default_spinner()
            .template(&fmt)
            .unwrap_or(ProgressStyle::default_spinner())
    }
}
