//! Interpretation of stdin lines.

/// What one line of input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Speak this text.
    Speak(String),
    /// Pause the current utterance.
    Stop,
    /// Exit.
    Quit,
    /// Nothing to do.
    Blank,
}

/// Classify one line. Commands are matched after trimming; text is passed
/// through as typed.
pub fn parse_line(line: &str) -> Input {
    match line.trim() {
        "" => Input::Blank,
        ":stop" => Input::Stop,
        ":quit" | ":q" => Input::Quit,
        _ => Input::Speak(line.to_string()),
    }
}
