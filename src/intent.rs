//! Keyword matching for chat messages. Deliberately dumb: the assistant is scripted.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Start a training run, optionally naming the target column in the same breath.
    StartTraining { target: Option<String> },
    SelectTarget(String),
    CheckStatus,
    Deploy,
    Reset,
    Help,
    Other,
}

const RESET_PHRASES: &[&str] = &["start over", "reset", "clear chat", "new session"];
const STATUS_PHRASES: &[&str] = &[
    "status",
    "progress",
    "how is",
    "how's",
    "done yet",
    "finished yet",
    "still training",
];
const TRAIN_PHRASES: &[&str] = &["train", "build a model", "build model", "fit a model", "go ahead"];
const TARGET_PHRASES: &[&str] = &["predict", "target", "forecast", "classify"];
const HELP_PHRASES: &[&str] = &["help", "what can you", "how do i"];

fn mentions(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

/// Longest dataset column named in `text`, compared case-insensitively on word boundaries.
pub fn find_column(text: &str, columns: &[String]) -> Option<String> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    columns
        .iter()
        .filter(|column| {
            let column = column.to_lowercase();
            if column.contains(char::is_whitespace) {
                lowered.contains(&column)
            } else {
                words.contains(&column.as_str())
            }
        })
        .max_by_key(|column| column.len())
        .cloned()
}

pub fn classify(message: &str, columns: &[String]) -> Intent {
    let text = message.trim().to_lowercase();

    if mentions(&text, RESET_PHRASES) {
        return Intent::Reset;
    }
    if mentions(&text, STATUS_PHRASES) {
        return Intent::CheckStatus;
    }
    if text.contains("deploy") {
        return Intent::Deploy;
    }
    if mentions(&text, TRAIN_PHRASES) {
        return Intent::StartTraining {
            target: find_column(&text, columns),
        };
    }
    if let Some(column) = find_column(&text, columns) {
        return Intent::SelectTarget(column);
    }
    if mentions(&text, TARGET_PHRASES) || mentions(&text, HELP_PHRASES) {
        return Intent::Help;
    }
    Intent::Other
}
