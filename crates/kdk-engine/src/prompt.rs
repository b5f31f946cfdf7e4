//! Interactive confirmation and selection boundary.

use std::io::{self, BufRead, Write};

use kdk_common::{KdkError, Result};

/// Blocking user interaction. Injected as a trait object so tests can script
/// answers; non-interactive call sites never touch it.
pub trait Prompt: Send + Sync {
    fn confirm(&self, question: &str) -> Result<bool>;

    /// Present numbered options and return the chosen index. Empty input
    /// takes the default.
    fn select(&self, question: &str, options: &[String], default: usize) -> Result<usize>;
}

/// Reads answers from stdin.
pub struct StdinPrompt;

impl StdinPrompt {
    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl Prompt for StdinPrompt {
    fn confirm(&self, question: &str) -> Result<bool> {
        print!("{question} [y/N]: ");
        io::stdout().flush()?;
        let answer = self.read_line()?.to_ascii_lowercase();
        Ok(matches!(answer.as_str(), "y" | "yes"))
    }

    fn select(&self, question: &str, options: &[String], default: usize) -> Result<usize> {
        println!("{question}");
        for (index, option) in options.iter().enumerate() {
            let marker = if index == default { " (default)" } else { "" };
            println!("  {}) {}{}", index + 1, option, marker);
        }
        print!("Choice [{}]: ", default + 1);
        io::stdout().flush()?;
        let answer = self.read_line()?;
        if answer.is_empty() {
            return Ok(default);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=options.len()).contains(&n) => Ok(n - 1),
            _ => Err(KdkError::Declined(format!("invalid selection '{answer}'"))),
        }
    }
}
