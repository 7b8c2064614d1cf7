use std::io::{self, BufRead, Write};

use crate::error::AlignError;

/// Source of interactive input. The session only ever asks for one trimmed
/// line at a time; `None` means the channel is closed.
pub trait InputProvider {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

/// Production input: prompt on stdout, read one line from stdin.
pub struct StdinPrompter;

impl InputProvider for StdinPrompter {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        print!("{}", prompt);
        io::stdout().flush()?;
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            println!();
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

/// Present a numbered menu and keep asking until the answer parses. A menu
/// entry can be picked by number, by its full label or by its first word.
/// A closed input channel counts as an abort.
pub fn menu(
    input: &mut dyn InputProvider,
    title: &str,
    options: &[&str],
) -> Result<usize, AlignError> {
    println!("{}", title);
    for (i, label) in options.iter().enumerate() {
        println!("  [{}] {}", i + 1, label);
    }
    loop {
        let Some(line) = input.read_line("choice> ")? else {
            return Err(AlignError::UserAborted);
        };
        let answer = line.trim();
        if let Ok(n) = answer.parse::<usize>() {
            if (1..=options.len()).contains(&n) {
                return Ok(n - 1);
            }
        }
        if let Some(i) = options
            .iter()
            .position(|label| label.eq_ignore_ascii_case(answer))
        {
            return Ok(i);
        }
        if !answer.is_empty() {
            if let Some(i) = options.iter().position(|label| {
                label
                    .split_whitespace()
                    .next()
                    .map(|word| word.eq_ignore_ascii_case(answer))
                    .unwrap_or(false)
            }) {
                return Ok(i);
            }
        }
        println!("[warn] unrecognized choice '{}'", answer);
    }
}

/// Ask for one value. An empty line means "keep the current value" and maps
/// to `None`; a closed input channel counts as an abort.
pub fn prompt_value(
    input: &mut dyn InputProvider,
    prompt: &str,
) -> Result<Option<String>, AlignError> {
    let Some(line) = input.read_line(prompt)? else {
        return Err(AlignError::UserAborted);
    };
    let answer = line.trim();
    if answer.is_empty() {
        Ok(None)
    } else {
        Ok(Some(answer.to_string()))
    }
}

/// Replays a fixed script of answers; used to drive sessions in tests.
#[cfg(test)]
pub struct ScriptedPrompter {
    feed: std::collections::VecDeque<String>,
    pub seen: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedPrompter {
            feed: lines.into_iter().map(Into::into).collect(),
            seen: Vec::new(),
        }
    }
}

#[cfg(test)]
impl InputProvider for ScriptedPrompter {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.seen.push(prompt.to_string());
        Ok(self.feed.pop_front())
    }
}
