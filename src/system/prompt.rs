// src/system/prompt.rs

use dialoguer::{Confirm, Input, Password, theme::ColorfulTheme};
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    /// The user closed the input (Ctrl+D) or interrupted the prompt.
    #[error("Input ended while prompting.")]
    EndOfInput,
    #[error("Could not read from the terminal: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for PromptError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::Interrupted => Self::EndOfInput,
            _ => Self::Io(e),
        }
    }
}

impl From<dialoguer::Error> for PromptError {
    fn from(e: dialoguer::Error) -> Self {
        io::Error::from(e).into()
    }
}

/// Interactive questions asked during a run.
pub trait Prompter: Send + Sync {
    /// Asks for a secret without echoing it. An empty answer is returned as-is.
    fn password(&self, prompt: &str) -> Result<String, PromptError>;
    /// Asks for a line of text. An empty answer is returned as-is.
    fn input(&self, prompt: &str) -> Result<String, PromptError>;
    /// Asks a yes/no question that defaults to no.
    fn confirm(&self, question: &str) -> Result<bool, PromptError>;
}

/// Terminal prompts rendered with `dialoguer`.
#[derive(Default)]
pub struct TerminalPrompter {
    theme: ColorfulTheme,
}

impl std::fmt::Debug for TerminalPrompter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalPrompter").finish_non_exhaustive()
    }
}

impl TerminalPrompter {
    /// Creates a prompter using the colorful theme.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prompter for TerminalPrompter {
    fn password(&self, prompt: &str) -> Result<String, PromptError> {
        Ok(Password::with_theme(&self.theme)
            .with_prompt(prompt.trim_end_matches([':', ' ']))
            .allow_empty_password(true)
            .interact()?)
    }

    fn input(&self, prompt: &str) -> Result<String, PromptError> {
        Ok(Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt.trim_end_matches([':', ' ']))
            .allow_empty(true)
            .interact_text()?)
    }

    fn confirm(&self, question: &str) -> Result<bool, PromptError> {
        Ok(Confirm::with_theme(&self.theme)
            .with_prompt(question)
            .default(false)
            .interact()?)
    }
}
