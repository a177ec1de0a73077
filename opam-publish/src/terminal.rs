//! Terminal implementation of the core `Operator` contract.

use std::io;

use dialoguer::{Confirm, Input, Password};
use opam_publish_core::contract::Operator;
use opam_publish_core::error::PublishError;

/// Hands a url to whatever shows it to the user.
pub type UrlOpener = Box<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

pub struct TerminalOperator {
    opener: UrlOpener,
}

fn open_in_browser(url: &str) -> io::Result<()> {
    open::that(url)
}

impl TerminalOperator {
    /// Prompts on the terminal and opens urls in the desktop's default browser.
    pub fn new() -> Self {
        Self::with_opener(Box::new(open_in_browser))
    }

    pub fn with_opener(opener: UrlOpener) -> Self {
        TerminalOperator { opener }
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

fn interaction(e: dialoguer::Error) -> PublishError {
    PublishError::Interaction(e.to_string())
}

impl Operator for TerminalOperator {
    fn ask_user(&self, prompt: &str) -> Result<String, PublishError> {
        let user: String = Input::new()
            .with_prompt(prompt)
            .interact_text()
            .map_err(interaction)?;
        Ok(user.trim().to_string())
    }

    fn ask_password(&self, prompt: &str) -> Result<String, PublishError> {
        Password::new()
            .with_prompt(prompt)
            .interact()
            .map_err(interaction)
    }

    fn confirm(&self, prompt: &str) -> Result<bool, PublishError> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(interaction)
    }

    fn open_url(&self, url: &str) {
        if let Err(e) = (self.opener)(url) {
            tracing::debug!(error = ?e, url, "Could not open browser");
        }
    }
}
