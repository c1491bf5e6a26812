//! Interactive input for encryption keys.

use dialoguer::theme::ColorfulTheme;
use dialoguer::Password;
use zeroize::Zeroizing;

use crate::error::{HeimdellError, Result};

/// Shortest encryption key accepted when encrypting.
pub const MIN_ENCRYPTION_KEY_LEN: usize = 7;

/// Asks the user for an encryption key.
pub trait KeyPrompt {
    /// Ask for the key that unlocks existing credentials.
    ///
    /// `error` is the outcome of the previous attempt, shown above the
    /// prompt when present.
    fn prompt_key(&mut self, message: &str, error: Option<&str>) -> Result<Zeroizing<String>>;
}

/// Masked terminal input via `dialoguer`.
pub struct TerminalPrompt {
    theme: ColorfulTheme,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }

    /// Ask for a new encryption key, twice, enforcing the minimum length.
    pub fn prompt_new_key(&self) -> Result<Zeroizing<String>> {
        Password::with_theme(&self.theme)
            .with_prompt(format!(
                "Choose an encryption key (minimum {MIN_ENCRYPTION_KEY_LEN} characters)"
            ))
            .with_confirmation("Re-enter encryption key", "Encryption keys do not match")
            .validate_with(|input: &String| -> std::result::Result<(), String> {
                if input.chars().count() >= MIN_ENCRYPTION_KEY_LEN {
                    Ok(())
                } else {
                    Err(format!(
                        "Encryption key must be at least {MIN_ENCRYPTION_KEY_LEN} characters long"
                    ))
                }
            })
            .interact()
            .map(Zeroizing::new)
            .map_err(|e| HeimdellError::Prompt(e.to_string()))
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPrompt for TerminalPrompt {
    fn prompt_key(&mut self, message: &str, error: Option<&str>) -> Result<Zeroizing<String>> {
        if let Some(error) = error {
            eprintln!("⚠ {error}. Please try again.");
        }

        Password::with_theme(&self.theme)
            .with_prompt(message)
            .interact()
            .map(Zeroizing::new)
            .map_err(|e| HeimdellError::Prompt(e.to_string()))
    }
}
