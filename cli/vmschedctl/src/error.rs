//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("API error ({status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Follow-up advice for the errors a user can act on.
    fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Api { code, .. } if code == "no_capacity" => Some(
                "No subset can take this domain. Check `vmschedctl info` for free CPUs and memory.",
            ),
            Self::Api { code, .. } if code == "already_placed" => {
                Some("Domain names are unique per host. Remove the old one first.")
            }
            Self::Api { code, .. } if code == "not_found" => {
                Some("List placed domains with `vmschedctl info`.")
            }
            Self::Api { retryable: true, .. } => {
                Some("The scheduler is stopping; retry once it is back.")
            }
            Self::Network(_) => {
                Some("Check that the scheduler is running and --url points at it.")
            }
            _ => None,
        }
    }
}

pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = err.downcast_ref::<CliError>().and_then(CliError::hint) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}
