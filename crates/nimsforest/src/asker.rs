//! The asker seam.
//!
//! Concrete AI provider adapters live outside the core; a nim only needs one
//! synchronous operation. Adapters are expected to enforce their own
//! timeouts — the core waits.

use anyhow::Result;

/// A narrow interface to an AI provider.
pub trait Asker: Send + Sync {
    /// Submit a rendered prompt and return the provider's text response.
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// An asker that returns the prompt verbatim. Stands in where no provider is
/// wired up (CLI default, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAsker;

impl Asker for EchoAsker {
    fn ask(&self, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }
}
