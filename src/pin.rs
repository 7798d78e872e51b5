//! PIN acquisition.
//!
//! Prompting goes through [`PinPrompt`] so that the lifecycle code never talks
//! to a terminal directly. The CLI uses [`TerminalPrompt`]; tests feed answers
//! through [`ScriptedPins`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum PinError {
    #[error("PIN entries do not match")]
    Mismatch,
    #[error("failed to read PIN: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = PinError> = core::result::Result<T, E>;

/// A PIN as typed. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(Zeroizing<String>);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(Zeroizing::new(pin.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

pub trait PinPrompt {
    /// Reads one secret entry without echoing it.
    fn read_secret(&mut self, prompt: &str) -> io::Result<Zeroizing<String>>;
}

impl<T: PinPrompt + ?Sized> PinPrompt for Box<T> {
    fn read_secret(&mut self, prompt: &str) -> io::Result<Zeroizing<String>> {
        (**self).read_secret(prompt)
    }
}

/// Asks for an optional new PIN. An empty first entry means "no PIN"; anything
/// else has to be confirmed by an identical second entry.
pub fn ask_new_pin(prompt: &mut dyn PinPrompt) -> Result<Option<Pin>> {
    let first = prompt.read_secret("Set an additional PIN (Enter for none): ")?;
    if first.is_empty() {
        return Ok(None);
    }
    let second = prompt.read_secret("Repeat PIN: ")?;
    if first != second {
        return Err(PinError::Mismatch);
    }
    Ok(Some(Pin(first)))
}

/// Asks for the PIN guarding an existing sealed key.
pub fn ask_existing_pin(prompt: &mut dyn PinPrompt, label: &str) -> Result<Pin> {
    let pin = prompt.read_secret(&format!("PIN for {}: ", label))?;
    Ok(Pin(pin))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PinPrompt for TerminalPrompt {
    fn read_secret(&mut self, prompt: &str) -> io::Result<Zeroizing<String>> {
        rpassword::prompt_password(prompt).map(Zeroizing::new)
    }
}

/// Replays a fixed list of entries, failing once they run out.
#[derive(Debug, Default, Clone)]
pub struct ScriptedPins {
    entries: VecDeque<String>,
    prompts: Vec<String>,
}

impl ScriptedPins {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
            prompts: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push_back(entry.into());
    }

    /// Prompts shown so far, in order.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

impl PinPrompt for ScriptedPins {
    fn read_secret(&mut self, prompt: &str) -> io::Result<Zeroizing<String>> {
        self.prompts.push(prompt.to_owned());
        self.entries
            .pop_front()
            .map(Zeroizing::new)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted PIN entry left")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn empty_entry_means_no_pin() -> Result<()> {
        let mut pins = ScriptedPins::new([""]);
        assert!(ask_new_pin(&mut pins)?.is_none());
        assert_eq!(pins.prompts().len(), 1);
        Ok(())
    }

    #[test]
    fn confirmed_pin() -> Result<()> {
        let mut pins = ScriptedPins::new(["1234", "1234"]);
        assert_eq!(ask_new_pin(&mut pins)?, Some(Pin::new("1234")));
        Ok(())
    }

    #[test]
    fn mismatched_confirmation() {
        let mut pins = ScriptedPins::new(["1234", "4321"]);
        assert!(matches!(ask_new_pin(&mut pins), Err(PinError::Mismatch)));
    }

    #[test]
    fn exhausted_script_is_an_io_error() {
        let mut pins = ScriptedPins::new(["1234"]);
        assert!(matches!(ask_new_pin(&mut pins), Err(PinError::Io(_))));
    }
}
