//! CLI utilities for the demo client.
//!
//! Every line typed at the prompt becomes one chat packet, except for `/`-prefixed
//! commands.
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Packet kind carrying one UTF-8 chat line.
pub const PACKET_CHAT: u32 = 1;

/// Possible inputs from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Quit command `/quit`, or end of input.
    Quit,
    /// Line to send.
    Chat(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to access terminal: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Prompt user for one line of input.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Input, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Input::Quit);
    }

    match s.trim_end() {
        "/quit" => Ok(Input::Quit),
        s if !s.starts_with('/') => Ok(Input::Chat(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}
