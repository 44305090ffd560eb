use std::{
    fmt,
    io::{self, BufRead, Write},
    str::FromStr,
};

use thiserror::Error;

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const HEADER_SEPARATOR: char = ',';

/// Operation requested by a client. The handler decides what each one means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Load,
    Save,
    Delete,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Load => "LOAD",
            Command::Save => "SAVE",
            Command::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOAD" => Ok(Command::Load),
            "SAVE" => Ok(Command::Save),
            "DELETE" => Ok(Command::Delete),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("request header `{0}` is missing the command separator")]
    MissingSeparator(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("payload must fit on a single line")]
    EmbeddedNewline,
}

/// A request as it travels on the wire, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub command: Command,
    pub type_id: String,
    pub payload: String,
}

/// A reply as it travels on the wire, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub type_id: String,
    pub payload: String,
}

/// Splits `COMMAND,type-id` into its parts.
pub fn parse_header(line: &str) -> Result<(Command, String), ProtocolError> {
    let (command, type_id) = line
        .split_once(HEADER_SEPARATOR)
        .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;
    Ok((command.parse()?, type_id.to_string()))
}

/// Reads one request. `Ok(None)` means the peer closed the stream, even if it
/// did so between the header and the payload.
pub fn read_request<R>(reader: &mut R) -> Result<Option<RequestFrame>, ProtocolError>
where
    R: BufRead,
{
    let Some(header) = read_header_line(reader)? else {
        return Ok(None);
    };
    let (command, type_id) = parse_header(&header)?;
    let Some(payload) = read_line(reader)? else {
        return Ok(None);
    };

    Ok(Some(RequestFrame {
        command,
        type_id,
        payload,
    }))
}

pub fn write_request<W>(
    writer: &mut W,
    command: Command,
    type_id: &str,
    payload: &str,
) -> Result<(), ProtocolError>
where
    W: Write,
{
    ensure_single_line(type_id)?;
    ensure_single_line(payload)?;
    let encoded = format!("{command}{HEADER_SEPARATOR}{type_id}\n{payload}\n");
    write_frame(writer, encoded.as_bytes())
}

pub fn read_response<R>(reader: &mut R) -> Result<Option<ResponseFrame>, ProtocolError>
where
    R: BufRead,
{
    let Some(type_id) = read_header_line(reader)? else {
        return Ok(None);
    };
    let Some(payload) = read_line(reader)? else {
        return Ok(None);
    };
    Ok(Some(ResponseFrame { type_id, payload }))
}

pub fn write_response<W>(writer: &mut W, type_id: &str, payload: &str) -> Result<(), ProtocolError>
where
    W: Write,
{
    ensure_single_line(type_id)?;
    ensure_single_line(payload)?;
    let encoded = format!("{type_id}\n{payload}\n");
    write_frame(writer, encoded.as_bytes())
}

fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), ProtocolError> {
    // Both lines go out in one write so the peer never sees half an envelope.
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

fn ensure_single_line(text: &str) -> Result<(), ProtocolError> {
    if text.contains(LINE_ENDINGS) {
        return Err(ProtocolError::EmbeddedNewline);
    }
    Ok(())
}

fn read_header_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    loop {
        match read_line(reader)? {
            Some(line) if line.is_empty() => continue,
            other => return Ok(other),
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}
