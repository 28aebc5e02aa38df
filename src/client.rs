//! One-shot client operations backing the `cent` CLI.
//!
//! Thin wrappers over [`Agent`] that add input/output plumbing: `-`
//! means stdin/stdout, a directory output writes the payload under its
//! carried file name, and listings render as JSON or a text table.

use crate::agent::{Agent, AgentError};
use crate::logging;
use crate::message::MessageKind;
use crate::persist::MessageMeta;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug)]
pub enum ClientError {
    Agent(AgentError),
    Io(std::io::Error),
    Encode(String),
    BadArgument(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Agent(error) => write!(f, "{error}"),
            ClientError::Io(error) => write!(f, "io error: {error}"),
            ClientError::Encode(message) => write!(f, "encode error: {message}"),
            ClientError::BadArgument(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<AgentError> for ClientError {
    fn from(error: AgentError) -> Self {
        ClientError::Agent(error)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(error: std::io::Error) -> Self {
        ClientError::Io(error)
    }
}

/// Output format for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Text,
}

impl Format {
    pub fn parse(s: &str) -> Result<Format, ClientError> {
        match s {
            "" | "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(ClientError::BadArgument(format!("unknown format: {other}"))),
        }
    }
}

fn write_output(data: &[u8], out: &str, file_name: Option<&str>, id: &str) -> Result<(), ClientError> {
    if out.is_empty() || out == "-" {
        std::io::stdout().write_all(data)?;
        return Ok(());
    }
    let out_path = Path::new(out);
    if out_path.is_dir() {
        let name = file_name.unwrap_or(id);
        std::fs::write(out_path.join(name), data)?;
        return Ok(());
    }
    std::fs::write(out_path, data)?;
    Ok(())
}

fn read_input(input: &str) -> Result<Vec<u8>, ClientError> {
    if input.is_empty() || input == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        return Ok(data);
    }
    Ok(std::fs::read(input)?)
}

fn meta_table(metas: &[MessageMeta]) -> String {
    let mut table = String::from("ID\tChannel\tSize\tCreatedAt\n");
    for meta in metas {
        table.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            meta.id,
            meta.channel,
            meta.size,
            logging::format_unix(meta.created_at)
        ));
    }
    table
}

/// List pending messages and render them to `out`.
pub fn list_messages(
    agent: &Agent,
    channel: &str,
    format: Format,
    out: &str,
) -> Result<(), ClientError> {
    let metas = agent.list_messages(channel)?;
    if metas.is_empty() {
        return Ok(());
    }
    let rendered = match format {
        Format::Json => serde_json::to_vec(&metas)
            .map_err(|error| ClientError::Encode(error.to_string()))?,
        Format::Text => meta_table(&metas).into_bytes(),
    };
    write_output(&rendered, out, None, "")?;
    Ok(())
}

fn oldest_pending(agent: &Agent, channel: &str) -> Result<Option<MessageMeta>, ClientError> {
    let mut metas = agent.list_messages(channel)?;
    metas.sort_by_key(|meta| meta.created_at);
    Ok(metas.into_iter().next())
}

/// Fetch and decrypt one message.  With an empty id the oldest pending
/// message is fetched and its id printed to stderr.  Returns the id that
/// was fetched, or `None` when the inbox was empty.
pub fn get_message(
    agent: &Agent,
    channel: &str,
    id: &str,
    out: &str,
) -> Result<Option<String>, ClientError> {
    let id = if id.is_empty() {
        let Some(meta) = oldest_pending(agent, channel)? else {
            return Ok(None);
        };
        eprintln!("id: {}", meta.id);
        meta.id
    } else {
        id.to_string()
    };
    let raw = agent.get_message(channel, &id)?;
    let text = String::from_utf8(raw)
        .map_err(|_| ClientError::Encode("envelope is not utf-8".to_string()))?;
    let opened = agent.decrypt_envelope(&text)?;
    write_output(&opened.data, out, opened.file_name.as_deref(), &id)?;
    Ok(Some(id))
}

/// Confirm (delete) a message without decrypting it.
pub fn confirm_message(agent: &Agent, channel: &str, id: &str) -> Result<(), ClientError> {
    if id.is_empty() {
        return Err(ClientError::BadArgument("confirm requires --id".to_string()));
    }
    agent.confirm_message(channel, id)?;
    Ok(())
}

/// Read plaintext from `input` and send it.  When no recipient is
/// given, any key in the local chain is used.
pub fn send_message(
    agent: &Agent,
    channel: &str,
    recipient_key_id: Option<&str>,
    kind: MessageKind,
    file_name: &str,
    input: &str,
) -> Result<String, ClientError> {
    let recipient = match recipient_key_id {
        Some(key_id) if !key_id.is_empty() => key_id.to_string(),
        _ => agent.any_recipient().ok_or_else(|| {
            ClientError::BadArgument("no recipient key in the local chain".to_string())
        })?,
    };
    let data = read_input(input)?;
    let named = match kind {
        MessageKind::File if !file_name.is_empty() => Some(file_name),
        MessageKind::File => {
            return Err(ClientError::BadArgument(
                "file messages require --file".to_string(),
            ))
        }
        MessageKind::Bytes => None,
    };
    let id = agent.send_message(channel, &recipient, kind, named, &data)?;
    Ok(id)
}

/// Used by `cent send --to-key`: load a recipient public key from a
/// file, or stdin when the argument is `-`.
pub fn load_recipient_key(agent: &Agent, source: &str) -> Result<String, ClientError> {
    let pem = read_input(source)?;
    Ok(agent.add_recipient_key(&pem)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert_eq!(Format::parse("text").unwrap(), Format::Text);
        assert_eq!(Format::parse("").unwrap(), Format::Text);
        assert!(Format::parse("yaml").is_err());
    }

    #[test]
    fn renders_meta_table() {
        let metas = vec![MessageMeta {
            id: "u1".to_string(),
            channel: "default".to_string(),
            pub_key_id: "abc".to_string(),
            size: 42,
            created_at: 0,
        }];
        let table = meta_table(&metas);
        assert!(table.starts_with("ID\tChannel\tSize\tCreatedAt\n"));
        assert!(table.contains("u1\tdefault\t42\t19700101T00:00:00"));
    }

    #[test]
    fn write_output_to_file_and_dir() {
        let dir = std::env::temp_dir().join(format!("centauri-client-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();

        let file = dir.join("direct.bin");
        write_output(b"data", file.to_str().unwrap(), None, "u1").unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"data");

        write_output(b"payload", dir.to_str().unwrap(), Some("report.pdf"), "u1").unwrap();
        assert_eq!(std::fs::read(dir.join("report.pdf")).unwrap(), b"payload");

        write_output(b"anon", dir.to_str().unwrap(), None, "u2").unwrap();
        assert_eq!(std::fs::read(dir.join("u2")).unwrap(), b"anon");
    }
}
