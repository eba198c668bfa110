//! RESP codec for the client-facing protocol.
//!
//! Commands arrive either as multi-bulk arrays (`*2\r\n$4\r\nLLEN\r\n...`)
//! or as inline space-separated lines. Replies use the RESP2 types.
//!
//! A framing error consumes the offending line and surfaces as
//! [`RespError::Protocol`]; the stream stays usable for the next command.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of a bulk string argument (16 MiB).
pub const MAX_BULK_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of a single protocol line.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Maximum number of elements in a multi-bulk request.
pub const MAX_ARGS: usize = 1024;

#[derive(Debug, Error)]
pub enum RespError {
    /// Malformed framing. Recoverable.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The peer closed the stream.
    #[error("connection closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed client command. The first argument is the command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(args: Vec<Vec<u8>>) -> Self {
        Self { args }
    }

    /// Upper-cased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[Vec<u8>] {
        self.args.get(1..).unwrap_or_default()
    }
}

/// Read the next command, skipping blank lines.
pub async fn read_command<R>(reader: &mut R) -> Result<Command, RespError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            continue;
        }

        if line[0] != b'*' {
            let args: Vec<Vec<u8>> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|part| !part.is_empty())
                .map(<[u8]>::to_vec)
                .collect();
            if args.is_empty() {
                continue;
            }
            return Ok(Command::new(args));
        }

        let count = parse_int(&line[1..])
            .ok_or_else(|| RespError::Protocol("invalid multibulk length".to_string()))?;
        if count <= 0 {
            continue;
        }
        if count > MAX_ARGS as i64 {
            return Err(RespError::Protocol("invalid multibulk length".to_string()));
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            args.push(read_bulk(reader).await?);
        }
        return Ok(Command::new(args));
    }
}

async fn read_bulk<R>(reader: &mut R) -> Result<Vec<u8>, RespError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let Some((&b'$', len)) = line.split_first() else {
        return Err(RespError::Protocol(format!(
            "expected '$', got '{}'",
            line.first().map(|b| *b as char).unwrap_or(' ')
        )));
    };
    let len = parse_int(len)
        .filter(|len| (0..=MAX_BULK_SIZE as i64).contains(len))
        .ok_or_else(|| RespError::Protocol("invalid bulk length".to_string()))? as usize;

    let mut data = vec![0u8; len + 2];
    read_exact(reader, &mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(RespError::Protocol("bulk string not terminated by CRLF".to_string()));
    }
    data.truncate(len);
    Ok(data)
}

/// Read one line without its terminator.
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, RespError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_SIZE as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Err(RespError::Closed);
    }
    if line.last() != Some(&b'\n') {
        if line.len() > MAX_LINE_SIZE {
            skip_line(reader).await?;
            return Err(RespError::Protocol("too big request line".to_string()));
        }
        return Err(RespError::Closed);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Discard input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> Result<(), RespError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), RespError>
where
    R: AsyncBufRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RespError::Closed),
        Err(e) => Err(RespError::Io(e)),
    }
}

fn parse_int(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// A RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    /// The nil bulk string (`$-1`).
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    /// An `ERR`-prefixed error reply.
    pub fn error(message: impl fmt::Display) -> Self {
        Reply::Error(format!("ERR {message}"))
    }

    pub fn simple(value: impl Into<String>) -> Self {
        Reply::Simple(value.into())
    }

    pub fn bulk(value: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(value.into())
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => encode_line(out, b'+', s),
            Reply::Error(s) => encode_line(out, b'-', s),
            Reply::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            Reply::Bulk(data) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Simple strings and errors cannot carry line breaks.
fn encode_line(out: &mut Vec<u8>, prefix: u8, text: &str) {
    out.push(prefix);
    out.extend(text.bytes().map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }));
    out.extend_from_slice(b"\r\n");
}

/// Write one reply and flush.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&reply.to_bytes()).await?;
    writer.flush().await
}

/// Encode a command as a multi-bulk request.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one reply (client side).
pub fn read_reply<'a, R>(
    reader: &'a mut R,
) -> Pin<Box<dyn Future<Output = Result<Reply, RespError>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let Some((&kind, rest)) = line.split_first() else {
            return Err(RespError::Protocol("empty reply line".to_string()));
        };
        let text = || String::from_utf8_lossy(rest).into_owned();
        let int = || {
            parse_int(rest).ok_or_else(|| RespError::Protocol(format!("invalid integer '{}'", text())))
        };
        match kind {
            b'+' => Ok(Reply::Simple(text())),
            b'-' => Ok(Reply::Error(text())),
            b':' => Ok(Reply::Integer(int()?)),
            b'$' => {
                let len = int()?;
                if len < 0 {
                    return Ok(Reply::Nil);
                }
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= MAX_BULK_SIZE)
                    .ok_or_else(|| RespError::Protocol("invalid bulk length".to_string()))?;
                let mut data = vec![0u8; len + 2];
                read_exact(reader, &mut data).await?;
                data.truncate(len);
                Ok(Reply::Bulk(data))
            }
            b'*' => {
                let count = int()?;
                if count < 0 {
                    return Ok(Reply::Nil);
                }
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(read_reply(&mut *reader).await?);
                }
                Ok(Reply::Array(items))
            }
            other => Err(RespError::Protocol(format!(
                "unexpected reply type '{}'",
                other as char
            ))),
        }
    })
}
