//! Server-side framing helpers, shared by virt-server implementations.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{quote, unquote};

/// One decoded request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: String,
    pub args: Vec<String>,
}

impl Request {
    /// Parse a request line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Request> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next()?.to_string();
        let args = tokens.map(unquote).collect();
        Some(Request { verb, args })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Vec<String>),
    Error(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(Vec::new())
    }

    pub fn ok_with(results: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Reply::Ok(results.into_iter().map(Into::into).collect())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    /// Render without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Reply::Ok(results) => {
                let mut line = String::from("ok");
                for r in results {
                    line.push(' ');
                    line.push_str(&quote(r));
                }
                line
            }
            // Error text stays readable; clients only look at the first token.
            Reply::Error(message) => format!("error {}", message.replace('\n', " ")),
        }
    }
}

/// Read the next request. `Ok(None)` means the client closed its end.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if let Some(request) = Request::parse(&line) {
            return Ok(Some(request));
        }
    }
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.to_line().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
