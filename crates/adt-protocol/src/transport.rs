//! Client side of the virt-server protocol.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::codec::{quote, unquote};
use crate::verb::Verb;

const DEBUG_FAIL_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol violations. Every variant is fatal to the whole run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot send to testbed: {0}")]
    Send(#[source] io::Error),
    #[error("cannot read from testbed: {0}")]
    Read(#[source] io::Error),
    #[error("unexpected eof from the testbed")]
    Eof,
    #[error("unterminated line from the testbed")]
    Unterminated,
    #[error("unexpected whitespace-only line from the testbed")]
    EmptyLine,
    #[error("got banner `{got}', expected `{expected}...'")]
    Banner { got: String, expected: String },
    #[error("sent `{sent}', got `{got}', expected `{expected}...'")]
    UnexpectedReply {
        sent: String,
        got: String,
        expected: String,
    },
    #[error("sent `{sent}', got `{got}' ({count} result parameters), expected {expected} result parameters")]
    ResultCount {
        sent: String,
        got: String,
        count: usize,
        expected: usize,
    },
}

/// Line channel to a virt-server.
///
/// Reader and writer are boxed so the same type serves a spawned child's
/// stdio and in-memory pipes.
pub struct Transport {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    last_sent: Option<String>,
    tried_debug: bool,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            last_sent: None,
            tried_debug: false,
        }
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    /// Write one request line and flush.
    pub async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        debug!("sending command to testbed: {line}");
        if let Err(err) = self.write_line(line).await {
            self.debug_fail().await;
            return Err(TransportError::Send(err));
        }
        self.last_sent = Some(line.to_string());
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Read one reply line whose first token must be `keyword`.
    ///
    /// With `nresults` set, exactly that many further tokens are required.
    /// Returned tokens are still percent-encoded.
    pub async fn expect(
        &mut self,
        keyword: &str,
        nresults: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        match self.read_reply(keyword, nresults).await {
            Ok(tokens) => Ok(tokens),
            Err(err) => {
                self.debug_fail().await;
                Err(err)
            }
        }
    }

    async fn read_reply(
        &mut self,
        keyword: &str,
        nresults: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(TransportError::Read)?;
        if n == 0 {
            return Err(TransportError::Eof);
        }
        let Some(line) = line.strip_suffix('\n') else {
            return Err(TransportError::Unterminated);
        };
        debug!("got reply from testbed: {line}");

        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            return Err(TransportError::EmptyLine);
        };
        if first != keyword {
            return Err(match &self.last_sent {
                None => TransportError::Banner {
                    got: line.to_string(),
                    expected: keyword.to_string(),
                },
                Some(sent) => TransportError::UnexpectedReply {
                    sent: sent.clone(),
                    got: line.to_string(),
                    expected: keyword.to_string(),
                },
            });
        }

        let results: Vec<String> = tokens.map(str::to_string).collect();
        if let Some(expected) = nresults {
            if results.len() != expected {
                return Err(TransportError::ResultCount {
                    sent: self.last_sent.clone().unwrap_or_default(),
                    got: line.to_string(),
                    count: results.len(),
                    expected,
                });
            }
        }
        Ok(results)
    }

    /// Send `verb` with percent-encoded arguments and return decoded results.
    pub async fn command(
        &mut self,
        verb: Verb,
        args: &[&str],
        nresults: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        let quoted: Vec<String> = args.iter().map(|a| quote(a)).collect();
        self.command_line(verb, &quoted, nresults).await
    }

    /// Like [`Transport::command`], but arguments are sent verbatim.
    pub async fn command_raw(
        &mut self,
        verb: Verb,
        args: &[&str],
        nresults: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        let raw: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.command_line(verb, &raw, nresults).await
    }

    async fn command_line(
        &mut self,
        verb: Verb,
        args: &[String],
        nresults: Option<usize>,
    ) -> Result<Vec<String>, TransportError> {
        let mut line = verb.as_str().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.send(&line).await?;
        let results = self.expect("ok", nresults).await?;
        Ok(results.iter().map(|r| unquote(r)).collect())
    }

    /// Ask the server to explain its last failure.
    ///
    /// Runs at most once per transport and never fails: the request is made
    /// while another error is already being reported.
    pub async fn debug_fail(&mut self) {
        if self.tried_debug {
            return;
        }
        self.tried_debug = true;

        let request = async {
            self.write_line(Verb::AuxverbDebugFail.as_str()).await?;
            let mut reply = String::new();
            self.reader.read_line(&mut reply).await?;
            Ok::<_, io::Error>(reply)
        };
        match tokio::time::timeout(DEBUG_FAIL_TIMEOUT, request).await {
            Ok(Ok(reply)) => debug!("auxverb_debug_fail replied: {}", reply.trim_end()),
            Ok(Err(err)) => debug!("auxverb_debug_fail failed: {err}"),
            Err(_) => debug!("auxverb_debug_fail timed out"),
        }
    }
}
