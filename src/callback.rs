//! Local HTTP listener that receives the OAuth redirect

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{CleanerError, Result};

const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_LINE: usize = 8 * 1024;

/// What one redirect request carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Code {
        code: String,
        state: Option<String>,
    },
    Denied {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },
    /// Anything else (favicon, health checks, empty parameters). The handshake keeps waiting.
    Malformed,
}

/// Parse an HTTP request line such as `GET /?code=x&state=y HTTP/1.1`
pub fn parse_callback_request(request_line: &str) -> CallbackEvent {
    let mut parts = request_line.split_whitespace();
    let (Some("GET"), Some(target)) = (parts.next(), parts.next()) else {
        return CallbackEvent::Malformed;
    };

    let Ok(url) = Url::parse("http://localhost").and_then(|base| base.join(target)) else {
        return CallbackEvent::Malformed;
    };

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }
    let state = state.filter(|s| !s.is_empty());

    match (code.filter(|c| !c.is_empty()), error.filter(|e| !e.is_empty())) {
        (Some(code), _) => CallbackEvent::Code { code, state },
        (None, Some(error)) => CallbackEvent::Denied {
            error,
            description,
            state,
        },
        (None, None) => CallbackEvent::Malformed,
    }
}

/// Page sent back to the browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackReply {
    Success,
    /// CSRF state did not match
    Rejected,
    Failed(String),
    InvalidRequest,
}

impl CallbackReply {
    fn status_line(&self) -> &'static str {
        match self {
            CallbackReply::Success => "200 OK",
            CallbackReply::Rejected => "403 Forbidden",
            CallbackReply::Failed(_) | CallbackReply::InvalidRequest => "400 Bad Request",
        }
    }

    fn body(&self) -> String {
        let (title, detail) = match self {
            CallbackReply::Success => (
                "Authentication successful",
                "You can close this window and return to the application.".to_string(),
            ),
            CallbackReply::Rejected => (
                "Authentication rejected",
                "The request did not match the sign-in that was started. Please sign in again.".to_string(),
            ),
            CallbackReply::Failed(reason) => ("Authentication failed", escape_html(reason)),
            CallbackReply::InvalidRequest => ("Invalid request", "Missing authorization code.".to_string()),
        };
        format!(
            "<!DOCTYPE html><html><body style='font-family: sans-serif; padding: 40px; text-align: center;'>\
             <h1>{}</h1><p>{}</p></body></html>",
            title, detail
        )
    }

    pub fn render(&self) -> String {
        let body = self.body();
        format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status_line(),
            body.len(),
            body
        )
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Connection awaiting its reply
pub struct CallbackResponder {
    socket: TcpStream,
}

impl CallbackResponder {
    pub async fn reply(mut self, reply: CallbackReply) {
        if let Err(e) = self.socket.write_all(reply.render().as_bytes()).await {
            debug!("Failed to write callback response: {}", e);
        }
        let _ = self.socket.shutdown().await;
    }
}

pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                CleanerError::AuthorizationError(format!(
                    "Port {} is already in use, stop the other process or choose another oauth_port",
                    port
                ))
            } else {
                CleanerError::AuthorizationError(format!("Failed to listen on {}:{}: {}", host, port, e))
            }
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next request that can be parsed into an event.
    /// Broken connections are logged and skipped.
    pub async fn next_event(&self) -> Result<(CallbackEvent, CallbackResponder)> {
        loop {
            let (mut socket, peer) = self.listener.accept().await?;
            match tokio::time::timeout(REQUEST_LINE_TIMEOUT, read_request_line(&mut socket)).await {
                Ok(Ok(line)) => {
                    let event = parse_callback_request(&line);
                    debug!("Callback request from {}: {:?}", peer, redact(&event));
                    return Ok((event, CallbackResponder { socket }));
                }
                Ok(Err(e)) => warn!("Failed to read callback request from {}: {}", peer, e),
                Err(_) => warn!("Callback connection from {} sent no request line", peer),
            }
        }
    }
}

/// Read the request line, then drain the header block so closing the
/// socket does not reset the connection before the reply is read
async fn read_request_line(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut reader = BufReader::new(socket).take(MAX_REQUEST_LINE as u64);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let mut header = String::new();
    loop {
        header.clear();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim_end().is_empty() {
            break;
        }
    }
    Ok(line)
}

fn redact(event: &CallbackEvent) -> &'static str {
    match event {
        CallbackEvent::Code { .. } => "code",
        CallbackEvent::Denied { .. } => "denied",
        CallbackEvent::Malformed => "malformed",
    }
}
