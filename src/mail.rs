//! Plain SMTP delivery through a relay.
//!
//! One connection per message so a broken session for one recipient cannot
//! take the others down with it. No TLS and no AUTH: the relay is expected
//! to be a local or otherwise trusted MTA, and shares are already encrypted.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::distribute::{Mailer, Message};
use crate::error::BootstrapError;

const MAX_REPLY_LINES: usize = 64;

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    /// Relay in `<host>:<port>` form.
    pub relay: String,
    pub from: String,
    pub helo_name: String,
    pub timeout: Duration,
}

impl SmtpConfig {
    pub fn new(relay: &str, from: &str, timeout: Duration) -> Self {
        Self {
            relay: relay.to_string(),
            from: from.to_string(),
            helo_name: "localhost".to_string(),
            timeout,
        }
    }
}

pub struct SmtpMailer {
    cfg: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(cfg: SmtpConfig) -> Self {
        Self { cfg }
    }

    /// Checks the relay answers before anything irreversible happens.
    /// Unreachable relay is fatal; a refused `VRFY` is only logged since
    /// most relays disable it.
    pub fn verify_relay(&self) -> Result<()> {
        let mut conn = SmtpConnection::open(&self.cfg.relay, self.cfg.timeout).map_err(|e| {
            BootstrapError::transport(format!("smtp relay {}: {:#}", self.cfg.relay, e))
        })?;
        conn.hello(&self.cfg.helo_name)
            .map_err(|e| BootstrapError::transport(format!("smtp relay {}: {:#}", self.cfg.relay, e)))?;
        let reply = conn.command(&format!("VRFY {}", self.cfg.from))?;
        if !reply.is_positive() {
            log::warn!(
                "smtp relay {} did not verify {}: {}",
                self.cfg.relay,
                self.cfg.from,
                reply
            );
        }
        conn.quit();
        log::info!("smtp relay {} reachable", self.cfg.relay);
        Ok(())
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, recipient: &str, message: &Message) -> Result<()> {
        let mut conn = SmtpConnection::open(&self.cfg.relay, self.cfg.timeout)?;
        conn.hello(&self.cfg.helo_name)?;
        conn.expect(&format!("MAIL FROM:<{}>", self.cfg.from), &[250])?;
        conn.expect(&format!("RCPT TO:<{}>", recipient), &[250, 251])?;
        conn.expect("DATA", &[354])?;
        let payload = format_message(&self.cfg.from, recipient, message);
        conn.write_raw(&payload)?;
        let reply = conn.read_reply()?;
        if reply.code != 250 {
            return Err(anyhow!("message rejected after DATA: {}", reply));
        }
        conn.quit();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

struct SmtpConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SmtpConnection {
    fn open(relay: &str, timeout: Duration) -> Result<Self> {
        let addr = relay
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", relay))?
            .next()
            .ok_or_else(|| anyhow!("{} resolves to no address", relay))?;
        let stream =
            TcpStream::connect_timeout(&addr, timeout).with_context(|| format!("connect {}", relay))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        let mut conn = Self {
            reader: BufReader::new(stream),
            writer,
        };
        let greeting = conn.read_reply()?;
        if greeting.code != 220 {
            return Err(anyhow!("unexpected greeting: {}", greeting));
        }
        Ok(conn)
    }

    fn hello(&mut self, name: &str) -> Result<()> {
        let reply = self.command(&format!("EHLO {}", name))?;
        if reply.code == 250 {
            return Ok(());
        }
        self.expect(&format!("HELO {}", name), &[250])?;
        Ok(())
    }

    fn command(&mut self, line: &str) -> Result<Reply> {
        self.write_raw(&format!("{}\r\n", line))?;
        self.read_reply()
    }

    fn expect(&mut self, line: &str, codes: &[u16]) -> Result<Reply> {
        let reply = self.command(line)?;
        if !codes.contains(&reply.code) {
            let verb = line.split([' ', ':']).next().unwrap_or(line);
            return Err(anyhow!("{} refused: {}", verb, reply));
        }
        Ok(reply)
    }

    fn write_raw(&mut self, data: &str) -> Result<()> {
        self.writer.write_all(data.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut text = Vec::new();
        for _ in 0..MAX_REPLY_LINES {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("connection closed by relay"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(anyhow!("malformed reply line: {:?}", line));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| anyhow!("malformed reply code: {:?}", line))?;
            let rest = &line[3..];
            text.push(rest.get(1..).unwrap_or("").to_string());
            if !rest.starts_with('-') {
                return Ok(Reply {
                    code,
                    text: text.join(" "),
                });
            }
        }
        Err(anyhow!("reply exceeds {} lines", MAX_REPLY_LINES))
    }

    fn quit(mut self) {
        if let Err(err) = self.command("QUIT") {
            log::debug!("smtp QUIT failed: {}", err);
        }
    }
}

/// Headers, CRLF line endings, dot-stuffing and the terminating `.` line.
fn format_message(from: &str, to: &str, message: &Message) -> String {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    let domain = from.rsplit('@').next().unwrap_or("localhost");

    let mut out = String::new();
    out.push_str(&format!("From: <{}>\r\n", from));
    out.push_str(&format!("To: <{}>\r\n", to));
    out.push_str(&format!("Subject: {}\r\n", message.subject));
    out.push_str(&format!("Message-ID: <{}@{}>\r\n", hex::encode(id), domain));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("\r\n");
    for line in message.body.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}
