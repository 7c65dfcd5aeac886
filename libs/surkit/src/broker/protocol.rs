//! Network side of the embedded broker: the NATS core client protocol
//! (INFO/CONNECT/PING/PONG/SUB/UNSUB/PUB/HPUB in, MSG/HMSG/+OK/-ERR out).

use super::server::{Delivery, ServerCore};
use super::{subject, Message};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const MAX_CONTROL_LINE: usize = 4096;

#[derive(Debug, Error)]
enum ProtocolError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown Protocol Operation")]
    UnknownOperation,
    #[error("Maximum Control Line Exceeded")]
    ControlLineTooLong,
    #[error("Maximum Payload Violation")]
    PayloadTooLarge,
    #[error("Invalid Connect Options")]
    InvalidConnect,
    #[error("Invalid Arguments")]
    InvalidArguments,
    #[error("Invalid Subject")]
    InvalidSubject,
    #[error("Invalid Publish Subject")]
    InvalidPublishSubject,
}

impl ProtocolError {
    /// Subject errors are reported but keep the connection open.
    fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::InvalidSubject | ProtocolError::InvalidPublishSubject
        )
    }
}

/// Options sent by the client in CONNECT. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectOptions {
    verbose: bool,
    headers: bool,
    no_responders: bool,
    name: Option<String>,
    lang: Option<String>,
}

pub(crate) async fn accept_loop(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_core = core.clone();
                    core.tasks.spawn(serve_connection(conn_core, stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker accept failed");
                }
            }
        }
    }
}

async fn serve_connection(core: Arc<ServerCore>, stream: TcpStream, peer: SocketAddr) {
    let client_id = core.next_client_id();
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (control_tx, control_rx) = mpsc::unbounded_channel::<Bytes>();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<Delivery>();
    let headers_enabled = Arc::new(AtomicBool::new(false));

    let writer = tokio::spawn(write_loop(
        write_half,
        control_rx,
        delivery_rx,
        headers_enabled.clone(),
    ));

    let _ = control_tx.send(info_line(&core, client_id, peer));
    if core.options.logging {
        tracing::debug!(client = client_id, %peer, "broker client connected");
    }

    let mut conn = ClientConn {
        core: core.clone(),
        client_id,
        control: control_tx,
        deliveries: delivery_tx,
        headers_enabled,
        connect: ConnectOptions::default(),
    };
    let mut reader = BufReader::new(read_half);

    let result = tokio::select! {
        _ = core.cancel.cancelled() => Ok(()),
        r = conn.read_loop(&mut reader) => r,
    };
    if let Err(e) = &result {
        if core.options.logging {
            tracing::debug!(client = client_id, error = %e, "broker client error");
        }
        if !matches!(e, ProtocolError::Io(_)) {
            conn.send_err(e);
        }
    }

    core.remove_owner(client_id);
    drop(conn);
    let _ = writer.await;
    if core.options.logging {
        tracing::debug!(client = client_id, %peer, "broker client disconnected");
    }
}

fn info_line(core: &ServerCore, client_id: u64, peer: SocketAddr) -> Bytes {
    let info = serde_json::json!({
        "server_id": core.server_id,
        "server_name": core.options.server_name,
        "version": env!("CARGO_PKG_VERSION"),
        "proto": 1,
        "host": core.options.host,
        "port": core.options.port,
        "headers": true,
        "max_payload": core.options.max_payload,
        "jetstream": core.options.streams_enabled,
        "domain": core.options.stream_domain,
        "client_id": client_id,
        "client_ip": peer.ip().to_string(),
    });
    Bytes::from(format!("INFO {info}\r\n"))
}

struct ClientConn {
    core: Arc<ServerCore>,
    client_id: u64,
    control: mpsc::UnboundedSender<Bytes>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    headers_enabled: Arc<AtomicBool>,
    connect: ConnectOptions,
}

impl ClientConn {
    async fn read_loop<R>(&mut self, reader: &mut R) -> Result<(), ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let mut limited = (&mut *reader).take(MAX_CONTROL_LINE as u64 + 1);
            let n = limited.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Ok(());
            }
            if !line.ends_with(b"\n") {
                if line.len() > MAX_CONTROL_LINE {
                    return Err(ProtocolError::ControlLineTooLong);
                }
                // EOF in the middle of a line.
                return Ok(());
            }
            let text = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidArguments)?;
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                continue;
            }

            let (op, rest) = match text.split_once([' ', '\t']) {
                Some((op, rest)) => (op, rest.trim()),
                None => (text, ""),
            };

            let outcome = match op.to_ascii_uppercase().as_str() {
                "PING" => {
                    self.send(Bytes::from_static(b"PONG\r\n"));
                    Ok(())
                }
                "PONG" => Ok(()),
                "CONNECT" => self.handle_connect(rest),
                "SUB" => self.handle_sub(rest),
                "UNSUB" => self.handle_unsub(rest),
                "PUB" => {
                    let (subject, reply, size) = parse_pub(rest)?;
                    self.check_payload(size)?;
                    let payload = read_payload(reader, size).await?;
                    self.handle_publish(subject, reply, None, payload)
                }
                "HPUB" => {
                    let (subject, reply, header_len, total_len) = parse_hpub(rest)?;
                    self.check_payload(total_len)?;
                    let mut block = read_payload(reader, total_len).await?;
                    let payload = block.split_off(header_len);
                    self.handle_publish(subject, reply, Some(block), payload)
                }
                _ => Err(ProtocolError::UnknownOperation),
            };

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.send_err(&e),
            }
        }
    }

    fn send(&self, bytes: Bytes) {
        let _ = self.control.send(bytes);
    }

    fn send_ok(&self) {
        if self.connect.verbose {
            self.send(Bytes::from_static(b"+OK\r\n"));
        }
    }

    fn send_err(&self, err: &ProtocolError) {
        self.send(Bytes::from(format!("-ERR '{err}'\r\n")));
    }

    fn check_payload(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.core.options.max_payload {
            return Err(ProtocolError::PayloadTooLarge);
        }
        Ok(())
    }

    fn handle_connect(&mut self, rest: &str) -> Result<(), ProtocolError> {
        self.connect =
            serde_json::from_str(rest).map_err(|_| ProtocolError::InvalidConnect)?;
        self.headers_enabled
            .store(self.connect.headers, Ordering::Relaxed);
        if self.core.options.logging {
            tracing::debug!(
                client = self.client_id,
                name = ?self.connect.name,
                lang = ?self.connect.lang,
                headers = self.connect.headers,
                "broker client CONNECT"
            );
        }
        self.send_ok();
        Ok(())
    }

    fn handle_sub(&self, rest: &str) -> Result<(), ProtocolError> {
        let args: Vec<&str> = rest.split_whitespace().collect();
        let (pattern, queue, sid) = match args.as_slice() {
            [pattern, sid] => (*pattern, None, *sid),
            [pattern, queue, sid] => (*pattern, Some(queue.to_string()), *sid),
            _ => return Err(ProtocolError::InvalidArguments),
        };
        self.core
            .subscribe(
                self.client_id,
                Arc::from(sid),
                pattern,
                queue,
                self.deliveries.clone(),
            )
            .map_err(|_| ProtocolError::InvalidSubject)?;
        self.send_ok();
        Ok(())
    }

    fn handle_unsub(&self, rest: &str) -> Result<(), ProtocolError> {
        let args: Vec<&str> = rest.split_whitespace().collect();
        let (sid, max) = match args.as_slice() {
            [sid] => (*sid, None),
            [sid, max] => (
                *sid,
                Some(max.parse::<u64>().map_err(|_| ProtocolError::InvalidArguments)?),
            ),
            _ => return Err(ProtocolError::InvalidArguments),
        };
        self.core.unsubscribe(self.client_id, sid, max);
        self.send_ok();
        Ok(())
    }

    fn handle_publish(
        &self,
        subject_name: String,
        reply: Option<String>,
        headers: Option<Bytes>,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        if !subject::is_valid_subject(&subject_name) {
            return Err(ProtocolError::InvalidPublishSubject);
        }
        // Acknowledge before routing so +OK precedes any echo of this message.
        self.send_ok();
        let message = Message {
            subject: subject_name,
            reply: reply.clone(),
            headers,
            payload,
        };
        let delivered = self.core.route(message);
        if delivered == 0 && self.connect.headers && self.connect.no_responders {
            if let Some(reply) = reply {
                self.core.route(Message::no_responders(reply));
            }
        }
        Ok(())
    }
}

fn parse_size(s: &str) -> Result<usize, ProtocolError> {
    s.parse().map_err(|_| ProtocolError::InvalidArguments)
}

/// `PUB <subject> [reply-to] <#bytes>`
fn parse_pub(rest: &str) -> Result<(String, Option<String>, usize), ProtocolError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    match args.as_slice() {
        [subject, size] => Ok((subject.to_string(), None, parse_size(size)?)),
        [subject, reply, size] => Ok((
            subject.to_string(),
            Some(reply.to_string()),
            parse_size(size)?,
        )),
        _ => Err(ProtocolError::InvalidArguments),
    }
}

/// `HPUB <subject> [reply-to] <#header bytes> <#total bytes>`
fn parse_hpub(rest: &str) -> Result<(String, Option<String>, usize, usize), ProtocolError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    let (subject, reply, hdr, total) = match args.as_slice() {
        [subject, hdr, total] => (*subject, None, *hdr, *total),
        [subject, reply, hdr, total] => (*subject, Some(reply.to_string()), *hdr, *total),
        _ => return Err(ProtocolError::InvalidArguments),
    };
    let hdr = parse_size(hdr)?;
    let total = parse_size(total)?;
    if hdr > total {
        return Err(ProtocolError::InvalidArguments);
    }
    Ok((subject.to_string(), reply, hdr, total))
}

/// Read `size` payload bytes followed by the CRLF terminator.
async fn read_payload<R>(reader: &mut R, size: usize) -> Result<Bytes, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = BytesMut::zeroed(size + 2);
    reader.read_exact(&mut buf).await?;
    if &buf[size..] != b"\r\n" {
        return Err(ProtocolError::InvalidArguments);
    }
    buf.truncate(size);
    Ok(buf.freeze())
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut control: mpsc::UnboundedReceiver<Bytes>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    headers_enabled: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let mut out = BufWriter::new(write_half);
    loop {
        tokio::select! {
            biased;
            ctrl = control.recv() => match ctrl {
                Some(bytes) => out.write_all(&bytes).await?,
                None => break,
            },
            delivery = deliveries.recv() => match delivery {
                Some(d) => {
                    let frame = encode_delivery(&d, headers_enabled.load(Ordering::Relaxed));
                    out.write_all(&frame).await?;
                }
                None => break,
            },
        }
        if control.is_empty() && deliveries.is_empty() {
            out.flush().await?;
        }
    }
    out.flush().await?;
    out.shutdown().await
}

fn encode_delivery(delivery: &Delivery, headers_enabled: bool) -> BytesMut {
    let msg = &delivery.message;
    let headers = msg.headers.as_ref().filter(|_| headers_enabled);

    let mut head = String::with_capacity(64 + msg.subject.len());
    let _ = match headers {
        Some(_) => write!(head, "HMSG {} {}", msg.subject, delivery.sid),
        None => write!(head, "MSG {} {}", msg.subject, delivery.sid),
    };
    if let Some(reply) = &msg.reply {
        let _ = write!(head, " {reply}");
    }
    let _ = match headers {
        Some(h) => write!(head, " {} {}\r\n", h.len(), h.len() + msg.payload.len()),
        None => write!(head, " {}\r\n", msg.payload.len()),
    };

    let hdr_len = headers.map_or(0, |h| h.len());
    let mut frame = BytesMut::with_capacity(head.len() + hdr_len + msg.payload.len() + 2);
    frame.extend_from_slice(head.as_bytes());
    if let Some(h) = headers {
        frame.extend_from_slice(h);
    }
    frame.extend_from_slice(&msg.payload);
    frame.extend_from_slice(b"\r\n");
    frame
}
