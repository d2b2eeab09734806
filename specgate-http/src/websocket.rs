//! RFC 6455 WebSocket support: handshake validation, frame codec and the
//! per-connection message loop.

use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use specgate_core::{digest, Error, Result};

use crate::conn::ConnWriter;
use crate::method::Method;
use crate::request::Request;

const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_FRAME: usize = 1 << 20;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    digest::sha1_base64(format!("{key}{WS_MAGIC}").as_bytes())
}

/// Validate the upgrade request headers.
pub fn check_upgrade(req: &Request) -> Result<()> {
    if req.method() != Method::Get {
        return Err(Error::UnsupportedMethod);
    }
    if !req.headers().connection_upgrade() {
        return Err(Error::Validation("missing 'Connection: Upgrade'".into()));
    }
    match req.headers().get("Upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(Error::Validation("missing 'Upgrade: websocket'".into())),
    }
    match req.headers().get("Sec-WebSocket-Version") {
        Some("13") => {}
        _ => return Err(Error::Validation("unsupported WebSocket version".into())),
    }
    if req.headers().get("Sec-WebSocket-Key").is_none() {
        return Err(Error::Validation("missing Sec-WebSocket-Key".into()));
    }
    Ok(())
}

/// Handles decoded JSON messages on one WebSocket connection.
#[async_trait]
pub trait WsMessageHandler: Send + Sync {
    /// Called once after the 101 response is on the wire.
    async fn on_open(&self, ws: &WsSender) -> Result<()> {
        let _ = ws;
        Ok(())
    }

    /// Called for each JSON text frame.
    async fn on_message(&self, ws: &WsSender, msg: Value) -> Result<()>;

    /// Called when the connection closes, for subscription cleanup.
    async fn on_close(&self, conn_id: u64);
}

/// Outbound half of a WebSocket connection.
#[derive(Clone)]
pub struct WsSender {
    id: u64,
    writer: ConnWriter,
}

impl WsSender {
    /// The connection id, used as the subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send_json(&self, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::Internal(anyhow::anyhow!("encoding frame: {e}")))?;
        self.writer.write_all(&encode_frame(OpCode::Text, &payload)).await
    }

    pub async fn send_close(&self) -> Result<()> {
        self.writer.write_all(&encode_frame(OpCode::Close, &[])).await
    }

    async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        self.writer.write_all(&encode_frame(OpCode::Pong, payload)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> Result<OpCode> {
        match value {
            0 => Ok(OpCode::Continuation),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            other => Err(Error::Parse(format!("invalid WebSocket opcode {other}"))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Encode a server frame (unmasked).
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.as_u8());

    match payload.len() {
        len if len < 126 => out.push(len as u8),
        len if len < 1 << 16 => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    out.extend_from_slice(payload);
    out
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, input: &mut BytesMut, len: usize) -> Result<()> {
    while input.len() < len {
        let n = reader
            .read_buf(input)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read failed: {e}")))?;
        if n == 0 {
            return Err(Error::Parse("connection closed mid-frame".into()));
        }
    }
    Ok(())
}

/// Read one frame.  Client frames must be masked.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    input: &mut BytesMut,
) -> Result<Frame> {
    fill(reader, input, 2).await?;
    let b0 = input[0];
    let b1 = input[1];

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(Error::Parse("reserved WebSocket bits set".into()));
    }
    let opcode = OpCode::from_u8(b0 & 0x0f)?;

    let masked = b1 & 0x80 != 0;
    if !masked {
        return Err(Error::Parse("client frame is not masked".into()));
    }

    let (len, mut header) = match b1 & 0x7f {
        126 => {
            fill(reader, input, 4).await?;
            (u16::from_be_bytes([input[2], input[3]]) as usize, 4)
        }
        127 => {
            fill(reader, input, 10).await?;
            let mut b = [0u8; 8];
            b.copy_from_slice(&input[2..10]);
            (u64::from_be_bytes(b) as usize, 10)
        }
        len => (len as usize, 2),
    };

    if MAX_FRAME < len {
        return Err(Error::BodyTooLarge);
    }

    fill(reader, input, header + 4 + len).await?;
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&input[header..header + 4]);
    header += 4;

    let mut payload = input[header..header + len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    let _ = input.split_to(header + len);
    Ok(Frame { fin, opcode, payload })
}

/// Run the message loop after a successful upgrade.
///
/// Writes the 101 response, then reads frames until close. JSON text
/// messages go to the request's WebSocket handler; ping is answered with
/// pong; close is echoed.
pub(crate) async fn drive<R: AsyncRead + Unpin>(
    id: u64,
    mut reader: R,
    mut input: BytesMut,
    writer: ConnWriter,
    mut request: Request,
) {
    let Some(handler) = request.take_ws_handler() else {
        warn!("ws {id}: upgrade without a message handler");
        writer.shutdown().await;
        return;
    };

    // 101 response
    let key = request.headers().get("Sec-WebSocket-Key").unwrap_or("").to_string();
    request.out_headers_mut().set("Upgrade", "websocket");
    request.out_headers_mut().set("Connection", "Upgrade");
    request.out_headers_mut().set("Sec-WebSocket-Accept", accept_key(&key));
    request.set_status(101);
    request.set_status_line("HTTP/1.1 101 Switching Protocols");
    let head = request.build_head(false);
    if writer.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    let sender = WsSender { id, writer: writer.clone() };

    if let Err(e) = handler.on_open(&sender).await {
        debug!("ws {id}: open handler failed: {e}");
        let _ = sender.send_close().await;
        handler.on_close(id).await;
        writer.shutdown().await;
        return;
    }

    let mut message: Vec<u8> = Vec::new();
    let mut message_op = OpCode::Text;

    loop {
        let frame = match read_frame(&mut reader, &mut input).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("ws {id}: {e}");
                break;
            }
        };

        match frame.opcode {
            OpCode::Ping => {
                if sender.send_pong(&frame.payload).await.is_err() {
                    break;
                }
                continue;
            }
            OpCode::Pong => continue,
            OpCode::Close => {
                let _ = sender.send_close().await;
                break;
            }
            OpCode::Text | OpCode::Binary => {
                message_op = frame.opcode;
                message = frame.payload;
            }
            OpCode::Continuation => message.extend_from_slice(&frame.payload),
        }

        if !frame.fin {
            continue;
        }

        if message_op == OpCode::Text {
            let text = std::mem::take(&mut message);
            match serde_json::from_slice::<Value>(&text) {
                Ok(msg) => {
                    trace!("ws {id}: message {msg}");
                    if let Err(e) = handler.on_message(&sender, msg).await {
                        debug!("ws {id}: message handler failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    debug!("ws {id}: non-JSON text frame: {e}");
                    break;
                }
            }
        } else {
            message.clear();
        }
    }

    handler.on_close(id).await;
    writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_rfc_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut out = Vec::new();
        out.push(if fin { 0x80 } else { 0 } | opcode.as_u8());

        match payload.len() {
            len if len < 126 => out.push(0x80 | len as u8),
            len if len < 1 << 16 => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        out
    }

    #[tokio::test]
    async fn masked_frame_round_trip() {
        let wire = masked(OpCode::Text, br#"{"x":1}"#, true);
        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();

        let frame = read_frame(&mut reader, &mut input).await.unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, br#"{"x":1}"#);
    }

    #[tokio::test]
    async fn extended_length_frames() {
        let payload = vec![7u8; 300];
        let wire = masked(OpCode::Binary, &payload, true);
        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();

        let frame = read_frame(&mut reader, &mut input).await.unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[tokio::test]
    async fn unmasked_client_frames_rejected() {
        let wire = encode_frame(OpCode::Text, b"{}");
        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();
        assert!(read_frame(&mut reader, &mut input).await.is_err());
    }

    #[test]
    fn server_frames_unmasked() {
        let frame = encode_frame(OpCode::Text, b"hi");
        assert_eq!(frame, vec![0x81, 0x02, b'h', b'i']);
    }
}
