use std::{fmt, io, net::SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_DELIMITER: u8 = b'\n';

/// Longest accepted frame, delimiter included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Wire tag carried in the `type` field of every frame.
///
/// The numeric values are fixed by the protocol and are mutually exclusive;
/// they are never combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Hello,
    Leave,
    Chat,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Hello => 1,
            MessageKind::Leave => 2,
            MessageKind::Chat => 4,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownKind;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Hello),
            2 => Ok(Self::Leave),
            4 => Ok(Self::Chat),
            other => Err(UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => write!(f, "hello"),
            Self::Leave => write!(f, "leave"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0}")]
pub struct UnknownKind(pub u8);

/// One chat frame.
///
/// `origin` never crosses the wire: the session that read the frame stamps it
/// with the physical peer address, replacing anything the client might claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(skip)]
    pub origin: Option<SocketAddr>,
}

impl Message {
    pub fn hello(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Hello, String::new(), sender.into())
    }

    pub fn leave(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Leave, String::new(), sender.into())
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, content.into(), sender.into())
    }

    fn new(kind: MessageKind, content: String, sender: String) -> Self {
        Self {
            kind,
            content,
            sender,
            timestamp: String::new(),
            origin: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_origin(mut self, origin: SocketAddr) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn stamped(self) -> Self {
        self.with_timestamp(timestamp_now())
    }

    /// Serializes the frame body without the trailing delimiter.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Human-readable local time. Advisory only, never used for ordering.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("frame longer than {limit} bytes discarded")]
    TooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Decode problems only cost the offending frame; transport failures end
    /// the connection.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Reads the next frame.
///
/// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped so the
/// protocol stays usable from netcat-style tools. At most [`MAX_FRAME_LEN`]
/// bytes are buffered; the rest of an oversized line is skipped unread.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_LEN as u64)
            .read_until(FRAME_DELIMITER, &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.last() != Some(&FRAME_DELIMITER) {
            if line.len() < MAX_FRAME_LEN {
                return Err(FrameError::Truncated);
            }
            discard_line(reader).await?;
            return Err(FrameError::TooLong {
                limit: MAX_FRAME_LEN,
            });
        }

        let trimmed = trim_line_ending(&line);
        if trimmed.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return Ok(Some(serde_json::from_slice(trimmed)?));
    }
}

/// Consumes input up to and including the next delimiter, or to EOF.
async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, found) = {
            let buffered = reader.fill_buf().await?;
            if buffered.is_empty() {
                return Ok(());
            }
            match buffered.iter().position(|byte| *byte == FRAME_DELIMITER) {
                Some(at) => (at + 1, true),
                None => (buffered.len(), false),
            }
        };
        reader.consume(consumed);
        if found {
            return Ok(());
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Writes one pre-serialized frame body followed by the delimiter and flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(&[FRAME_DELIMITER]).await?;
    writer.flush().await
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded =
        message.encode().map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &encoded).await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;

    #[test]
    fn kind_uses_protocol_tags() {
        let encoded = Message::chat("alice", "hi").encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], 4);
        assert_eq!(value["sender"], "alice");
        assert!(value.get("origin").is_none());

        assert_eq!(u8::from(MessageKind::Hello), 1);
        assert_eq!(u8::from(MessageKind::Leave), 2);
        assert_eq!(MessageKind::try_from(3), Err(UnknownKind(3)));
    }

    #[test]
    fn embedded_newlines_stay_inside_one_line() {
        let encoded = Message::chat("bob", "line one\nline two")
            .encode()
            .expect("encode");
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn origin_is_never_read_from_the_wire() {
        let raw =
            r#"{"type":4,"content":"x","sender":"eve","timestamp":"","origin":"10.0.0.1:1"}"#;
        let message: Message = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.origin, None);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let message: Message = serde_json::from_str(r#"{"type":2}"#).expect("decode");
        assert_eq!(message, Message::leave(""));
    }

    #[tokio::test]
    async fn malformed_frame_is_recoverable_and_stream_continues() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"{not json}\n\n\xff\xfe\n").await.expect("write");
        write_message(&mut writer, &Message::chat("alice", "after"))
            .await
            .expect("write message");
        writer.write_all(b"{\"type\":8}\n").await.expect("write");
        drop(writer);

        let err = read_frame(&mut reader).await.expect_err("malformed");
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(err.is_recoverable());

        let err = read_frame(&mut reader).await.expect_err("invalid utf-8");
        assert!(matches!(err, FrameError::Malformed(_)));

        let next = read_frame(&mut reader).await.expect("read").expect("frame");
        assert_eq!(next, Message::chat("alice", "after"));

        let err = read_frame(&mut reader).await.expect_err("unknown kind");
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(err.to_string().contains("unknown message type 8"));

        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn unterminated_final_line_is_a_decode_error() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(br#"{"type":4,"content":"cut"}"#).await.expect("write");
        drop(writer);

        let err = read_frame(&mut reader).await.expect_err("truncated");
        assert!(matches!(err, FrameError::Truncated));
        assert!(err.is_recoverable());
        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_without_buffering_it() {
        let mut input = vec![b'x'; 4 * MAX_FRAME_LEN];
        input.push(FRAME_DELIMITER);
        input.extend_from_slice(b"{\"type\":4,\"content\":\"small\"}\n");
        input.extend(std::iter::repeat_n(b'y', 2 * MAX_FRAME_LEN));
        let mut reader = BufReader::new(&input[..]);

        let err = read_frame(&mut reader).await.expect_err("too long");
        assert!(matches!(err, FrameError::TooLong { limit: MAX_FRAME_LEN }));
        assert!(err.is_recoverable());

        let next = read_frame(&mut reader).await.expect("read").expect("frame");
        assert_eq!(next.content, "small");

        // An endless line with no delimiter before EOF is still bounded.
        let err = read_frame(&mut reader).await.expect_err("too long");
        assert!(matches!(err, FrameError::TooLong { .. }));
        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }
}
