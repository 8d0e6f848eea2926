//! DAP wire framing
//!
//! Every message travels as a `Content-Length: <n>` header, a blank line and
//! exactly `n` bytes of JSON. This module turns frames into
//! [`ProtocolMessage`] values and back.

use crate::types::ProtocolMessage;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body we accept from the adapter (10 MB)
pub const MAX_CONTENT_LENGTH: usize = 10_000_000;

const CONTENT_LENGTH: &str = "Content-Length:";

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("stream closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),
    #[error("truncated frame: expected {expected} body bytes")]
    Truncated { expected: usize },
    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
}

impl FrameError {
    /// Closed streams and I/O failures are transport problems, the rest are
    /// framing violations
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Closed | FrameError::Io(_))
    }
}

/// Serialize a message with its header
pub fn encode_frame(message: &ProtocolMessage) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("{} {}\r\n\r\n", CONTENT_LENGTH, body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a frame body
pub fn parse_message(body: &[u8]) -> Result<ProtocolMessage, FrameError> {
    Ok(serde_json::from_slice(body)?)
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, message: &ProtocolMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns [`FrameError::Closed`] when the stream ends on a frame boundary.
/// Header lines other than `Content-Length` are ignored, as are stray blank
/// lines between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<ProtocolMessage, FrameError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut content_length: Option<usize> = None;
    let mut seen_header = false;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            if seen_header {
                return Err(FrameError::Truncated {
                    expected: content_length.unwrap_or(0),
                });
            }
            return Err(FrameError::Closed);
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if !seen_header {
                continue;
            }
            break;
        }

        seen_header = true;
        if let Some(value) = text.strip_prefix(CONTENT_LENGTH) {
            let value = value.trim();
            let len: usize = value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            if len > MAX_CONTENT_LENGTH {
                return Err(FrameError::InvalidContentLength(value.to_string()));
            }
            content_length = Some(len);
        } else {
            log::debug!("Ignoring header line: {}", text);
        }
    }

    let len = content_length.ok_or(FrameError::MissingContentLength)?;
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated { expected: len });
        }
        Err(e) => return Err(e.into()),
    }

    parse_message(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Request, Response};
    use serde_json::json;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    fn framed(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_encode_request() {
        let message = ProtocolMessage::Request(Request {
            seq: 1,
            command: "threads".into(),
            arguments: serde_json::Value::Null,
        });
        let frame = encode_frame(&message).unwrap();
        let text = String::from_utf8(frame).unwrap();

        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));

        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(value, json!({"type": "request", "seq": 1, "command": "threads"}));
    }

    #[test]
    fn test_parse_response_without_body() {
        let body = br#"{"type":"response","seq":7,"request_seq":3,"success":true,"command":"continue"}"#;
        match parse_message(body).unwrap() {
            ProtocolMessage::Response(response) => {
                assert_eq!(response.request_seq, 3);
                assert!(response.success);
                assert!(response.body.is_null());
                assert_eq!(response.message, None);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        let body = br#"{"type":"banana","seq":1}"#;
        assert!(matches!(parse_message(body), Err(FrameError::Body(_))));
    }

    #[tokio::test]
    async fn test_read_frame_split_across_reads() {
        let body = r#"{"type":"event","seq":4,"event":"stopped","body":{"reason":"breakpoint","threadId":1}}"#;
        let frame = framed(body);
        let (head, tail) = frame.split_at(9);

        let mock = Builder::new().read(head).read(tail).build();
        let mut reader = BufReader::new(mock);

        let message = read_frame(&mut reader).await.unwrap();
        assert_eq!(
            message,
            ProtocolMessage::Event(Event {
                seq: 4,
                event: "stopped".into(),
                body: json!({"reason": "breakpoint", "threadId": 1}),
            })
        );
        assert!(matches!(read_frame(&mut reader).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_read_two_frames_with_extra_header() {
        let first = r#"{"type":"response","seq":1,"request_seq":1,"success":true,"command":"initialize","body":{}}"#;
        let second = r#"{"type":"event","seq":2,"event":"initialized"}"#;
        let mut data = format!(
            "Content-Type: application/vscode-jsonrpc\r\nContent-Length: {}\r\n\r\n{}",
            first.len(),
            first
        )
        .into_bytes();
        data.extend(framed(second));

        let mock = Builder::new().read(&data).build();
        let mut reader = BufReader::new(mock);

        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            ProtocolMessage::Response(Response { request_seq: 1, .. })
        ));
        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            ProtocolMessage::Event(Event { seq: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        let mock = Builder::new()
            .read(b"Content-Length: 50\r\n\r\n{\"type\":")
            .build();
        let mut reader = BufReader::new(mock);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 50 }));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_read_frame_bad_length() {
        let mock = Builder::new().read(b"Content-Length: abc\r\n\r\n").build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::InvalidContentLength(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_oversized_length() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_CONTENT_LENGTH + 1);
        let mock = Builder::new().read(header.as_bytes()).build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::InvalidContentLength(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_missing_length() {
        let mock = Builder::new().read(b"X-Other: 1\r\n\r\n{}").build();
        let mut reader = BufReader::new(mock);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let message = ProtocolMessage::Request(Request {
            seq: 2,
            command: "pause".into(),
            arguments: json!({"threadId": 1}),
        });
        let expected = encode_frame(&message).unwrap();
        let mut mock = Builder::new().write(&expected).build();
        write_frame(&mut mock, &message).await.unwrap();
    }
}
