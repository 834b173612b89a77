use tokio::io::{AsyncRead, AsyncReadExt};

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the stream")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("payload of {0} bytes exceeds the cap")]
    TooBig(u64),
}

/// Reads one frame. Payload lengths of 7, 16, and 64 bits are all
/// accepted; anything longer than `max_payload` is a protocol failure.
/// Data frames from the client must be masked.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    read_exact(reader, &mut header).await?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(FrameError::Protocol("reserved bits set".to_string()));
    }
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    let mut payload_len = (header[1] & 0x7F) as u64;

    if payload_len == 126 {
        let mut extended = [0u8; 2];
        read_exact(reader, &mut extended).await?;
        payload_len = u16::from_be_bytes(extended) as u64;
    } else if payload_len == 127 {
        let mut extended = [0u8; 8];
        read_exact(reader, &mut extended).await?;
        payload_len = u64::from_be_bytes(extended);
    }

    if payload_len > max_payload as u64 {
        return Err(FrameError::TooBig(payload_len));
    }
    let is_data_frame = matches!(opcode, OP_CONTINUATION | OP_TEXT | OP_BINARY);
    if is_data_frame && !masked {
        return Err(FrameError::Protocol(
            "unmasked data frame from client".to_string(),
        ));
    }

    let mut mask = [0u8; 4];
    if masked {
        read_exact(reader, &mut mask).await?;
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        read_exact(reader, &mut payload).await?;
        if masked {
            for (idx, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[idx % 4];
            }
        }
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::Closed)
        }
        Err(error) => Err(FrameError::Io(error)),
    }
}

/// Server-to-client frame: FIN set, unmasked.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | (opcode & 0x0F));
    let len = payload.len();
    if len <= 125 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

pub fn encode_text(message: &str) -> Vec<u8> {
    encode_frame(OP_TEXT, message.as_bytes())
}

/// Close frame; the orderly shutdown form carries no payload.
pub fn encode_close(code: Option<u16>) -> Vec<u8> {
    match code {
        Some(code) => encode_frame(OP_CLOSE, &code.to_be_bytes()),
        None => encode_frame(OP_CLOSE, &[]),
    }
}

/// Client-side form with the mandatory mask. The server never sends these;
/// test harnesses and tooling do.
pub fn encode_masked(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | (opcode & 0x0F));
    let len = payload.len();
    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(idx, byte)| byte ^ mask[idx % 4]));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];
    const MAX: usize = 64 * 1024;

    async fn read_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = bytes;
        read_frame(&mut cursor, MAX).await
    }

    #[tokio::test]
    async fn masked_text_frame_round_trips() {
        let encoded = encode_masked(OP_TEXT, b"hello maze", MASK);
        let frame = read_bytes(&encoded).await.expect("decode");
        assert!(frame.fin);
        assert_eq!(frame.opcode, OP_TEXT);
        assert_eq!(frame.payload, b"hello maze");
    }

    #[tokio::test]
    async fn sixteen_bit_length_is_accepted() {
        let payload = vec![b'x'; 300];
        let encoded = encode_masked(OP_TEXT, &payload, MASK);
        assert_eq!(encoded[1] & 0x7F, 126);
        let frame = read_bytes(&encoded).await.expect("decode");
        assert_eq!(frame.payload.len(), 300);
    }

    #[tokio::test]
    async fn sixty_four_bit_length_is_accepted() {
        let payload = vec![b'y'; 2000];
        let mut encoded = Vec::new();
        encoded.push(0x80 | OP_TEXT);
        encoded.push(0x80 | 127);
        encoded.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        encoded.extend_from_slice(&MASK);
        encoded.extend(
            payload
                .iter()
                .enumerate()
                .map(|(idx, byte)| byte ^ MASK[idx % 4]),
        );
        let frame = read_bytes(&encoded).await.expect("decode");
        assert_eq!(frame.payload.len(), 2000);
    }

    #[tokio::test]
    async fn oversized_payload_is_a_protocol_error() {
        let mut encoded = Vec::new();
        encoded.push(0x80 | OP_TEXT);
        encoded.push(0x80 | 127);
        encoded.extend_from_slice(&(MAX as u64 + 1).to_be_bytes());
        encoded.extend_from_slice(&MASK);
        let error = read_bytes(&encoded).await.expect_err("reject");
        assert!(matches!(error, FrameError::TooBig(_)));
    }

    #[tokio::test]
    async fn unmasked_data_frame_is_a_protocol_error() {
        let encoded = encode_text("server style frame");
        let error = read_bytes(&encoded).await.expect_err("reject");
        assert!(matches!(error, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn continuation_frames_decode_with_fin_clear() {
        let mut encoded = encode_masked(OP_TEXT, b"fragmented", MASK);
        encoded[0] &= 0x7F; // clear FIN
        let frame = read_bytes(&encoded).await.expect("decode");
        assert!(!frame.fin);
    }

    #[tokio::test]
    async fn control_frames_may_be_unmasked() {
        let encoded = encode_close(Some(CLOSE_PROTOCOL_ERROR));
        let frame = read_bytes(&encoded).await.expect("decode");
        assert_eq!(frame.opcode, OP_CLOSE);
        assert_eq!(frame.payload, CLOSE_PROTOCOL_ERROR.to_be_bytes());

        let ping = encode_frame(OP_PING, b"stamp");
        let frame = read_bytes(&ping).await.expect("decode");
        assert_eq!(frame.opcode, OP_PING);
        assert_eq!(frame.payload, b"stamp");
    }

    #[tokio::test]
    async fn truncated_stream_reports_closed() {
        let encoded = encode_masked(OP_TEXT, b"cut short", MASK);
        let error = read_bytes(&encoded[..4]).await.expect_err("reject");
        assert!(matches!(error, FrameError::Closed));
    }

    #[test]
    fn orderly_close_has_an_empty_payload() {
        let encoded = encode_close(None);
        assert_eq!(encoded, vec![0x80 | OP_CLOSE, 0x00]);
    }
}
