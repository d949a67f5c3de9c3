//! Connection level framing.
//!
//! Request:  `u64 id | i32 verb | u32 len | payload`
//! Response: `u64 id | u8 status | u32 len | payload`
//!
//! A response with [`STATUS_ERR`] carries an encoded string message as payload.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::codec::{Decode as _, Encode as _, FramingError};

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

/// Upper bound for a single payload; protects against corrupt length prefixes.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const REQUEST_HEADER_SIZE: usize = 8 + 4 + 4;
const RESPONSE_HEADER_SIZE: usize = 8 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub id: u64,
    /// Raw verb id, unknown ids are answered with an error response.
    pub verb: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: u64,
    pub result: Result<Vec<u8>, String>,
}

#[derive(Debug)]
pub enum FrameReadError {
    Io(io::Error),
    Framing(FramingError),
}

impl std::fmt::Display for FrameReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameReadError::Io(err) => write!(f, "FrameReadError: io: {err}"),
            FrameReadError::Framing(err) => write!(f, "FrameReadError: {err}"),
        }
    }
}

impl std::error::Error for FrameReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameReadError::Io(err) => Some(err),
            FrameReadError::Framing(err) => Some(err),
        }
    }
}

impl From<io::Error> for FrameReadError {
    fn from(err: io::Error) -> Self {
        FrameReadError::Io(err)
    }
}

impl From<FramingError> for FrameReadError {
    fn from(err: FramingError) -> Self {
        FrameReadError::Framing(err)
    }
}

/// Payloads beyond [`MAX_PAYLOAD_SIZE`] would be rejected by the peer.
fn check_payload_size(payload: &[u8]) -> Result<(), FramingError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::Oversized {
            size: payload.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

impl RequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        check_payload_size(&self.payload)?;
        let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + self.payload.len());
        self.id.encode(&mut out)?;
        self.verb.encode(&mut out)?;
        // the payload is already encoded, only the length prefix is added here
        self.payload.encode(&mut out)?;
        Ok(out)
    }

    /// Read the next request, `Ok(None)` on a clean end of stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, FrameReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; REQUEST_HEADER_SIZE];
        if !read_header(reader, &mut header).await? {
            return Ok(None);
        }

        let mut input = &header[..];
        let id = u64::decode(&mut input)?;
        let verb = i32::decode(&mut input)?;
        let size = u32::decode(&mut input)? as usize;

        let payload = read_payload(reader, size).await?;
        Ok(Some(Self { id, verb, payload }))
    }
}

impl ResponseFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let message;
        let (status, payload): (u8, &[u8]) = match &self.result {
            Ok(payload) => (STATUS_OK, payload),
            Err(msg) => {
                message = msg.to_bytes()?;
                (STATUS_ERR, &message)
            }
        };
        check_payload_size(payload)?;

        let mut out = Vec::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
        self.id.encode(&mut out)?;
        status.encode(&mut out)?;
        payload.encode(&mut out)?;
        Ok(out)
    }

    /// Read the next response, `Ok(None)` on a clean end of stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, FrameReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; RESPONSE_HEADER_SIZE];
        if !read_header(reader, &mut header).await? {
            return Ok(None);
        }

        let mut input = &header[..];
        let id = u64::decode(&mut input)?;
        let status = u8::decode(&mut input)?;
        let size = u32::decode(&mut input)? as usize;

        let payload = read_payload(reader, size).await?;
        let result = match status {
            STATUS_OK => Ok(payload),
            STATUS_ERR => {
                // diagnostic text only, kept readable whatever the peer sent
                let message = <Vec<u8>>::from_bytes(&payload)?;
                Err(String::from_utf8_lossy(&message).into_owned())
            }
            other => return Err(FramingError::UnknownStatus(other).into()),
        };
        Ok(Some(Self { id, result }))
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_header<R>(reader: &mut R, header: &mut [u8]) -> Result<bool, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FramingError::UnexpectedEof {
                needed: header.len(),
                available: filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(true)
}

async fn read_payload<R>(reader: &mut R, size: usize) -> Result<Vec<u8>, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    if size > MAX_PAYLOAD_SIZE {
        return Err(FramingError::Oversized {
            size,
            limit: MAX_PAYLOAD_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameReadError::Framing(FramingError::UnexpectedEof {
                needed: size,
                available: 0,
            })
        } else {
            FrameReadError::Io(err)
        }
    })?;
    Ok(payload)
}
