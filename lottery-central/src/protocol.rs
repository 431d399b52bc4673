//! Length-framed text protocol spoken between agencies and the central.
//!
//! Requests travel as `[u16 big-endian length][UTF-8 payload]`. The payload's
//! first line names the message kind and the remaining lines carry its body.
//! Responses are single newline-terminated text lines.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bet::{parse_agency, AgencyId, BetBatch, BetParseError};

pub const BETS: &str = "bets";
pub const DELIVERY_ENDED: &str = "delivery-ended";
pub const ASK_WINNERS: &str = "ask-winners";

/// Answer to `ask-winners` while some agency has not finished submitting.
pub const PENDING_SENTINEL: &str = "PENDING_RAFFLE";

/// Sent to a connection refused at admission, right before closing it.
pub const REJECTION_LINE: &str = "ERROR: Maximum number of agencies reached";

/// Largest payload a two-byte length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const ACK_SEPARATOR: &str = "-";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame carries no message kind")]
    Empty,
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("`{0}` expects exactly one agency line")]
    AgencyLine(&'static str),
    #[error(transparent)]
    Agency(#[from] BetParseError),
    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
    #[error("unexpected response `{0}`")]
    UnexpectedResponse(String),
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bets(BetBatch),
    DeliveryEnded { agency: AgencyId },
    AskWinners { agency: AgencyId },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Bets(_) => BETS,
            Request::DeliveryEnded { .. } => DELIVERY_ENDED,
            Request::AskWinners { .. } => ASK_WINNERS,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload)?;
        let mut lines = text
            .lines()
            .map(|line| line.trim_end_matches(LINE_ENDINGS))
            .filter(|line| !line.trim().is_empty());

        let kind = lines.next().ok_or(ProtocolError::Empty)?.trim();
        match kind {
            BETS => Ok(Request::Bets(BetBatch::parse_lines(lines))),
            DELIVERY_ENDED => Ok(Request::DeliveryEnded {
                agency: single_agency(DELIVERY_ENDED, lines)?,
            }),
            ASK_WINNERS => Ok(Request::AskWinners {
                agency: single_agency(ASK_WINNERS, lines)?,
            }),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        let mut payload = String::from(self.kind());
        payload.push('\n');
        match self {
            Request::Bets(batch) => {
                for bet in &batch.bets {
                    payload.push_str(&bet.to_wire());
                    payload.push('\n');
                }
            }
            Request::DeliveryEnded { agency } | Request::AskWinners { agency } => {
                payload.push_str(&agency.to_string());
            }
        }
        payload
    }
}

fn single_agency<'a, I>(kind: &'static str, mut lines: I) -> Result<AgencyId, ProtocolError>
where
    I: Iterator<Item = &'a str>,
{
    match (lines.next(), lines.next()) {
        (Some(line), None) => Ok(parse_agency(line)?),
        _ => Err(ProtocolError::AgencyLine(kind)),
    }
}

/// A server reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Numbers of the bets that were stored.
    Ack(Vec<u64>),
    Winners(usize),
    Pending,
    Rejected,
}

impl Response {
    pub fn encode(&self) -> String {
        let mut line = match self {
            Response::Ack(numbers) => numbers
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(ACK_SEPARATOR),
            Response::Winners(count) => count.to_string(),
            Response::Pending => PENDING_SENTINEL.to_string(),
            Response::Rejected => REJECTION_LINE.to_string(),
        };
        line.push('\n');
        line
    }

    /// Interprets a line received after sending `bets`.
    pub fn decode_ack(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(LINE_ENDINGS);
        if line == REJECTION_LINE {
            return Ok(Response::Rejected);
        }
        if line.is_empty() {
            return Ok(Response::Ack(Vec::new()));
        }
        line.split(ACK_SEPARATOR)
            .map(|number| number.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map(Response::Ack)
            .map_err(|_| ProtocolError::UnexpectedResponse(line.to_string()))
    }

    /// Interprets a line received after sending `ask-winners`.
    pub fn decode_winners(line: &str) -> Result<Self, ProtocolError> {
        match line.trim_end_matches(LINE_ENDINGS) {
            PENDING_SENTINEL => Ok(Response::Pending),
            REJECTION_LINE => Ok(Response::Rejected),
            other => other
                .parse()
                .map(Response::Winners)
                .map_err(|_| ProtocolError::UnexpectedResponse(other.to_string())),
        }
    }
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closes the stream before sending any byte
/// of a new frame. Short reads are accumulated until the declared length is
/// complete; a stream ending inside a frame yields [`ProtocolError::Truncated`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    fill(reader, &mut len_buf[first..]).await?;

    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut payload = vec![0u8; len];
    fill(reader, &mut payload).await?;
    Ok(Some(payload))
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
        Err(err) => Err(err.into()),
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Request::decode(&payload).map(Some),
        None => Ok(None),
    }
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, request.encode().as_bytes()).await
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.encode().as_bytes()).await?;
    writer.flush().await
}

/// Reads one response line. `Ok(None)` means the server closed the connection.
pub async fn read_response_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}
