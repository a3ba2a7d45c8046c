//! Binary wire protocol shared by clients, the router and the compute server.
//!
//! All integers are big-endian.
//!
//! ```text
//! matrix         := rows:u32 { len:u32 value:i32 * len } * rows
//! request        := matrix(A) matrix(B)
//! routed request := client_id:i32 request
//! reply          := 0x00 matrix execution_time_ns:i64 speed_up:f64 efficiency:f64
//!                 | 0x01 kind:u8 len:u32 message:utf8[len]
//! ```
//!
//! Parsing works on a byte slice and never consumes input: callers keep
//! reading into their buffer until a parse returns [`ParseResult::Complete`].
//! A parse first walks only the length prefixes of the frame, which costs one
//! step per row, and decodes values once every byte of the frame is present.

use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::error::Error;
use crate::matrix::Matrix;
use crate::metrics::Metrics;

/// Largest row count or row length accepted from the wire.
pub const MAX_DIMENSION: usize = 4096;

/// Largest fault message accepted from the wire.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

const STATUS_COMPUTED: u8 = 0;
const STATUS_FAILED: u8 = 1;

/// Two operands submitted for multiplication.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRequest {
    pub a: Matrix,
    pub b: Matrix,
}

/// A compute request prefixed with the identifier the client chose.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRequest {
    pub client_id: i32,
    pub request: ComputeRequest,
}

/// Product of a request plus the metrics measured while computing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeResult {
    pub product: Matrix,
    pub metrics: Metrics,
}

/// Classification of a failed session, carried in a failure reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    DimensionMismatch = 1,
    MalformedPayload = 2,
    BackendUnreachable = 3,
    Internal = 4,
}

impl FaultKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FaultKind::DimensionMismatch),
            2 => Some(FaultKind::MalformedPayload),
            3 => Some(FaultKind::BackendUnreachable),
            4 => Some(FaultKind::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::DimensionMismatch => "dimension mismatch",
            FaultKind::MalformedPayload => "malformed payload",
            FaultKind::BackendUnreachable => "backend unreachable",
            FaultKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A session failure reported to the peer instead of dropping the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

/// Response frame sent back for every request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Computed(ComputeResult),
    Failed(Fault),
}

impl Reply {
    /// Build a failure reply describing `err`.
    pub fn failed(err: &Error) -> Reply {
        let mut message = err.to_string();
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Reply::Failed(Fault {
            kind: err.fault_kind(),
            message,
        })
    }

    /// Turn a failure reply into [`Error::Remote`].
    pub fn into_result(self) -> Result<ComputeResult, Error> {
        match self {
            Reply::Computed(result) => Ok(result),
            Reply::Failed(Fault { kind, message }) => Err(Error::Remote { kind, message }),
        }
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// Need more data to complete parsing
    #[error("incomplete frame")]
    Incomplete,
    #[error("dimension {0} exceeds limit of {max}", max = MAX_DIMENSION)]
    DimensionTooLarge(usize),
    #[error("row {row} has {len} columns, expected {expected}")]
    RaggedRow {
        row: usize,
        len: usize,
        expected: usize,
    },
    #[error("unknown reply status {0:#04x}")]
    UnknownStatus(u8),
    #[error("unknown fault kind {0}")]
    UnknownFault(u8),
    #[error("fault message of {0} bytes exceeds limit")]
    MessageTooLong(usize),
    #[error("fault message is not valid UTF-8")]
    InvalidUtf8,
    #[error("negative execution time {0}")]
    NegativeTime(i64),
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::MalformedPayload(err.to_string())
    }
}

/// Result of parsing a frame
#[derive(Debug)]
pub enum ParseResult<T> {
    /// Successfully parsed frame with bytes consumed
    Complete(T, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(ParseError),
}

/// A message that can be framed on a stream.
pub trait Frame: Sized {
    /// Parse one frame from the start of `buffer`.
    fn parse(buffer: &[u8]) -> ParseResult<Self> {
        let mut scan = Cursor::new(buffer);
        match Self::scan(&mut scan) {
            Ok(()) => {}
            Err(ParseError::Incomplete) => return ParseResult::Incomplete,
            Err(e) => return ParseResult::Error(e),
        }

        let frame_len = scan.pos;
        let mut cursor = Cursor::new(&buffer[..frame_len]);
        match Self::decode(&mut cursor) {
            Ok(frame) => ParseResult::Complete(frame, frame_len),
            Err(e) => ParseResult::Error(e),
        }
    }

    /// Encode the frame to bytes
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Advance past one frame, checking only its structure.
    fn scan(cursor: &mut Cursor<'_>) -> Result<(), ParseError>;

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, ParseError>;

    fn encode_into(&self, buf: &mut BytesMut);
}

impl Frame for ComputeRequest {
    fn scan(cursor: &mut Cursor<'_>) -> Result<(), ParseError> {
        scan_matrix(cursor)?;
        scan_matrix(cursor)
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let a = decode_matrix(cursor)?;
        let b = decode_matrix(cursor)?;
        Ok(ComputeRequest { a, b })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        encode_matrix(&self.a, buf);
        encode_matrix(&self.b, buf);
    }
}

impl Frame for RoutedRequest {
    fn scan(cursor: &mut Cursor<'_>) -> Result<(), ParseError> {
        cursor.take(4)?;
        ComputeRequest::scan(cursor)
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let client_id = cursor.i32()?;
        let request = ComputeRequest::decode(cursor)?;
        Ok(RoutedRequest { client_id, request })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32(self.client_id);
        self.request.encode_into(buf);
    }
}

impl Frame for Reply {
    fn scan(cursor: &mut Cursor<'_>) -> Result<(), ParseError> {
        match cursor.u8()? {
            STATUS_COMPUTED => {
                scan_matrix(cursor)?;
                // execution time, speed-up, efficiency
                cursor.take(24)?;
            }
            STATUS_FAILED => {
                fault_kind(cursor)?;
                let len = message_len(cursor)?;
                cursor.take(len)?;
            }
            other => return Err(ParseError::UnknownStatus(other)),
        }
        Ok(())
    }

    fn decode(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        match cursor.u8()? {
            STATUS_COMPUTED => {
                let product = decode_matrix(cursor)?;
                let execution_time_ns = cursor.i64()?;
                if execution_time_ns < 0 {
                    return Err(ParseError::NegativeTime(execution_time_ns));
                }
                let speed_up = cursor.f64()?;
                let efficiency = cursor.f64()?;
                Ok(Reply::Computed(ComputeResult {
                    product,
                    metrics: Metrics {
                        execution_time_ns: execution_time_ns as u64,
                        speed_up,
                        efficiency,
                    },
                }))
            }
            STATUS_FAILED => {
                let kind = fault_kind(cursor)?;
                let len = message_len(cursor)?;
                let message = std::str::from_utf8(cursor.take(len)?)
                    .map_err(|_| ParseError::InvalidUtf8)?
                    .to_string();
                Ok(Reply::Failed(Fault { kind, message }))
            }
            other => Err(ParseError::UnknownStatus(other)),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Computed(result) => {
                buf.put_u8(STATUS_COMPUTED);
                encode_matrix(&result.product, buf);
                buf.put_i64(i64::try_from(result.metrics.execution_time_ns).unwrap_or(i64::MAX));
                buf.put_f64(result.metrics.speed_up);
                buf.put_f64(result.metrics.efficiency);
            }
            Reply::Failed(fault) => {
                buf.put_u8(STATUS_FAILED);
                buf.put_u8(fault.kind as u8);
                buf.put_u32(fault.message.len() as u32);
                buf.extend_from_slice(fault.message.as_bytes());
            }
        }
    }
}

fn fault_kind(cursor: &mut Cursor<'_>) -> Result<FaultKind, ParseError> {
    let raw = cursor.u8()?;
    FaultKind::from_u8(raw).ok_or(ParseError::UnknownFault(raw))
}

fn message_len(cursor: &mut Cursor<'_>) -> Result<usize, ParseError> {
    let len = cursor.u32()? as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(ParseError::MessageTooLong(len));
    }
    Ok(len)
}

fn scan_matrix(cursor: &mut Cursor<'_>) -> Result<(), ParseError> {
    let rows = cursor.dimension()?;
    let mut cols = 0;
    for row in 0..rows {
        let len = cursor.dimension()?;
        if row == 0 {
            cols = len;
        } else if len != cols {
            return Err(ParseError::RaggedRow {
                row,
                len,
                expected: cols,
            });
        }
        cursor.take(len * 4)?;
    }
    Ok(())
}

fn decode_matrix(cursor: &mut Cursor<'_>) -> Result<Matrix, ParseError> {
    let rows = cursor.dimension()?;
    let mut cols = 0;
    let mut data = Vec::new();
    for row in 0..rows {
        let len = cursor.dimension()?;
        if row == 0 {
            cols = len;
            // Only reached once the whole frame is buffered.
            data.reserve(rows * cols);
        } else if len != cols {
            return Err(ParseError::RaggedRow {
                row,
                len,
                expected: cols,
            });
        }
        let bytes = cursor.take(len * 4)?;
        data.extend(
            bytes
                .chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]])),
        );
    }
    // Every row was checked against `cols`, so the length always fits.
    Matrix::from_vec(rows, cols, data).map_err(|_| ParseError::RaggedRow {
        row: rows,
        len: 0,
        expected: cols,
    })
}

fn encode_matrix(matrix: &Matrix, buf: &mut BytesMut) {
    buf.reserve(4 + matrix.rows() * (4 + matrix.cols() * 4));
    buf.put_u32(matrix.rows() as u32);
    for row in matrix.iter_rows() {
        buf.put_u32(row.len() as u32);
        for &value in row {
            buf.put_i32(value);
        }
    }
}

/// Read position over a borrowed buffer. Every accessor reports
/// [`ParseError::Incomplete`] when the buffer runs out.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).ok_or(ParseError::Incomplete)?;
        let bytes = self.buf.get(self.pos..end).ok_or(ParseError::Incomplete)?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        self.array().map(u32::from_be_bytes)
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        self.array().map(i32::from_be_bytes)
    }

    fn i64(&mut self) -> Result<i64, ParseError> {
        self.array().map(i64::from_be_bytes)
    }

    fn f64(&mut self) -> Result<f64, ParseError> {
        self.array().map(f64::from_be_bytes)
    }

    fn dimension(&mut self) -> Result<usize, ParseError> {
        let n = self.u32()? as usize;
        if n > MAX_DIMENSION {
            return Err(ParseError::DimensionTooLarge(n));
        }
        Ok(n)
    }
}
