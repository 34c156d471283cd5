// Field-level wire format for the Iris relay protocol.
//
// Every frame is an opcode byte followed by a fixed field sequence; there is
// no outer length prefix, so inbound fields are decoded incrementally against
// the byte stream rather than from a pre-read buffer.
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Magic string opening the relay handshake.
pub const MAGIC: &str = "iris-relay-v1.0";

const VARINT_DATA_BITS: u32 = 7;
const VARINT_CONT_BIT: u8 = 1 << VARINT_DATA_BITS;
const VARINT_DATA_MASK: u8 = VARINT_CONT_BIT - 1;

/// Longest legal varint: ceil(64 / 7) bytes.
pub const VARINT_MAX_BYTES: usize = 10;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("boolean expected, received {0}")]
    InvalidBool(u8),
    #[error("varint longer than {VARINT_MAX_BYTES} bytes")]
    VarintOverlong,
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("string field is not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Relay protocol opcodes. The ordinal values are part of the wire contract
/// and must match the relay's enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Init = 0,
    InitAck = 1,
    Broadcast = 2,
    Request = 3,
    Reply = 4,
    Subscribe = 5,
    Unsubscribe = 6,
    Publish = 7,
    TunInit = 8,
    TunConfirm = 9,
    TunAllow = 10,
    TunTransfer = 11,
    TunClose = 12,
    Close = 13,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => OpCode::Init,
            1 => OpCode::InitAck,
            2 => OpCode::Broadcast,
            3 => OpCode::Request,
            4 => OpCode::Reply,
            5 => OpCode::Subscribe,
            6 => OpCode::Unsubscribe,
            7 => OpCode::Publish,
            8 => OpCode::TunInit,
            9 => OpCode::TunConfirm,
            10 => OpCode::TunAllow,
            11 => OpCode::TunTransfer,
            12 => OpCode::TunClose,
            13 => OpCode::Close,
            other => return Err(Error::UnknownOpCode(other)),
        })
    }
}

// ---- encoding -------------------------------------------------------------
//
// Outbound frames are assembled into a scratch buffer and written to the
// socket in one atomic write, so the encoders are plain appends.

pub fn put_op(buf: &mut BytesMut, op: OpCode) {
    buf.put_u8(op as u8);
}

pub fn put_bool(buf: &mut BytesMut, data: bool) {
    buf.put_u8(u8::from(data));
}

pub fn put_varint(buf: &mut BytesMut, data: u64) {
    let mut left = data;
    loop {
        let chunk = (left & u64::from(VARINT_DATA_MASK)) as u8;
        left >>= VARINT_DATA_BITS;
        if left != 0 {
            buf.put_u8(VARINT_CONT_BIT | chunk);
        } else {
            buf.put_u8(chunk);
            return;
        }
    }
}

pub fn put_binary(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn put_string(buf: &mut BytesMut, data: &str) {
    put_binary(buf, data.as_bytes());
}

// ---- decoding -------------------------------------------------------------

pub async fn read_byte<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u8> {
    Ok(stream.read_u8().await?)
}

pub async fn read_op<R: AsyncRead + Unpin>(stream: &mut R) -> Result<OpCode> {
    OpCode::try_from(read_byte(stream).await?)
}

pub async fn read_bool<R: AsyncRead + Unpin>(stream: &mut R) -> Result<bool> {
    match read_byte(stream).await? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::InvalidBool(other)),
    }
}

pub async fn read_varint<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u64> {
    let mut result = 0u64;
    for index in 0..VARINT_MAX_BYTES {
        let byte = read_byte(stream).await?;
        result |= u64::from(byte & VARINT_DATA_MASK) << (index as u32 * VARINT_DATA_BITS);
        if byte & VARINT_CONT_BIT == 0 {
            return Ok(result);
        }
    }
    Err(Error::VarintOverlong)
}

pub async fn read_binary<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Bytes> {
    let length = read_varint(stream).await? as usize;
    let mut data = vec![0u8; length];
    stream.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

pub async fn read_string<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String> {
    let data = read_binary(stream).await?;
    Ok(String::from_utf8(data.to_vec())?)
}
