//! Wire frames for the netdepot control plane.
//!
//! Every control-plane exchange is one UDP datagram carrying one of two
//! binary shapes. A *simple* frame is a 10-byte NUL-padded command field, a
//! big-endian `u64` correlation sequence and a raw data payload; a *complex*
//! frame carries an additional big-endian `u64` parameter between the
//! sequence and the data. Framing is implicit in the datagram length: there
//! is no terminator and `data` may contain any byte, including NUL.
//!
//! Responders echo the requester's sequence, so receivers validate frames
//! against the exchange they belong to. The [`FrameError`] `Display` strings
//! are exactly the reasons shown in the package-skipping notice both sides
//! print for a rejected datagram.

use bytes::{BufMut, BytesMut};

/// Width of the command field.
pub const CMD_LEN: usize = 10;
/// Largest UDP payload the protocol will put on the wire.
pub const MAX_UDP_PAYLOAD: usize = 65_507;
/// Encoded length of a simple frame with empty data.
pub const SIMPLE_HEADER_LEN: usize = 18;
/// Encoded length of a complex frame with empty data.
pub const COMPLEX_HEADER_LEN: usize = 26;
/// Data ceiling for a simple frame.
pub const SIMPLE_DATA_MAX: usize = MAX_UDP_PAYLOAD - SIMPLE_HEADER_LEN;
/// Data ceiling for a complex frame.
pub const COMPLEX_DATA_MAX: usize = MAX_UDP_PAYLOAD - COMPLEX_HEADER_LEN;

/// The command vocabulary.
pub mod cmd {
    /// Client discovery probe, sent to the group. Simple, empty data.
    pub const HELLO: &str = "HELLO";
    /// Server discovery reply. Complex: free bytes and the group address.
    pub const GOOD_DAY: &str = "GOOD_DAY";
    /// Client catalog query. Simple: substring pattern.
    pub const LIST: &str = "LIST";
    /// Server catalog reply. Simple: `\n`-joined names, possibly several
    /// frames per query.
    pub const MY_LIST: &str = "MY_LIST";
    /// Client download request. Simple: filename.
    pub const GET: &str = "GET";
    /// Server download offer. Complex: TCP port, filename echo.
    pub const CONNECT_ME: &str = "CONNECT_ME";
    /// Client upload request. Complex: file size, filename.
    pub const ADD: &str = "ADD";
    /// Server upload admission. Complex: TCP port, empty data.
    pub const CAN_ADD: &str = "CAN_ADD";
    /// Server upload refusal. Simple: filename echo.
    pub const NO_WAY: &str = "NO_WAY";
    /// Client removal order, sent to the group. Simple: filename.
    pub const DEL: &str = "DEL";
}

/// Reasons a received datagram is rejected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Shorter than the header of the expected shape.
    #[error("Message too small")]
    TooShort,
    /// Correlation sequence does not match the originating request.
    #[error("Wrong cmd_seq")]
    WrongSeq,
    /// Command field differs from the expected command.
    #[error("Wrong cmd")]
    WrongCmd,
    /// Data payload differs from the prescribed echo.
    #[error("Wrong data")]
    WrongData,
    /// Data would not fit in one datagram.
    #[error("data of {len} bytes exceeds the {max}-byte frame ceiling")]
    Oversize {
        /// Offered data length.
        len: usize,
        /// Ceiling for the requested shape.
        max: usize,
    },
}

fn put_cmd(buf: &mut BytesMut, command: &str) {
    let bytes = command.as_bytes();
    let take = bytes.len().min(CMD_LEN);
    buf.put_slice(&bytes[..take]);
    buf.put_bytes(0, CMD_LEN - take);
}

/// Encodes a simple frame. Command bytes past the field width are
/// discarded; oversized data is refused, never truncated.
///
/// # Errors
///
/// Returns [`FrameError::Oversize`] when `data` exceeds
/// [`SIMPLE_DATA_MAX`].
pub fn encode_simple(command: &str, seq: u64, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > SIMPLE_DATA_MAX {
        return Err(FrameError::Oversize {
            len: data.len(),
            max: SIMPLE_DATA_MAX,
        });
    }
    let mut buf = BytesMut::with_capacity(SIMPLE_HEADER_LEN + data.len());
    put_cmd(&mut buf, command);
    buf.put_u64(seq);
    buf.put_slice(data);
    Ok(buf.to_vec())
}

/// Encodes a complex frame.
///
/// # Errors
///
/// Returns [`FrameError::Oversize`] when `data` exceeds
/// [`COMPLEX_DATA_MAX`].
pub fn encode_complex(command: &str, seq: u64, param: u64, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > COMPLEX_DATA_MAX {
        return Err(FrameError::Oversize {
            len: data.len(),
            max: COMPLEX_DATA_MAX,
        });
    }
    let mut buf = BytesMut::with_capacity(COMPLEX_HEADER_LEN + data.len());
    put_cmd(&mut buf, command);
    buf.put_u64(seq);
    buf.put_u64(param);
    buf.put_slice(data);
    Ok(buf.to_vec())
}

/// Compares a command field against `expected`: the expected bytes must
/// match position for position and the rest of the field must be NUL.
#[must_use]
pub fn cmd_matches(field: &[u8; CMD_LEN], expected: &str) -> bool {
    let want = expected.as_bytes();
    if want.len() > CMD_LEN {
        return false;
    }
    field[..want.len()] == *want && field[want.len()..].iter().all(|&b| b == 0)
}

/// Borrowed view of a decoded simple frame.
#[derive(Debug, PartialEq, Eq)]
pub struct SimpleFrame<'a> {
    /// Raw command field, NUL padding included.
    pub cmd: &'a [u8; CMD_LEN],
    /// Correlation sequence.
    pub seq: u64,
    /// Everything after the header.
    pub data: &'a [u8],
}

impl<'a> SimpleFrame<'a> {
    /// Length-checks `datagram` and borrows the fields.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] below [`SIMPLE_HEADER_LEN`] bytes.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, FrameError> {
        if datagram.len() < SIMPLE_HEADER_LEN {
            return Err(FrameError::TooShort);
        }
        let cmd = datagram[..CMD_LEN]
            .try_into()
            .expect("command slice is CMD_LEN bytes");
        let seq = u64::from_be_bytes(
            datagram[CMD_LEN..CMD_LEN + 8]
                .try_into()
                .expect("sequence slice is 8 bytes"),
        );
        Ok(Self {
            cmd,
            seq,
            data: &datagram[SIMPLE_HEADER_LEN..],
        })
    }

    /// Enforces a prescribed data echo.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::WrongData`] on any byte difference.
    pub fn require_data(&self, expected: &[u8]) -> Result<(), FrameError> {
        if self.data == expected {
            Ok(())
        } else {
            Err(FrameError::WrongData)
        }
    }
}

/// Borrowed view of a decoded complex frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ComplexFrame<'a> {
    /// Raw command field, NUL padding included.
    pub cmd: &'a [u8; CMD_LEN],
    /// Correlation sequence.
    pub seq: u64,
    /// Command-specific parameter (free bytes, TCP port, file size).
    pub param: u64,
    /// Everything after the header.
    pub data: &'a [u8],
}

impl<'a> ComplexFrame<'a> {
    /// Length-checks `datagram` and borrows the fields.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] below [`COMPLEX_HEADER_LEN`] bytes.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, FrameError> {
        if datagram.len() < COMPLEX_HEADER_LEN {
            return Err(FrameError::TooShort);
        }
        let cmd = datagram[..CMD_LEN]
            .try_into()
            .expect("command slice is CMD_LEN bytes");
        let seq = u64::from_be_bytes(
            datagram[CMD_LEN..CMD_LEN + 8]
                .try_into()
                .expect("sequence slice is 8 bytes"),
        );
        let param = u64::from_be_bytes(
            datagram[CMD_LEN + 8..CMD_LEN + 16]
                .try_into()
                .expect("parameter slice is 8 bytes"),
        );
        Ok(Self {
            cmd,
            seq,
            param,
            data: &datagram[COMPLEX_HEADER_LEN..],
        })
    }

    /// Enforces a prescribed data echo.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::WrongData`] on any byte difference.
    pub fn require_data(&self, expected: &[u8]) -> Result<(), FrameError> {
        if self.data == expected {
            Ok(())
        } else {
            Err(FrameError::WrongData)
        }
    }
}

/// Validates a response of simple shape: length, then sequence, then
/// command. Data echoes are the caller's to check, where prescribed.
///
/// # Errors
///
/// The first failing check wins, in the order above.
pub fn expect_simple<'a>(
    datagram: &'a [u8],
    command: &str,
    seq: u64,
) -> Result<SimpleFrame<'a>, FrameError> {
    let frame = SimpleFrame::parse(datagram)?;
    if frame.seq != seq {
        return Err(FrameError::WrongSeq);
    }
    if !cmd_matches(frame.cmd, command) {
        return Err(FrameError::WrongCmd);
    }
    Ok(frame)
}

/// Validates a response of complex shape: length, then sequence, then
/// command.
///
/// # Errors
///
/// The first failing check wins, in the order above.
pub fn expect_complex<'a>(
    datagram: &'a [u8],
    command: &str,
    seq: u64,
) -> Result<ComplexFrame<'a>, FrameError> {
    let frame = ComplexFrame::parse(datagram)?;
    if frame.seq != seq {
        return Err(FrameError::WrongSeq);
    }
    if !cmd_matches(frame.cmd, command) {
        return Err(FrameError::WrongCmd);
    }
    Ok(frame)
}
