//! ISO-on-TCP transport (RFC 1006 TPKT + ISO 8073 COTP class 0).
//!
//! Every S7 PDU travels inside a COTP data TPDU inside a TPKT packet. The
//! server side only needs connection setup (CR → CC) and data transfer
//! (DT with end-of-TSDU set); anything else drops the connection.

use std::io::{self, Read, Write};

pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;

/// Largest frame we will accept. A negotiated PDU never exceeds 960, so
/// anything bigger is a framing error, not a big request.
pub const MAX_FRAME_LEN: usize = 4096;

const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: u8 = 0xF0;
const COTP_EOT: u8 = 0x80;

#[derive(Debug, PartialEq, Eq)]
pub enum IsoError {
    BadTpktVersion(u8),
    FrameTooShort,
    FrameTooLong(usize),
    UnexpectedTpdu(u8),
}

impl std::fmt::Display for IsoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsoError::BadTpktVersion(v) => write!(f, "bad TPKT version 0x{:02X}", v),
            IsoError::FrameTooShort => write!(f, "truncated frame"),
            IsoError::FrameTooLong(n) => write!(f, "frame of {} bytes exceeds limit", n),
            IsoError::UnexpectedTpdu(c) => write!(f, "unexpected TPDU code 0x{:02X}", c),
        }
    }
}

impl std::error::Error for IsoError {}

impl From<IsoError> for io::Error {
    fn from(e: IsoError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

// =============================================================================
// TPKT framing
// =============================================================================

/// Read one TPKT-framed payload (COTP TPDU) from the stream.
pub fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    stream.read_exact(&mut header)?;
    if header[0] != TPKT_VERSION {
        return Err(IsoError::BadTpktVersion(header[0]).into());
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total < TPKT_HEADER_LEN {
        return Err(IsoError::FrameTooShort.into());
    }
    if total > MAX_FRAME_LEN {
        return Err(IsoError::FrameTooLong(total).into());
    }
    let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Write one payload with a TPKT header.
pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let total = (payload.len() + TPKT_HEADER_LEN) as u16;
    let mut frame = Vec::with_capacity(total as usize);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

// =============================================================================
// COTP
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum CotpTpdu {
    /// Connection request: peer's source reference and its option bytes
    /// (echoed back in the confirm).
    ConnectionRequest { src_ref: u16, options: Vec<u8> },
    /// Data TPDU carrying one S7 PDU.
    Data { payload: Vec<u8> },
}

pub fn parse_tpdu(frame: &[u8]) -> Result<CotpTpdu, IsoError> {
    if frame.len() < 2 {
        return Err(IsoError::FrameTooShort);
    }
    let li = frame[0] as usize;
    let code = frame[1] & 0xF0;
    match code {
        COTP_CR => {
            // li covers dst_ref(2) src_ref(2) class(1) + options
            if frame.len() < 7 || li < 6 {
                return Err(IsoError::FrameTooShort);
            }
            let src_ref = u16::from_be_bytes([frame[4], frame[5]]);
            let opt_end = (1 + li).min(frame.len());
            let options = frame[7..opt_end].to_vec();
            Ok(CotpTpdu::ConnectionRequest { src_ref, options })
        }
        COTP_DT => {
            // [li, 0xF0, eot] — payload follows the fixed part
            if frame.len() < 3 {
                return Err(IsoError::FrameTooShort);
            }
            Ok(CotpTpdu::Data {
                payload: frame[1 + li..].to_vec(),
            })
        }
        other => Err(IsoError::UnexpectedTpdu(other)),
    }
}

/// Build the connection-confirm TPDU for a CR, echoing the peer's
/// reference and option bytes (TPDU size negotiation lives in those).
pub fn build_connection_confirm(peer_src_ref: u16, options: &[u8]) -> Vec<u8> {
    let li = (6 + options.len()) as u8;
    let mut out = Vec::with_capacity(2 + li as usize);
    out.push(li);
    out.push(COTP_CC);
    out.extend_from_slice(&peer_src_ref.to_be_bytes()); // dst ref = peer's src
    out.extend_from_slice(&0x0001u16.to_be_bytes()); // our src ref
    out.push(0x00); // class 0
    out.extend_from_slice(options);
    out
}

/// Wrap an S7 PDU into a data TPDU (single TSDU, EOT set).
pub fn build_data(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(0x02); // li
    out.push(COTP_DT);
    out.push(COTP_EOT);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// CR as sent by common S7 clients (snap7, python-snap7).
    const SAMPLE_CR: &[u8] = &[
        0x11, 0xE0, 0x00, 0x00, 0x00, 0x2E, 0x00, 0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00, 0xC2,
        0x02, 0x01, 0x02,
    ];

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..4], &[0x03, 0x00, 0x00, 0x09]);

        let mut cursor = io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn frame_rejects_bad_version() {
        let mut cursor = io::Cursor::new(vec![0x02, 0x00, 0x00, 0x04]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parse_connection_request() {
        match parse_tpdu(SAMPLE_CR).unwrap() {
            CotpTpdu::ConnectionRequest { src_ref, options } => {
                assert_eq!(src_ref, 0x002E);
                // c0 (tpdu size), c1 (calling tsap), c2 (called tsap)
                assert_eq!(options[0], 0xC0);
                assert_eq!(options.len(), 11);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn confirm_echoes_peer_reference() {
        let cc = build_connection_confirm(0x002E, &[0xC0, 0x01, 0x0A]);
        assert_eq!(cc[1], 0xD0);
        assert_eq!(&cc[2..4], &[0x00, 0x2E]);
        assert_eq!(&cc[7..], &[0xC0, 0x01, 0x0A]);
    }

    #[test]
    fn data_tpdu_round_trip() {
        let dt = build_data(&[0x32, 0x01]);
        match parse_tpdu(&dt).unwrap() {
            CotpTpdu::Data { payload } => assert_eq!(payload, vec![0x32, 0x01]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
