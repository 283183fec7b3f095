//! S7 communication PDU codec (server side).
//!
//! Speaks the subset a data server needs: communication setup (PDU
//! negotiation), read var, write var, and the SZL identity query. All
//! multi-byte fields are big-endian on the wire.

// =============================================================================
// Constants
// =============================================================================

pub const PROTOCOL_ID: u8 = 0x32;

pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;
pub const ROSCTR_USERDATA: u8 = 0x07;

pub const FUNC_SETUP: u8 = 0xF0;
pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;

/// Area codes in S7ANY addressing.
pub const AREA_PE: u8 = 0x81;
pub const AREA_PA: u8 = 0x82;
pub const AREA_MK: u8 = 0x83;
pub const AREA_DB: u8 = 0x84;

/// Per-item return codes.
pub const RET_OK: u8 = 0xFF;
pub const RET_HW_FAULT: u8 = 0x01;
pub const RET_ACCESS_DENIED: u8 = 0x03;
pub const RET_OUT_OF_RANGE: u8 = 0x05;
pub const RET_TYPE_UNSUPPORTED: u8 = 0x06;
pub const RET_OBJECT_NOT_EXIST: u8 = 0x0A;

/// Request transport sizes (word lengths).
pub const TS_BIT: u8 = 0x01;
pub const TS_BYTE: u8 = 0x02;
pub const TS_CHAR: u8 = 0x03;
pub const TS_WORD: u8 = 0x04;
pub const TS_INT: u8 = 0x05;
pub const TS_DWORD: u8 = 0x06;
pub const TS_DINT: u8 = 0x07;
pub const TS_REAL: u8 = 0x08;

/// Response/write-data transport codes.
pub const DTS_BIT: u8 = 0x03;
pub const DTS_BYTE_WORD: u8 = 0x04;
pub const DTS_OCTET: u8 = 0x09;

/// SZL id answered from the identity configuration.
pub const SZL_COMPONENT_ID: u16 = 0x001C;

#[derive(Debug, PartialEq, Eq)]
pub enum S7Error {
    Truncated,
    BadProtocolId(u8),
    UnsupportedRosctr(u8),
    UnsupportedFunction(u8),
    MalformedItem,
}

impl std::fmt::Display for S7Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            S7Error::Truncated => write!(f, "truncated S7 PDU"),
            S7Error::BadProtocolId(v) => write!(f, "bad protocol id 0x{:02X}", v),
            S7Error::UnsupportedRosctr(v) => write!(f, "unsupported ROSCTR {}", v),
            S7Error::UnsupportedFunction(v) => write!(f, "unsupported function 0x{:02X}", v),
            S7Error::MalformedItem => write!(f, "malformed request item"),
        }
    }
}

impl std::error::Error for S7Error {}

// =============================================================================
// Requests
// =============================================================================

/// One S7ANY addressing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestItem {
    pub transport: u8,
    /// Element count in units of `transport`.
    pub count: u16,
    pub db_number: u16,
    pub area: u8,
    /// Bit-granular address: `byte * 8 + bit`.
    pub address: u32,
}

impl RequestItem {
    pub fn byte_offset(&self) -> usize {
        (self.address >> 3) as usize
    }

    pub fn bit_offset(&self) -> u8 {
        (self.address & 0x07) as u8
    }

    /// Width of one element in bytes; `None` for bit or unknown transports.
    pub fn element_width(&self) -> Option<usize> {
        match self.transport {
            TS_BYTE | TS_CHAR => Some(1),
            TS_WORD | TS_INT => Some(2),
            TS_DWORD | TS_DINT | TS_REAL => Some(4),
            _ => None,
        }
    }

    pub fn is_bit(&self) -> bool {
        self.transport == TS_BIT
    }

    /// Requested length in bytes (bit requests count bits as bytes of one).
    pub fn byte_len(&self) -> Option<usize> {
        if self.is_bit() {
            // A bit item addresses single bits; count is in bits.
            return Some(self.count as usize);
        }
        self.element_width().map(|w| w * self.count as usize)
    }
}

/// Payload of one write item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteData {
    pub transport: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Setup {
        pdu_ref: u16,
        max_amq_caller: u16,
        max_amq_callee: u16,
        pdu_length: u16,
    },
    ReadVar {
        pdu_ref: u16,
        items: Vec<RequestItem>,
    },
    WriteVar {
        pdu_ref: u16,
        items: Vec<(RequestItem, WriteData)>,
    },
    ReadSzl {
        pdu_ref: u16,
        szl_id: u16,
        szl_index: u16,
        sequence: u8,
    },
}

struct Cur<'a> {
    b: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn new(b: &'a [u8]) -> Self {
        Self { b, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, S7Error> {
        let v = *self.b.get(self.pos).ok_or(S7Error::Truncated)?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, S7Error> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u24(&mut self) -> Result<u32, S7Error> {
        Ok(((self.u8()? as u32) << 16) | ((self.u8()? as u32) << 8) | self.u8()? as u32)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], S7Error> {
        let end = self.pos.checked_add(n).ok_or(S7Error::Truncated)?;
        if end > self.b.len() {
            return Err(S7Error::Truncated);
        }
        let s = &self.b[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), S7Error> {
        self.take(n).map(|_| ())
    }
}

/// Parse one request PDU (the payload of a COTP data TPDU).
pub fn parse_request(pdu: &[u8]) -> Result<Request, S7Error> {
    let mut c = Cur::new(pdu);
    let proto = c.u8()?;
    if proto != PROTOCOL_ID {
        return Err(S7Error::BadProtocolId(proto));
    }
    let rosctr = c.u8()?;
    c.skip(2)?; // redundancy id
    let pdu_ref = c.u16()?;
    let param_len = c.u16()? as usize;
    let data_len = c.u16()? as usize;

    match rosctr {
        ROSCTR_JOB => {
            let param = Cur::new(&pdu[10..]).take(param_len).map_err(|_| S7Error::Truncated)?;
            let data_start = 10 + param_len;
            let data = pdu
                .get(data_start..data_start + data_len)
                .ok_or(S7Error::Truncated)?;
            parse_job(pdu_ref, param, data)
        }
        ROSCTR_USERDATA => parse_userdata(pdu_ref, &pdu[10..], param_len, data_len),
        other => Err(S7Error::UnsupportedRosctr(other)),
    }
}

fn parse_job(pdu_ref: u16, param: &[u8], data: &[u8]) -> Result<Request, S7Error> {
    let mut p = Cur::new(param);
    match p.u8()? {
        FUNC_SETUP => {
            p.skip(1)?; // reserved
            Ok(Request::Setup {
                pdu_ref,
                max_amq_caller: p.u16()?,
                max_amq_callee: p.u16()?,
                pdu_length: p.u16()?,
            })
        }
        FUNC_READ_VAR => {
            let count = p.u8()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(parse_item(&mut p)?);
            }
            Ok(Request::ReadVar { pdu_ref, items })
        }
        FUNC_WRITE_VAR => {
            let count = p.u8()? as usize;
            let mut addr_items = Vec::with_capacity(count);
            for _ in 0..count {
                addr_items.push(parse_item(&mut p)?);
            }
            let mut d = Cur::new(data);
            let mut items = Vec::with_capacity(count);
            for (i, item) in addr_items.into_iter().enumerate() {
                d.skip(1)?; // reserved return code
                let transport = d.u8()?;
                let length = d.u16()? as usize;
                let byte_len = match transport {
                    DTS_BIT => length,          // length in bits, one byte each
                    DTS_OCTET => length,        // length in bytes
                    _ => length.div_ceil(8),    // length in bits
                };
                let bytes = d.take(byte_len)?.to_vec();
                // Items are padded to even offsets, except after the last.
                if i + 1 < count && byte_len % 2 == 1 {
                    d.skip(1)?;
                }
                items.push((item, WriteData { transport, bytes }));
            }
            Ok(Request::WriteVar { pdu_ref, items })
        }
        other => Err(S7Error::UnsupportedFunction(other)),
    }
}

fn parse_item(p: &mut Cur<'_>) -> Result<RequestItem, S7Error> {
    // [0x12, len=0x0A, syntax=0x10 (S7ANY), transport, count, db, area, addr24]
    let spec = p.u8()?;
    let len = p.u8()?;
    if spec != 0x12 || len != 0x0A {
        return Err(S7Error::MalformedItem);
    }
    let syntax = p.u8()?;
    if syntax != 0x10 {
        return Err(S7Error::MalformedItem);
    }
    Ok(RequestItem {
        transport: p.u8()?,
        count: p.u16()?,
        db_number: p.u16()?,
        area: p.u8()?,
        address: p.u24()?,
    })
}

fn parse_userdata(
    pdu_ref: u16,
    rest: &[u8],
    param_len: usize,
    data_len: usize,
) -> Result<Request, S7Error> {
    let mut p = Cur::new(rest);
    let param = p.take(param_len)?;
    let data = p.take(data_len)?;

    // Parameter head: 00 01 12, length, method, type/group, subfunction, seq
    let mut ph = Cur::new(param);
    let head = ph.take(3)?;
    if head != [0x00, 0x01, 0x12] {
        return Err(S7Error::MalformedItem);
    }
    ph.skip(1)?; // parameter length
    ph.skip(1)?; // method (request)
    let type_group = ph.u8()?;
    let subfunction = ph.u8()?;
    let sequence = ph.u8()?;

    // CPU functions, read SZL.
    if type_group & 0x0F != 0x04 || subfunction != 0x01 {
        return Err(S7Error::UnsupportedFunction(subfunction));
    }

    let mut d = Cur::new(data);
    let ret = d.u8()?;
    let ts = d.u8()?;
    let len = d.u16()? as usize;
    if ret != RET_OK || ts != DTS_OCTET || len < 4 {
        return Err(S7Error::MalformedItem);
    }
    Ok(Request::ReadSzl {
        pdu_ref,
        szl_id: d.u16()?,
        szl_index: d.u16()?,
        sequence,
    })
}

// =============================================================================
// Responses
// =============================================================================

fn ack_header(pdu_ref: u16, param_len: usize, data_len: usize, error: (u8, u8)) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + param_len + data_len);
    out.push(PROTOCOL_ID);
    out.push(ROSCTR_ACK_DATA);
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&pdu_ref.to_be_bytes());
    out.extend_from_slice(&(param_len as u16).to_be_bytes());
    out.extend_from_slice(&(data_len as u16).to_be_bytes());
    out.push(error.0);
    out.push(error.1);
    out
}

pub fn build_setup_response(
    pdu_ref: u16,
    max_amq_caller: u16,
    max_amq_callee: u16,
    negotiated_pdu: u16,
) -> Vec<u8> {
    let mut out = ack_header(pdu_ref, 8, 0, (0, 0));
    out.push(FUNC_SETUP);
    out.push(0x00);
    out.extend_from_slice(&max_amq_caller.to_be_bytes());
    out.extend_from_slice(&max_amq_callee.to_be_bytes());
    out.extend_from_slice(&negotiated_pdu.to_be_bytes());
    out
}

/// Outcome of one read item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Payload bytes; `bit` selects the bit transport in the data item.
    Ok { bit: bool, data: Vec<u8> },
    Err(u8),
}

pub fn build_read_response(pdu_ref: u16, results: &[ReadResult]) -> Vec<u8> {
    let mut data = Vec::new();
    for (i, r) in results.iter().enumerate() {
        match r {
            ReadResult::Ok { bit, data: payload } => {
                data.push(RET_OK);
                if *bit {
                    data.push(DTS_BIT);
                    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                } else {
                    data.push(DTS_BYTE_WORD);
                    data.extend_from_slice(&((payload.len() * 8) as u16).to_be_bytes());
                }
                data.extend_from_slice(payload);
                if i + 1 < results.len() && payload.len() % 2 == 1 {
                    data.push(0x00);
                }
            }
            ReadResult::Err(code) => {
                data.extend_from_slice(&[*code, 0x00, 0x00, 0x00]);
            }
        }
    }
    let mut out = ack_header(pdu_ref, 2, data.len(), (0, 0));
    out.push(FUNC_READ_VAR);
    out.push(results.len() as u8);
    out.extend_from_slice(&data);
    out
}

pub fn build_write_response(pdu_ref: u16, codes: &[u8]) -> Vec<u8> {
    let mut out = ack_header(pdu_ref, 2, codes.len(), (0, 0));
    out.push(FUNC_WRITE_VAR);
    out.push(codes.len() as u8);
    out.extend_from_slice(codes);
    out
}

/// Whole-PDU failure (unsupported function, malformed request).
pub fn build_error_response(pdu_ref: u16, error_class: u8, error_code: u8) -> Vec<u8> {
    ack_header(pdu_ref, 0, 0, (error_class, error_code))
}

// =============================================================================
// SZL (identity queries)
// =============================================================================

/// Identity strings served through SZL 0x001C.
#[derive(Debug, Clone, Default)]
pub struct SzlIdentity {
    pub name: String,
    pub module_name: String,
    pub plant_id: String,
    pub copyright: String,
    pub serial_number: String,
    pub module_type: String,
}

fn szl_record(index: u16, text: &str) -> Vec<u8> {
    let mut rec = Vec::with_capacity(34);
    rec.extend_from_slice(&index.to_be_bytes());
    let bytes = text.as_bytes();
    let n = bytes.len().min(32);
    rec.extend_from_slice(&bytes[..n]);
    rec.resize(34, 0x00);
    rec
}

fn userdata_response_header(
    pdu_ref: u16,
    sequence: u8,
    data_len: usize,
) -> Vec<u8> {
    let param_len = 12;
    let mut out = Vec::with_capacity(10 + param_len + data_len);
    out.push(PROTOCOL_ID);
    out.push(ROSCTR_USERDATA);
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&pdu_ref.to_be_bytes());
    out.extend_from_slice(&(param_len as u16).to_be_bytes());
    out.extend_from_slice(&(data_len as u16).to_be_bytes());
    // Parameter: head, len 8, method response, CPU functions group,
    // subfunction read-szl, sequence, data-unit ref, last-data-unit, error
    out.extend_from_slice(&[0x00, 0x01, 0x12, 0x08, 0x12, 0x84, 0x01]);
    out.push(sequence);
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    out
}

/// Answer SZL 0x001C from the identity block; other ids report
/// object-not-available.
pub fn build_szl_response(
    pdu_ref: u16,
    sequence: u8,
    szl_id: u16,
    szl_index: u16,
    identity: &SzlIdentity,
) -> Vec<u8> {
    if szl_id != SZL_COMPONENT_ID {
        let mut out = userdata_response_header(pdu_ref, sequence, 4);
        out.extend_from_slice(&[RET_OBJECT_NOT_EXIST, 0x00, 0x00, 0x00]);
        return out;
    }

    let records: Vec<Vec<u8>> = vec![
        szl_record(0x0001, &identity.name),
        szl_record(0x0002, &identity.module_name),
        szl_record(0x0003, &identity.plant_id),
        szl_record(0x0004, &identity.copyright),
        szl_record(0x0005, &identity.serial_number),
        szl_record(0x0007, &identity.module_type),
    ];

    let mut szl = Vec::new();
    szl.extend_from_slice(&szl_id.to_be_bytes());
    szl.extend_from_slice(&szl_index.to_be_bytes());
    szl.extend_from_slice(&34u16.to_be_bytes()); // record length
    szl.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for r in &records {
        szl.extend_from_slice(r);
    }

    let mut out = userdata_response_header(pdu_ref, sequence, 4 + szl.len());
    out.push(RET_OK);
    out.push(DTS_OCTET);
    out.extend_from_slice(&(szl.len() as u16).to_be_bytes());
    out.extend_from_slice(&szl);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(pdu_ref: u16, param: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = vec![PROTOCOL_ID, ROSCTR_JOB, 0, 0];
        pdu.extend_from_slice(&pdu_ref.to_be_bytes());
        pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(param);
        pdu.extend_from_slice(data);
        pdu
    }

    #[test]
    fn parse_setup() {
        let param = [FUNC_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03, 0xC0];
        let req = parse_request(&job(7, &param, &[])).unwrap();
        assert_eq!(
            req,
            Request::Setup {
                pdu_ref: 7,
                max_amq_caller: 1,
                max_amq_callee: 1,
                pdu_length: 960,
            }
        );
    }

    #[test]
    fn parse_read_db_word_item() {
        // Read 2 words from DB10 offset 0: transport WORD, count 2.
        let param = [
            FUNC_READ_VAR,
            0x01,
            0x12,
            0x0A,
            0x10,
            TS_WORD,
            0x00,
            0x02,
            0x00,
            0x0A,
            AREA_DB,
            0x00,
            0x00,
            0x00,
        ];
        match parse_request(&job(1, &param, &[])).unwrap() {
            Request::ReadVar { pdu_ref, items } => {
                assert_eq!(pdu_ref, 1);
                assert_eq!(items.len(), 1);
                let it = items[0];
                assert_eq!(it.transport, TS_WORD);
                assert_eq!(it.count, 2);
                assert_eq!(it.db_number, 10);
                assert_eq!(it.area, AREA_DB);
                assert_eq!(it.byte_offset(), 0);
                assert_eq!(it.byte_len(), Some(4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_bit_item_address_split() {
        // M 12.5: address = 12*8 + 5.
        let param = [
            FUNC_READ_VAR,
            0x01,
            0x12,
            0x0A,
            0x10,
            TS_BIT,
            0x00,
            0x01,
            0x00,
            0x00,
            AREA_MK,
            0x00,
            0x00,
            0x65,
        ];
        match parse_request(&job(2, &param, &[])).unwrap() {
            Request::ReadVar { items, .. } => {
                let it = items[0];
                assert!(it.is_bit());
                assert_eq!(it.byte_offset(), 12);
                assert_eq!(it.bit_offset(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_write_var_with_payload() {
        // Write bytes 00 FF at DB20 offset 2 (byte transport, count 2).
        let param = [
            FUNC_WRITE_VAR,
            0x01,
            0x12,
            0x0A,
            0x10,
            TS_BYTE,
            0x00,
            0x02,
            0x00,
            0x14,
            AREA_DB,
            0x00,
            0x00,
            0x10,
        ];
        let data = [0x00, DTS_BYTE_WORD, 0x00, 0x10, 0x00, 0xFF];
        match parse_request(&job(3, &param, &data)).unwrap() {
            Request::WriteVar { items, .. } => {
                assert_eq!(items.len(), 1);
                let (item, wd) = &items[0];
                assert_eq!(item.db_number, 20);
                assert_eq!(item.byte_offset(), 2);
                assert_eq!(wd.bytes, vec![0x00, 0xFF]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_szl_request() {
        let mut pdu = vec![PROTOCOL_ID, ROSCTR_USERDATA, 0, 0, 0x00, 0x09];
        let param = [0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x01, 0x00];
        let data = [RET_OK, DTS_OCTET, 0x00, 0x04, 0x00, 0x1C, 0x00, 0x00];
        pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&param);
        pdu.extend_from_slice(&data);
        assert_eq!(
            parse_request(&pdu).unwrap(),
            Request::ReadSzl {
                pdu_ref: 9,
                szl_id: 0x001C,
                szl_index: 0,
                sequence: 0,
            }
        );
    }

    #[test]
    fn read_response_encodes_payload_bits() {
        let resp = build_read_response(
            1,
            &[ReadResult::Ok {
                bit: false,
                data: vec![0x12, 0x34, 0x56, 0x78],
            }],
        );
        // header(12) + param(2) + data item header(4) + payload(4)
        assert_eq!(resp.len(), 22);
        assert_eq!(resp[1], ROSCTR_ACK_DATA);
        assert_eq!(resp[12], FUNC_READ_VAR);
        assert_eq!(resp[13], 1);
        assert_eq!(resp[14], RET_OK);
        assert_eq!(resp[15], DTS_BYTE_WORD);
        assert_eq!(u16::from_be_bytes([resp[16], resp[17]]), 32);
        assert_eq!(&resp[18..], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn error_item_has_empty_data() {
        let resp = build_read_response(1, &[ReadResult::Err(RET_OBJECT_NOT_EXIST)]);
        assert_eq!(resp[14], RET_OBJECT_NOT_EXIST);
        assert_eq!(resp.len(), 12 + 2 + 4);
    }

    #[test]
    fn szl_response_carries_identity_records() {
        let identity = SzlIdentity {
            name: "FERRUM PLC".into(),
            ..Default::default()
        };
        let resp = build_szl_response(4, 0, SZL_COMPONENT_ID, 0, &identity);
        // szl payload begins after header(10) + param(12) + data head(4)
        let szl = &resp[26..];
        assert_eq!(u16::from_be_bytes([szl[0], szl[1]]), SZL_COMPONENT_ID);
        assert_eq!(u16::from_be_bytes([szl[4], szl[5]]), 34);
        assert_eq!(u16::from_be_bytes([szl[6], szl[7]]), 6);
        // first record: index 1, then the name
        assert_eq!(&szl[8..10], &[0x00, 0x01]);
        assert_eq!(&szl[10..20], b"FERRUM PLC");
    }

    #[test]
    fn unknown_szl_id_reports_object_missing() {
        let resp = build_szl_response(4, 0, 0x0131, 0, &SzlIdentity::default());
        assert_eq!(resp[22], RET_OBJECT_NOT_EXIST);
    }
}
