//! NVMe/TCP PDU framing. Only the PDUs a discovery session exchanges
//! are modelled; header digests and data padding are negotiated off.

use crate::{
    error::TransportError,
    types::{get_le16, get_le32, put_le16, put_le32},
};

pub const ICREQ: u8 = 0x0;
pub const ICRESP: u8 = 0x1;
pub const H2CTERMREQ: u8 = 0x2;
pub const C2HTERMREQ: u8 = 0x3;
pub const CAPSULECMD: u8 = 0x4;
pub const CAPSULERESP: u8 = 0x5;
pub const H2CDATA: u8 = 0x7;
pub const C2HDATA: u8 = 0x8;

pub const PDU_FORMAT_VER: u16 = 0x0;

pub const COMMON_HDR_SIZE: usize = 8;
pub const IC_PDU_SIZE: usize = 128;
pub const CMD_CAPSULE_SIZE: usize = COMMON_HDR_SIZE + crate::types::NVME_CMD_SIZE;
pub const RSP_CAPSULE_SIZE: usize = COMMON_HDR_SIZE + crate::types::NVME_CQE_SIZE;
pub const DATA_PDU_SIZE: usize = 24;

/// The 8 byte header leading every PDU.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommonHdr {
    pub pdu_type: u8,
    pub flags: u8,
    pub hlen: u8,
    pub pdo: u8,
    pub plen: u32,
}

impl CommonHdr {
    pub fn new(pdu_type: u8, hlen: usize, plen: usize) -> Self {
        CommonHdr {
            pdu_type,
            flags: 0,
            hlen: hlen as u8,
            pdo: 0,
            plen: plen as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMON_HDR_SIZE] {
        let mut b = [0u8; COMMON_HDR_SIZE];
        b[0] = self.pdu_type;
        b[1] = self.flags;
        b[2] = self.hlen;
        b[3] = self.pdo;
        put_le32(&mut b[4..], self.plen);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        CommonHdr {
            pdu_type: b[0],
            flags: b[1],
            hlen: b[2],
            pdo: b[3],
            plen: get_le32(&b[4..]),
        }
    }
}

/// Trailer of a data PDU after the common header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataHdr {
    pub cccid: u16,
    pub ttag: u16,
    pub data_offset: u32,
    pub data_length: u32,
}

impl DataHdr {
    pub fn to_bytes(&self) -> [u8; DATA_PDU_SIZE - COMMON_HDR_SIZE] {
        let mut b = [0u8; DATA_PDU_SIZE - COMMON_HDR_SIZE];
        put_le16(&mut b[0..], self.cccid);
        put_le16(&mut b[2..], self.ttag);
        put_le32(&mut b[4..], self.data_offset);
        put_le32(&mut b[8..], self.data_length);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        DataHdr {
            cccid: get_le16(&b[0..]),
            ttag: get_le16(&b[2..]),
            data_offset: get_le32(&b[4..]),
            data_length: get_le32(&b[8..]),
        }
    }
}

/// Build a full data PDU header (common + data trailer).
pub fn build_data_pdu(pdu_type: u8, cccid: u16, len: usize) -> [u8; DATA_PDU_SIZE] {
    let mut b = [0u8; DATA_PDU_SIZE];
    let hdr = CommonHdr::new(pdu_type, DATA_PDU_SIZE, DATA_PDU_SIZE + len);
    b[..COMMON_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
    let data = DataHdr {
        cccid,
        ttag: 0,
        data_offset: 0,
        data_length: len as u32,
    };
    b[COMMON_HDR_SIZE..].copy_from_slice(&data.to_bytes());
    b
}

/// Build the IC request a connecting host opens with.
pub fn build_icreq() -> [u8; IC_PDU_SIZE] {
    let mut b = [0u8; IC_PDU_SIZE];
    let hdr = CommonHdr::new(ICREQ, IC_PDU_SIZE, IC_PDU_SIZE);
    b[..COMMON_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
    put_le16(&mut b[8..], PDU_FORMAT_VER);
    // hpda, dgst, maxr2t all zero
    b
}

/// Build the IC response the controller answers with.
pub fn build_icresp() -> [u8; IC_PDU_SIZE] {
    let mut b = [0u8; IC_PDU_SIZE];
    let hdr = CommonHdr::new(ICRESP, IC_PDU_SIZE, IC_PDU_SIZE);
    b[..COMMON_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
    put_le16(&mut b[8..], PDU_FORMAT_VER);
    put_le32(&mut b[12..], 0xffff); /* maxh2c */
    b
}

fn bad(reason: &str, value: u32) -> TransportError {
    TransportError::InvalidParam {
        reason: format!("{} {}", reason, value),
    }
}

/// Validate an IC request; every negotiable field must be at its only
/// supported value.
pub fn validate_icreq(b: &[u8]) -> Result<(), TransportError> {
    let hdr = CommonHdr::from_bytes(b);
    if hdr.pdu_type != ICREQ {
        return Err(bad("bad pdu type", hdr.pdu_type as u32));
    }
    if hdr.hlen as usize != IC_PDU_SIZE || hdr.plen as usize != IC_PDU_SIZE {
        return Err(bad("bad ic length", hdr.plen));
    }
    if get_le16(&b[8..]) != PDU_FORMAT_VER {
        return Err(bad("bad pfv", get_le16(&b[8..]) as u32));
    }
    if b[10] != 0 {
        return Err(bad("unsupported hpda", b[10] as u32));
    }
    if b[11] != 0 {
        return Err(bad("unsupported digest", b[11] as u32));
    }
    Ok(())
}

/// Validate an IC response, the client side of the same checks.
pub fn validate_icresp(b: &[u8]) -> Result<(), TransportError> {
    let hdr = CommonHdr::from_bytes(b);
    if hdr.pdu_type != ICRESP {
        return Err(bad("bad pdu type", hdr.pdu_type as u32));
    }
    if hdr.hlen as usize != IC_PDU_SIZE || hdr.plen as usize != IC_PDU_SIZE {
        return Err(bad("bad ic length", hdr.plen));
    }
    if get_le16(&b[8..]) != PDU_FORMAT_VER {
        return Err(bad("bad pfv", get_le16(&b[8..]) as u32));
    }
    if b[10] != 0 {
        return Err(bad("unsupported cpda", b[10] as u32));
    }
    if b[11] != 0 {
        return Err(bad("unsupported digest", b[11] as u32));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ic_handshake_accepts_defaults() {
        assert!(validate_icreq(&build_icreq()).is_ok());
        assert!(validate_icresp(&build_icresp()).is_ok());
    }

    #[test]
    fn ic_handshake_rejects_digest() {
        let mut req = build_icreq();
        req[11] = 1;
        assert!(validate_icreq(&req).is_err());

        let mut rsp = build_icresp();
        rsp[11] = 1;
        assert!(validate_icresp(&rsp).is_err());
    }

    #[test]
    fn ic_handshake_rejects_padding() {
        let mut req = build_icreq();
        req[10] = 4;
        assert!(validate_icreq(&req).is_err());
    }

    #[test]
    fn data_pdu_round_trip() {
        let b = build_data_pdu(C2HDATA, 9, 4096);
        let hdr = CommonHdr::from_bytes(&b);
        assert_eq!(hdr.pdu_type, C2HDATA);
        assert_eq!(hdr.hlen as usize, DATA_PDU_SIZE);
        assert_eq!(hdr.plen as usize, DATA_PDU_SIZE + 4096);
        let data = DataHdr::from_bytes(&b[COMMON_HDR_SIZE..]);
        assert_eq!(data.cccid, 9);
        assert_eq!(data.data_length, 4096);
    }
}
