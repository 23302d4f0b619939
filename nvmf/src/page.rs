//! Discovery log page codecs and the packed resource-config entries the
//! in-band management path exchanges with a target.

use crate::types::{
    get_le16,
    get_le32,
    get_le64,
    get_str,
    put_le16,
    put_le32,
    put_le64,
    put_str,
    MAX_NQN_SIZE,
    MAX_TRADDR_SIZE,
    MAX_TRSVCID_SIZE,
};

pub const TRTYPE_RDMA: u8 = 1;
pub const TRTYPE_FC: u8 = 2;
pub const TRTYPE_TCP: u8 = 3;
pub const TRTYPE_LOOP: u8 = 254;

pub const ADRFAM_IPV4: u8 = 1;
pub const ADRFAM_IPV6: u8 = 2;
pub const ADRFAM_IB: u8 = 3;
pub const ADRFAM_FC: u8 = 4;

pub const SUBTYPE_DISCOVERY: u8 = 1;
pub const SUBTYPE_NVME: u8 = 2;

pub const TREQ_NOT_SPECIFIED: u8 = 0;
pub const TREQ_NOT_REQUIRED: u8 = 2;

pub fn trtype_of(s: &str) -> Option<u8> {
    match s {
        "rdma" => Some(TRTYPE_RDMA),
        "fc" => Some(TRTYPE_FC),
        "tcp" => Some(TRTYPE_TCP),
        "loop" => Some(TRTYPE_LOOP),
        _ => None,
    }
}

pub fn trtype_str(t: u8) -> &'static str {
    match t {
        TRTYPE_RDMA => "rdma",
        TRTYPE_FC => "fc",
        TRTYPE_TCP => "tcp",
        TRTYPE_LOOP => "loop",
        _ => "unknown",
    }
}

pub fn adrfam_of(s: &str) -> Option<u8> {
    match s {
        "ipv4" => Some(ADRFAM_IPV4),
        "ipv6" => Some(ADRFAM_IPV6),
        "ib" => Some(ADRFAM_IB),
        "fc" => Some(ADRFAM_FC),
        _ => None,
    }
}

pub fn adrfam_str(f: u8) -> &'static str {
    match f {
        ADRFAM_IPV4 => "ipv4",
        ADRFAM_IPV6 => "ipv6",
        ADRFAM_IB => "ib",
        ADRFAM_FC => "fc",
        _ => "unknown",
    }
}

pub fn subtype_str(t: u8) -> &'static str {
    match t {
        SUBTYPE_DISCOVERY => "discovery",
        SUBTYPE_NVME => "nvme",
        _ => "unknown",
    }
}

/// Header of the discovery log page. The count phase of the two-phase
/// fetch reads exactly these 16 bytes; entries follow immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscRspPageHdr {
    pub genctr: u64,
    pub numrec: u64,
}

pub const DISC_HDR_SIZE: usize = 16;

impl DiscRspPageHdr {
    pub fn to_bytes(&self) -> [u8; DISC_HDR_SIZE] {
        let mut b = [0u8; DISC_HDR_SIZE];
        put_le64(&mut b[0..], self.genctr);
        put_le64(&mut b[8..], self.numrec);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        DiscRspPageHdr {
            genctr: get_le64(&b[0..]),
            numrec: get_le64(&b[8..]),
        }
    }
}

/// One 1024-byte discovery log page entry, the standard wire layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscLogEntry {
    pub trtype: u8,
    pub adrfam: u8,
    pub subtype: u8,
    pub treq: u8,
    pub portid: u16,
    pub cntlid: u16,
    pub asqsz: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
}

pub const DISC_ENTRY_SIZE: usize = 1024;

impl Default for DiscLogEntry {
    fn default() -> Self {
        DiscLogEntry {
            trtype: TRTYPE_TCP,
            adrfam: ADRFAM_IPV4,
            subtype: SUBTYPE_NVME,
            treq: TREQ_NOT_REQUIRED,
            portid: 0,
            cntlid: crate::types::CNTLID_DYNAMIC,
            asqsz: crate::NVMF_DQ_DEPTH,
            trsvcid: String::new(),
            subnqn: String::new(),
            traddr: String::new(),
        }
    }
}

impl DiscLogEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; DISC_ENTRY_SIZE];
        b[0] = self.trtype;
        b[1] = self.adrfam;
        b[2] = self.subtype;
        b[3] = self.treq;
        put_le16(&mut b[4..], self.portid);
        put_le16(&mut b[6..], self.cntlid);
        put_le16(&mut b[8..], self.asqsz);
        put_str(&mut b[32..64], &self.trsvcid);
        put_str(&mut b[256..512], &self.subnqn);
        put_str(&mut b[512..768], &self.traddr);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        DiscLogEntry {
            trtype: b[0],
            adrfam: b[1],
            subtype: b[2],
            treq: b[3],
            portid: get_le16(&b[4..]),
            cntlid: get_le16(&b[6..]),
            asqsz: get_le16(&b[8..]),
            trsvcid: get_str(&b[32..64]),
            subnqn: get_str(&b[256..512]),
            traddr: get_str(&b[512..768]),
        }
    }

    /// Identity of an entry for diffing; the subsystem NQN is matched
    /// separately when attaching entries to the model.
    pub fn key(&self) -> (u16, String, String, u8, u8) {
        (
            self.portid,
            self.traddr.clone(),
            self.trsvcid.clone(),
            self.trtype,
            self.adrfam,
        )
    }

    /// Same transport tuple, ignoring portid; how fetched pages are
    /// matched against cached ones.
    pub fn same_endpoint(&self, other: &DiscLogEntry) -> bool {
        self.traddr == other.traddr
            && self.trsvcid == other.trsvcid
            && self.trtype == other.trtype
            && self.adrfam == other.adrfam
    }
}

/// Parse a full log page buffer into entries, bounded by both the
/// header count and the buffer length.
pub fn parse_log_page(buf: &[u8]) -> (DiscRspPageHdr, Vec<DiscLogEntry>) {
    let hdr = DiscRspPageHdr::from_bytes(buf);
    let avail = (buf.len().saturating_sub(DISC_HDR_SIZE)) / DISC_ENTRY_SIZE;
    let n = (hdr.numrec as usize).min(avail);
    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let off = DISC_HDR_SIZE + i * DISC_ENTRY_SIZE;
        entries.push(DiscLogEntry::from_bytes(&buf[off..off + DISC_ENTRY_SIZE]));
    }
    (hdr, entries)
}

/// Build a full log page buffer from entries.
pub fn build_log_page(genctr: u64, entries: &[DiscLogEntry]) -> Vec<u8> {
    let hdr = DiscRspPageHdr {
        genctr,
        numrec: entries.len() as u64,
    };
    let mut buf = Vec::with_capacity(DISC_HDR_SIZE + entries.len() * DISC_ENTRY_SIZE);
    buf.extend_from_slice(&hdr.to_bytes());
    for e in entries {
        buf.extend_from_slice(&e.to_bytes());
    }
    buf
}

/* resource-config entries; flat packed little-endian layouts */

pub const NULLB_ONWIRE_DEVID: u32 = 255;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortConfigEntry {
    pub portid: u32,
    pub treq: u8,
    pub trtype: u8,
    pub adrfam: u8,
    pub traddr: String,
    pub trsvcid: String,
}

pub const PORT_CONFIG_ENTRY_SIZE: usize = 8 + MAX_TRADDR_SIZE + MAX_TRSVCID_SIZE;

impl PortConfigEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; PORT_CONFIG_ENTRY_SIZE];
        put_le32(&mut b[0..], self.portid);
        b[4] = self.treq;
        b[5] = self.trtype;
        b[6] = self.adrfam;
        put_str(&mut b[8..8 + MAX_TRADDR_SIZE], &self.traddr);
        put_str(&mut b[8 + MAX_TRADDR_SIZE..], &self.trsvcid);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        PortConfigEntry {
            portid: get_le32(&b[0..]),
            treq: b[4],
            trtype: b[5],
            adrfam: b[6],
            traddr: get_str(&b[8..8 + MAX_TRADDR_SIZE]),
            trsvcid: get_str(&b[8 + MAX_TRADDR_SIZE..]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubsysConfigEntry {
    pub allowanyhost: u32,
    pub subnqn: String,
}

pub const SUBSYS_CONFIG_ENTRY_SIZE: usize = 4 + MAX_NQN_SIZE;

impl SubsysConfigEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; SUBSYS_CONFIG_ENTRY_SIZE];
        put_le32(&mut b[0..], self.allowanyhost);
        put_str(&mut b[4..], &self.subnqn);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        SubsysConfigEntry {
            allowanyhost: get_le32(&b[0..]),
            subnqn: get_str(&b[4..4 + MAX_NQN_SIZE]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostConfigEntry {
    pub hostnqn: String,
}

pub const HOST_CONFIG_ENTRY_SIZE: usize = MAX_NQN_SIZE;

impl HostConfigEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; HOST_CONFIG_ENTRY_SIZE];
        put_str(&mut b, &self.hostnqn);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        HostConfigEntry {
            hostnqn: get_str(&b[..MAX_NQN_SIZE]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHostEntry {
    pub subnqn: String,
    pub hostnqn: String,
}

pub const LINK_HOST_ENTRY_SIZE: usize = 2 * MAX_NQN_SIZE;

impl LinkHostEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; LINK_HOST_ENTRY_SIZE];
        put_str(&mut b[..MAX_NQN_SIZE], &self.subnqn);
        put_str(&mut b[MAX_NQN_SIZE..], &self.hostnqn);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        LinkHostEntry {
            subnqn: get_str(&b[..MAX_NQN_SIZE]),
            hostnqn: get_str(&b[MAX_NQN_SIZE..2 * MAX_NQN_SIZE]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkPortEntry {
    pub subnqn: String,
    pub portid: u32,
}

pub const LINK_PORT_ENTRY_SIZE: usize = MAX_NQN_SIZE + 4;

impl LinkPortEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; LINK_PORT_ENTRY_SIZE];
        put_str(&mut b[..MAX_NQN_SIZE], &self.subnqn);
        put_le32(&mut b[MAX_NQN_SIZE..], self.portid);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        LinkPortEntry {
            subnqn: get_str(&b[..MAX_NQN_SIZE]),
            portid: get_le32(&b[MAX_NQN_SIZE..]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NsConfigEntry {
    pub subnqn: String,
    pub nsid: u32,
    pub deviceid: u32,
    pub devicensid: u32,
}

pub const NS_CONFIG_ENTRY_SIZE: usize = MAX_NQN_SIZE + 12;

impl NsConfigEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![0u8; NS_CONFIG_ENTRY_SIZE];
        put_str(&mut b[..MAX_NQN_SIZE], &self.subnqn);
        put_le32(&mut b[MAX_NQN_SIZE..], self.nsid);
        put_le32(&mut b[MAX_NQN_SIZE + 4..], self.deviceid);
        put_le32(&mut b[MAX_NQN_SIZE + 8..], self.devicensid);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        NsConfigEntry {
            subnqn: get_str(&b[..MAX_NQN_SIZE]),
            nsid: get_le32(&b[MAX_NQN_SIZE..]),
            deviceid: get_le32(&b[MAX_NQN_SIZE + 4..]),
            devicensid: get_le32(&b[MAX_NQN_SIZE + 8..]),
        }
    }
}

/// Inventory of namespace devices a target reports on a
/// resource-config get.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NsDeviceEntry {
    pub devid: u32,
    pub nsid: u32,
}

pub const NS_DEVICE_ENTRY_SIZE: usize = 8;

pub fn parse_ns_devices(buf: &[u8]) -> Vec<NsDeviceEntry> {
    if buf.len() < 4 {
        return Vec::new();
    }
    let count = get_le32(buf) as usize;
    let avail = (buf.len() - 4) / NS_DEVICE_ENTRY_SIZE;
    (0..count.min(avail))
        .map(|i| {
            let off = 4 + i * NS_DEVICE_ENTRY_SIZE;
            NsDeviceEntry {
                devid: get_le32(&buf[off..]),
                nsid: get_le32(&buf[off + 4..]),
            }
        })
        .collect()
}

pub fn build_ns_devices(entries: &[NsDeviceEntry]) -> Vec<u8> {
    let mut b = vec![0u8; 4 + entries.len() * NS_DEVICE_ENTRY_SIZE];
    put_le32(&mut b, entries.len() as u32);
    for (i, e) in entries.iter().enumerate() {
        let off = 4 + i * NS_DEVICE_ENTRY_SIZE;
        put_le32(&mut b[off..], e.devid);
        put_le32(&mut b[off + 4..], e.nsid);
    }
    b
}

/// Inventory of fabric interfaces a target reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XportEntry {
    pub trtype: u8,
    pub adrfam: u8,
    pub traddr: String,
}

pub const XPORT_ENTRY_SIZE: usize = 4 + MAX_TRADDR_SIZE;

pub fn parse_xports(buf: &[u8]) -> Vec<XportEntry> {
    if buf.len() < 4 {
        return Vec::new();
    }
    let count = get_le32(buf) as usize;
    let avail = (buf.len() - 4) / XPORT_ENTRY_SIZE;
    (0..count.min(avail))
        .map(|i| {
            let off = 4 + i * XPORT_ENTRY_SIZE;
            XportEntry {
                trtype: buf[off],
                adrfam: buf[off + 1],
                traddr: get_str(&buf[off + 4..off + 4 + MAX_TRADDR_SIZE]),
            }
        })
        .collect()
}

pub fn build_xports(entries: &[XportEntry]) -> Vec<u8> {
    let mut b = vec![0u8; 4 + entries.len() * XPORT_ENTRY_SIZE];
    put_le32(&mut b, entries.len() as u32);
    for (i, e) in entries.iter().enumerate() {
        let off = 4 + i * XPORT_ENTRY_SIZE;
        b[off] = e.trtype;
        b[off + 1] = e.adrfam;
        put_str(&mut b[off + 4..off + 4 + MAX_TRADDR_SIZE], &e.traddr);
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subnqn: &str, addr: &str) -> DiscLogEntry {
        DiscLogEntry {
            portid: 1,
            trsvcid: "4420".to_string(),
            subnqn: subnqn.to_string(),
            traddr: addr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn log_page_round_trip() {
        let entries = vec![entry("nqn.a", "192.168.1.1"), entry("nqn.b", "192.168.1.2")];
        let buf = build_log_page(1, &entries);
        assert_eq!(buf.len(), DISC_HDR_SIZE + 2 * DISC_ENTRY_SIZE);
        let (hdr, back) = parse_log_page(&buf);
        assert_eq!(hdr.genctr, 1);
        assert_eq!(hdr.numrec, 2);
        assert_eq!(back, entries);
    }

    #[test]
    fn truncated_page_is_bounded() {
        let entries = vec![entry("nqn.a", "192.168.1.1")];
        let mut buf = build_log_page(1, &entries);
        buf.truncate(DISC_HDR_SIZE + 10);
        let (hdr, back) = parse_log_page(&buf);
        assert_eq!(hdr.numrec, 1);
        assert!(back.is_empty());
    }

    #[test]
    fn entry_key_ignores_subnqn() {
        let a = entry("nqn.a", "192.168.1.1");
        let b = entry("nqn.b", "192.168.1.1");
        assert!(a.same_endpoint(&b));
        assert_ne!(a.key().1, "10.0.0.1");
    }

    #[test]
    fn entry_field_offsets() {
        let e = entry("nqn.x", "10.0.0.1");
        let b = e.to_bytes();
        assert_eq!(b[0], TRTYPE_TCP);
        assert_eq!(b[1], ADRFAM_IPV4);
        assert_eq!(&b[32..36], b"4420");
        assert_eq!(&b[256..261], b"nqn.x");
        assert_eq!(&b[512..520], b"10.0.0.1");
    }

    #[test]
    fn config_entries_round_trip() {
        let p = PortConfigEntry {
            portid: 2,
            treq: TREQ_NOT_REQUIRED,
            trtype: TRTYPE_TCP,
            adrfam: ADRFAM_IPV4,
            traddr: "10.0.0.2".to_string(),
            trsvcid: "4420".to_string(),
        };
        assert_eq!(PortConfigEntry::from_bytes(&p.to_bytes()), p);

        let s = SubsysConfigEntry {
            allowanyhost: 1,
            subnqn: "nqn.x".to_string(),
        };
        assert_eq!(SubsysConfigEntry::from_bytes(&s.to_bytes()), s);

        let l = LinkHostEntry {
            subnqn: "nqn.x".to_string(),
            hostnqn: "nqn.h".to_string(),
        };
        assert_eq!(LinkHostEntry::from_bytes(&l.to_bytes()), l);

        let n = NsConfigEntry {
            subnqn: "nqn.x".to_string(),
            nsid: 1,
            deviceid: NULLB_ONWIRE_DEVID,
            devicensid: 0,
        };
        assert_eq!(NsConfigEntry::from_bytes(&n.to_bytes()), n);
    }

    #[test]
    fn inventories_round_trip() {
        let devs = vec![
            NsDeviceEntry {
                devid: 0,
                nsid: 1,
            },
            NsDeviceEntry {
                devid: 255,
                nsid: 1,
            },
        ];
        assert_eq!(parse_ns_devices(&build_ns_devices(&devs)), devs);

        let xps = vec![XportEntry {
            trtype: TRTYPE_TCP,
            adrfam: ADRFAM_IPV4,
            traddr: "192.168.1.7".to_string(),
        }];
        assert_eq!(parse_xports(&build_xports(&xps)), xps);
    }
}
