//! Host-facing listener interfaces, one per small `.conf` file in the
//! discovery-config directory. Each file carries `tag = value` lines
//! (`type`, `family`, `address`, `trsvcid`), `#` comments and optional
//! quotes.

use std::{fs, io, path::Path};

use tracing::{info, warn};

use crate::config::validate_address;

pub const DEFAULT_CONF_DIR: &str = "/etc/nvme/nvmeof-dem";
pub const CONFIG_FILENAME: &str = "config.json";
pub const SIGNATURE_FILENAME: &str = "signature";

const DEFAULT_TRSVCID: &str = "4420";

/// One listening interface of the pseudo discovery controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostIface {
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
    pub trsvcid: String,
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let mut parts = line.splitn(2, '=');
    let tag = parts.next()?.trim().to_lowercase();
    let value = parts
        .next()?
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string();
    if tag.is_empty() || value.is_empty() {
        return None;
    }
    Some((tag, value))
}

/// Parse one interface description.
pub fn parse_conf(text: &str) -> Option<HostIface> {
    let mut iface = HostIface::default();
    for line in text.lines() {
        if let Some((tag, value)) = parse_line(line) {
            match tag.as_str() {
                "type" => iface.trtype = value,
                "family" => iface.adrfam = value,
                "address" => iface.traddr = value,
                "trsvcid" => iface.trsvcid = value,
                _ => {}
            }
        }
    }
    if iface.trtype.is_empty() || iface.adrfam.is_empty() || iface.traddr.is_empty() {
        return None;
    }
    if iface.trsvcid.is_empty() {
        iface.trsvcid = DEFAULT_TRSVCID.to_string();
    }
    Some(iface)
}

/// Read every interface file in the directory, skipping the config
/// store and signature files that share it.
pub fn load_interfaces(dir: &Path) -> io::Result<Vec<HostIface>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == CONFIG_FILENAME || name == SIGNATURE_FILENAME || name.ends_with(".tmp") {
            continue;
        }
        if !entry.file_type()?.is_file() {
            continue;
        }
        let text = fs::read_to_string(entry.path())?;
        match parse_conf(&text) {
            Some(iface) => {
                if validate_address(&iface.adrfam, &iface.traddr).is_err() {
                    warn!("bad address in {:?}, ignoring interface", entry.path());
                    continue;
                }
                info!(
                    "interface {} {} {}:{}",
                    iface.trtype, iface.adrfam, iface.traddr, iface.trsvcid
                );
                out.push(iface);
            }
            None => warn!("bad config file {:?}, ignoring interface", entry.path()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_with_comments_and_quotes() {
        let text = r#"
            # pseudo controller interface
            Type = tcp
            Family = ipv4
            Address = "192.168.1.1"   # management lan
            TRSVCID = 4420
        "#;
        let iface = parse_conf(text).unwrap();
        assert_eq!(iface.trtype, "tcp");
        assert_eq!(iface.adrfam, "ipv4");
        assert_eq!(iface.traddr, "192.168.1.1");
        assert_eq!(iface.trsvcid, "4420");
    }

    #[test]
    fn missing_trsvcid_defaults() {
        let text = "type=rdma\nfamily=ipv4\naddress=10.0.0.1\n";
        let iface = parse_conf(text).unwrap();
        assert_eq!(iface.trsvcid, DEFAULT_TRSVCID);
    }

    #[test]
    fn incomplete_interface_is_rejected() {
        assert!(parse_conf("type=tcp\nfamily=ipv4\n").is_none());
    }
}
