use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("target is empty")]
    Empty,
    #[error("invalid target {0:?}")]
    Invalid(String),
    #[error("range end {end} precedes start {start}")]
    Backwards { start: String, end: String },
}

/// Expands a discovery target into the concrete addresses to probe.
///
/// Three forms are accepted: a single IP, a CIDR block (network and
/// broadcast addresses are stripped when the block holds more than two
/// addresses), and an inclusive range "a.b.c.d-w.x.y.z" where the end may
/// also be just a final octet ("10.0.0.1-9").
pub fn expand_target(target: &str) -> Result<Vec<String>, TargetError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if let Some((start, end)) = target.split_once('-') {
        return expand_range(start.trim(), end.trim());
    }
    if target.contains('/') {
        let network: Ipv4Network = target
            .parse()
            .map_err(|_| TargetError::Invalid(target.to_string()))?;
        let size = network.size();
        let hosts: Vec<String> = if size > 2 {
            network
                .iter()
                .skip(1)
                .take(size as usize - 2)
                .map(|ip| ip.to_string())
                .collect()
        } else {
            network.iter().map(|ip| ip.to_string()).collect()
        };
        return Ok(hosts);
    }
    target
        .parse::<IpAddr>()
        .map(|ip| vec![ip.to_string()])
        .map_err(|_| TargetError::Invalid(target.to_string()))
}

fn expand_range(start: &str, end: &str) -> Result<Vec<String>, TargetError> {
    let start_ip: Ipv4Addr = start
        .parse()
        .map_err(|_| TargetError::Invalid(start.to_string()))?;
    let end_ip: Ipv4Addr = if end.contains('.') {
        end.parse()
            .map_err(|_| TargetError::Invalid(end.to_string()))?
    } else {
        let octets = start_ip.octets();
        let last: u8 = end.parse().map_err(|_| TargetError::Invalid(end.to_string()))?;
        Ipv4Addr::new(octets[0], octets[1], octets[2], last)
    };
    let (lo, hi) = (u32::from(start_ip), u32::from(end_ip));
    if hi < lo {
        return Err(TargetError::Backwards {
            start: start_ip.to_string(),
            end: end_ip.to_string(),
        });
    }
    Ok((lo..=hi).map(|n| Ipv4Addr::from(n).to_string()).collect())
}
