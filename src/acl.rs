//! Access control for the server's destination-connect decision.
//!
//! Grounded on `acl.c` from the original implementation: a single rule of the
//! form `src_ip,dst_ip,dst_port,{allow|deny}`, where `0.0.0.0`/`0` mean
//! wildcard and absence of a rule permits everything.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("ACL rule is missing field: {0}")]
    MissingField(&'static str),
    #[error("ACL rule has an unparseable address: {0}")]
    BadAddress(String),
    #[error("ACL rule has an unparseable port: {0}")]
    BadPort(String),
    #[error("ACL rule verb must be \"allow\" or \"deny\", got: {0}")]
    BadVerb(String),
}

/// A single parsed ACL rule. `None` rule fields are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclRule {
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
    dst_port: Option<u16>,
    deny: bool,
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.src.unwrap_or(Ipv4Addr::UNSPECIFIED),
            self.dst.unwrap_or(Ipv4Addr::UNSPECIFIED),
            self.dst_port.unwrap_or(0),
            if self.deny { "deny" } else { "allow" }
        )
    }
}

impl AclRule {
    /// Parses `src_ip,dst_ip,dst_port,{allow|deny}`. `0.0.0.0` and `0` are wildcards.
    pub fn parse(s: &str) -> Result<Self, AclError> {
        let mut fields = s.split(',');

        let src = parse_wildcard_addr(fields.next().ok_or(AclError::MissingField("src_ip"))?)?;
        let dst = parse_wildcard_addr(fields.next().ok_or(AclError::MissingField("dst_ip"))?)?;
        let dst_port = parse_wildcard_port(fields.next().ok_or(AclError::MissingField("dst_port"))?)?;

        let verb = fields.next().ok_or(AclError::MissingField("allow|deny"))?;
        let deny = match verb {
            "allow" => false,
            "deny" => true,
            other => return Err(AclError::BadVerb(other.to_string())),
        };

        if fields.next().is_some() {
            return Err(AclError::MissingField("unexpected trailing field"));
        }

        Ok(Self { src, dst, dst_port, deny })
    }

    /// Evaluates `(src, dst_ip, dst_port)` against this rule. `allow` means "permit only if
    /// every specified field matches"; `deny` means the inverse (permit unless every
    /// specified field matches).
    pub fn evaluate(&self, src: Ipv4Addr, dst: Ipv4Addr, dst_port: u16) -> bool {
        let matches = self.src.map_or(true, |r| r == src)
            && self.dst.map_or(true, |r| r == dst)
            && self.dst_port.map_or(true, |r| r == dst_port);

        if self.deny {
            !matches
        } else {
            matches
        }
    }
}

/// Evaluates an optional ACL rule. Absence of a rule permits everything, matching the
/// original implementation's "no -a flag" behavior.
pub fn is_allowed(rule: Option<&AclRule>, src: Ipv4Addr, dst: Ipv4Addr, dst_port: u16) -> bool {
    match rule {
        Some(rule) => rule.evaluate(src, dst, dst_port),
        None => true,
    }
}

fn parse_wildcard_addr(s: &str) -> Result<Option<Ipv4Addr>, AclError> {
    let addr: Ipv4Addr = s.parse().map_err(|_| AclError::BadAddress(s.to_string()))?;
    Ok(if addr == Ipv4Addr::UNSPECIFIED { None } else { Some(addr) })
}

fn parse_wildcard_port(s: &str) -> Result<Option<u16>, AclError> {
    let port: u16 = s.parse().map_err(|_| AclError::BadPort(s.to_string()))?;
    Ok(if port == 0 { None } else { Some(port) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn no_rule_permits_all() {
        assert!(is_allowed(None, ip("1.2.3.4"), ip("10.0.0.1"), 22));
    }

    #[test]
    fn deny_rule_blocks_exact_match() {
        let rule = AclRule::parse("0.0.0.0,10.0.0.1,22,deny").unwrap();
        assert!(!is_allowed(Some(&rule), ip("1.2.3.4"), ip("10.0.0.1"), 22));
        assert!(is_allowed(Some(&rule), ip("1.2.3.4"), ip("10.0.0.1"), 23));
        assert!(is_allowed(Some(&rule), ip("1.2.3.4"), ip("10.0.0.2"), 22));
    }

    #[test]
    fn allow_rule_permits_only_exact_match() {
        let rule = AclRule::parse("0.0.0.0,10.0.0.1,22,allow").unwrap();
        assert!(is_allowed(Some(&rule), ip("1.2.3.4"), ip("10.0.0.1"), 22));
        assert!(!is_allowed(Some(&rule), ip("1.2.3.4"), ip("10.0.0.1"), 23));
    }

    #[test]
    fn wildcards_match_anything() {
        let rule = AclRule::parse("0.0.0.0,0.0.0.0,0,allow").unwrap();
        assert!(is_allowed(Some(&rule), ip("9.9.9.9"), ip("8.8.8.8"), 80));
    }

    #[test]
    fn malformed_address_is_rejected() {
        assert!(matches!(
            AclRule::parse("not-an-ip,0.0.0.0,0,allow"),
            Err(AclError::BadAddress(_))
        ));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(matches!(
            AclRule::parse("0.0.0.0,0.0.0.0,0,maybe"),
            Err(AclError::BadVerb(_))
        ));
    }

    #[test]
    fn missing_field_is_rejected() {
        assert!(matches!(AclRule::parse("0.0.0.0,0.0.0.0"), Err(AclError::MissingField(_))));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let rule = AclRule::parse("0.0.0.0,10.0.0.1,22,deny").unwrap();
        let reparsed = AclRule::parse(&rule.to_string()).unwrap();
        assert_eq!(rule, reparsed);
    }
}
