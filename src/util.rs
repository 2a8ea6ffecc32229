// Helpers shared by the probe pipeline: record type parsing and address extraction.

use std::net::Ipv4Addr;
use std::str::FromStr;
use trust_dns_resolver::proto::rr::{RData, RecordType};

use crate::prober::ProbeError;

/// Tokens are case-sensitive: "a" and "mx" are not record types.
pub fn parse_record_type(token: &str) -> Result<RecordType, ProbeError> {
    let invalid = || ProbeError::InvalidQueryType(token.to_string());
    // RecordType::from_str asserts on lowercase input
    if token.bytes().any(|b| b.is_ascii_lowercase()) {
        return Err(invalid());
    }
    RecordType::from_str(token).map_err(|_| invalid())
}

/// First A record in the answer set, if it is a usable unicast target.
pub fn first_ipv4(domain: &str, answers: &[RData]) -> Result<Ipv4Addr, ProbeError> {
    let ip = answers
        .iter()
        .find_map(|rdata| match rdata {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .ok_or_else(|| ProbeError::InvalidResolvedAddress {
            domain: domain.to_string(),
        })?;

    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return Err(ProbeError::InvalidResolvedAddress {
            domain: domain.to_string(),
        });
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trust_dns_resolver::proto::rr::Name;
    use trust_dns_resolver::proto::rr::rdata::{A, CNAME};

    #[test]
    fn parses_known_record_types() {
        assert_eq!(parse_record_type("A").unwrap(), RecordType::A);
        assert_eq!(parse_record_type("AAAA").unwrap(), RecordType::AAAA);
        assert_eq!(parse_record_type("MX").unwrap(), RecordType::MX);
        assert_eq!(parse_record_type("CNAME").unwrap(), RecordType::CNAME);
    }

    #[test]
    fn rejects_unknown_record_type() {
        match parse_record_type("ZZZ") {
            Err(ProbeError::InvalidQueryType(token)) => assert_eq!(token, "ZZZ"),
            other => panic!("expected InvalidQueryType, got {:?}", other),
        }
    }

    #[test]
    fn lowercase_tokens_are_rejected() {
        for token in ["a", "mx", "Aaaa", "cname"] {
            match parse_record_type(token) {
                Err(ProbeError::InvalidQueryType(t)) => assert_eq!(t, token),
                other => panic!("expected InvalidQueryType for {}, got {:?}", token, other),
            }
        }
    }

    #[test]
    fn skips_non_a_answers() {
        let answers = vec![
            RData::CNAME(CNAME(Name::from_ascii("edge.example.net.").unwrap())),
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            RData::A(A(Ipv4Addr::new(93, 184, 216, 35))),
        ];
        assert_eq!(
            first_ipv4("example.com", &answers).unwrap(),
            Ipv4Addr::new(93, 184, 216, 34)
        );
    }

    #[test]
    fn missing_a_answer_is_invalid() {
        let answers = vec![RData::CNAME(CNAME(Name::from_ascii("edge.example.net.").unwrap()))];
        assert!(matches!(
            first_ipv4("example.com", &answers),
            Err(ProbeError::InvalidResolvedAddress { ref domain }) if domain == "example.com"
        ));
        assert!(first_ipv4("example.com", &[]).is_err());
    }

    #[test]
    fn unusable_addresses_are_invalid() {
        for ip in [Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, Ipv4Addr::new(224, 0, 0, 1)] {
            let answers = vec![RData::A(A(ip))];
            assert!(first_ipv4("example.com", &answers).is_err(), "{} accepted", ip);
        }
    }
}
