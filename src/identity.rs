use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};
use strum::IntoStaticStr;
use thiserror::Error;

/// Canonical stable identity used as the uniqueness scope for sessions, rate
/// limits, and bans. Authenticated users key by user id, guests by a
/// server-assigned guest id, and token-only participants by participant id.
#[derive(Debug, Hash, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IdentityKey {
    User(String),
    Guest(String),
    Participant(i64),
}

impl IdentityKey {
    #[must_use]
    pub fn for_participant(
        user_id: Option<&str>,
        guest_id: Option<&str>,
        participant_id: i64,
    ) -> Self {
        match (user_id, guest_id) {
            (Some(user), _) => Self::User(user.to_owned()),
            (None, Some(guest)) => Self::Guest(guest.to_owned()),
            (None, None) => Self::Participant(participant_id),
        }
    }
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Guest(id) => write!(f, "guest:{id}"),
            Self::Participant(id) => write!(f, "participant:{id}"),
        }
    }
}

#[derive(Debug, Error, IntoStaticStr)]
pub enum IdentityError {
    #[error("client address could not be resolved")]
    Unresolvable,
}

/// Resolves the client address, honoring `X-Forwarded-For` / `X-Real-IP` only
/// when the peer is a listed trusted proxy.
pub fn resolve_client_ip(
    peer: SocketAddr,
    headers: &HeaderMap,
    trusted_proxies: &[IpAddr],
) -> Result<IpAddr, IdentityError> {
    if !trusted_proxies.contains(&peer.ip()) {
        return Ok(peer.ip());
    }

    if let Some(forwarded) = headers.get("x-forwarded-for") {
        let first = forwarded
            .to_str()
            .ok()
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .and_then(|value| IpAddr::from_str(value).ok());
        if let Some(ip) = first {
            return Ok(ip);
        }
        return Err(IdentityError::Unresolvable);
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        return real_ip
            .to_str()
            .ok()
            .and_then(|value| IpAddr::from_str(value.trim()).ok())
            .ok_or(IdentityError::Unresolvable);
    }

    Ok(peer.ip())
}

pub fn parse_trusted_proxies(raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| IpAddr::from_str(part).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_str(name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn identity_key_renders_scoped_strings() {
        assert_eq!(IdentityKey::User("u7".into()).to_string(), "user:u7");
        assert_eq!(IdentityKey::Guest("g1".into()).to_string(), "guest:g1");
        assert_eq!(IdentityKey::Participant(42).to_string(), "participant:42");
    }

    #[test]
    fn forwarded_header_ignored_for_untrusted_peer() {
        let peer: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let ip = resolve_client_ip(
            peer,
            &headers(&[("x-forwarded-for", "203.0.113.9")]),
            &[],
        )
        .unwrap();
        assert_eq!(ip, peer.ip());
    }

    #[test]
    fn forwarded_header_honored_for_trusted_proxy() {
        let peer: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let ip = resolve_client_ip(
            peer,
            &headers(&[("x-forwarded-for", "203.0.113.9, 10.1.2.3")]),
            &[peer.ip()],
        )
        .unwrap();
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn garbage_forwarded_header_is_unresolvable() {
        let peer: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let result = resolve_client_ip(
            peer,
            &headers(&[("x-forwarded-for", "not-an-ip")]),
            &[peer.ip()],
        );
        assert!(matches!(result, Err(IdentityError::Unresolvable)));
    }

    #[test]
    fn trusted_proxies_parse_skips_blanks() {
        let proxies = parse_trusted_proxies("10.0.0.1, , 192.168.1.1");
        assert_eq!(proxies.len(), 2);
    }
}
