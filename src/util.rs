use eyre::{bail, ensure, Result as EyreResult};
use std::convert::Infallible;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str,
};
use url::{Host, Url};

pub fn parse_url(url: &Url) -> EyreResult<(SocketAddr, &str)> {
    ensure!(
        url.scheme() == "http",
        "Only http:// is supported in {}",
        url
    );
    let prefix = url.path();
    let ip: IpAddr = match url.host() {
        Some(Host::Ipv4(ip)) => ip.into(),
        Some(Host::Ipv6(ip)) => ip.into(),
        Some(_) => bail!("Cannot bind {}", url),
        None => Ipv4Addr::LOCALHOST.into(),
    };
    let port = url.port().unwrap_or(8080);
    let addr = SocketAddr::new(ip, port);
    Ok((addr, prefix))
}

/// Opaque secret such as a participant join token. Never printed, never
/// serialized, compared in constant time.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn get_secret(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        let a = self.0.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("[REDACTED]")
    }
}

impl str::FromStr for Secret {
    type Err = Infallible;

    fn from_str(str: &str) -> Result<Self, Self::Err> {
        Ok(Self(str.to_owned()))
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_matches_same_token_only() {
        let secret = Secret::from("4cf9a3f1".to_owned());
        assert!(secret.matches("4cf9a3f1"));
        assert!(!secret.matches("4cf9a3f2"));
        assert!(!secret.matches("4cf9a3f"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::from("super-secret".to_owned());
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
    }
}
