use super::*;

/// A `stratum+tcp://host:port` URL. Only that scheme is accepted, and the
/// URL must not carry a path.
#[derive(Debug, Clone, PartialEq, DeserializeFromStr, SerializeDisplay)]
pub struct StratumUrl {
    pub host: String,
    pub port: u16,
}

impl FromStr for StratumUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("stratum+tcp://").ok_or_else(|| {
            anyhow!("unrecognized scheme in `{s}`, only 'stratum+tcp' is allowed")
        })?;

        ensure!(
            !rest.contains('/'),
            "endpoint URL `{s}` has a path, this is not valid"
        );

        let (host, port) = rest
            .rsplit_once(':')
            .with_context(|| format!("no port provided in `{s}`"))?;

        ensure!(!host.is_empty(), "no hostname provided in `{s}`");

        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in `{s}`"))?;

        Ok(StratumUrl {
            host: host.into(),
            port,
        })
    }
}

impl fmt::Display for StratumUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "stratum+tcp://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5 {
    pub host: String,
    pub port: u16,
}

/// One watched pool, loaded from the endpoints file at boot and never
/// mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub url: StratumUrl,
    pub userpass: String,
    pub pool_name: String,
    #[serde(default)]
    pub socks5: Option<Socks5>,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

impl Endpoint {
    pub fn credentials(&self) -> (&str, &str) {
        self.userpass
            .split_once(':')
            .unwrap_or((self.userpass.as_str(), ""))
    }
}
