use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};

use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::error::ConfigError;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const DEFAULT_PORT: u16 = 1080;

/// Opens TCP connections through a SOCKS5 proxy (RFC 1928), optionally
/// authenticating with username and password (RFC 1929).
#[derive(Clone, PartialEq)]
pub struct Socks5Dialer {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

#[derive(Clone, PartialEq)]
struct Credentials {
    username: String,
    password: String,
}

impl Socks5Dialer {
    pub fn from_url(url: &Url) -> std::result::Result<Self, ConfigError> {
        let dialer_error = |reason: &str| ConfigError::ProxyDialer {
            uri: url.to_string(),
            reason: reason.to_string(),
        };
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(dialer_error("missing proxy host")),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let credentials = if url.username().is_empty() {
            None
        } else {
            // Userinfo stays percent-encoded in a parsed URL
            let decode = |field: &str| {
                percent_decode_str(field)
                    .decode_utf8()
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| dialer_error("credentials are not valid UTF-8"))
            };
            let username = decode(url.username())?;
            let password = decode(url.password().unwrap_or_default())?;
            // Both fields are length-prefixed with a single byte on the wire
            if username.len() > 255 || password.len() > 255 {
                return Err(dialer_error("credentials longer than 255 bytes"));
            }
            Some(Credentials { username, password })
        };
        Ok(Self {
            host,
            port,
            credentials,
        })
    }

    pub fn proxy_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Connects to the proxy and asks it to open a tunnel to `target`.
    pub async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.negotiate_auth(&mut stream).await?;
        request_connect(&mut stream, target).await?;
        Ok(stream)
    }

    async fn negotiate_auth(&self, stream: &mut TcpStream) -> Result<()> {
        let greeting: &[u8] = match &self.credentials {
            Some(_) => &[VERSION, 2, NO_AUTH, USERNAME_PASSWORD],
            None => &[VERSION, 1, NO_AUTH],
        };
        stream.write_all(greeting).await?;

        let mut reply = [0; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION {
            return Err(protocol_error("invalid version in method selection"));
        }
        match (reply[1], &self.credentials) {
            (NO_AUTH, _) => Ok(()),
            (USERNAME_PASSWORD, Some(credentials)) => authenticate(stream, credentials).await,
            (NO_ACCEPTABLE_METHODS, _) => Err(Error::new(
                ErrorKind::PermissionDenied,
                "socks5 proxy rejected all authentication methods",
            )),
            (method, _) => Err(protocol_error(&format!(
                "unexpected authentication method 0x{method:02x}"
            ))),
        }
    }
}

async fn authenticate(stream: &mut TcpStream, credentials: &Credentials) -> Result<()> {
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username);
    request.push(password.len() as u8);
    request.extend_from_slice(password);
    stream.write_all(&request).await?;

    let mut reply = [0; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            "socks5 authentication failed",
        ));
    }
    Ok(())
}

async fn request_connect(stream: &mut TcpStream, target: SocketAddr) -> Result<()> {
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
    match target.ip() {
        IpAddr::V4(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error("invalid version in connect reply"));
    }
    if header[1] != 0x00 {
        return Err(Error::new(
            ErrorKind::ConnectionRefused,
            format!("socks5 connect to {} failed with status {}", target, header[1]),
        ));
    }

    // Skip the bound address, its length depends on the address type
    let skip = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => stream.read_u8().await? as usize + 2,
        other => return Err(protocol_error(&format!("unknown address type {other}"))),
    };
    let mut bound = vec![0; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn protocol_error(message: &str) -> Error {
    Error::new(ErrorKind::InvalidData, format!("socks5: {message}"))
}

impl fmt::Debug for Socks5Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Dialer")
            .field("proxy", &self.proxy_address())
            .field("authenticated", &self.has_credentials())
            .finish()
    }
}
