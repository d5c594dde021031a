//! SOCKS5 CONNECT (RFC 1928) with optional username/password auth (RFC 1929).
//!
//! Hostnames are sent with the domain-name address type so the proxy does
//! the resolution; this is what makes `.onion` endpoints reachable through
//! a local Tor daemon.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{Endpoint, Socks5Config, Socks5Credential};
use crate::error::{QueryError, Result};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dial `target` through the proxy described by `proxy`.
pub async fn connect(proxy: &Socks5Config, target: &Endpoint) -> Result<TcpStream> {
    let mut stream =
        TcpStream::connect(&proxy.addr)
            .await
            .map_err(|source| QueryError::Connect {
                endpoint: proxy.addr.clone(),
                source,
            })?;

    tracing::debug!("Connected to SOCKS5 proxy {}, requesting {}", proxy.addr, target);
    handshake(&mut stream, proxy.credentials.as_ref(), target).await?;
    Ok(stream)
}

/// Run the SOCKS5 negotiation over an already-open stream.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    credentials: Option<&Socks5Credential>,
    target: &Endpoint,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if credentials.is_some() {
        stream
            .write_all(&[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;
    }

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(QueryError::Proxy(format!(
            "unexpected SOCKS version {:#04x}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(cred)) => authenticate(stream, cred).await?,
        (METHOD_NONE_ACCEPTABLE, _) => {
            return Err(QueryError::Proxy(
                "proxy accepted none of the offered auth methods".to_string(),
            ))
        }
        (other, _) => {
            return Err(QueryError::Proxy(format!(
                "proxy selected unoffered auth method {other:#04x}"
            )))
        }
    }

    stream.write_all(&connect_request(target)?).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(QueryError::Proxy(format!(
            "unexpected SOCKS version {:#04x} in reply",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(QueryError::Proxy(reply_message(reply[1]).to_string()));
    }

    // Bound address and port; unused but must be consumed.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => {
            return Err(QueryError::Proxy(format!(
                "unknown address type {other:#04x} in reply"
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, cred: &Socks5Credential) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = cred.username.as_bytes();
    let pass = cred.password.as_bytes();
    if user.is_empty() || user.len() > 255 || pass.len() > 255 {
        return Err(QueryError::Proxy(
            "SOCKS5 credentials must be 1-255 bytes".to_string(),
        ));
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user);
    request.push(pass.len() as u8);
    request.extend_from_slice(pass);
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(QueryError::Proxy("SOCKS5 authentication failed".to_string()));
    }
    Ok(())
}

fn connect_request(target: &Endpoint) -> Result<Vec<u8>> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match target.host().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host().as_bytes();
            if host.len() > 255 {
                return Err(QueryError::Proxy(format!(
                    "hostname too long for SOCKS5: {}",
                    target.host()
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host);
        }
    }

    request.extend_from_slice(&target.port().to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_connect_request_uses_domain_for_onion() {
        let target = Endpoint::new("55k4e2eaeucf3omt.onion", 9091);
        let request = connect_request(&target).unwrap();

        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, ATYP_DOMAIN]);
        assert_eq!(request[4] as usize, "55k4e2eaeucf3omt.onion".len());
        assert_eq!(&request[request.len() - 2..], &9091u16.to_be_bytes());
    }

    #[test]
    fn test_connect_request_ipv4() {
        let request = connect_request(&Endpoint::new("5.135.30.59", 9091)).unwrap();
        assert_eq!(request, vec![5, 1, 0, ATYP_IPV4, 5, 135, 30, 59, 0x23, 0x83]);
    }

    #[tokio::test]
    async fn test_handshake_no_auth() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            proxy.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            proxy.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            proxy.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"node.example");

            proxy
                .write_all(&[5, 0, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();
        });

        handshake(&mut client, None, &Endpoint::new("node.example", 9091))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_with_credentials() {
        let (mut client, mut proxy) = duplex(1024);
        let cred = Socks5Credential {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, 0, 2]);
            proxy.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 1 + 1 + 5 + 1 + 6];
            proxy.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[2..7], b"alice");
            proxy.write_all(&[1, 0]).await.unwrap();

            let mut request = [0u8; 10];
            proxy.read_exact(&mut request).await.unwrap();
            proxy
                .write_all(&[5, 0, 0, ATYP_DOMAIN, 1, b'x', 0, 80])
                .await
                .unwrap();
        });

        handshake(&mut client, Some(&cred), &Endpoint::new("10.0.0.1", 9091))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_connect_refused() {
        let (mut client, mut proxy) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[5, 0x05, 0, ATYP_IPV4]).await.unwrap();
        });

        let err = handshake(&mut client, None, &Endpoint::new("10.0.0.1", 9091))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Proxy(msg) if msg == "connection refused"));
    }

    #[tokio::test]
    async fn test_handshake_rejected_methods() {
        let (mut client, mut proxy) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            proxy.write_all(&[5, 0xFF]).await.unwrap();
        });

        let err = handshake(&mut client, None, &Endpoint::new("host", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Proxy(_)));
    }
}
