//! Minimal SOCKS5 CONNECT client (RFC 1928) with optional
//! username/password authentication (RFC 1929).

use crate::error::WeftError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;
const AUTH_VERSION: u8 = 0x01;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Negotiates a CONNECT tunnel to `host:port` over an established stream
/// to the proxy. On success the stream carries the tunnelled connection.
pub(crate) async fn connect<S>(
    stream: &mut S,
    host: url::Host<&str>,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<(), WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods: &[u8] = if auth.is_some() {
        &[METHOD_USERPASS, METHOD_NONE]
    } else {
        &[METHOD_NONE]
    };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != VERSION {
        return Err(WeftError::Socks(
            "proxy replied with a non-SOCKS5 version".into(),
        ));
    }
    match selection[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let (user, pass) = auth
                .ok_or_else(|| WeftError::Socks("proxy requires authentication".into()))?;
            authenticate(stream, user, pass).await?;
        }
        METHOD_UNACCEPTABLE => {
            return Err(WeftError::Socks(
                "proxy accepts none of the offered authentication methods".into(),
            ))
        }
        other => {
            return Err(WeftError::Socks(format!(
                "proxy selected unknown method {other:#04x}"
            )))
        }
    }

    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
    match host {
        url::Host::Ipv4(ip) => {
            request.push(ATYP_V4);
            request.extend_from_slice(&ip.octets());
        }
        url::Host::Ipv6(ip) => {
            request.push(ATYP_V6);
            request.extend_from_slice(&ip.octets());
        }
        url::Host::Domain(domain) => {
            let bytes = domain.as_bytes();
            if bytes.is_empty() || bytes.len() > 255 {
                return Err(WeftError::Socks(format!(
                    "target host name length {} is out of range",
                    bytes.len()
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(bytes.len() as u8);
            request.extend_from_slice(bytes);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(WeftError::Socks(
            "proxy replied with a non-SOCKS5 version".into(),
        ));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(WeftError::Socks(format!(
            "connect refused: {}",
            reply_reason(head[1])
        )));
    }
    // Drain the bound-address trailer so the stream is positioned at the
    // first tunnelled byte.
    let trailer = match head[3] {
        ATYP_V4 => 4 + 2,
        ATYP_V6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(WeftError::Socks(format!(
                "reply carries unknown address type {other:#04x}"
            )))
        }
    };
    let mut bound = vec![0u8; trailer];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), WeftError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = user.as_bytes();
    let pass = pass.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(WeftError::Socks("credentials exceed 255 bytes".into()));
    }
    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(AUTH_VERSION);
    msg.push(user.len() as u8);
    msg.extend_from_slice(user);
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass);
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(WeftError::Socks("authentication rejected".into()));
    }
    Ok(())
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}
