use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// An address rejected by the dial-safety policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("address {ip} rejected: {reason}")]
pub struct AddrError {
    /// The offending IP address.
    pub ip: IpAddr,
    /// Which policy rule rejected it.
    pub reason: &'static str,
}

/// Checks that `ip` is a sane dial target for an overlay link.
///
/// Loopback, link-local, unspecified, and multicast addresses are
/// rejected: a mesh link over any of them terminates on this host (or
/// nowhere) and would feed the overlay back into itself.
///
/// # Errors
///
/// Returns an [`AddrError`] naming the violated rule.
pub fn check_addr(ip: IpAddr) -> Result<(), AddrError> {
    let reject = |reason| Err(AddrError { ip, reason });
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_unspecified() {
                return reject("unspecified");
            }
            if v4.is_loopback() {
                return reject("loopback");
            }
            if v4.is_link_local() {
                return reject("link-local");
            }
            if v4.is_multicast() {
                return reject("multicast");
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_unspecified() {
                return reject("unspecified");
            }
            if v6.is_loopback() {
                return reject("loopback");
            }
            // fe80::/10
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                return reject("link-local");
            }
            if v6.is_multicast() {
                return reject("multicast");
            }
        }
    }
    Ok(())
}

/// Endpoint checks on a completed socket.
///
/// The peer address must pass [`check_addr`], and the two endpoints must
/// not share an IP: equal local and remote IPs mean the connection was
/// routed to an address bound by this host.
///
/// # Errors
///
/// Returns an [`AddrError`] naming the violated rule.
pub fn check_stream_endpoints(local: SocketAddr, peer: SocketAddr) -> Result<(), AddrError> {
    check_addr(peer.ip())?;
    if local.ip() == peer.ip() {
        return Err(AddrError {
            ip: peer.ip(),
            reason: "bound by this host",
        });
    }
    Ok(())
}
