use std::io;
use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// First IPv4 address of an up, non-loopback interface.
pub fn local_ipv4() -> io::Result<Ipv4Addr> {
    let addrs = getifaddrs().map_err(io::Error::from)?;
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            continue;
        }
        let Some(ip) = ifaddr
            .address
            .as_ref()
            .and_then(|addr| addr.as_sockaddr_in())
            .map(|sin| sin.ip())
        else {
            continue;
        };
        if !ip.is_loopback() {
            return Ok(ip);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no non-loopback IPv4 address found",
    ))
}
