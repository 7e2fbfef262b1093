use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

/// Binds a nonblocking UDP socket for TS packet reception, joining the
/// multicast group when the address calls for it.
pub fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => anyhow::bail!("only IPv4 input is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    if ip.is_multicast() {
        // default interface
        socket.join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}
