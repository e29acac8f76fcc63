//! Local interface address lookup

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// First non-loopback IPv4 interface address, paired with `port`
#[cfg(unix)]
pub fn first_interface_address(port: u16) -> Option<SocketAddr> {
    let mut found = None;

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let octets = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::from(octets);

                if !ip.is_loopback() && !ip.is_unspecified() {
                    found = Some(SocketAddr::new(IpAddr::V4(ip), port));
                    break;
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    found
}

#[cfg(not(unix))]
pub fn first_interface_address(_port: u16) -> Option<SocketAddr> {
    None
}
