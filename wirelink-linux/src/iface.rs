//! Enumerate local IPv4 addresses with getifaddrs(3) and hand them to the selector.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use wirelink_core::iface::{classify, LinkKind};
use wirelink_core::{select_bind_address, Candidate};

/// Every (interface, IPv4 address) pair on the host, in kernel order.
pub fn enumerate() -> io::Result<Vec<Candidate>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs writes a list head we free below with freeifaddrs.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        // SAFETY: `cur` is a live node of the list returned by getifaddrs.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        // SAFETY: non-null sockaddr from getifaddrs; family checked before the cast.
        let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
        if family != libc::AF_INET {
            continue;
        }
        // SAFETY: AF_INET checked above, so the address is a sockaddr_in.
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        // SAFETY: ifa_name is a NUL-terminated string owned by the list until freeifaddrs.
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        out.push(Candidate::new(name, IpAddr::V4(addr)));
    }
    // SAFETY: head came from a successful getifaddrs call and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(out)
}

/// Resolve the bind address: an explicit override, else the wired/tethering policy.
pub fn bind_address(explicit: Option<Ipv4Addr>) -> anyhow::Result<Ipv4Addr> {
    if let Some(ip) = explicit {
        tracing::info!(%ip, "using configured bind address");
        return Ok(ip);
    }
    let candidates = enumerate()?;
    for c in &candidates {
        match classify(&c.name) {
            LinkKind::Radio => tracing::debug!(iface = %c.name, addr = %c.addr, "skipping radio interface"),
            kind => tracing::debug!(iface = %c.name, addr = %c.addr, ?kind, "found interface"),
        }
    }
    let ip = select_bind_address(&candidates)?;
    let iface = candidates
        .iter()
        .find(|c| c.addr == IpAddr::V4(ip))
        .map(|c| c.name.as_str())
        .unwrap_or("?");
    tracing::info!(%ip, %iface, "selected bind address");
    Ok(ip)
}
