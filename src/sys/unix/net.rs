use std::ffi::{CStr, CString};
use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::ptr;

/// Scatter read into `bufs`.
///
/// `IoSliceMut` is guaranteed to be ABI compatible with `iovec` on Unix.
pub(crate) fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let n = syscall!(readv(
        fd,
        bufs.as_mut_ptr().cast(),
        bufs.len() as libc::c_int,
    ))?;
    Ok(n as usize)
}

/// Gather write from `bufs`.
///
/// `IoSlice` is guaranteed to be ABI compatible with `iovec` on Unix.
pub(crate) fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let n = syscall!(writev(fd, bufs.as_ptr().cast(), bufs.len() as libc::c_int))?;
    Ok(n as usize)
}

/// Converts a raw `sockaddr` into a `SocketAddr`.
pub(crate) fn to_socket_addr(addr: *const libc::sockaddr) -> io::Result<SocketAddr> {
    if addr.is_null() {
        return Err(io::ErrorKind::InvalidInput.into());
    }
    match unsafe { (*addr).sa_family } as libc::c_int {
        libc::AF_INET => {
            // Safety: `sa_family` says this is a `sockaddr_in`.
            let addr = unsafe { &*(addr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // Safety: `sa_family` says this is a `sockaddr_in6`.
            let addr = unsafe { &*(addr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

/// One entry produced by `getaddrinfo`.
pub(crate) struct AddrInfoEntry {
    pub(crate) addr: SocketAddr,
    pub(crate) canonical_name: Option<String>,
}

/// Blocking wrapper over `getaddrinfo(3)` restricted to TCP streams.
///
/// A `None` host passes a null node pointer (for `AI_PASSIVE` lookups);
/// an empty service passes a null service pointer.
pub(crate) fn getaddrinfo(
    host: Option<&str>,
    service: &str,
    ai_flags: libc::c_int,
) -> io::Result<Vec<AddrInfoEntry>> {
    fn nul_in_input(_: std::ffi::NulError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, "name contains a nul byte")
    }

    let host = match host {
        Some(host) => Some(CString::new(host).map_err(nul_in_input)?),
        None => None,
    };
    let service = CString::new(service).map_err(nul_in_input)?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;
    hints.ai_flags = ai_flags;

    let host_ptr = host.as_ref().map_or(ptr::null(), |h| h.as_ptr());
    let service_ptr = if service.as_bytes().is_empty() {
        ptr::null()
    } else {
        service.as_ptr()
    };

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(host_ptr, service_ptr, &hints, &mut res) };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut entries = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        // Entries for address families this crate does not speak are
        // skipped rather than failing the whole query.
        if let Ok(addr) = to_socket_addr(ai.ai_addr) {
            let canonical_name = if ai.ai_canonname.is_null() {
                None
            } else {
                let name = unsafe { CStr::from_ptr(ai.ai_canonname) };
                Some(name.to_string_lossy().into_owned())
            };
            entries.push(AddrInfoEntry {
                addr,
                canonical_name,
            });
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(entries)
}

fn gai_error(rc: libc::c_int) -> io::Error {
    if rc == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }
    let detail = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    io::Error::new(
        io::ErrorKind::Other,
        format!(
            "failed to look up address information: {}",
            detail.to_string_lossy()
        ),
    )
}
