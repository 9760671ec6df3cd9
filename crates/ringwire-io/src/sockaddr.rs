//! Cached socket-address storage for kernel submissions.
//!
//! A connect SQE carries a *pointer* to the sockaddr; the storage must
//! stay put until the completion arrives. Each backend instance owns one
//! boxed slot per family and refills it per connect — no per-call
//! allocation on the submit path.
//!
//! `sockaddr_in` layout handed to the kernel (16 bytes):
//! family `u16`, port `u16` network order, IPv4 address 4 bytes,
//! 8 bytes zero padding.

use std::net::SocketAddr;

/// Stable sockaddr storage. Boxed so the address survives moves of the
/// owning backend.
pub struct SockAddrSlot {
    v4: Box<libc::sockaddr_in>,
    v6: Box<libc::sockaddr_in6>,
}

impl Default for SockAddrSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SockAddrSlot {
    pub fn new() -> Self {
        Self {
            v4: Box::new(unsafe { std::mem::zeroed() }),
            v6: Box::new(unsafe { std::mem::zeroed() }),
        }
    }

    /// Fill the family slot and return `(pointer, addrlen)` for the SQE.
    pub fn fill(&mut self, addr: SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
        match addr {
            SocketAddr::V4(v4) => {
                self.v4.sin_family = libc::AF_INET as libc::sa_family_t;
                self.v4.sin_port = v4.port().to_be();
                self.v4.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                self.v4.sin_zero = [0; 8];
                (
                    &*self.v4 as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                self.v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                self.v6.sin6_port = v6.port().to_be();
                self.v6.sin6_flowinfo = v6.flowinfo();
                self.v6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                self.v6.sin6_scope_id = v6.scope_id();
                (
                    &*self.v6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    }
}

/// Open a TCP socket of the right family for `addr`.
pub fn tcp_socket(addr: SocketAddr) -> Result<i32, i32> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(unsafe { *libc::__errno_location() });
    }
    Ok(fd)
}

/// TCP_NODELAY, the transport's default for every data socket.
pub fn set_nodelay(fd: i32) {
    unsafe {
        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            4,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_wire_layout() {
        let mut slot = SockAddrSlot::new();
        let (ptr, len) = slot.fill("127.0.0.1:9999".parse().unwrap());
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(len, 16);

        let raw = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
        // family (host order, AF_INET = 2)
        assert_eq!(
            u16::from_ne_bytes([raw[0], raw[1]]),
            libc::AF_INET as u16
        );
        // port 9999 in network byte order
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 9999);
        // address bytes as written
        assert_eq!(&raw[4..8], &[127, 0, 0, 1]);
        // 8-byte pad
        assert_eq!(&raw[8..16], &[0u8; 8]);
    }

    #[test]
    fn v6_addrlen() {
        let mut slot = SockAddrSlot::new();
        let (_, len) = slot.fill("[::1]:80".parse().unwrap());
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
    }

    #[test]
    fn refill_overwrites() {
        let mut slot = SockAddrSlot::new();
        slot.fill("10.0.0.1:1".parse().unwrap());
        let (ptr, _) = slot.fill("192.168.1.2:2".parse().unwrap());
        let raw = unsafe { std::slice::from_raw_parts(ptr as *const u8, 8) };
        assert_eq!(&raw[4..8], &[192, 168, 1, 2]);
    }
}
