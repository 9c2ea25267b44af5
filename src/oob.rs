//! UDP out-of-band (ancillary) destination-address handling.
//!
//! On a multi-homed host the kernel may answer from a different source
//! address than the one a client sent to, breaking stub resolvers that
//! expect the reply to come from the address they queried. This module
//! recovers the original destination via `IP_PKTINFO`/`IPV6_PKTINFO` and
//! lets the caller pin the reply's source address to match it.
//!
//! Ancillary data is platform-dependent. On platforms where the kernel
//! doesn't surface it (anything but Linux, here), every function in this
//! module degrades to the plain `recv_from`/`send_to` behavior: correction
//! becomes a no-op and the kernel picks the source, per design.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;

/// Enable receipt of destination-address ancillary data on `socket`. A
/// no-op on platforms without cmsg support for this.
pub fn enable_pktinfo(socket: &UdpSocket, is_ipv6: bool) -> io::Result<()> {
    imp::enable_pktinfo(socket, is_ipv6)
}

/// Receive one datagram along with the destination address the client
/// used, when the platform can report it.
pub async fn recv_with_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
    imp::recv_with_dst(socket, buf).await
}

/// Send one datagram to `dst`, pinning the outgoing source address to
/// `src_hint` when the platform supports it and a hint is available.
/// IPv6 is preferred unless `src_hint` has an IPv4-mapped form, since IPv6
/// ancillary marshalling silently drops plain v4 addresses.
pub async fn send_with_src(
    socket: &UdpSocket,
    buf: &[u8],
    dst: SocketAddr,
    src_hint: Option<IpAddr>,
) -> io::Result<usize> {
    imp::send_with_src(socket, buf, dst, src_hint).await
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::mem::MaybeUninit;
    use std::os::fd::AsRawFd;

    pub fn enable_pktinfo(socket: &UdpSocket, is_ipv6: bool) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        let (level, name) = if is_ipv6 {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
        } else {
            (libc::IPPROTO_IP, libc::IP_PKTINFO)
        };
        let one: libc::c_int = 1;
        // SAFETY: fd is a valid, open socket owned by `socket`; `one` lives
        // for the duration of the call and matches the expected option size.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub async fn recv_with_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        loop {
            socket.readable().await?;
            match try_recvmsg(socket, buf) {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn try_recvmsg(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        let fd = socket.as_raw_fd();
        let mut cmsg_buf = [0u8; 128];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut src_storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = src_storage.as_mut_ptr() as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        // SAFETY: all pointers above are valid for the duration of the
        // call and sized per the structures they point to.
        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let src = sockaddr_storage_to_socket_addr(unsafe { src_storage.assume_init() })?;
        let dst = unsafe { extract_dst(&msg) };
        Ok((n as usize, src, dst))
    }

    unsafe fn extract_dst(msg: &libc::msghdr) -> Option<IpAddr> {
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                let pktinfo = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
                let addr = std::net::Ipv4Addr::from(u32::from_be(pktinfo.ipi_addr.s_addr));
                return Some(IpAddr::V4(addr));
            }
            if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let pktinfo = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
                let addr = std::net::Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr);
                return Some(IpAddr::V6(addr));
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
        }
        None
    }

    fn sockaddr_storage_to_socket_addr(storage: libc::sockaddr_storage) -> io::Result<SocketAddr> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(&storage) };
                let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(addr.sin_port)))
            }
            libc::AF_INET6 => {
                let addr: libc::sockaddr_in6 = unsafe { std::mem::transmute_copy(&storage) };
                let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
                Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(addr.sin6_port)))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address family {family}"),
            )),
        }
    }

    pub async fn send_with_src(
        socket: &UdpSocket,
        buf: &[u8],
        dst: SocketAddr,
        src_hint: Option<IpAddr>,
    ) -> io::Result<usize> {
        let Some(src) = src_hint else {
            return socket.send_to(buf, dst).await;
        };

        loop {
            socket.writable().await?;
            match try_sendmsg(socket, buf, dst, src) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn try_sendmsg(
        socket: &UdpSocket,
        buf: &[u8],
        dst: SocketAddr,
        src: IpAddr,
    ) -> io::Result<usize> {
        let fd = socket.as_raw_fd();
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // IPv6 marshalling silently drops IPv4-mapped addresses, so use
        // IPv4 PKTINFO whenever the hinted source has a v4 form.
        let use_v4 = matches!(src, IpAddr::V4(_)) || matches!(dst, SocketAddr::V4(_));

        let mut dst_storage = socket_addr_to_storage(dst);
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut dst_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if use_v4 {
            if let IpAddr::V4(ip) = src {
                let mut cmsg_buf = [0u8; 64];
                msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = unsafe {
                    libc::CMSG_SPACE(std::mem::size_of::<libc::in_pktinfo>() as u32)
                } as usize;

                let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
                unsafe {
                    (*cmsg).cmsg_level = libc::IPPROTO_IP;
                    (*cmsg).cmsg_type = libc::IP_PKTINFO;
                    (*cmsg).cmsg_len =
                        libc::CMSG_LEN(std::mem::size_of::<libc::in_pktinfo>() as u32) as _;
                    let pktinfo = libc::in_pktinfo {
                        ipi_ifindex: 0,
                        ipi_spec_dst: libc::in_addr {
                            s_addr: u32::from(ip).to_be(),
                        },
                        ipi_addr: libc::in_addr { s_addr: 0 },
                    };
                    std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, pktinfo);
                }
                return send_raw(fd, &msg);
            }
        } else if let IpAddr::V6(ip) = src {
            let mut cmsg_buf = [0u8; 64];
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen =
                unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::in6_pktinfo>() as u32) } as usize;

            let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            unsafe {
                (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
                (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
                (*cmsg).cmsg_len =
                    libc::CMSG_LEN(std::mem::size_of::<libc::in6_pktinfo>() as u32) as _;
                let pktinfo = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: ip.octets(),
                    },
                    ipi6_ifindex: 0,
                };
                std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, pktinfo);
            }
            return send_raw(fd, &msg);
        }

        socket.try_send_to(buf, dst)
    }

    fn send_raw(fd: std::os::fd::RawFd, msg: &libc::msghdr) -> io::Result<usize> {
        // SAFETY: `msg` was built above with pointers valid for this call.
        let n = unsafe { libc::sendmsg(fd, msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn socket_addr_to_storage(addr: SocketAddr) -> libc::sockaddr_storage {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from(*v4.ip()).to_be(),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: 0,
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: 0,
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
            }
        }
        storage
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn enable_pktinfo(_socket: &UdpSocket, _is_ipv6: bool) -> io::Result<()> {
        Ok(())
    }

    pub async fn recv_with_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        let (n, src) = socket.recv_from(buf).await?;
        Ok((n, src, None))
    }

    pub async fn send_with_src(
        socket: &UdpSocket,
        buf: &[u8],
        dst: SocketAddr,
        _src_hint: Option<IpAddr>,
    ) -> io::Result<usize> {
        socket.send_to(buf, dst).await
    }
}
