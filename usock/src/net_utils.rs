use std::{
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  ptr,
};

/// Converts a populated `sockaddr_storage` (from `getsockname`, `accept`)
/// into a `SocketAddr`. Fails with `EAFNOSUPPORT` for non-IP families.
pub(crate) fn sockaddr_into_std(
  storage: &libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
  if storage.ss_family == libc::AF_INET as libc::sa_family_t {
    let v4_ptr = ptr::from_ref(storage).cast::<libc::sockaddr_in>();
    // SAFETY: ss_family says AF_INET, so the storage holds a sockaddr_in.
    let v4 = unsafe { *v4_ptr };
    let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
    let port = u16::from_be(v4.sin_port);

    Ok(SocketAddr::from(SocketAddrV4::new(ip, port)))
  } else if storage.ss_family == libc::AF_INET6 as libc::sa_family_t {
    let v6_ptr = ptr::from_ref(storage).cast::<libc::sockaddr_in6>();
    // SAFETY: ss_family says AF_INET6, so the storage holds a sockaddr_in6.
    let v6 = unsafe { *v6_ptr };
    let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
    let port = u16::from_be(v6.sin6_port);

    Ok(SocketAddr::from(SocketAddrV6::new(
      ip,
      port,
      v6.sin6_flowinfo,
      v6.sin6_scope_id,
    )))
  } else {
    Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
  }
}

/// Converts a `SocketAddr` into a `sockaddr_storage` plus the length the
/// kernel expects for the concrete family.
pub(crate) fn std_into_sockaddr(
  addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: sockaddr_storage is a plain C struct; all-zeroes is a valid value.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

  let len = match addr {
    SocketAddr::V4(v4) => {
      let sin = into_addr(v4);
      // SAFETY: sockaddr_in fits in sockaddr_storage by definition and the
      // two regions cannot overlap (one is a fresh stack local).
      unsafe {
        ptr::copy_nonoverlapping(
          ptr::from_ref(&sin).cast::<u8>(),
          ptr::from_mut(&mut storage).cast::<u8>(),
          mem::size_of::<libc::sockaddr_in>(),
        );
      }
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let sin6 = into_addr6(v6);
      // SAFETY: same as the V4 arm, for sockaddr_in6.
      unsafe {
        ptr::copy_nonoverlapping(
          ptr::from_ref(&sin6).cast::<u8>(),
          ptr::from_mut(&mut storage).cast::<u8>(),
          mem::size_of::<libc::sockaddr_in6>(),
        );
      }
      mem::size_of::<libc::sockaddr_in6>()
    }
  };

  (storage, len as libc::socklen_t)
}

fn into_addr(addr: SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in has only primitive fields; zero is valid for all.
  let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };

  #[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
  ))]
  {
    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
  }
  sin.sin_family = libc::AF_INET as libc::sa_family_t;
  sin.sin_port = addr.port().to_be();
  sin.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };

  sin
}

fn into_addr6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 has only primitive fields; zero is valid for all.
  let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };

  #[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
  ))]
  {
    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
  }
  sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  sin6.sin6_port = addr.port().to_be();
  sin6.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };

  sin6
}
