//! Layer-2 TAP device
//!
//! Creates and configures the virtual interface, then pumps raw Ethernet
//! frames between the device and a pair of bounded channels. The channel
//! seam is the backpressure boundary: a full capture queue blocks the
//! device reader (flow control back to the host stack), while injection
//! drops are the caller's policy.
//!
//! On Linux the requested interface name is honored; on macOS the kernel
//! assigns the name and the handle records it.

use std::io;
use std::os::fd::AsRawFd;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TapConfig;
use crate::error::{Result, TunnelError};
use crate::frame::validate_frame_len;
use crate::frame::ETH_HEADER_LEN;
use crate::pipeline::QUEUE_DEPTH;
use crate::telemetry::TunnelStats;

/// Raw TAP file descriptor; closing it destroys the interface binding.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub struct TapFd(OwnedFd);

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl AsRawFd for TapFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// An open, configured TAP interface.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub struct TapDevice {
    fd: Arc<AsyncFd<TapFd>>,
    name: String,
    mtu: u16,
}

/// Channel ends of a running TAP device.
///
/// `inbound` yields frames captured from the host stack; `outbound`
/// accepts frames to inject. Both sequences end when the device closes.
pub struct TapHandle {
    pub name: String,
    pub mtu: u16,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub tasks: Vec<JoinHandle<()>>,
    /// Token the pump tasks observe; cancelling it releases the device.
    pub cancel: CancellationToken,
}

/// Far end of an in-memory TAP used by tests: inject "host" frames and
/// observe what the tunnel writes back.
pub struct TapPort {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub delivered: mpsc::Receiver<Vec<u8>>,
}

impl TapHandle {
    /// A device-less handle backed by channels, standing in for the
    /// kernel interface where no privileges exist.
    pub fn in_memory(name: &str, mtu: u16) -> (TapHandle, TapPort) {
        let (inject_tx, inject_rx) = mpsc::channel(QUEUE_DEPTH);
        let (deliver_tx, deliver_rx) = mpsc::channel(QUEUE_DEPTH);
        (
            TapHandle {
                name: name.to_string(),
                mtu,
                inbound: inject_rx,
                outbound: deliver_tx,
                tasks: Vec::new(),
                cancel: CancellationToken::new(),
            },
            TapPort {
                inject: inject_tx,
                delivered: deliver_rx,
            },
        )
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl TapDevice {
    /// Open and configure the interface. Requires CAP_NET_ADMIN on Linux
    /// or root on macOS; failure here is fatal for the tunnel.
    pub fn create(cfg: &TapConfig) -> Result<Self> {
        let (fd, name) = open_device(cfg)?;
        configure_device(&name, cfg)?;
        let fd = AsyncFd::new(TapFd(fd)).map_err(|e| {
            TunnelError::Tap(format!("failed to register tap fd with the reactor: {e}"))
        })?;
        info!(interface = %name, mtu = cfg.mtu, ip = %cfg.ip, "tap device ready");
        Ok(Self {
            fd: Arc::new(fd),
            name,
            mtu: cfg.mtu,
        })
    }

    /// Kernel-assigned interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the reader/writer pumps and hand back the channel seam.
    /// Both pumps exit on cancellation; dropping the last fd reference
    /// closes the device on every exit path.
    pub fn start(self, stats: Arc<TunnelStats>, cancel: CancellationToken) -> TapHandle {
        let token = cancel.child_token();
        let (capture_tx, capture_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inject_tx, inject_rx) = mpsc::channel(QUEUE_DEPTH);

        let reader = tokio::spawn(read_pump(
            self.fd.clone(),
            capture_tx,
            self.mtu,
            stats.clone(),
            token.clone(),
        ));
        let writer = tokio::spawn(write_pump(self.fd, inject_rx, stats, token.clone()));

        TapHandle {
            name: self.name,
            mtu: self.mtu,
            inbound: capture_rx,
            outbound: inject_tx,
            tasks: vec![reader, writer],
            cancel: token,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn read_pump(
    fd: Arc<AsyncFd<TapFd>>,
    capture_tx: mpsc::Sender<Vec<u8>>,
    mtu: u16,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
) {
    // One byte beyond the largest legal frame so oversize reads are
    // detectable rather than silently truncated.
    let mut buf = vec![0u8; mtu as usize + ETH_HEADER_LEN + 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ready = fd.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(Ok(n)) => {
                        if validate_frame_len(n, mtu).is_err() {
                            stats.record_malformed();
                            continue;
                        }
                        // A full queue blocks here: flow control back to
                        // the host stack.
                        if capture_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Ok(Err(e)) => {
                        warn!(error = %e, "transient tap read failure");
                        continue;
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn write_pump(
    fd: Arc<AsyncFd<TapFd>>,
    mut inject_rx: mpsc::Receiver<Vec<u8>>,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inject_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        loop {
            let mut guard = match fd.writable().await {
                Ok(guard) => guard,
                Err(_) => return,
            };
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => break,
                Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "tap injection failed, frame dropped");
                    stats.record_dropped();
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn creation_error(err: io::Error) -> TunnelError {
    if matches!(
        err.raw_os_error(),
        Some(libc::EPERM) | Some(libc::EACCES)
    ) {
        TunnelError::Tap(
            "creating the TAP device was denied: run as root or grant CAP_NET_ADMIN".into(),
        )
    } else {
        TunnelError::Tap(format!("failed to create TAP device: {err}"))
    }
}

#[cfg(target_os = "linux")]
fn open_device(cfg: &TapConfig) -> Result<(OwnedFd, String)> {
    let raw = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_NONBLOCK,
        )
    };
    if raw < 0 {
        return Err(creation_error(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = cfg.name.as_bytes();
    if name_bytes.len() >= libc::IFNAMSIZ {
        return Err(TunnelError::Tap(format!(
            "interface name {:?} exceeds IFNAMSIZ",
            cfg.name
        )));
    }
    for (slot, byte) in req.ifr_name.iter_mut().zip(name_bytes.iter()) {
        *slot = *byte as libc::c_char;
    }
    req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF as _, &mut req) } < 0 {
        return Err(creation_error(io::Error::last_os_error()));
    }

    let assigned = unsafe {
        std::ffi::CStr::from_ptr(req.ifr_name.as_ptr())
            .to_string_lossy()
            .into_owned()
    };
    Ok((fd, assigned))
}

#[cfg(target_os = "linux")]
fn sockaddr_v4(ip: std::net::Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0u8; 8],
    };
    let mut out: libc::sockaddr = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            &sin as *const libc::sockaddr_in as *const u8,
            &mut out as *mut libc::sockaddr as *mut u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        );
    }
    out
}

#[cfg(target_os = "linux")]
fn configure_device(name: &str, cfg: &TapConfig) -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TunnelError::Tap(format!(
            "failed to open configuration socket: {}",
            io::Error::last_os_error()
        )));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in req.ifr_name.iter_mut().zip(name.as_bytes().iter()) {
        *slot = *byte as libc::c_char;
    }

    let ioctl = |request: libc::c_ulong, req: &mut libc::ifreq, what: &str| -> Result<()> {
        if unsafe { libc::ioctl(sock.as_raw_fd(), request as _, req) } < 0 {
            return Err(TunnelError::Tap(format!(
                "failed to {what} on {name}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    };

    req.ifr_ifru.ifru_addr = sockaddr_v4(cfg.ip);
    ioctl(libc::SIOCSIFADDR as libc::c_ulong, &mut req, "set address")?;

    req.ifr_ifru.ifru_netmask = sockaddr_v4(cfg.netmask);
    ioctl(libc::SIOCSIFNETMASK as libc::c_ulong, &mut req, "set netmask")?;

    req.ifr_ifru.ifru_mtu = cfg.mtu as libc::c_int;
    ioctl(libc::SIOCSIFMTU as libc::c_ulong, &mut req, "set mtu")?;

    ioctl(libc::SIOCGIFFLAGS as libc::c_ulong, &mut req, "read flags")?;
    unsafe {
        req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    ioctl(libc::SIOCSIFFLAGS as libc::c_ulong, &mut req, "bring up")?;

    Ok(())
}

#[cfg(target_os = "macos")]
fn open_device(_cfg: &TapConfig) -> Result<(OwnedFd, String)> {
    // The tuntap kext exposes /dev/tapN; the kernel owns the name.
    for idx in 0..16 {
        let path = format!("/dev/tap{idx}\0");
        let raw = unsafe {
            libc::open(
                path.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if raw >= 0 {
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            return Ok((fd, format!("tap{idx}")));
        }
        let err = io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::EPERM) | Some(libc::EACCES)) {
            return Err(creation_error(err));
        }
    }
    Err(TunnelError::Tap(
        "no /dev/tapN device available: install the tuntap kext and run as root".into(),
    ))
}

#[cfg(target_os = "macos")]
fn configure_device(name: &str, cfg: &TapConfig) -> Result<()> {
    let status = std::process::Command::new("ifconfig")
        .arg(name)
        .arg(cfg.ip.to_string())
        .arg("netmask")
        .arg(cfg.netmask.to_string())
        .arg("mtu")
        .arg(cfg.mtu.to_string())
        .arg("up")
        .status()
        .map_err(|e| TunnelError::Tap(format!("failed to run ifconfig: {e}")))?;
    if !status.success() {
        return Err(TunnelError::Tap(format!(
            "ifconfig exited with {status} while configuring {name}"
        )));
    }
    Ok(())
}
