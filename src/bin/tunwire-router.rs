//! Standalone runner: wires `tunwire::Router` to a real TUN device.
//!
//! Grounded on the teacher's `bin/standalone.rs`: manual CLI argument
//! parsing (no external arg-parsing crate pulled in for a handful of
//! flags), and the macOS `utun`/Linux `/dev/net/tun` device setup via raw
//! `libc` ioctls.

use std::env;
use std::ffi::CStr;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use tunwire::{Router, RouterConfig};

#[derive(Debug)]
struct Settings {
    mtu: u32,
    utun_index: Option<u32>,
    ifname: Option<String>,
    proxy: SocketAddr,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut mtu = 1500;
        let mut utun_index = None;
        let mut ifname = None;
        let mut proxy = SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 1080));

        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--mtu" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("--mtu requires a value"))?;
                    mtu = value.parse().map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                }
                "--utun" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("--utun requires a value"))?;
                    utun_index = Some(value.parse().map_err(|_| anyhow::anyhow!("invalid utun index"))?);
                }
                "--ifname" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("--ifname requires a value"))?;
                    if value.is_empty() {
                        anyhow::bail!("--ifname requires a non-empty value");
                    }
                    ifname = Some(value);
                }
                "--proxy" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("--proxy requires a value"))?;
                    proxy = value.parse().map_err(|_| anyhow::anyhow!("invalid proxy address"))?;
                }
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported: --mtu <value>, --utun <index>, --ifname <name>, --proxy <ip:port>",
                        arg
                    );
                }
            }
        }
        Ok(Self {
            mtu,
            utun_index,
            ifname,
            proxy,
        })
    }
}

struct SystemTunDevice {
    reader: std::fs::File,
    writer: std::fs::File,
    name: String,
}

impl SystemTunDevice {
    #[cfg(target_os = "macos")]
    fn connect(settings: &Settings) -> io::Result<Self> {
        use std::mem::{size_of, zeroed};

        const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
        let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut info: libc::ctl_info = unsafe { zeroed() };
        for (idx, byte) in UTUN_CONTROL_NAME.iter().enumerate() {
            info.ctl_name[idx] = *byte as libc::c_char;
        }
        if unsafe { libc::ioctl(owned.as_raw_fd(), libc::CTLIOCGINFO, &mut info) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_ctl = unsafe { zeroed() };
        addr.sc_len = size_of::<libc::sockaddr_ctl>() as u8;
        addr.sc_family = libc::AF_SYSTEM as u8;
        addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
        addr.sc_id = info.ctl_id;
        addr.sc_unit = settings.utun_index.map(|value| value + 1).unwrap_or(0);

        let connected = unsafe {
            libc::connect(
                owned.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_ctl>() as u32,
            )
        };
        if connected < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ifname = [0u8; libc::IFNAMSIZ];
        let mut ifname_len = ifname.len() as u32;
        let opt_status = unsafe {
            libc::getsockopt(
                owned.as_raw_fd(),
                libc::SYSPROTO_CONTROL,
                libc::UTUN_OPT_IFNAME,
                ifname.as_mut_ptr() as *mut _,
                &mut ifname_len,
            )
        };
        if opt_status < 0 {
            return Err(io::Error::last_os_error());
        }
        let trimmed_len = if ifname_len == 0 { 0 } else { (ifname_len as usize).saturating_sub(1) };
        let name = String::from_utf8_lossy(&ifname[..trimmed_len]).into_owned();

        let reader_fd = owned.try_clone()?;
        let reader = std::fs::File::from(reader_fd);
        let writer = std::fs::File::from(owned);
        Ok(Self { reader, writer, name })
    }

    #[cfg(target_os = "linux")]
    fn connect(settings: &Settings) -> io::Result<Self> {
        use std::mem::zeroed;

        const TUN_DEVICE: &str = "/dev/net/tun";
        let file = std::fs::OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;
        let fd = file.as_raw_fd();

        let mut ifreq: libc::ifreq = unsafe { zeroed() };
        if let Some(name) = settings.ifname.as_deref() {
            for (idx, byte) in name.as_bytes().iter().enumerate() {
                if idx >= libc::IFNAMSIZ {
                    break;
                }
                ifreq.ifr_name[idx] = *byte as libc::c_char;
            }
        }
        ifreq.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        if unsafe { libc::ioctl(fd, libc::TUNSETIFF, &ifreq) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = unsafe { CStr::from_ptr(ifreq.ifr_name.as_ptr()).to_string_lossy().into_owned() };
        let reader = file.try_clone()?;
        Ok(Self { reader, writer: file, name })
    }

    fn into_parts(self) -> (std::fs::File, std::fs::File) {
        (self.reader, self.writer)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::parse()?;
    let device = SystemTunDevice::connect(&settings)?;
    tracing::info!(target: "tunwire::router", name = %device.name, "tun device attached");
    let (reader_file, writer_file) = device.into_parts();

    let reader = tokio::fs::File::from_std(reader_file);
    let writer = tokio::fs::File::from_std(writer_file);

    let config = RouterConfig {
        socks5_endpoint: settings.proxy,
        dns_resolver: None,
        mtu: settings.mtu as usize,
    };

    let (router, handle) = Router::new(reader, writer, config);
    let run = tokio::spawn(router.run());

    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    tracing::info!(target: "tunwire::router", "signal received, shutting down");
    handle.shutdown();
    let _ = run.await;
    Ok(())
}
