use crate::config::Config;
use crate::listener::Listener;
use tracing::{info, warn};

/// Sets the process umask so files created after startup are owner-only.
/// Must be called once, as early as possible.
pub fn set_umask() {
    unsafe {
        libc::umask(0o077);
    }
}

/// Drops privileges to the configured group/user. A no-op (with a warning)
/// when the process is not running as root, matching the behavior of the
/// reference privilege-drop tooling this is modeled on: attempting the
/// syscalls without root would only fail, so skip them entirely.
pub fn drop_privileges(uid: Option<&str>, gid: Option<&str>) -> anyhow::Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    let is_root = unsafe { libc::getuid() } == 0;
    if !is_root {
        warn!("lifecycle: not running as root, skipping privilege drop");
        return Ok(());
    }

    if let Some(gid) = gid {
        let numeric_gid = resolve_gid(gid)?;
        if unsafe { libc::setgid(numeric_gid) } != 0 {
            anyhow::bail!("setgid({}) failed: {}", numeric_gid, std::io::Error::last_os_error());
        }
        info!("lifecycle: dropped group privileges, gid={}", numeric_gid);
    }

    if let Some(uid) = uid {
        let numeric_uid = resolve_uid(uid)?;
        if unsafe { libc::setuid(numeric_uid) } != 0 {
            anyhow::bail!("setuid({}) failed: {}", numeric_uid, std::io::Error::last_os_error());
        }
        info!("lifecycle: dropped user privileges, uid={}", numeric_uid);
    }

    Ok(())
}

fn resolve_gid(name: &str) -> anyhow::Result<libc::gid_t> {
    if let Ok(n) = name.parse::<libc::gid_t>() {
        return Ok(n);
    }
    let cname = std::ffi::CString::new(name)?;
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        anyhow::bail!("unknown group: {}", name);
    }
    Ok(unsafe { (*grp).gr_gid })
}

fn resolve_uid(name: &str) -> anyhow::Result<libc::uid_t> {
    if let Ok(n) = name.parse::<libc::uid_t>() {
        return Ok(n);
    }
    let cname = std::ffi::CString::new(name)?;
    let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pwd.is_null() {
        anyhow::bail!("unknown user: {}", name);
    }
    Ok(unsafe { (*pwd).pw_uid })
}

/// Builds and owns every proxy listener described by a `Config`, and the
/// start/stop orchestration across all of them. Mirrors a one-listener
/// variant of a service manager: nothing here is proxy-protocol aware.
pub struct ProxyManager {
    listeners: Vec<Listener>,
}

impl ProxyManager {
    /// Zero configured listeners is not a startup error here: a missing
    /// config file is a deliberate soft fallback in `Config::load`
    /// (warn + run with defaults), and a manager built from that fallback
    /// must survive to let the process start and serve `/health` via the
    /// admin listener rather than fail for a reason the config layer
    /// already chose not to treat as fatal.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if config.listeners.is_empty() {
            warn!("lifecycle: no listeners configured, proxy manager will start with none");
        }

        let listeners = config.listeners.iter().map(Listener::new).collect();
        Ok(Self { listeners })
    }

    /// Drops privileges (if configured) then starts every listener.
    pub async fn run(&self, config: &Config) -> anyhow::Result<()> {
        drop_privileges(config.uid.as_deref(), config.gid.as_deref())?;

        for listener in &self.listeners {
            listener.start().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for listener in &self.listeners {
            listener.stop().await;
        }
    }
}

/// Blocks until SIGTERM, SIGINT, or SIGHUP is received (or, on non-Unix
/// targets, Ctrl+C). SIGPIPE and SIGFPE are ignored at process start —
/// broken-pipe writes surface as ordinary `io::Error`s instead of killing
/// the process, and there is no floating-point signal path in safe Rust
/// async code for SIGFPE to interrupt.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    #[cfg(unix)]
    ignore_signals();

    tokio::select! {
        _ = ctrl_c => info!("lifecycle: received interrupt, shutting down"),
        reason = terminate => info!("lifecycle: received {}, shutting down", reason),
    }
}

#[cfg(unix)]
fn ignore_signals() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGFPE, libc::SIG_IGN);
    }
}
