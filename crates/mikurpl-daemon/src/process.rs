//! 进程级支持:pid 文件、后台运行与信号
//!
//! 后台运行的守护进程收到 SIGTERM 时停止,收到 SIGHUP 时重启。
//! 另一个进程通过 pid 文件找到它并发送信号。

use crate::daemon::DaemonHandle;
use crate::state::DaemonState;
use mikurpl_common::{RplError, RplResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// pid 文件,释放时删除
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// # Brief
    /// 写入当前进程号
    ///
    /// 文件已存在且其中的进程仍存活时失败;进程已不存在时覆盖旧文件。
    pub fn create(path: &Path) -> RplResult<Self> {
        if let Some(pid) = read_pid(path)? {
            if process_alive(pid) {
                return Err(RplError::Config(format!(
                    "daemon already running with pid {} ({})",
                    pid,
                    path.display()
                )));
            }
            warn!("Removing stale pid file {:?} (pid {})", path, pid);
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        info!("Pid file {:?} created", path);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Pid file {:?} removed", self.path),
            Err(e) => warn!("Cannot remove pid file {:?}: {}", self.path, e),
        }
    }
}

/// 读取 pid 文件;文件不存在时返回 None
pub fn read_pid(path: &Path) -> RplResult<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RplError::Config(format!("invalid pid file {}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// 发给后台守护进程的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// SIGTERM
    Stop,
    /// SIGHUP
    Restart,
}

/// # Brief
/// 按 pid 文件向后台守护进程发送信号
///
/// # Returns
/// 目标进程号
pub fn signal_daemon(pidfile: &Path, request: DaemonSignal) -> RplResult<u32> {
    let pid = read_pid(pidfile)?.ok_or_else(|| {
        RplError::Config(format!("no daemon is running (pid file {} not found)", pidfile.display()))
    })?;
    if !process_alive(pid) {
        return Err(RplError::Config(format!("daemon with pid {} is not running", pid)));
    }
    send_signal(pid, request)?;
    info!("Sent {:?} request to daemon pid {}", request, pid);
    Ok(pid)
}

#[cfg(target_os = "linux")]
fn send_signal(pid: u32, request: DaemonSignal) -> RplResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match request {
        DaemonSignal::Stop => Signal::SIGTERM,
        DaemonSignal::Restart => Signal::SIGHUP,
    };
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| RplError::Io(io::Error::from(e)))
}

#[cfg(not(target_os = "linux"))]
fn send_signal(_pid: u32, _request: DaemonSignal) -> RplResult<()> {
    Err(RplError::Config("signalling a detached daemon is only supported on Linux".into()))
}

/// 等待进程退出,超时返回 false
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

/// fork 之后所在的进程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// 原进程,附带子进程号
    Parent(u32),
    /// 脱离终端的子进程
    Child,
}

/// # Brief
/// 转入后台:fork、setsid,并把标准输入输出重定向到 /dev/null
///
/// 必须在创建 tokio 运行时之前调用。
#[cfg(target_os = "linux")]
pub fn daemonize() -> RplResult<Forked> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};
    use std::os::unix::io::AsRawFd;

    let to_io = |e: nix::errno::Errno| RplError::Io(io::Error::from(e));

    // SAFETY: 此时进程只有一个线程
    match unsafe { fork() }.map_err(to_io)? {
        ForkResult::Parent { child } => return Ok(Forked::Parent(child.as_raw() as u32)),
        ForkResult::Child => {}
    }
    setsid().map_err(to_io)?;

    let devnull = fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).map_err(to_io)?;
    }
    Ok(Forked::Child)
}

#[cfg(not(target_os = "linux"))]
pub fn daemonize() -> RplResult<Forked> {
    Err(RplError::Config("detached mode is only supported on Linux".into()))
}

/// # Brief
/// 运行守护进程直到收到停止信号
///
/// Ctrl-C 与 SIGTERM 触发协作停止;SIGHUP 触发重启。
pub async fn serve(handle: &DaemonHandle) -> RplResult<DaemonState> {
    #[cfg(unix)]
    let restarter = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let handle = handle.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, restarting");
                match handle.restart().await {
                    Ok(state) => info!("Daemon restarted: {}", state),
                    Err(e) => warn!("Restart rejected: {}", e),
                }
            }
        })
    };

    // 收到停止信号后不再接受新的重启
    let shutdown = async {
        shutdown_signal().await;
        #[cfg(unix)]
        restarter.abort();
    };
    let result = handle.run_until(shutdown).await;

    #[cfg(unix)]
    restarter.abort();
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
