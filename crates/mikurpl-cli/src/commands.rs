//! 子命令的执行逻辑
//!
//! 所有命令接收一个 `DatabaseClient`,CLI 传入 MySQL 适配器,测试传入模拟集群。

use crate::cli::{ReplicateArgs, RplmsArgs, SkiptrxArgs};
use crate::formatter::Formatter;
use anyhow::{anyhow, bail, Context, Result};
use mikurpl_common::RplConfig;
use mikurpl_core::{setup_replication, skip_transactions, DatabaseClient, SetupOptions, SkipOptions, Verification};
use mikurpl_daemon::{
    serve, signal_daemon, wait_for_exit, DaemonSignal, DaemonState, DaemonTopology, MultiSourceDaemon,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 等待后台守护进程退出的时间
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn replicate(
    client: Arc<dyn DatabaseClient>,
    args: &ReplicateArgs,
    config: &RplConfig,
    out: &Formatter,
) -> Result<()> {
    let mut setup = config.setup.clone();
    if let Some(attempts) = args.max_attempts {
        setup.attempts = attempts.max(1);
    }
    let options = SetupOptions {
        pedantic: args.pedantic || setup.pedantic,
        main_log_file: args.main_log_file.clone(),
        main_log_pos: args.main_log_pos,
        from_beginning: args.start_from_beginning,
        test_db: args.test_db.clone(),
        ..SetupOptions::from_config(&setup)
    };

    let outcome = setup_replication(client.as_ref(), &args.main, &args.subordinate, &args.rpl_user, &options)
        .await
        .with_context(|| format!("replication {} -> {}", args.main.address(), args.subordinate.address()))?;
    println!("{}", out.setup_outcome(&outcome));

    if let Verification::Failed {
        ref database,
        ref reason,
    } = outcome.verification
    {
        bail!("test database '{}' did not replicate: {}", database, reason);
    }
    Ok(())
}

pub async fn skiptrx(
    client: Arc<dyn DatabaseClient>,
    args: &SkiptrxArgs,
    config: &RplConfig,
    out: &Formatter,
) -> Result<()> {
    let options = SkipOptions {
        dry_run: args.dryrun,
        ..SkipOptions::from_config(&config.skip)
    };
    let report = skip_transactions(client, &args.gtid_set, &args.subordinates, &options).await?;
    println!("{}", out.skip_report(&report));
    report.into_result()?;
    Ok(())
}

/// 由参数构建守护进程拓扑
pub fn topology(args: &RplmsArgs) -> Result<DaemonTopology> {
    let subordinate = args
        .subordinate
        .clone()
        .ok_or_else(|| anyhow!("--subordinate is required"))?;
    if args.mains.is_empty() {
        bail!("--mains requires at least one main");
    }
    let user = args
        .rpl_user
        .clone()
        .ok_or_else(|| anyhow!("--rpl-user is required"))?;
    Ok(DaemonTopology::new(subordinate, user, args.mains.clone())?)
}

/// # Brief
/// 在当前进程中运行守护进程直到收到停止信号
///
/// 退出前打印最后一次状态;启动失败时返回错误。
pub async fn run_daemon(
    client: Arc<dyn DatabaseClient>,
    topology: DaemonTopology,
    config: &RplConfig,
    out: &Formatter,
) -> Result<()> {
    let handle = MultiSourceDaemon::new(client, topology, &config.setup, config.daemon.clone()).spawn();
    let state = serve(&handle).await?;
    let status = handle.status();
    println!("{}", out.daemon_status(&status));

    if handle.history().contains(&DaemonState::Failed) {
        let errors: Vec<String> = status
            .channels
            .iter()
            .filter_map(|c| c.last_error.as_ref().map(|e| format!("{}: {}", c.channel, e)))
            .collect();
        bail!("multi-source daemon failed ({}): {}", state, errors.join("; "));
    }
    Ok(())
}

pub async fn stop_daemon(pidfile: &Path) -> Result<()> {
    let pid = signal_daemon(pidfile, DaemonSignal::Stop)?;
    println!("# Stopping daemon (pid {})", pid);
    if !wait_for_exit(pid, STOP_TIMEOUT).await {
        bail!("daemon with pid {} did not exit within {}s", pid, STOP_TIMEOUT.as_secs());
    }
    info!("Daemon pid {} exited", pid);
    println!("# Daemon stopped");
    Ok(())
}

pub fn restart_daemon(pidfile: &Path) -> Result<()> {
    let pid = signal_daemon(pidfile, DaemonSignal::Restart)?;
    println!("# Restart requested for daemon (pid {})", pid);
    Ok(())
}
