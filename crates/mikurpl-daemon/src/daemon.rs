//! 多源复制守护进程
//!
//! 生命周期请求(start / stop / restart)作为消息发送给唯一的监督任务,
//! 监督任务串行执行状态变更。请求方先用 `try_lock_owned` 取得生命周期许可,
//! 已有变更在进行时立即返回 `DaemonBusy`。状态查询直接读取共享快照,随时可用。

use crate::channel::{ChannelSnapshot, ChannelSpec, ChannelWorker, WorkerContext, WorkerEvent, WorkerEventKind};
use crate::state::{DaemonState, StateCell};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use mikurpl_common::{
    ConnectionDescriptor, DaemonConfig, FailurePolicy, ReplicationUser, RplError, RplResult, SetupConfig,
};
use mikurpl_core::{DatabaseClient, SetupOptions};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 从库与它的主库集合
#[derive(Debug, Clone)]
pub struct DaemonTopology {
    subordinate: ConnectionDescriptor,
    user: ReplicationUser,
    channels: Vec<ChannelSpec>,
}

impl DaemonTopology {
    /// 通道名由主库地址生成
    pub fn new(
        subordinate: ConnectionDescriptor,
        user: ReplicationUser,
        mains: Vec<ConnectionDescriptor>,
    ) -> RplResult<Self> {
        Self::with_channels(subordinate, user, mains.into_iter().map(ChannelSpec::for_main).collect())
    }

    /// # Brief
    /// 使用显式通道名构建拓扑
    ///
    /// 至少需要一个主库;主库之间、主库与从库之间不能指向同一端点,通道名不能重复。
    pub fn with_channels(
        subordinate: ConnectionDescriptor,
        user: ReplicationUser,
        channels: Vec<ChannelSpec>,
    ) -> RplResult<Self> {
        if channels.is_empty() {
            return Err(RplError::Config("at least one main is required".into()));
        }
        let mut names = HashSet::new();
        for (i, spec) in channels.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(RplError::Config(format!("main '{}' has an empty channel name", spec.main.address())));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(RplError::Uniqueness(format!("channel name '{}' is used twice", spec.name)));
            }
            if spec.main.same_endpoint(&subordinate) {
                return Err(RplError::Uniqueness(format!(
                    "main '{}' and the subordinate name the same server",
                    spec.main.address()
                )));
            }
            if let Some(other) = channels[i + 1..].iter().find(|o| o.main.same_endpoint(&spec.main)) {
                return Err(RplError::Uniqueness(format!(
                    "mains '{}' and '{}' name the same server",
                    spec.main.address(),
                    other.main.address()
                )));
            }
        }
        Ok(Self {
            subordinate,
            user,
            channels,
        })
    }

    pub fn subordinate(&self) -> &ConnectionDescriptor {
        &self.subordinate
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }
}

/// 守护进程状态与各通道快照
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub since: DateTime<Utc>,
    pub subordinate: String,
    pub channels: Vec<ChannelSnapshot>,
}

struct Shared {
    state: StateCell,
    topology: DaemonTopology,
    context: Arc<WorkerContext>,
}

impl Shared {
    fn status(&self) -> DaemonStatus {
        let snapshots = &self.context.snapshots;
        DaemonStatus {
            state: self.state.current(),
            since: self.state.since(),
            subordinate: self.topology.subordinate.address(),
            channels: self
                .topology
                .channels
                .iter()
                .map(|spec| {
                    snapshots
                        .get(&spec.name)
                        .map(|s| s.value().clone())
                        .unwrap_or_else(|| ChannelSnapshot::pending(spec))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop,
    Restart,
}

struct Command {
    lifecycle: Lifecycle,
    // 在监督任务处理完该请求、回复之前释放
    _permit: OwnedMutexGuard<()>,
    reply: oneshot::Sender<RplResult<DaemonState>>,
}

/// 多源复制守护进程
pub struct MultiSourceDaemon {
    shared: Arc<Shared>,
}

impl MultiSourceDaemon {
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        topology: DaemonTopology,
        setup: &SetupConfig,
        config: DaemonConfig,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            client,
            subordinate: topology.subordinate.clone(),
            user: topology.user.clone(),
            setup: SetupOptions::from_config(setup),
            config,
            snapshots: Arc::new(DashMap::new()),
            configure: Mutex::new(()),
        });
        Self {
            shared: Arc::new(Shared {
                state: StateCell::new(),
                topology,
                context,
            }),
        }
    }

    /// 启动监督任务并返回句柄;守护进程初始为 stopped
    pub fn spawn(self) -> DaemonHandle {
        let (commands, rx) = mpsc::channel(8);
        let (events_tx, events) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            shared: self.shared.clone(),
            commands: rx,
            events,
            events_tx,
            workers: Vec::new(),
            cancel: None,
            generation: 0,
        };
        tokio::spawn(supervisor.run());
        DaemonHandle {
            shared: self.shared,
            commands,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }
}

/// 守护进程句柄,可克隆并在多个任务间共享
#[derive(Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    lifecycle: Arc<Mutex<()>>,
}

impl DaemonHandle {
    /// 启动所有通道,返回启动结束时的状态(running 或 failed)
    pub async fn start(&self) -> RplResult<DaemonState> {
        self.request(Lifecycle::Start).await
    }

    pub async fn stop(&self) -> RplResult<DaemonState> {
        self.request(Lifecycle::Stop).await
    }

    /// 停止后重新启动,整个过程持有同一个生命周期许可
    pub async fn restart(&self) -> RplResult<DaemonState> {
        self.request(Lifecycle::Restart).await
    }

    pub fn state(&self) -> DaemonState {
        self.shared.state.current()
    }

    pub fn status(&self) -> DaemonStatus {
        self.shared.status()
    }

    /// 状态变更历史(从旧到新)
    pub fn history(&self) -> Vec<DaemonState> {
        self.shared.state.history()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.shared.state.subscribe()
    }

    /// # Brief
    /// 前台运行:启动后阻塞直到 `shutdown` 完成,然后协作停止
    ///
    /// 启动失败时同样执行停止以释放连接,并返回 failed。收到停止信号时若有
    /// 重启正在进行,等它结束后再停止。
    pub async fn run_until<F>(&self, shutdown: F) -> RplResult<DaemonState>
    where
        F: Future<Output = ()>,
    {
        let started = self.start().await?;
        if started == DaemonState::Failed {
            self.stop_after_pending().await?;
            return Ok(DaemonState::Failed);
        }
        shutdown.await;
        info!("Received shutdown signal");
        self.stop_after_pending().await
    }

    /// 排队等待生命周期许可后停止
    async fn stop_after_pending(&self) -> RplResult<DaemonState> {
        let permit = match self.lifecycle.clone().try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                info!("Waiting for the running lifecycle request before stopping");
                self.lifecycle.clone().lock_owned().await
            }
        };
        self.send(Lifecycle::Stop, permit).await
    }

    async fn request(&self, lifecycle: Lifecycle) -> RplResult<DaemonState> {
        let permit = self.lifecycle.clone().try_lock_owned().map_err(|_| RplError::DaemonBusy)?;
        self.send(lifecycle, permit).await
    }

    async fn send(&self, lifecycle: Lifecycle, permit: OwnedMutexGuard<()>) -> RplResult<DaemonState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command {
                lifecycle,
                _permit: permit,
                reply,
            })
            .await
            .map_err(|_| RplError::Internal("daemon supervisor has exited".into()))?;
        rx.await
            .map_err(|_| RplError::Internal("daemon supervisor dropped the request".into()))?
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    workers: Vec<JoinHandle<crate::channel::ChannelState>>,
    cancel: Option<watch::Sender<bool>>,
    generation: u64,
}

impl Supervisor {
    async fn run(mut self) {
        debug!("Daemon supervisor started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event),
            }
        }

        // 所有句柄都已释放
        if self.shared.state.current().has_workers() {
            if let Err(e) = self.stop().await {
                warn!("Daemon shutdown: {}", e);
            }
        }
        debug!("Daemon supervisor exited");
    }

    async fn handle(&mut self, command: Command) {
        let Command {
            lifecycle,
            _permit: permit,
            reply,
        } = command;
        let state = self.shared.state.current();
        let result = match lifecycle {
            Lifecycle::Start => match state {
                DaemonState::Stopped => self.start().await,
                other => Err(RplError::IllegalTransition(format!("cannot start the daemon while it is {}", other))),
            },
            Lifecycle::Stop => match state {
                DaemonState::Stopped => Ok(DaemonState::Stopped),
                _ => self.stop().await,
            },
            Lifecycle::Restart => match state {
                DaemonState::Stopped => self.start().await,
                _ => self.restart().await,
            },
        };
        if let Err(ref e) = result {
            warn!("Daemon {:?} request failed: {}", lifecycle, e);
        }
        drop(permit);
        // 接收方可能已放弃等待
        let _ = reply.send(result);
    }

    async fn start(&mut self) -> RplResult<DaemonState> {
        self.shared.state.transition(DaemonState::Starting)?;
        self.launch().await
    }

    async fn stop(&mut self) -> RplResult<DaemonState> {
        self.shared.state.transition(DaemonState::Stopping)?;
        self.shutdown_workers().await;
        self.shared.state.transition(DaemonState::Stopped)?;
        Ok(DaemonState::Stopped)
    }

    async fn restart(&mut self) -> RplResult<DaemonState> {
        info!("Restarting daemon");
        self.shared.state.transition(DaemonState::Stopping)?;
        self.shutdown_workers().await;
        self.shared.state.transition(DaemonState::Starting)?;
        self.launch().await
    }

    /// 派生工作任务并等待每个通道给出第一个结果
    async fn launch(&mut self) -> RplResult<DaemonState> {
        let ctx = self.shared.context.clone();
        let channels = self.shared.topology.channels.clone();
        let fail_fast = ctx.config.failure_policy == FailurePolicy::FailFast;

        self.generation += 1;
        let generation = self.generation;
        let (cancel, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel);

        ctx.snapshots.clear();
        for spec in &channels {
            ctx.snapshots.insert(spec.name.clone(), ChannelSnapshot::pending(spec));
        }
        info!(
            "Starting {} channel(s) on subordinate {}",
            channels.len(),
            self.shared.topology.subordinate.address()
        );
        for spec in channels.iter().cloned() {
            let worker = ChannelWorker::new(spec, ctx.clone(), cancel_rx.clone(), self.events_tx.clone(), generation);
            self.workers.push(tokio::spawn(worker.run()));
        }

        // 快速失败策略下,重试中的通道要等到成功或耗尽预算
        let mut unsettled: HashSet<String> = channels.iter().map(|c| c.name.clone()).collect();
        let mut failed = 0usize;
        while !unsettled.is_empty() {
            let Some(event) = self.events.recv().await else {
                return Err(RplError::Internal("worker event channel closed".into()));
            };
            if event.generation != generation || !unsettled.contains(&event.channel) {
                continue;
            }
            match event.kind {
                WorkerEventKind::Running => {}
                WorkerEventKind::Retrying if fail_fast => continue,
                WorkerEventKind::Retrying => {}
                WorkerEventKind::Failed(ref reason) => {
                    failed += 1;
                    warn!("Channel '{}' could not be started: {}", event.channel, reason);
                }
            }
            unsettled.remove(&event.channel);
        }

        let next = if failed == channels.len() {
            error!("No channel could be started");
            DaemonState::Failed
        } else if fail_fast && failed > 0 {
            error!("{} channel(s) failed under the fail-fast policy", failed);
            DaemonState::Failed
        } else {
            DaemonState::Running
        };
        if next == DaemonState::Failed {
            self.signal_cancel();
        }
        self.shared.state.transition(next)?;
        Ok(next)
    }

    fn on_event(&mut self, event: WorkerEvent) {
        if event.generation != self.generation {
            return;
        }
        let WorkerEventKind::Failed(reason) = event.kind else {
            return;
        };
        let fail_fast = self.shared.context.config.failure_policy == FailurePolicy::FailFast;
        if fail_fast && self.shared.state.current() == DaemonState::Running {
            error!("Channel '{}' failed, stopping all channels: {}", event.channel, reason);
            self.signal_cancel();
            if let Err(e) = self.shared.state.transition(DaemonState::Failed) {
                warn!("{}", e);
            }
        } else {
            warn!("Channel '{}' failed; other channels keep running", event.channel);
        }
    }

    fn signal_cancel(&self) {
        if let Some(ref cancel) = self.cancel {
            cancel.send_replace(true);
        }
    }

    /// 通知所有工作任务停止,并等待它们到达检查点退出
    async fn shutdown_workers(&mut self) {
        self.signal_cancel();
        let workers = std::mem::take(&mut self.workers);
        if !workers.is_empty() {
            info!("Waiting for {} channel worker(s) to stop", workers.len());
        }
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!("Channel worker aborted: {}", e);
            }
        }
        self.cancel = None;
        // 丢弃已退出的工作任务留下的事件
        while self.events.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use mikurpl_common::ServerVersion;
    use mikurpl_core::sim::{SimCluster, SimServer};
    use std::time::Duration;

    fn desc(s: &str) -> ConnectionDescriptor {
        s.parse().unwrap()
    }

    fn fast_config() -> DaemonConfig {
        DaemonConfig {
            min_version: ServerVersion::new(5, 6, 9),
            interval_secs: 3600,
            channel_attempts: 3,
            reconnect_backoff_ms: 5,
            reconnect_attempts: 2,
            report_values: vec!["health".into(), "uuid".into(), "gtid".into()],
            ..DaemonConfig::default()
        }
    }

    fn fast_setup() -> SetupConfig {
        SetupConfig {
            attempts: 5,
            backoff_ms: 5,
            ..SetupConfig::default()
        }
    }

    fn cluster(mains: &[&str]) -> SimCluster {
        let cluster = SimCluster::new();
        cluster.add_server("sub:3306", SimServer::new(100));
        for (i, main) in mains.iter().enumerate() {
            cluster.add_server(main, SimServer::new(1 + i as u32));
        }
        cluster
    }

    fn daemon(cluster: &SimCluster, mains: &[&str], config: DaemonConfig) -> DaemonHandle {
        let topology = DaemonTopology::new(
            desc("root@sub:3306"),
            "rpl:secret".parse().unwrap(),
            mains.iter().map(|m| desc(&format!("root@{m}"))).collect(),
        )
        .unwrap();
        let client: Arc<dyn DatabaseClient> = Arc::new(cluster.clone());
        MultiSourceDaemon::new(client, topology, &fast_setup(), config).spawn()
    }

    #[tokio::test]
    async fn test_three_mains_one_unreachable_keeps_running() {
        let mains = ["m1:3306", "m2:3306", "m3:3306"];
        let cluster = cluster(&mains[..2]);
        let handle = daemon(&cluster, &mains, fast_config());

        assert_eq!(handle.start().await.unwrap(), DaemonState::Running);

        // 等待不可达通道耗尽预算
        let mut rx = handle.subscribe();
        for _ in 0..200 {
            if handle.status().channels[2].state == ChannelState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let status = handle.status();
        assert_eq!(status.state, DaemonState::Running);
        assert_eq!(status.channels[0].state, ChannelState::Running);
        assert_eq!(status.channels[1].state, ChannelState::Running);
        assert!(status.channels[0].io_running && status.channels[0].sql_running);
        assert!(status.channels[0].main_uuid.is_some());
        assert_eq!(status.channels[2].state, ChannelState::Failed);
        assert_eq!(status.channels[2].attempts, 3);
        assert!(status.channels[2].last_error.as_deref().unwrap().contains("Cannot connect"));
        assert!(cluster.channel_started("sub:3306", "m1_3306"));
        assert!(cluster.channel_started("sub:3306", "m2_3306"));
        assert_eq!(*rx.borrow_and_update(), DaemonState::Running);

        assert_eq!(handle.stop().await.unwrap(), DaemonState::Stopped);
        assert!(!cluster.channel_started("sub:3306", "m1_3306"));
        assert_eq!(cluster.total_open_connections(), 0);
        assert!(handle.status().channels.iter().all(|c| c.state != ChannelState::Running));
    }

    #[tokio::test]
    async fn test_fail_fast_marks_daemon_failed() {
        let mains = ["m1:3306", "m2:3306"];
        let cluster = cluster(&mains[..1]);
        let config = DaemonConfig {
            failure_policy: FailurePolicy::FailFast,
            ..fast_config()
        };
        let handle = daemon(&cluster, &mains, config);

        assert_eq!(handle.start().await.unwrap(), DaemonState::Failed);
        assert_eq!(handle.stop().await.unwrap(), DaemonState::Stopped);
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_all_channels_failing_is_failed_even_when_isolated() {
        let cluster = cluster(&[]);
        cluster.add_server("m1:3306", SimServer::new(1).with_log_bin(false));
        let handle = daemon(&cluster, &["m1:3306"], fast_config());

        assert_eq!(handle.start().await.unwrap(), DaemonState::Failed);
        let status = handle.status();
        // 致命校验失败不消耗重试预算
        assert_eq!(status.channels[0].attempts, 1);
        assert!(status.channels[0].last_error.as_deref().unwrap().contains("binary logging"));
    }

    #[tokio::test]
    async fn test_missing_privileges_fail_the_channel_before_configuring() {
        let mains = ["m1:3306", "m2:3306"];
        let cluster = cluster(&mains);
        cluster.update("m2:3306", |s| *s = SimServer::new(2).with_connect_grants(&["SELECT", "REPLICATION SLAVE"]));
        let handle = daemon(&cluster, &mains, fast_config());

        assert_eq!(handle.start().await.unwrap(), DaemonState::Running);
        let status = handle.status();
        assert_eq!(status.channels[0].state, ChannelState::Running);
        assert_eq!(status.channels[1].state, ChannelState::Failed);
        assert_eq!(status.channels[1].attempts, 1);
        assert!(status.channels[1]
            .last_error
            .as_deref()
            .unwrap()
            .contains("does not have sufficient privileges"));
        assert!(cluster.channel_source("sub:3306", "m2_3306").is_none());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_never_publishes_stopped() {
        let mains = ["m1:3306"];
        let cluster = cluster(&mains);
        let handle = daemon(&cluster, &mains, fast_config());

        handle.start().await.unwrap();
        assert_eq!(handle.restart().await.unwrap(), DaemonState::Running);
        assert_eq!(
            handle.history(),
            vec![
                DaemonState::Stopped,
                DaemonState::Starting,
                DaemonState::Running,
                DaemonState::Stopping,
                DaemonState::Starting,
                DaemonState::Running,
            ]
        );
        assert!(cluster.channel_started("sub:3306", "m1_3306"));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_lifecycle_request_is_busy() {
        let mains = ["m1:3306"];
        let cluster = cluster(&mains);
        cluster.set_latency(Duration::from_millis(20));
        let handle = daemon(&cluster, &mains, fast_config());

        let starter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.start().await })
        };
        let mut rx = handle.subscribe();
        rx.wait_for(|s| *s == DaemonState::Starting).await.unwrap();

        assert!(matches!(handle.stop().await, Err(RplError::DaemonBusy)));
        assert!(matches!(handle.restart().await, Err(RplError::DaemonBusy)));
        // 状态查询不受影响
        assert_eq!(handle.status().state, DaemonState::Starting);

        assert_eq!(starter.await.unwrap().unwrap(), DaemonState::Running);
        assert_eq!(handle.stop().await.unwrap(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_illegal_and_stop_is_idempotent() {
        let mains = ["m1:3306"];
        let cluster = cluster(&mains);
        let handle = daemon(&cluster, &mains, fast_config());

        assert_eq!(handle.stop().await.unwrap(), DaemonState::Stopped);
        handle.start().await.unwrap();
        assert!(matches!(handle.start().await, Err(RplError::IllegalTransition(_))));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_run_stops_on_shutdown() {
        let mains = ["m1:3306"];
        let cluster = cluster(&mains);
        let handle = daemon(&cluster, &mains, fast_config());

        let (tx, rx) = oneshot::channel::<()>();
        let runner = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .run_until(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        let mut states = handle.subscribe();
        states.wait_for(|s| *s == DaemonState::Running).await.unwrap();
        tx.send(()).unwrap();

        assert_eq!(runner.await.unwrap().unwrap(), DaemonState::Stopped);
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_status_serializes_before_start() {
        let mains = ["m1:3306", "m2:3306"];
        let cluster = cluster(&mains);
        let handle = daemon(&cluster, &mains, fast_config());

        let value = serde_json::to_value(handle.status()).unwrap();
        assert_eq!(value["state"], "stopped");
        assert_eq!(value["subordinate"], "sub:3306");
        assert_eq!(value["channels"][1]["channel"], "m2_3306");
        assert_eq!(value["channels"][1]["state"], "pending");
    }

    #[tokio::test]
    async fn test_shutdown_during_restart_still_stops() {
        let mains = ["m1:3306"];
        let cluster = cluster(&mains);
        let handle = daemon(&cluster, &mains, fast_config());

        let (tx, rx) = oneshot::channel::<()>();
        let runner = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .run_until(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };
        let mut states = handle.subscribe();
        states.wait_for(|s| *s == DaemonState::Running).await.unwrap();

        cluster.set_latency(Duration::from_millis(20));
        let restarter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.restart().await })
        };
        states.wait_for(|s| *s == DaemonState::Stopping).await.unwrap();
        tx.send(()).unwrap();

        assert_eq!(restarter.await.unwrap().unwrap(), DaemonState::Running);
        assert_eq!(runner.await.unwrap().unwrap(), DaemonState::Stopped);
        assert_eq!(handle.state(), DaemonState::Stopped);
        assert!(!cluster.channel_started("sub:3306", "m1_3306"));
        assert_eq!(cluster.total_open_connections(), 0);
    }

    #[tokio::test]
    async fn test_channel_configurations_do_not_interleave() {
        let mains = ["m1:3306", "m2:3306", "m3:3306"];
        let cluster = cluster(&mains);
        cluster.set_latency(Duration::from_millis(2));
        let handle = daemon(&cluster, &mains, fast_config());

        assert_eq!(handle.start().await.unwrap(), DaemonState::Running);
        let writes: Vec<String> = cluster
            .statements("sub:3306")
            .into_iter()
            .filter(|s| s.starts_with("STOP") || s.starts_with("CHANGE") || s.starts_with("START") || s == "COMMIT")
            .collect();
        assert_eq!(writes.len(), 9, "{:?}", writes);

        // 每个通道的 CHANGE / START / COMMIT 连续出现
        let channels = ["m1_3306", "m2_3306", "m3_3306"];
        let mut seen = HashSet::new();
        for block in writes.chunks(3) {
            let channel = channels
                .iter()
                .find(|c| block[0].starts_with("CHANGE") && block[0].contains(&format!("'{}'", c)))
                .unwrap();
            assert!(block[1].starts_with("START") && block[1].contains(&format!("'{}'", channel)), "{:?}", writes);
            assert_eq!(block[2], "COMMIT");
            assert!(seen.insert(*channel));
        }
        handle.stop().await.unwrap();
    }

    #[test]
    fn test_topology_rejects_duplicates() {
        let user: ReplicationUser = "rpl:pw".parse().unwrap();
        let err = DaemonTopology::new(
            desc("root@sub:3306"),
            user.clone(),
            vec![desc("root@m1:3306"), desc("other@m1:3306")],
        )
        .unwrap_err();
        assert!(matches!(err, RplError::Uniqueness(_)));

        let err = DaemonTopology::new(desc("root@sub:3306"), user.clone(), vec![desc("root@sub:3306")]).unwrap_err();
        assert!(matches!(err, RplError::Uniqueness(_)));

        let err = DaemonTopology::new(desc("root@sub:3306"), user, vec![]).unwrap_err();
        assert!(matches!(err, RplError::Config(_)));
    }
}
