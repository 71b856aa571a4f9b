//! 复制通道工作任务
//!
//! 每个主库对应一个工作任务:先在通道预算内搭建复制,然后按间隔监控通道,
//! 直到收到停止信号或重连预算耗尽。工作任务只在检查点(两次尝试之间、两次
//! 监控之间)观察停止信号,不会中断正在执行的语句序列。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mikurpl_common::{
    cancellable_sleep, retry_until_cancelled, retry_with, retry_with_until_cancelled, Attempt,
    ConnectionDescriptor, DaemonConfig, ReplicationUser, RplError, RplResult,
};
use mikurpl_core::{
    channel_status, check_privileges, configure_replication, connect_pair, stop_replication, ConnectorOptions,
    DatabaseClient, ServerEndpoint, SetupOptions, REPLICATION_PRIVILEGES,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// MySQL 通道名的最大长度
const MAX_CHANNEL_NAME: usize = 64;

/// 一个主库及其通道名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub main: ConnectionDescriptor,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, main: ConnectionDescriptor) -> Self {
        Self { name: name.into(), main }
    }

    /// 由主库地址生成通道名,如 `db1_3306`
    pub fn for_main(main: ConnectionDescriptor) -> Self {
        let mut name: String = format!("{}_{}", main.host, main.port)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        name.truncate(MAX_CHANNEL_NAME);
        Self { name, main }
    }
}

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Pending,
    SettingUp,
    /// 搭建失败,仍在预算内重试
    Retrying,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Pending => "pending",
            ChannelState::SettingUp => "setting up",
            ChannelState::Retrying => "retrying",
            ChannelState::Running => "running",
            ChannelState::Failed => "failed",
            ChannelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 通道状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: String,
    pub main: String,
    pub state: ChannelState,
    pub io_running: bool,
    pub sql_running: bool,
    pub last_error: Option<String>,
    pub main_uuid: Option<String>,
    pub main_gtid_executed: Option<String>,
    /// 最近一次搭建的尝试序号
    pub attempts: u32,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ChannelSnapshot {
    pub fn pending(spec: &ChannelSpec) -> Self {
        Self {
            channel: spec.name.clone(),
            main: spec.main.address(),
            state: ChannelState::Pending,
            io_running: false,
            sql_running: false,
            last_error: None,
            main_uuid: None,
            main_gtid_executed: None,
            attempts: 0,
            last_checked: None,
        }
    }
}

/// 工作任务上报给监督任务的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerEvent {
    pub generation: u64,
    pub channel: String,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerEventKind {
    /// 首次搭建尝试失败,将在预算内重试
    Retrying,
    Running,
    Failed(String),
}

/// 所有工作任务共享的只读上下文
pub(crate) struct WorkerContext {
    pub client: Arc<dyn DatabaseClient>,
    pub subordinate: ConnectionDescriptor,
    pub user: ReplicationUser,
    pub setup: SetupOptions,
    pub config: DaemonConfig,
    pub snapshots: Arc<DashMap<String, ChannelSnapshot>>,
    /// 从库上同一时刻只允许一个通道执行搭建语句
    pub configure: Mutex<()>,
}

impl WorkerContext {
    fn record(&self, channel: &str, update: impl FnOnce(&mut ChannelSnapshot)) {
        if let Some(mut snapshot) = self.snapshots.get_mut(channel) {
            update(&mut snapshot);
        }
    }

    /// 连接主从并搭建通道;成功后保留两个连接用于监控
    async fn establish(&self, spec: &ChannelSpec) -> RplResult<(ServerEndpoint, ServerEndpoint)> {
        let options = ConnectorOptions {
            min_version: self.config.min_version,
            unique: true,
        };
        let (mut main, mut sub) = connect_pair(&*self.client, &spec.main, &self.subordinate, options).await?;
        check_privileges(&mut main, REPLICATION_PRIVILEGES, "perform replication").await?;
        check_privileges(&mut sub, REPLICATION_PRIVILEGES, "perform replication").await?;
        let setup = SetupOptions {
            min_version: self.config.min_version,
            channel: Some(spec.name.clone()),
            ..self.setup.clone()
        };
        let _configuring = self.configure.lock().await;
        configure_replication(&mut main, &mut sub, &self.user, &setup).await?;
        Ok((main, sub))
    }
}

pub(crate) struct ChannelWorker {
    spec: ChannelSpec,
    ctx: Arc<WorkerContext>,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    generation: u64,
}

impl ChannelWorker {
    pub(crate) fn new(
        spec: ChannelSpec,
        ctx: Arc<WorkerContext>,
        cancel: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        generation: u64,
    ) -> Self {
        Self {
            spec,
            ctx,
            cancel,
            events,
            generation,
        }
    }

    fn emit(&self, kind: WorkerEventKind) {
        // 监督任务退出后事件无人接收
        let _ = self.events.send(WorkerEvent {
            generation: self.generation,
            channel: self.spec.name.clone(),
            kind,
        });
    }

    /// 运行到停止或失败,返回通道的最终状态
    pub(crate) async fn run(mut self) -> ChannelState {
        let name = self.spec.name.clone();
        info!("Channel '{}': replicating from {}", name, self.spec.main.address());

        let (mut main, mut sub) = match self.setup().await {
            Ok(pair) => pair,
            Err(RplError::Cancelled(_)) => {
                info!("Channel '{}': setup cancelled", name);
                self.ctx.record(&name, |s| s.state = ChannelState::Stopped);
                return ChannelState::Stopped;
            }
            Err(e) => return self.fail(e),
        };

        // 搭建时已确认 IO 与 SQL 线程在运行
        self.ctx.record(&name, |s| {
            s.state = ChannelState::Running;
            s.io_running = true;
            s.sql_running = true;
            s.last_error = None;
        });
        self.emit(WorkerEventKind::Running);

        loop {
            if *self.cancel.borrow() {
                break;
            }
            match self.monitor(&mut main, &mut sub).await {
                Ok(()) => {}
                Err(RplError::Cancelled(_)) => break,
                Err(e) => return self.fail(e),
            }
            if cancellable_sleep(self.ctx.config.interval(), &mut self.cancel).await {
                break;
            }
        }

        self.shutdown(&mut sub).await;
        ChannelState::Stopped
    }

    fn fail(&self, err: RplError) -> ChannelState {
        let message = err.to_string();
        error!("Channel '{}' failed: {}", self.spec.name, message);
        self.ctx.record(&self.spec.name, |s| {
            s.state = ChannelState::Failed;
            s.io_running = false;
            s.sql_running = false;
            // 预算耗尽时保留最后一次尝试的错误
            if !matches!(err, RplError::SetupTimeout { .. }) || s.last_error.is_none() {
                s.last_error = Some(message.clone());
            }
        });
        self.emit(WorkerEventKind::Failed(message));
        ChannelState::Failed
    }

    async fn setup(&mut self) -> RplResult<(ServerEndpoint, ServerEndpoint)> {
        let policy = self.ctx.config.channel_policy();
        let operation = format!("setup of channel '{}'", self.spec.name);
        let mut cancel = self.cancel.clone();
        let worker = &*self;

        retry_until_cancelled(policy, &operation, &mut cancel, |attempt| async move {
            let name = &worker.spec.name;
            worker.ctx.record(name, |s| {
                s.state = ChannelState::SettingUp;
                s.attempts = attempt;
            });
            match worker.ctx.establish(&worker.spec).await {
                Ok(pair) => Ok(Attempt::Done(pair)),
                Err(e) => {
                    let retrying = e.is_transient() && attempt < policy.attempts;
                    warn!("Channel '{}': setup attempt {} failed: {}", name, attempt, e);
                    worker.ctx.record(name, |s| {
                        s.last_error = Some(e.to_string());
                        if retrying {
                            s.state = ChannelState::Retrying;
                        }
                    });
                    if retrying && attempt == 1 {
                        worker.emit(WorkerEventKind::Retrying);
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// 一次监控:确认连接、读取通道状态、按报告项采集主库信息
    async fn monitor(&mut self, main: &mut ServerEndpoint, sub: &mut ServerEndpoint) -> RplResult<()> {
        self.ensure_connected(main).await?;
        self.ensure_connected(sub).await?;

        let name = self.spec.name.clone();
        let status = channel_status(sub, Some(&name)).await;
        let uuid = main.server_uuid().map(|u| u.to_string());
        let gtid = if self.ctx.config.reports("gtid") {
            match main.gtid_executed().await {
                Ok(set) => Some(set.to_string()),
                Err(e) => {
                    debug!("Channel '{}': cannot read GTID_EXECUTED: {}", name, e);
                    None
                }
            }
        } else {
            None
        };

        let reports_uuid = self.ctx.config.reports("uuid");
        self.ctx.record(&name, |s| {
            match status {
                Ok(Some(ref st)) => {
                    s.io_running = st.io_running();
                    s.sql_running = st.sql_running;
                    s.last_error = st.last_io_error.clone().or_else(|| st.last_sql_error.clone());
                }
                Ok(None) => {
                    s.io_running = false;
                    s.sql_running = false;
                    s.last_error = Some(format!("channel '{}' is not configured on the subordinate", name));
                }
                Err(ref e) => s.last_error = Some(e.to_string()),
            }
            if reports_uuid {
                s.main_uuid = uuid;
            }
            if gtid.is_some() {
                s.main_gtid_executed = gtid;
            }
            s.last_checked = Some(Utc::now());
        });

        if self.ctx.config.reports("health") {
            if let Some(snapshot) = self.ctx.snapshots.get(&name) {
                info!(
                    "Channel '{}' health: main {} IO {} SQL {}{}",
                    name,
                    snapshot.main,
                    if snapshot.io_running { "Yes" } else { "No" },
                    if snapshot.sql_running { "Yes" } else { "No" },
                    snapshot.last_error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    async fn ensure_connected(&mut self, endpoint: &mut ServerEndpoint) -> RplResult<()> {
        if endpoint.ping().await.is_ok() {
            return Ok(());
        }
        warn!("Channel '{}': lost connection to {}, reconnecting", self.spec.name, endpoint.label());
        let operation = format!("reconnect to {}", endpoint.label());
        let client = self.ctx.client.clone();
        retry_with_until_cancelled(
            self.ctx.config.reconnect_policy(),
            &operation,
            endpoint,
            &mut self.cancel,
            move |ep, _| {
                let client = client.clone();
                Box::pin(async move {
                    ep.reconnect(&*client).await?;
                    ep.ping().await?;
                    Ok(Attempt::Done(()))
                })
            },
        )
        .await
    }

    /// 停止通道并释放连接
    async fn shutdown(&self, sub: &mut ServerEndpoint) {
        let name = self.spec.name.clone();
        let operation = format!("stop of channel '{}'", name);
        let client = self.ctx.client.clone();
        let stopped = retry_with(self.ctx.config.reconnect_policy(), &operation, sub, move |sub, attempt| {
            let name = name.clone();
            let client = client.clone();
            Box::pin(async move {
                if attempt > 1 {
                    sub.reconnect(&*client).await?;
                }
                stop_replication(sub, Some(&name)).await?;
                Ok(Attempt::Done(()))
            })
        })
        .await;

        if let Err(e) = stopped {
            warn!("Channel '{}': {}", self.spec.name, e);
        }
        self.ctx.record(&self.spec.name, |s| {
            s.state = ChannelState::Stopped;
            s.io_running = false;
            s.sql_running = false;
        });
        info!("Channel '{}' stopped", self.spec.name);
    }
}
