//! 守护进程状态机

use chrono::{DateTime, Utc};
use mikurpl_common::{RplError, RplResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

const HISTORY_LIMIT: usize = 64;

/// 守护进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// 已停止
    Stopped,
    /// 启动中
    Starting,
    /// 运行中
    Running,
    /// 停止中
    Stopping,
    /// 启动失败或快速失败策略下有通道失败
    Failed,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Failed => "failed",
        }
    }

    /// `Stopping -> Starting` 只出现在重启中
    pub fn can_transition_to(&self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (*self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Failed)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Starting)
        )
    }

    /// 有工作任务在运行或正在启动
    pub fn has_workers(&self) -> bool {
        !matches!(self, DaemonState::Stopped)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次状态变更
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: DaemonState,
    pub at: DateTime<Utc>,
}

struct StateInner {
    current: DaemonState,
    since: DateTime<Utc>,
    history: VecDeque<StateChange>,
}

/// 状态单元
///
/// 只有监督任务写入;状态查询和订阅者随时可读。
pub struct StateCell {
    inner: RwLock<StateInner>,
    publisher: watch::Sender<DaemonState>,
}

impl StateCell {
    pub fn new() -> Self {
        let now = Utc::now();
        let (publisher, _) = watch::channel(DaemonState::Stopped);
        let mut history = VecDeque::with_capacity(HISTORY_LIMIT);
        history.push_back(StateChange {
            state: DaemonState::Stopped,
            at: now,
        });
        Self {
            inner: RwLock::new(StateInner {
                current: DaemonState::Stopped,
                since: now,
                history,
            }),
            publisher,
        }
    }

    pub fn current(&self) -> DaemonState {
        self.inner.read().current
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.inner.read().since
    }

    /// 最近的状态序列(从旧到新)
    pub fn history(&self) -> Vec<DaemonState> {
        self.inner.read().history.iter().map(|c| c.state).collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.publisher.subscribe()
    }

    /// 执行一次状态变更,非法变更返回 `IllegalTransition`
    pub(crate) fn transition(&self, next: DaemonState) -> RplResult<DaemonState> {
        let mut inner = self.inner.write();
        let previous = inner.current;
        if !previous.can_transition_to(next) {
            return Err(RplError::IllegalTransition(format!("daemon {} -> {}", previous, next)));
        }
        let now = Utc::now();
        inner.current = next;
        inner.since = now;
        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(StateChange { state: next, at: now });
        drop(inner);

        info!("Daemon state: {} -> {}", previous, next);
        self.publisher.send_replace(next);
        Ok(previous)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DaemonState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Stopping.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_cell_records_history_and_publishes() {
        let cell = StateCell::new();
        let rx = cell.subscribe();
        cell.transition(Starting).unwrap();
        cell.transition(Running).unwrap();
        assert_eq!(*rx.borrow(), Running);

        let err = cell.transition(Stopped).unwrap_err();
        assert!(matches!(err, RplError::IllegalTransition(_)));
        assert_eq!(cell.current(), Running);
        assert_eq!(cell.history(), vec![Stopped, Starting, Running]);
    }

    #[test]
    fn test_history_is_bounded() {
        let cell = StateCell::new();
        cell.transition(Starting).unwrap();
        for _ in 0..HISTORY_LIMIT {
            cell.transition(Running).unwrap();
            cell.transition(Stopping).unwrap();
            cell.transition(Starting).unwrap();
        }
        let history = cell.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last(), Some(&Starting));
    }
}
