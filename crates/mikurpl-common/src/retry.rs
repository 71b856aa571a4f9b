//! 有界重试模块
//!
//! 复制搭建、测试库同步、守护进程通道启动和空事务注入都使用同一个
//! 重试组合子:固定次数预算 + 退避等待,耗尽后返回带操作名称的超时错误。

use crate::error::{RplError, RplResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数(至少为 1)
    pub attempts: u32,
    pub backoff: Duration,
    /// 指数退避上限;与 backoff 相等时为固定间隔
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            max_backoff: backoff,
        }
    }

    pub fn exponential(attempts: u32, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            max_backoff: max_backoff.max(backoff),
        }
    }

    /// 第 `attempt` 次失败后的等待时间(从 1 开始计数)
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    /// 条件尚未满足,附带原因
    Retry(String),
}

/// 单次尝试返回的装箱 future,可借用调用方传入的状态
pub type AttemptFuture<'a, T> = Pin<Box<dyn Future<Output = RplResult<Attempt<T>>> + Send + 'a>>;

// 重试预算记账
struct Budget<'o> {
    policy: RetryPolicy,
    operation: &'o str,
    last: String,
}

impl<'o> Budget<'o> {
    fn new(policy: RetryPolicy, operation: &'o str) -> Self {
        Self {
            policy,
            operation,
            last: String::from("no attempt made"),
        }
    }

    /// 返回 Some 表示结束(成功或不可重试的错误)
    fn absorb<T>(&mut self, attempt: u32, outcome: RplResult<Attempt<T>>) -> Option<RplResult<T>> {
        match outcome {
            Ok(Attempt::Done(value)) => return Some(Ok(value)),
            Ok(Attempt::Retry(reason)) => self.last = reason,
            Err(e) if e.is_transient() => self.last = e.to_string(),
            Err(e) => return Some(Err(e)),
        }
        debug!(
            operation = self.operation,
            attempt,
            attempts = self.policy.attempts,
            reason = %self.last,
            "Attempt did not complete"
        );
        None
    }

    async fn pause(&self, attempt: u32, cancel: Option<&mut watch::Receiver<bool>>) -> RplResult<()> {
        if attempt >= self.policy.attempts {
            return Ok(());
        }
        let delay = self.policy.delay(attempt);
        match cancel {
            Some(cancel) => {
                if cancellable_sleep(delay, cancel).await {
                    return Err(self.cancelled());
                }
                Ok(())
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn check_cancel(&self, cancel: Option<&mut watch::Receiver<bool>>) -> RplResult<()> {
        match cancel {
            Some(cancel) if *cancel.borrow() => Err(self.cancelled()),
            _ => Ok(()),
        }
    }

    fn cancelled(&self) -> RplError {
        RplError::Cancelled(self.operation.to_string())
    }

    fn exhausted(self) -> RplError {
        RplError::SetupTimeout {
            operation: self.operation.to_string(),
            attempts: self.policy.attempts,
            last: self.last,
        }
    }
}

/// # Brief
/// 在重试预算内反复执行操作
///
/// 瞬时错误(见 [`RplError::is_transient`])和 `Attempt::Retry` 消耗一次预算;
/// 其它错误立即返回。预算耗尽后返回 `SetupTimeout`。
///
/// # Arguments
/// * `policy` - 重试策略
/// * `operation` - 操作名称,用于日志和超时错误
/// * `f` - 接收当前尝试序号(从 1 开始)的异步操作
pub async fn retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut f: F) -> RplResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RplResult<Attempt<T>>>,
{
    let mut budget = Budget::new(policy, operation);
    for attempt in 1..=policy.attempts {
        if let Some(done) = budget.absorb(attempt, f(attempt).await) {
            return done;
        }
        budget.pause(attempt, None).await?;
    }
    Err(budget.exhausted())
}

/// # Brief
/// 与 [`retry`] 相同,但在每个检查点观察取消信号
///
/// 检查点是每次尝试之前和退避等待期间;正在执行的语句不会被打断。
/// 取消信号为 `true` 时返回 `Cancelled`。
pub async fn retry_until_cancelled<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    cancel: &mut watch::Receiver<bool>,
    mut f: F,
) -> RplResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RplResult<Attempt<T>>>,
{
    let mut budget = Budget::new(policy, operation);
    for attempt in 1..=policy.attempts {
        budget.check_cancel(Some(&mut *cancel))?;
        if let Some(done) = budget.absorb(attempt, f(attempt).await) {
            return done;
        }
        budget.pause(attempt, Some(&mut *cancel)).await?;
    }
    Err(budget.exhausted())
}

/// # Brief
/// 每次尝试借用同一个可变状态(通常是服务器连接)的重试
///
/// 闭包捕获的数据需要是自有的,借用只能来自 `state`。
pub async fn retry_with<S, T, F>(policy: RetryPolicy, operation: &str, state: &mut S, f: F) -> RplResult<T>
where
    S: ?Sized + Send,
    F: for<'a> FnMut(&'a mut S, u32) -> AttemptFuture<'a, T>,
{
    run_with(policy, operation, state, None, f).await
}

/// [`retry_with`] 的可取消版本
pub async fn retry_with_until_cancelled<S, T, F>(
    policy: RetryPolicy,
    operation: &str,
    state: &mut S,
    cancel: &mut watch::Receiver<bool>,
    f: F,
) -> RplResult<T>
where
    S: ?Sized + Send,
    F: for<'a> FnMut(&'a mut S, u32) -> AttemptFuture<'a, T>,
{
    run_with(policy, operation, state, Some(cancel), f).await
}

async fn run_with<S, T, F>(
    policy: RetryPolicy,
    operation: &str,
    state: &mut S,
    mut cancel: Option<&mut watch::Receiver<bool>>,
    mut f: F,
) -> RplResult<T>
where
    S: ?Sized + Send,
    F: for<'a> FnMut(&'a mut S, u32) -> AttemptFuture<'a, T>,
{
    let mut budget = Budget::new(policy, operation);
    for attempt in 1..=policy.attempts {
        budget.check_cancel(cancel.as_deref_mut())?;
        let outcome = f(&mut *state, attempt).await;
        if let Some(done) = budget.absorb(attempt, outcome) {
            return done;
        }
        budget.pause(attempt, cancel.as_deref_mut()).await?;
    }
    Err(budget.exhausted())
}

/// 等待 `duration`,期间收到取消信号则提前返回 `true`
pub async fn cancellable_sleep(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = cancel.changed() => {
                match changed {
                    Ok(()) if *cancel.borrow() => return true,
                    Ok(()) => continue,
                    // 发送端已关闭,不会再有取消信号
                    Err(_) => {
                        (&mut sleep).await;
                        return false;
                    }
                }
            }
        }
    }
}
