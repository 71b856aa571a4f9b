//! GTID 事务跳过
//!
//! 对每个从库计算 `待跳过 = 请求集合 − 已执行集合`,然后按 UUID、序号升序为每个
//! GTID 注入一个空事务。每个从库由一个独立任务处理,从库之间并行、从库内部串行;
//! 单个从库失败不影响其它从库。

use crate::client::DatabaseClient;
use crate::connector::{connect, ServerEndpoint};
use crate::gtid::{Gtid, GtidSet};
use crate::sql::set_gtid_next;
use futures::future::join_all;
use mikurpl_common::{
    retry_with, Attempt, ConnectionDescriptor, RetryPolicy, RplError, RplResult, ServerRole, ServerVersion,
    SkipConfig,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SkipOptions {
    /// 只计算待跳过集合,不写入
    pub dry_run: bool,
    pub min_version: ServerVersion,
    /// 每个空事务注入的重试策略
    pub inject_policy: RetryPolicy,
}

impl SkipOptions {
    pub fn from_config(config: &SkipConfig) -> Self {
        Self {
            dry_run: false,
            min_version: ServerVersion::new(5, 6, 9),
            inject_policy: config.inject_policy(),
        }
    }
}

impl Default for SkipOptions {
    fn default() -> Self {
        Self::from_config(&SkipConfig::default())
    }
}

/// 单个从库的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkipOutcome {
    NothingToSkip,
    DryRun {
        to_skip: GtidSet,
    },
    Skipped {
        skipped: GtidSet,
    },
    /// 注入中途失败,`applied` 为已注入的部分
    PartiallySkipped {
        applied: GtidSet,
        failed_at: String,
        error: String,
    },
    /// 连接失败或 GTID 模式未开启
    Failed {
        error: String,
    },
}

impl SkipOutcome {
    pub fn is_complete(&self) -> bool {
        !matches!(self, SkipOutcome::PartiallySkipped { .. } | SkipOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubordinateSkip {
    pub subordinate: String,
    #[serde(flatten)]
    pub outcome: SkipOutcome,
}

/// 跳过报告,按输入顺序每个从库一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipReport {
    pub requested: GtidSet,
    pub dry_run: bool,
    pub results: Vec<SubordinateSkip>,
}

impl SkipReport {
    /// 未完成的从库
    pub fn incomplete(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_complete())
            .map(|r| r.subordinate.as_str())
            .collect()
    }

    /// 有从库未完成时返回 `PartialSkip` 错误
    pub fn into_result(self) -> RplResult<SkipReport> {
        let incomplete: Vec<String> = self.incomplete().into_iter().map(str::to_string).collect();
        if incomplete.is_empty() {
            Ok(self)
        } else {
            Err(RplError::PartialSkip {
                subordinates: incomplete,
            })
        }
    }
}

/// # Brief
/// 在一组从库上跳过指定的 GTID
///
/// GTID 集合格式错误或为空、从库描述符重复时,在联系任何从库之前失败。
///
/// # Arguments
/// * `client` - 数据库客户端能力
/// * `gtid_set` - 要跳过的 GTID 集合文本
/// * `subordinates` - 从库连接描述符
/// * `options` - 跳过选项
pub async fn skip_transactions(
    client: Arc<dyn DatabaseClient>,
    gtid_set: &str,
    subordinates: &[ConnectionDescriptor],
    options: &SkipOptions,
) -> RplResult<SkipReport> {
    let requested = GtidSet::parse(gtid_set)?;
    if requested.is_empty() {
        return Err(RplError::gtid_format(gtid_set, "GTID set is empty"));
    }
    for (i, a) in subordinates.iter().enumerate() {
        if let Some(b) = subordinates[i + 1..].iter().find(|b| a.same_endpoint(b)) {
            return Err(RplError::Uniqueness(format!(
                "subordinates '{}' and '{}' name the same server",
                a.address(),
                b.address()
            )));
        }
    }

    info!(
        "Skipping {} transaction(s) on {} subordinate(s){}",
        requested.count(),
        subordinates.len(),
        if options.dry_run { " (dry run)" } else { "" }
    );

    let workers = subordinates.iter().map(|descriptor| {
        let client = client.clone();
        let descriptor = descriptor.clone();
        let requested = requested.clone();
        let options = options.clone();
        tokio::spawn(async move { skip_on_subordinate(client, descriptor, requested, options).await })
    });

    let results = join_all(workers)
        .await
        .into_iter()
        .zip(subordinates)
        .map(|(joined, descriptor)| {
            let outcome = joined.unwrap_or_else(|e| SkipOutcome::Failed {
                error: format!("skip worker aborted: {}", e),
            });
            SubordinateSkip {
                subordinate: descriptor.address(),
                outcome,
            }
        })
        .collect();

    Ok(SkipReport {
        requested,
        dry_run: options.dry_run,
        results,
    })
}

async fn skip_on_subordinate(
    client: Arc<dyn DatabaseClient>,
    descriptor: ConnectionDescriptor,
    requested: GtidSet,
    options: SkipOptions,
) -> SkipOutcome {
    let failed = |e: RplError| {
        error!("Skip failed on {}: {}", descriptor.address(), e);
        SkipOutcome::Failed { error: e.to_string() }
    };

    let mut endpoint = match connect(&*client, &descriptor, ServerRole::Subordinate, options.min_version).await {
        Ok(ep) => ep,
        Err(e) => return failed(e),
    };
    match endpoint.variable_on("gtid_mode").await {
        Ok(true) => {}
        Ok(false) => {
            return failed(RplError::Config(format!(
                "GTID_MODE must be ON on {} to skip transactions",
                endpoint.label()
            )))
        }
        Err(e) => return failed(e),
    }
    let executed = match endpoint.gtid_executed().await {
        Ok(set) => set,
        Err(e) => return failed(e),
    };

    let to_skip = requested.subtract(&executed);
    if to_skip.is_empty() {
        info!("{}: nothing to skip", endpoint.label());
        return SkipOutcome::NothingToSkip;
    }
    if options.dry_run {
        info!("{}: would skip {}", endpoint.label(), to_skip);
        return SkipOutcome::DryRun { to_skip };
    }

    info!("{}: injecting {} empty transaction(s)", endpoint.label(), to_skip.count());
    let mut applied: Vec<Gtid> = Vec::new();
    for gtid in to_skip.iter() {
        let operation = format!("empty transaction {} on {}", gtid, endpoint.label());
        let injected = retry_with(options.inject_policy, &operation, &mut endpoint, move |ep, _| {
            Box::pin(async move {
                inject_empty_transaction(ep, gtid).await?;
                Ok(Attempt::Done(()))
            })
        })
        .await;

        if let Err(e) = injected {
            warn!("{}: injecting {} failed: {}", endpoint.label(), gtid, e);
            reset_session(&mut endpoint, true).await;
            return SkipOutcome::PartiallySkipped {
                applied: GtidSet::from_gtids(applied),
                failed_at: gtid.to_string(),
                error: e.to_string(),
            };
        }
        debug!("{}: skipped {}", endpoint.label(), gtid);
        applied.push(gtid);
    }

    reset_session(&mut endpoint, false).await;
    SkipOutcome::Skipped { skipped: to_skip }
}

async fn inject_empty_transaction(endpoint: &mut ServerEndpoint, gtid: Gtid) -> RplResult<()> {
    endpoint.execute(&set_gtid_next(&gtid.to_string())).await?;
    endpoint.execute("BEGIN").await?;
    endpoint.execute("COMMIT").await
}

async fn reset_session(endpoint: &mut ServerEndpoint, rollback: bool) {
    if rollback {
        if let Err(e) = endpoint.execute("ROLLBACK").await {
            debug!("{}: rollback after failed injection: {}", endpoint.label(), e);
        }
    }
    if let Err(e) = endpoint.execute(&set_gtid_next("AUTOMATIC")).await {
        warn!("{}: cannot reset GTID_NEXT: {}", endpoint.label(), e);
    }
}
