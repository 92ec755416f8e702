//! 执行监管：每个执行一个取消令牌，保证同一执行在本进程内最多一个活跃循环
//!
//! 根令牌在 shutdown 时取消，所有执行令牌都是它的子令牌。循环启动前 claim 一个 RunLease，
//! lease 被 drop（循环结束、出错或 panic）时自动登记完成并唤醒等待者。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::ExecutionId;

struct ActiveRun {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

type ActiveMap = Arc<Mutex<HashMap<ExecutionId, ActiveRun>>>;

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<ExecutionId, ActiveRun>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 活跃循环的所有权凭证
pub struct RunLease {
    id: ExecutionId,
    token: CancellationToken,
    done_tx: watch::Sender<bool>,
    active: ActiveMap,
}

impl RunLease {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
        let _ = self.done_tx.send(true);
    }
}

/// 执行级生命周期管理：取消令牌注册表
pub struct ExecutionSupervisor {
    root: CancellationToken,
    active: ActiveMap,
}

impl ExecutionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 登记一个活跃循环；已有活跃循环时返回 None
    pub fn claim(&self, id: &str) -> Option<RunLease> {
        let mut active = lock(&self.active);
        if active.contains_key(id) {
            return None;
        }
        let token = self.root.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        active.insert(
            id.to_string(),
            ActiveRun {
                token: token.clone(),
                done: done_rx,
            },
        );
        Some(RunLease {
            id: id.to_string(),
            token,
            done_tx,
            active: self.active.clone(),
        })
    }

    /// 取消活跃循环；没有活跃循环时返回 false
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.active).get(id) {
            Some(run) => {
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        lock(&self.active).contains_key(id)
    }

    /// 活跃循环结束信号；没有活跃循环时返回 None
    pub fn waiter(&self, id: &str) -> Option<watch::Receiver<bool>> {
        lock(&self.active).get(id).map(|run| run.done.clone())
    }

    pub fn active_ids(&self) -> Vec<ExecutionId> {
        lock(&self.active).keys().cloned().collect()
    }

    /// 取消根令牌：所有活跃与之后启动的循环都会收到取消
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Default for ExecutionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待 watch 信号变为 true（发送端已 drop 也视为完成）
pub async fn wait_done(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_claim_per_execution() {
        let sup = ExecutionSupervisor::new();
        let lease = sup.claim("exec_1").unwrap();
        assert!(sup.claim("exec_1").is_none());
        assert!(sup.is_active("exec_1"));
        drop(lease);
        assert!(!sup.is_active("exec_1"));
        assert!(sup.claim("exec_1").is_some());
    }

    #[test]
    fn test_cancel_and_shutdown() {
        let sup = ExecutionSupervisor::new();
        let a = sup.claim("a").unwrap();
        let b = sup.claim("b").unwrap();
        assert!(sup.cancel("a"));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        assert!(!sup.cancel("ghost"));

        sup.shutdown();
        assert!(b.token().is_cancelled());
        assert!(sup.claim("c").unwrap().token().is_cancelled());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let sup = ExecutionSupervisor::new();
        let lease = sup.claim("a").unwrap();
        let rx = sup.waiter("a").unwrap();
        let handle = tokio::spawn(wait_done(rx));
        drop(lease);
        handle.await.unwrap();
        assert!(sup.waiter("a").is_none());
    }
}
