//! 进程级关闭：监听 Ctrl+C / SIGTERM，把信号转成对执行的取消
//!
//! 只记录第一次触发的原因；之后重复触发只会再次取消令牌。
//! 编排器侧的收尾（取消活跃循环并等待终态落盘）由 cancel_on_shutdown / drain_on_shutdown 挂接。

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{ExecutionId, Orchestrator};

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号（clone 后共享同一个令牌与原因）
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；返回 false 表示之前已触发过（原因不覆盖）
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!(reason = ?reason, "shutdown triggered");
        }
        self.token.cancel();
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM（unix）处理；第一个到达的信号决定原因
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.token.cancelled() => return,
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                        return;
                    }
                },
                _ = terminate_signal() => ShutdownReason::Signal,
            };
            manager.trigger(reason);
        });
    }

    /// 关闭时取消指定执行（CLI 前台跟踪单个执行时使用）
    pub fn cancel_on_shutdown(&self, orchestrator: Orchestrator, id: ExecutionId) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.wait_for_shutdown().await;
            if let Err(e) = orchestrator.cancel(&id).await {
                tracing::warn!(execution_id = %id, error = %e, "cancel on shutdown failed");
            }
        })
    }

    /// 关闭时取消所有活跃循环并等待它们写完终态
    pub fn drain_on_shutdown(&self, orchestrator: Orchestrator) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.wait_for_shutdown().await;
            orchestrator.shutdown().await;
        })
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        assert!(manager.trigger(ShutdownReason::FatalError("disk full".into())));
        assert!(!manager.trigger(ShutdownReason::UserInitiated));
        manager.wait_for_shutdown().await;

        assert!(manager.token().is_cancelled());
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::FatalError("disk full".into()))
        );
    }
}
