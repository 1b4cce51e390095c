use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 触发关闭的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,
    /// SIGINT / Ctrl+C
    Interrupt,
    /// 进程内主动触发，例如信号监听安装失败
    Manual,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Term => "SIGTERM",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Manual => "manual",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 关闭信号的广播端
///
/// 评估循环、清理循环和 HTTP 服务各自 `subscribe()` 一个接收端，只在两次 tick 之间检查。
/// 只有第一个信号会被广播，之后的重复触发被忽略；晚于触发才订阅的任务用
/// `is_shutting_down()` 补查。
#[derive(Debug, Clone)]
pub struct SignalHandler {
    tx: broadcast::Sender<ShutdownSignal>,
    fired: Arc<AtomicBool>,
}

impl SignalHandler {
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        let (tx, rx) = broadcast::channel(4);
        let handler = Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        };
        (handler, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// 广播关闭信号，返回本次调用是否真正触发了关闭
    pub fn notify(&self, signal: ShutdownSignal) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(%signal, "Shutdown already in progress, ignoring signal");
            return false;
        }
        info!(%signal, receivers = self.tx.receiver_count(), "Shutdown requested");
        let _ = self.tx.send(signal);
        true
    }

    pub fn trigger_shutdown(&self) {
        self.notify(ShutdownSignal::Manual);
    }

    /// 监听操作系统信号，收到后广播
    pub async fn wait_for_system_signal(&self) -> io::Result<ShutdownSignal> {
        let received = os_signal().await?;
        self.notify(received);
        Ok(received)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(unix)]
async fn os_signal() -> io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = term.recv() => ShutdownSignal::Term,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
    })
}

#[cfg(not(unix))]
async fn os_signal() -> io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
