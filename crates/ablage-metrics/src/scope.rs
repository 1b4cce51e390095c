use prometheus::{Histogram, IntCounter, IntGauge};
use std::time::{Duration, Instant};

/// 测量作用域
///
/// 创建时启动计时并增加进行中计数，析构时记录耗时并减少计数。
/// 无论调用方以何种路径退出（正常返回、`?` 提前返回、panic 展开），都会执行收尾。
pub struct MeasurementScope {
    duration: Histogram,
    in_progress: IntGauge,
    failures: Option<IntCounter>,
    started: Instant,
    failed: bool,
}

impl MeasurementScope {
    pub fn enter(duration: Histogram, in_progress: IntGauge) -> Self {
        in_progress.inc();
        Self {
            duration,
            in_progress,
            failures: None,
            started: Instant::now(),
            failed: false,
        }
    }

    pub fn with_failure_counter(mut self, counter: IntCounter) -> Self {
        self.failures = Some(counter);
        self
    }

    /// 标记本次测量失败，退出时计入失败计数
    pub fn fail(&mut self) {
        self.failed = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for MeasurementScope {
    fn drop(&mut self) {
        self.duration.observe(self.started.elapsed().as_secs_f64());
        self.in_progress.dec();
        if self.failed {
            if let Some(counter) = &self.failures {
                counter.inc();
            }
        }
    }
}
