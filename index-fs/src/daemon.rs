//! # 后台任务
//!
//! 两个常驻任务服务于块缓存：
//!
//! - 定时写回：每隔固定周期写回所有脏扇区，限制断电时丢失的数据量；
//! - 预读：取出预读请求，把扇区提前装入缓存。
//!
//! 线程的创建与休眠由宿主内核通过 [`Runtime`] 提供。
//! 单次写回或预读失败只记录日志，任务继续运行，直到缓存被关闭。

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::BufferCache;

/// 宿主提供的执行环境
pub trait Runtime: Send + Sync {
    /// 在后台运行 `task`
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send>);
    /// 让当前任务休眠
    fn sleep_ms(&self, millis: u64);
}

impl BufferCache {
    pub fn spawn_daemons(self: &Arc<Self>, runtime: Arc<dyn Runtime>) {
        let cache = Arc::clone(self);
        let rt = Arc::clone(&runtime);
        runtime.spawn(
            "write-behind",
            Box::new(move || cache.write_behind(rt.as_ref())),
        );

        let cache = Arc::clone(self);
        let rt = Arc::clone(&runtime);
        runtime.spawn("read-ahead", Box::new(move || cache.read_ahead(rt.as_ref())));
    }

    fn write_behind(&self, runtime: &dyn Runtime) {
        log::debug!("write-behind daemon started");
        loop {
            runtime.sleep_ms(self.config().write_behind_ms);
            // 关闭时由 `shutdown` 自己写回
            if self.is_stopped() {
                break;
            }
            if let Err(err) = self.flush() {
                log::warn!("periodic write-behind failed, retrying next tick: {err}");
            }
        }
        log::debug!("write-behind daemon stopped");
    }

    fn read_ahead(&self, runtime: &dyn Runtime) {
        log::debug!("read-ahead daemon started");
        while !self.is_stopped() {
            match self.serve_read_ahead() {
                Some(Ok(())) => {}
                Some(Err(err)) => log::warn!("read-ahead failed: {err}"),
                None => runtime.sleep_ms(self.config().read_ahead_idle_ms),
            }
        }
        log::debug!("read-ahead daemon stopped");
    }
}
