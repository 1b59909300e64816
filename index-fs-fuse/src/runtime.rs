use std::thread;
use std::time::Duration;

use index_fs::Runtime;

/// 用宿主线程跑后台任务
#[derive(Debug, Default, Clone, Copy)]
pub struct StdRuntime;

impl Runtime for StdRuntime {
    fn spawn(&self, name: &str, task: Box<dyn FnOnce() + Send>) {
        if let Err(err) = thread::Builder::new().name(name.to_owned()).spawn(task) {
            log::error!("cannot spawn {name}: {err}");
        }
    }

    fn sleep_ms(&self, millis: u64) {
        thread::sleep(Duration::from_millis(millis));
    }
}
