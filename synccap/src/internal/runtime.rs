use std::future::Future;
use std::io;

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Runtime};

// 全局单例 Runtime，同步 API 在它上面驱动采集周期
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// 获取全局 Runtime，如果不存在则创建
///
/// `worker_threads` 只在第一次创建时生效；采集任务跑在 blocking 线程池上，
/// worker 线程只负责 fan-in，默认 2 个足够。
pub(crate) fn get_runtime(worker_threads: Option<usize>) -> io::Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        let threads = worker_threads.unwrap_or(2).max(1);
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(threads)
            .thread_name("synccap-bg-worker")
            .build()?;
        tracing::debug!("Background runtime started with {} worker threads", threads);
        Ok(runtime)
    })
}

/// 当前线程是否已经处在某个 tokio Runtime 中 (此时不能 block_on)
pub(crate) fn inside_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// 在后台 Runtime 上运行 Future 并阻塞等待结果
pub(crate) fn block_on<F: Future>(worker_threads: Option<usize>, future: F) -> io::Result<F::Output> {
    if inside_runtime() {
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "blocking capture called from inside an async runtime",
        ));
    }
    Ok(get_runtime(worker_threads)?.block_on(future))
}
