use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::error!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns a task on the ambient tokio runtime, or on a dedicated thread
/// driving the background runtime when called outside of one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("replica-background".into())
        .spawn(move || {
            if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
                runtime.block_on(future);
            }
        });
    if let Err(err) = spawned {
        log::error!("failed to spawn background thread: {err}");
    }
}

/// Waits for the provided duration; returns immediately for zero.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
