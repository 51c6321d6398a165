//! Network namespace handles.
//!
//! `setns(2)` switches only the calling thread, so any work done inside a
//! foreign namespace runs on a dedicated OS thread via [`run_on_thread`] and
//! never on a tokio worker.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;

use nix::sched::setns;
use nix::sched::CloneFlags;
use tokio::sync::oneshot;
use tracing::error;

use super::PlatformError;

/// Namespace of the init process, i.e. the host network namespace.
pub const HOST_NETNS_PATH: &str = "/proc/1/ns/net";

const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

/// Opens a namespace file such as `/var/run/netns/<name>` or `/proc/<pid>/ns/net`.
pub fn open(path: impl AsRef<Path>) -> Result<File, PlatformError> {
    let path = path.as_ref();
    File::open(path).map_err(|e| PlatformError::Namespace {
        message: format!("open {}: {e}", path.display()),
    })
}

/// Keeps the current thread inside another network namespace until dropped.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    /// Switches the current thread into `target`, remembering where it was.
    pub fn enter(target: impl AsFd) -> Result<Self, PlatformError> {
        let original = open(THREAD_NETNS_PATH)?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| PlatformError::Namespace {
            message: format!("setns: {e}"),
        })?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // The thread is dedicated and exits right after, so nothing else
            // observes the wrong namespace.
            error!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Runs `f` on a fresh OS thread and awaits its result.
pub async fn run_on_thread<T, F>(name: &str, f: F) -> Result<T, PlatformError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    rx.await.map_err(|_| PlatformError::Namespace {
        message: format!("thread {name} exited without a result"),
    })
}
