use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::{fmt, io};

use tracing::{info, warn};

/// Thread handle that joins on drop
pub struct AutoJoinHandle {
    name: &'static str,
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let join_handle = thread::Builder::new().name(name.into()).spawn(move || {
            let _guard = scopeguard::guard((), |_| {
                info!("{name} is done");
            });
            f();
        })?;
        Ok(Self {
            name,
            join_handle: Some(join_handle),
        })
    }

    pub fn spawn_res<F, E>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Debug + 'static,
    {
        Self::spawn(name, move || {
            if let Err(e) = f() {
                panic!("{name} failed: {e:?}");
            }
        })
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() && !thread::panicking() {
                warn!(thread = self.name, "Thread panicked");
            }
        }
    }
}

/// Flips the node shutdown flag if the owning thread unwinds
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}
