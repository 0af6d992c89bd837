//! Process-wide spill file registry
//!
//! Sort runs and intermediate merge outputs live in uniquely named files
//! under one directory (`-T DIR`, else `TMPDIR`, else `/tmp`). Every file
//! is tracked in a process-wide registry so that normal exit and fatal
//! signals both leave no droppings behind. All access is serialised through
//! one lock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};
use uuid::Uuid;

use tds_core::TdsError;

struct Registry {
    dir: Option<PathBuf>,
    files: BTreeSet<PathBuf>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            dir: None,
            files: BTreeSet::new(),
        })
    })
}

/// Override the spill directory (`-T`). Takes effect for files created
/// afterwards.
pub fn set_dir(dir: impl Into<PathBuf>) {
    registry().lock().expect("tmpfile registry poisoned").dir = Some(dir.into());
}

/// The directory spill files are created in.
pub fn dir() -> PathBuf {
    let explicit = registry()
        .lock()
        .expect("tmpfile registry poisoned")
        .dir
        .clone();
    explicit
        .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Allocate and register a fresh spill file path. The file itself is
/// created by whoever writes it.
pub fn create(prefix: &str) -> Result<PathBuf, TdsError> {
    let dir = dir();
    if !dir.is_dir() {
        return Err(TdsError::Config(format!(
            "temp directory {} does not exist",
            dir.display()
        )));
    }
    let path = dir.join(format!(
        "tds.{}.{}.{}",
        std::process::id(),
        prefix,
        Uuid::new_v4().simple()
    ));
    registry()
        .lock()
        .expect("tmpfile registry poisoned")
        .files
        .insert(path.clone());
    debug!(path = %path.display(), "registered spill file");
    Ok(path)
}

/// Delete one spill file and drop it from the registry. Missing files are
/// fine; a consumed-and-renamed spill is not an error.
pub fn release(path: &Path) {
    registry()
        .lock()
        .expect("tmpfile registry poisoned")
        .files
        .remove(path);
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "released spill file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove spill file"),
    }
}

/// Delete every outstanding spill file. Called on normal exit and from the
/// signal handlers.
pub fn cleanup() {
    let files: Vec<PathBuf> = {
        let mut reg = registry().lock().expect("tmpfile registry poisoned");
        std::mem::take(&mut reg.files).into_iter().collect()
    };
    for path in files {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed spill file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove spill file"),
        }
    }
}

/// Install handlers so HUP, INT, and TERM clean up spill files before the
/// process dies. Must run inside a tokio runtime.
#[cfg(unix)]
pub fn install_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [
        SignalKind::hangup(),
        SignalKind::interrupt(),
        SignalKind::terminate(),
    ] {
        match signal(kind) {
            Ok(mut sig) => {
                tokio::spawn(async move {
                    sig.recv().await;
                    warn!("fatal signal, removing spill files");
                    cleanup();
                    std::process::exit(1);
                });
            }
            Err(e) => warn!(error = %e, "could not install signal handler"),
        }
    }
}

#[cfg(not(unix))]
pub fn install_signal_handlers() {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt, removing spill files");
            cleanup();
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_release_cleanup() {
        let a = create("testrun").unwrap();
        let b = create("testrun").unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().contains("testrun"));

        std::fs::write(&a, "#tds x\n").unwrap();
        std::fs::write(&b, "#tds x\n").unwrap();

        release(&a);
        assert!(!a.exists());

        cleanup();
        assert!(!b.exists());

        // Releasing something already gone is quiet.
        release(&b);
    }
}
