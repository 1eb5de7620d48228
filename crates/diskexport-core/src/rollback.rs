//! Undo of partially applied exports.
//!
//! A [`Rollback`] collects cleanup actions before the first side effect of an
//! operation. Dropping the guard runs them, most recently registered first.
//! Calling [`Rollback::disarm`] after the last step succeeds discards them.
//! Because cleanup lives in `Drop`, it also runs when a step returns early
//! with `?` or panics.
//!
//! # Example
//!
//! ```no_run
//! use diskexport_core::rollback::{remove_quietly, Rollback};
//! use std::path::PathBuf;
//!
//! fn run_steps() -> std::io::Result<()> {
//!     let output = PathBuf::from("/exports/root.qcow2");
//!     let mut rollback = Rollback::new();
//!     let target = output.clone();
//!     rollback.defer(move || remove_quietly(&target));
//!
//!     std::fs::write(&output, b"...")?; // on error, `output` is removed
//!
//!     rollback.disarm();
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

type Action = Box<dyn FnOnce()>;

/// Cleanup guard that runs registered actions unless disarmed.
#[derive(Default)]
#[must_use = "dropping the guard immediately runs its cleanup actions"]
pub struct Rollback {
    actions: Vec<Action>,
}

impl Rollback {
    /// Create a guard with no actions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action. It runs before every action registered earlier.
    pub fn defer(&mut self, action: impl FnOnce() + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Discard all actions; nothing runs when the guard goes away.
    pub fn disarm(mut self) {
        self.actions.clear();
    }
}

impl fmt::Debug for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rollback")
            .field("pending", &self.actions.len())
            .finish()
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        tracing::debug!(actions = self.actions.len(), "rolling back");
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

/// Remove a file or directory tree, ignoring errors.
///
/// Failures other than a missing path are logged and otherwise swallowed, so
/// cleanup never replaces the error that triggered it.
pub fn remove_quietly(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let handle = Rc::clone(&log);
        let make = move |label: &'static str| {
            let log = Rc::clone(&handle);
            Box::new(move || log.borrow_mut().push(label)) as Box<dyn FnOnce()>
        };
        (log, make)
    }

    #[test]
    fn test_drop_runs_actions_in_reverse() {
        let (log, make) = recorder();
        {
            let mut rollback = Rollback::new();
            rollback.defer(make("first"));
            rollback.defer(make("second"));
            rollback.defer(make("third"));
        }
        assert_eq!(*log.borrow(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_disarm_skips_actions() {
        let (log, make) = recorder();
        let mut rollback = Rollback::new();
        rollback.defer(make("cleanup"));
        rollback.disarm();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_early_return_runs_once() {
        let (log, make) = recorder();

        let run = |fail: bool| -> Result<(), &'static str> {
            let mut rollback = Rollback::new();
            rollback.defer(make("cleanup"));
            if fail {
                return Err("step failed");
            }
            rollback.disarm();
            Ok(())
        };

        assert_eq!(run(true), Err("step failed"));
        assert_eq!(*log.borrow(), vec!["cleanup"]);

        assert_eq!(run(false), Ok(()));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_panic_runs_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.img");
        fs::write(&path, b"partial").unwrap();

        let target = path.clone();
        let result = std::panic::catch_unwind(move || {
            let mut rollback = Rollback::new();
            rollback.defer(move || remove_quietly(&target));
            panic!("step panicked");
        });

        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_quietly_file_dir_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("disk.img");
        let tree = dir.path().join("disk.img.hash");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(tree.join("nested")).unwrap();

        remove_quietly(&file);
        remove_quietly(&tree);
        remove_quietly(&dir.path().join("never-existed"));

        assert!(!file.exists());
        assert!(!tree.exists());
    }
}
