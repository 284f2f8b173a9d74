//! Class hierarchy analysis slot.
//!
//! The optimizing compiler records classes whose hierarchy it assumed fixed
//! while compiling. The innermost active analysis is reachable from the
//! compiling thread so that nested compilations can register their own.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::thread::Thread;

/// Classes guarded by one compilation
#[derive(Debug, Default)]
pub struct Cha {
    guarded: RefCell<Vec<u32>>,
}

impl Cha {
    /// Create an empty analysis
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the compilation depends on `class_id` having no new
    /// subclasses
    pub fn add_guarded_class(&self, class_id: u32) {
        let mut guarded = self.guarded.borrow_mut();
        if !guarded.contains(&class_id) {
            guarded.push(class_id);
        }
    }

    /// Whether `class_id` is guarded
    pub fn is_guarded(&self, class_id: u32) -> bool {
        self.guarded.borrow().contains(&class_id)
    }

    /// Guarded class ids in registration order
    pub fn guarded_classes(&self) -> Vec<u32> {
        self.guarded.borrow().clone()
    }
}

impl Thread {
    /// The topmost CHA of the compilation running on this thread.
    ///
    /// The pointer is non-owning and valid only while the installing scope
    /// is active.
    pub fn cha(&self) -> Option<NonNull<Cha>> {
        self.cha.get()
    }

    /// Install or clear the topmost CHA.
    ///
    /// # Safety
    /// `cha` must outlive its installation: clear or replace it before the
    /// analysis is dropped. Prefer [`Thread::with_cha`].
    pub unsafe fn set_cha(&self, cha: Option<&Cha>) {
        self.cha.set(cha.map(NonNull::from));
    }

    /// Run `f` with `cha` installed as the topmost analysis, restoring the
    /// previous one afterwards (also on unwind).
    pub fn with_cha<R>(&self, cha: &Cha, f: impl FnOnce() -> R) -> R {
        struct Restore<'a> {
            thread: &'a Thread,
            previous: Option<NonNull<Cha>>,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.thread.cha.set(self.previous);
            }
        }

        let _restore = Restore {
            thread: self,
            previous: self.cha.replace(Some(NonNull::from(cha))),
        };
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_classes() {
        let cha = Cha::new();
        cha.add_guarded_class(7);
        cha.add_guarded_class(3);
        cha.add_guarded_class(7);

        assert!(cha.is_guarded(7));
        assert!(!cha.is_guarded(4));
        assert_eq!(cha.guarded_classes(), vec![7, 3]);
    }

    #[test]
    fn test_with_cha_nests_and_restores() {
        let thread = Thread::new(false);
        let outer = Cha::new();
        let inner = Cha::new();

        thread.with_cha(&outer, || {
            assert_eq!(thread.cha(), Some(NonNull::from(&outer)));
            thread.with_cha(&inner, || {
                assert_eq!(thread.cha(), Some(NonNull::from(&inner)));
            });
            assert_eq!(thread.cha(), Some(NonNull::from(&outer)));
        });
        assert!(thread.cha().is_none());
    }

    #[test]
    fn test_set_cha() {
        let thread = Thread::new(false);
        let cha = Cha::new();

        // SAFETY: Cleared before `cha` is dropped
        unsafe { thread.set_cha(Some(&cha)) };
        assert_eq!(thread.cha(), Some(NonNull::from(&cha)));
        // SAFETY: Clearing installs nothing
        unsafe { thread.set_cha(None) };
        assert!(thread.cha().is_none());
    }

    #[test]
    fn test_with_cha_restores_on_unwind() {
        let thread = Thread::new(false);
        let cha = Cha::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            thread.with_cha(&cha, || panic!("compilation bailed out"));
        }));
        assert!(result.is_err());
        assert!(thread.cha().is_none());
    }
}
