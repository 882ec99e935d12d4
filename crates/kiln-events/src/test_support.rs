//! Helpers shared by tests across the workspace.

/// Serialised access to process environment variables.
///
/// Tests that set `KILN_*` variables take a guard first; the previous values
/// are restored when it drops.
pub mod env {
    use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        let lk = ENV_LOCK.get_or_init(|| Mutex::new(()));
        EnvGuard {
            // a panicking test must not wedge every later one
            _lock: lk.lock().unwrap_or_else(PoisonError::into_inner),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }

        pub fn clear_keys(&mut self, keys: &[&'static str]) {
            for &k in keys {
                self.remove(k);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn values_are_restored_on_drop() {
            const KEY: &str = "KILN_TEST_SUPPORT_PROBE";
            {
                let mut g = guard();
                g.remove(KEY);
                g.set(KEY, "one");
                g.set(KEY, "two");
                assert_eq!(std::env::var(KEY).as_deref(), Ok("two"));
            }
            assert!(std::env::var(KEY).is_err());
        }
    }
}
