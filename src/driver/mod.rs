// Module: Driver
// Browser-driver seam: the transport lives outside the engine, the engine
// owns lifecycle and scope.

use serde_json::{Map, Value};

use crate::errors::Result;

pub trait Driver: Send {
    fn click(&mut self, locator: &str) -> Result<()>;
    fn input(&mut self, locator: &str, value: &str) -> Result<()>;
    fn is_terminated(&self) -> bool;
    fn quit(&mut self);
}

/// Optional pooling provider. When present, drivers are acquired from and
/// released back to the pool instead of being created and quit per scenario.
pub trait DriverProvider: Send + Sync {
    fn acquire(&self, options: &Map<String, Value>) -> Result<Box<dyn Driver>>;
    fn release(&self, driver: Box<dyn Driver>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverScope {
    /// Released or closed when the owning scenario ends.
    Scenario,
    /// Transferred upward: the callee leaves the handle for the caller, who
    /// becomes the owner responsible for release.
    Caller,
}

impl DriverScope {
    pub fn from_options(options: &Map<String, Value>) -> Self {
        match options.get("scope").and_then(Value::as_str) {
            Some("caller") => DriverScope::Caller,
            _ => DriverScope::Scenario,
        }
    }
}

/// An owned driver plus its release semantics. `inherited` marks a handle
/// received from a callee; an inheritor never closes an inherited driver
/// until it becomes the owner at its own scenario end.
pub struct DriverHandle {
    pub driver: Box<dyn Driver>,
    pub scope: DriverScope,
    pub pooled: bool,
}

impl DriverHandle {
    pub fn new(driver: Box<dyn Driver>, scope: DriverScope, pooled: bool) -> Self {
        Self {
            driver,
            scope,
            pooled,
        }
    }

    /// Ends this handle's life: back to the pool when pooled, otherwise quit.
    pub fn release(mut self, provider: Option<&dyn DriverProvider>) {
        if self.pooled {
            if let Some(provider) = provider {
                provider.release(self.driver);
                return;
            }
        }
        if !self.driver.is_terminated() {
            self.driver.quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) struct FakeDriver {
        pub terminated: Arc<AtomicBool>,
    }

    impl Driver for FakeDriver {
        fn click(&mut self, _locator: &str) -> Result<()> {
            Ok(())
        }

        fn input(&mut self, _locator: &str, _value: &str) -> Result<()> {
            Ok(())
        }

        fn is_terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }

        fn quit(&mut self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    struct CountingProvider {
        released: AtomicUsize,
    }

    impl DriverProvider for CountingProvider {
        fn acquire(&self, _options: &Map<String, Value>) -> Result<Box<dyn Driver>> {
            Ok(Box::new(FakeDriver {
                terminated: Arc::new(AtomicBool::new(false)),
            }))
        }

        fn release(&self, _driver: Box<dyn Driver>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn scope_parses_from_options() {
        let mut options = Map::new();
        assert_eq!(DriverScope::from_options(&options), DriverScope::Scenario);
        options.insert("scope".into(), json!("caller"));
        assert_eq!(DriverScope::from_options(&options), DriverScope::Caller);
    }

    #[test]
    fn unpooled_release_quits_the_driver() {
        let terminated = Arc::new(AtomicBool::new(false));
        let handle = DriverHandle::new(
            Box::new(FakeDriver {
                terminated: terminated.clone(),
            }),
            DriverScope::Scenario,
            false,
        );
        handle.release(None);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn pooled_release_returns_to_the_provider_without_quit() {
        let provider = CountingProvider {
            released: AtomicUsize::new(0),
        };
        let terminated = Arc::new(AtomicBool::new(false));
        let handle = DriverHandle::new(
            Box::new(FakeDriver {
                terminated: terminated.clone(),
            }),
            DriverScope::Scenario,
            true,
        );
        handle.release(Some(&provider));
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
        assert!(!terminated.load(Ordering::SeqCst));
    }
}
