use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use parking_lot::RwLock;

use crate::proxy::snapshot::EngineSnapshot;

/// Holds the current [`EngineSnapshot`]. Sessions clone the `Arc` once at
/// dispatch and never look here again, so an install only affects sessions
/// accepted afterwards.
#[derive(Debug)]
pub struct ProxyRuntime {
    current: RwLock<Arc<EngineSnapshot>>,
    generation: AtomicU64,
}

impl ProxyRuntime {
    pub fn new(snapshot: EngineSnapshot) -> Self {
        snapshot.start_probes();
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Swaps in `snapshot`, starts its probes and retires the previous one.
    pub fn install(&self, snapshot: EngineSnapshot) -> Arc<EngineSnapshot> {
        snapshot.start_probes();
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(snapshot));
        previous.retire();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("[Runtime] installed snapshot generation {}", generation);
        previous
    }

    /// Stops the current snapshot's background work on shutdown.
    pub fn retire(&self) {
        self.current.read().retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::cipher::CipherRegistry;
    use crate::proxy::snapshot::tests::ROUTING;

    fn snapshot(yaml: &str) -> EngineSnapshot {
        let config = Config::from_yaml(yaml).unwrap();
        EngineSnapshot::build(&config, &CipherRegistry::default()).unwrap()
    }

    #[tokio::test]
    async fn test_install_keeps_captured_snapshot() {
        let runtime = ProxyRuntime::new(snapshot(ROUTING));
        let captured = runtime.snapshot();
        assert_eq!(runtime.generation(), 1);

        let replaced = ROUTING.replace("FINAL,Proxy", "FINAL,DIRECT");
        let previous = runtime.install(snapshot(&replaced));

        assert!(Arc::ptr_eq(&previous, &captured));
        assert!(captured.is_retired());
        assert_eq!(captured.rules().rules().last().unwrap().policy(), "Proxy");
        assert_eq!(runtime.snapshot().rules().rules().last().unwrap().policy(), "DIRECT");
        assert!(!runtime.snapshot().is_retired());
        assert_eq!(runtime.generation(), 2);
    }
}
