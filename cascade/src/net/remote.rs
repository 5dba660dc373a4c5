//! Named code that peers can ask this node to run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::stage::StageError;
use crate::trace::warn;
use crate::types::{PartitionId, SubmissionId};

/// Arguments of one remote execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInvocation {
    /// Node the request came from.
    pub origin: PartitionId,
    /// Node the code runs on behalf of.
    pub node: PartitionId,
    pub submission: SubmissionId,
}

pub type RemoteFn = Arc<dyn Fn(&RemoteInvocation) -> Result<(), StageError> + Send + Sync>;

#[derive(Default)]
pub struct RemoteCodeRegistry {
    entries: RwLock<HashMap<String, RemoteFn>>,
}

impl RemoteCodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&RemoteInvocation) -> Result<(), StageError> + Send + Sync + 'static,
    {
        self.entries.write().insert(name.into(), Arc::new(f));
    }

    /// Runs `name`. Unknown names and failures are logged and reported as
    /// `false`.
    pub fn run(&self, name: &str, invocation: &RemoteInvocation) -> bool {
        let Some(f) = self.entries.read().get(name).cloned() else {
            warn!(name, origin = %invocation.origin, "no remote code registered under this name");
            return false;
        };
        match f(invocation) {
            Ok(()) => true,
            Err(e) => {
                warn!(name, origin = %invocation.origin, error = %e, "remote code failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn invocation() -> RemoteInvocation {
        RemoteInvocation {
            origin: PartitionId::new(1),
            node: PartitionId::new(0),
            submission: SubmissionId::new(4),
        }
    }

    #[test]
    fn runs_registered_code() {
        let registry = RemoteCodeRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        registry.register("count", move |inv| {
            assert_eq!(inv.submission, SubmissionId::new(4));
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert!(registry.run("count", &invocation()));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unknown_or_failing_code_reports_false() {
        let registry = RemoteCodeRegistry::new();
        registry.register("fail", |_| Err(StageError::Failed("nope".into())));
        assert!(!registry.run("fail", &invocation()));
        assert!(!registry.run("missing", &invocation()));
    }
}
