//! Stage instances recycled across activations.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Stage, StageError};

/// Builds a fresh stage instance.
pub type StageFactory = Box<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Named stage factories plus an idle list per name.
///
/// Registration happens before the engine starts; acquire and release are
/// called concurrently by every handler thread.
#[derive(Default)]
pub struct StagePool {
    factories: HashMap<String, StageFactory>,
    idle: Mutex<HashMap<String, Vec<Box<dyn Stage>>>>,
}

impl StagePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, S>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stage + 'static,
    {
        self.factories
            .insert(name.into(), Box::new(move || Box::new(factory())));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Takes an idle instance or builds a new one.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::UnknownStage`] if `name` was never registered.
    pub fn acquire(&self, name: &str) -> Result<Box<dyn Stage>, StageError> {
        if let Some(stage) = self.idle.lock().get_mut(name).and_then(Vec::pop) {
            return Ok(stage);
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StageError::UnknownStage(name.to_owned()))?;
        Ok(factory())
    }

    /// Returns an instance for reuse by later activations.
    pub fn release(&self, name: &str, stage: Box<dyn Stage>) {
        self.idle
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push(stage);
    }

    #[must_use]
    pub fn idle_count(&self, name: &str) -> usize {
        self.idle.lock().get(name).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::stage::{ChildBuffers, Emitter, StageContext};
    use crate::value::{Record, Value};

    struct Noop;

    impl Stage for Noop {
        fn start_process(
            &mut self,
            _ctx: &mut StageContext,
            _chain: &mut Chain,
            _params: &[Value],
        ) -> Result<(), StageError> {
            Ok(())
        }

        fn process(
            &mut self,
            _record: &Record,
            _chain: &mut Chain,
            _children: &mut ChildBuffers,
            _downstream: &mut Emitter<'_>,
            _ctx: &mut StageContext,
        ) -> Result<(), StageError> {
            Ok(())
        }
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let pool = StagePool::new();
        assert!(matches!(
            pool.acquire("missing"),
            Err(StageError::UnknownStage(name)) if name == "missing"
        ));
    }

    #[test]
    fn released_stages_are_reused() {
        let mut pool = StagePool::new();
        pool.register("noop", || Noop);
        assert!(pool.contains("noop"));

        let stage = pool.acquire("noop").unwrap();
        assert_eq!(pool.idle_count("noop"), 0);
        pool.release("noop", stage);
        assert_eq!(pool.idle_count("noop"), 1);

        let _again = pool.acquire("noop").unwrap();
        assert_eq!(pool.idle_count("noop"), 0);
    }
}
