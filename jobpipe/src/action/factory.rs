//! A registry of named action constructors.
use std::{fmt, sync::Arc};

use fxhash::FxHashMap;

use super::{
    error::ActionNotRegisteredError,
    wrapper::{ActionWrapper, CacheableAction, ErrorHandlingWrapper, RetryWrapper},
    BoxAction,
};
use crate::{cache::is_conventionally_cacheable, deps::Dependencies};

type Constructor<D> = Arc<dyn Fn(&D) -> BoxAction<D> + Send + Sync>;

struct Registration<D: Dependencies> {
    constructor: Constructor<D>,
    wrappers: Vec<ActionWrapper<D>>,
    cacheable: bool,
}

/// Maps action names to constructors, and optionally to a chain of wrappers applied to every
/// created action.
///
/// Registering a name again replaces the previous registration in full. Actions whose name
/// contains `parse` or `fetch` are marked [cacheable](super::Action::cacheable) when created.
///
/// Registration happens while a worker is set up. Once jobs are being processed the factory is
/// only read.
pub struct ActionFactory<D: Dependencies> {
    registrations: FxHashMap<String, Registration<D>>,
}

impl<D: Dependencies> Default for ActionFactory<D> {
    fn default() -> Self {
        Self {
            registrations: Default::default(),
        }
    }
}

impl<D: Dependencies> fmt::Debug for ActionFactory<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionFactory")
            .field("actions", &self.registered_actions())
            .finish()
    }
}

impl<D: Dependencies> ActionFactory<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&D) -> BoxAction<D> + Send + Sync + 'static,
    {
        self.register_with_wrappers(name, constructor, Vec::new())
    }

    /// Registers the constructor for `name` together with the wrappers to apply to created
    /// actions, replacing any previous registration.
    ///
    /// Wrappers are applied in order, so the last one becomes the outermost.
    ///
    /// Caching applies to the action as created, wrappers included: when a cacheable action's
    /// result is served from the cache, none of its wrappers run. A
    /// [`StatusBroadcastWrapper`](super::wrapper::StatusBroadcastWrapper) around a cacheable
    /// action therefore only broadcasts when the action actually executes.
    pub fn register_with_wrappers<F>(
        &mut self,
        name: impl Into<String>,
        constructor: F,
        wrappers: Vec<ActionWrapper<D>>,
    ) -> &mut Self
    where
        F: Fn(&D) -> BoxAction<D> + Send + Sync + 'static,
    {
        let name = name.into();
        let registration = Registration {
            constructor: Arc::new(constructor),
            wrappers,
            cacheable: is_conventionally_cacheable(&name),
        };
        if self.registrations.insert(name.clone(), registration).is_some() {
            tracing::debug!(action = %name, "Replaced registration of action {name}");
        }
        self
    }

    /// Creates the action registered under `name`, decorated with its wrappers.
    pub fn create(&self, name: &str, deps: &D) -> Result<BoxAction<D>, ActionNotRegisteredError> {
        let registration = self
            .registrations
            .get(name)
            .ok_or_else(|| ActionNotRegisteredError::new(name))?;

        let mut action = (registration.constructor)(deps);
        if registration.cacheable && !action.cacheable() {
            action = CacheableAction::wrap(action);
        }
        Ok(registration
            .wrappers
            .iter()
            .fold(action, |action, wrapper| wrapper(action)))
    }

    /// Creates the action wrapped for retries, with error handling outermost.
    pub fn create_retryable_error_handled(
        &self,
        name: &str,
        deps: &D,
    ) -> Result<BoxAction<D>, ActionNotRegisteredError> {
        let action = self.create(name, deps)?;
        Ok(ErrorHandlingWrapper::wrap(RetryWrapper::wrap(action)))
    }

    pub fn create_error_handled(
        &self,
        name: &str,
        deps: &D,
    ) -> Result<BoxAction<D>, ActionNotRegisteredError> {
        let action = self.create(name, deps)?;
        Ok(ErrorHandlingWrapper::wrap(action))
    }

    pub fn has(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    /// The names of all registered actions, in no particular order.
    pub fn registered_actions(&self) -> Vec<String> {
        self.registrations.keys().cloned().collect()
    }

    /// Drops all registrations.
    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}
