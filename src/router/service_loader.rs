use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::trace;

use crate::{AppError, AppResult};

type Factory<S> = Box<dyn Fn() -> Arc<S> + Send + Sync>;

struct ServiceHolder<S: ?Sized> {
    factory: Factory<S>,
    cache: bool,
    instance: OnceCell<Arc<S>>,
}

impl<S: ?Sized> ServiceHolder<S> {
    fn instance(&self) -> Arc<S> {
        if self.cache {
            // concurrent first calls still build only one instance
            self.instance.get_or_init(|| (self.factory)()).clone()
        } else {
            (self.factory)()
        }
    }
}

/// Command -> service registry.
///
/// Filled by explicit `register` calls during bootstrap. A cached
/// registration hands out one shared instance, built on first use; an
/// uncached one builds a fresh instance for every lookup.
pub struct ServiceLoader<S: ?Sized> {
    services: DashMap<String, Arc<ServiceHolder<S>>>,
}

impl<S: ?Sized + Send + Sync> ServiceLoader<S> {
    pub fn new() -> Self {
        ServiceLoader {
            services: DashMap::new(),
        }
    }

    /// Fails with `DuplicateCommand` if `command` is already registered.
    pub fn register<F>(&self, command: impl Into<String>, cache: bool, factory: F) -> AppResult<()>
    where
        F: Fn() -> Arc<S> + Send + Sync + 'static,
    {
        let command = command.into();
        match self.services.entry(command) {
            Entry::Occupied(entry) => Err(AppError::DuplicateCommand(entry.key().clone())),
            Entry::Vacant(entry) => {
                trace!("register service {} (cache={cache})", entry.key());
                entry.insert(Arc::new(ServiceHolder {
                    factory: Box::new(factory),
                    cache,
                    instance: OnceCell::new(),
                }));
                Ok(())
            }
        }
    }

    pub fn get_service(&self, command: &str) -> AppResult<Arc<S>> {
        // release the shard lock before running a factory
        let holder = self
            .services
            .get(command)
            .map(|holder| holder.value().clone())
            .ok_or_else(|| AppError::command_not_found(Some(command)))?;
        Ok(holder.instance())
    }

    pub fn contains(&self, command: &str) -> bool {
        self.services.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        commands.sort();
        commands
    }
}

impl<S: ?Sized + Send + Sync> Default for ServiceLoader<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> fmt::Debug for ServiceLoader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<(String, bool)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().cache))
            .collect();
        services.sort();
        f.debug_struct("ServiceLoader")
            .field("services", &services)
            .finish()
    }
}
