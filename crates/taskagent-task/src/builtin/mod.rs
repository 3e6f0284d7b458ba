//! Task types shipped with the worker binary.

mod delegate;
mod demo;
mod error;

use crate::task_type::TaskRegistry;

/// Registry holding `demo`, `error` and `delegate`.
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(demo::task_type());
    registry.register(error::task_type());
    registry.register(delegate::task_type());
    registry
}
