//! Task-local values.
//!
//! Each task keeps a stack of `(key, value)` bindings. Keys are types, so a
//! library can declare a private marker type and be sure nobody else binds
//! it. Lookups search the task's own stack first and, unless told not to,
//! the stacks of its ancestors.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Whether a lookup may fall back to the parent task's bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskLocalInheritance {
    /// Search this task, then each ancestor.
    #[default]
    Default,
    /// Search this task only.
    DoNotInherit,
}

struct LocalItem {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    next: Option<Box<LocalItem>>,
}

/// The binding stack stored in every task.
pub struct TaskLocalStorage {
    head: RwLock<Option<Box<LocalItem>>>,
}

impl TaskLocalStorage {
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
        }
    }

    /// Bind `value` under key `K`, shadowing any earlier binding.
    pub fn push<K: 'static, V: Send + Sync + 'static>(
        &self,
        value: V,
    ) {
        let mut head = self.head.write();
        let next = head.take();
        *head = Some(Box::new(LocalItem {
            key: TypeId::of::<K>(),
            value: Arc::new(value),
            next,
        }));
    }

    /// Innermost binding for `K`, if it holds a `V`.
    pub fn get<K: 'static, V: Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        let head = self.head.read();
        let key = TypeId::of::<K>();
        let mut cursor = head.as_deref();
        while let Some(item) = cursor {
            if item.key == key {
                return item.value.clone().downcast::<V>().ok();
            }
            cursor = item.next.as_deref();
        }
        None
    }

    /// Remove the innermost binding.
    ///
    /// # Panics
    ///
    /// Panics if there are no bindings.
    pub fn pop(&self) {
        let mut head = self.head.write();
        let Some(item) = head.take() else {
            panic!("task-local value stack is empty");
        };
        let LocalItem { next, .. } = *item;
        *head = next;
    }

    pub fn len(&self) -> usize {
        let head = self.head.read();
        let mut count = 0;
        let mut cursor = head.as_deref();
        while let Some(item) = cursor {
            count += 1;
            cursor = item.next.as_deref();
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.head.read().is_none()
    }
}

impl Default for TaskLocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskLocalStorage {
    fn drop(&mut self) {
        let mut cursor = self.head.get_mut().take();
        while let Some(mut item) = cursor {
            cursor = item.next.take();
        }
    }
}

impl fmt::Debug for TaskLocalStorage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskLocalStorage")
            .field("len", &self.len())
            .finish()
    }
}
