use crate::error::{ModelError, Result};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Types that can be pushed onto the per-thread context stack.
pub trait Context: Clone + 'static {
    /// Error returned by `get_context(true)` when nothing is on the stack.
    fn missing() -> ModelError;
}

thread_local! {
    static STACKS: RefCell<HashMap<TypeId, Vec<Box<dyn Any>>>> = RefCell::new(HashMap::new());
}

/// Pops its context when dropped, including during unwinding.
pub struct ContextGuard<T: Context> {
    depth: usize,
    _marker: PhantomData<T>,
}

impl<T: Context> Drop for ContextGuard<T> {
    fn drop(&mut self) {
        STACKS.with(|cell| {
            if let Some(stack) = cell.borrow_mut().get_mut(&TypeId::of::<T>()) {
                debug_assert_eq!(stack.len(), self.depth, "context guards dropped out of order");
                stack.truncate(self.depth - 1);
            }
        });
    }
}

/// Push `ctx`; it stays on top until the returned guard is dropped.
pub fn enter<T: Context>(ctx: T) -> ContextGuard<T> {
    let depth = STACKS.with(|cell| {
        let mut stacks = cell.borrow_mut();
        let stack = stacks.entry(TypeId::of::<T>()).or_default();
        stack.push(Box::new(ctx));
        stack.len()
    });
    ContextGuard {
        depth,
        _marker: PhantomData,
    }
}

/// Run `f` with `ctx` on top of the stack.
pub fn with_context<T: Context, R>(ctx: T, f: impl FnOnce() -> R) -> R {
    let _guard = enter(ctx);
    f()
}

/// The innermost context of type `T`.
pub fn get_context<T: Context>(error_if_none: bool) -> Result<Option<T>> {
    let top = STACKS.with(|cell| {
        cell.borrow()
            .get(&TypeId::of::<T>())
            .and_then(|stack| stack.last())
            .and_then(|ctx| ctx.downcast_ref::<T>())
            .cloned()
    });
    match top {
        None if error_if_none => Err(T::missing()),
        other => Ok(other),
    }
}

/// All active contexts of type `T`, outermost first.
pub fn contexts<T: Context>() -> Vec<T> {
    STACKS.with(|cell| {
        cell.borrow()
            .get(&TypeId::of::<T>())
            .map(|stack| stack.iter().filter_map(|c| c.downcast_ref::<T>().cloned()).collect())
            .unwrap_or_default()
    })
}

pub fn context_depth<T: Context>() -> usize {
    STACKS.with(|cell| cell.borrow().get(&TypeId::of::<T>()).map_or(0, |s| s.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(&'static str);

    impl Context for Tag {
        fn missing() -> ModelError {
            ModelError::NoActiveModel
        }
    }

    #[test]
    fn test_nesting_is_reentrant() {
        assert!(get_context::<Tag>(false).unwrap().is_none());
        assert!(matches!(get_context::<Tag>(true), Err(ModelError::NoActiveModel)));

        with_context(Tag("outer"), || {
            with_context(Tag("inner"), || {
                assert_eq!(get_context::<Tag>(true).unwrap(), Some(Tag("inner")));
                assert_eq!(contexts::<Tag>(), vec![Tag("outer"), Tag("inner")]);
                // the same context may be entered twice
                with_context(Tag("inner"), || assert_eq!(context_depth::<Tag>(), 3));
            });
            assert_eq!(get_context::<Tag>(true).unwrap(), Some(Tag("outer")));
        });
        assert_eq!(context_depth::<Tag>(), 0);
    }

    #[test]
    fn test_depth_restored_after_panic() {
        let _outer = enter(Tag("outer"));
        let result = catch_unwind(AssertUnwindSafe(|| {
            with_context(Tag("doomed"), || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(context_depth::<Tag>(), 1);
        assert_eq!(get_context::<Tag>(false).unwrap(), Some(Tag("outer")));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "context guards dropped out of order")]
    fn test_out_of_order_guards_are_caught() {
        let outer = enter(Tag("outer"));
        let _inner = enter(Tag("inner"));
        drop(outer);
    }
}
