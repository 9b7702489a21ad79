//! Template engine: scoped extraction and injection of template holes.
//!
//! A template is an AST fragment with holes for values that are only known at
//! expansion time. Printing a template inside [`TemplateEngine::extract_values`]
//! replaces every hole with its ordinal and collects the values in order.
//! Parsing the printed text inside [`TemplateEngine::inject_values`] resolves
//! each ordinal back to a fresh duplicate of the value it stands for.
//!
//! # Scoping
//!
//! Scopes live on an explicit stack owned by one engine. Each call pushes its
//! own frame and pops it on every exit path, including early returns and
//! panics, so nested expansions never see each other's values. One engine
//! belongs to one compilation session; parallel sessions never share state.

use std::cell::RefCell;
use thiserror::Error;
use tracing::trace;

/// Misuse of a template hole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template hole {hole} used outside an expansion")]
    OutsideExpansion { hole: String },
    #[error("template placeholder `${ordinal}` has no injected value ({available} available)")]
    OrdinalOutOfRange { ordinal: usize, available: usize },
    #[error("template consumed {consumed} of {expected} injected values")]
    CountMismatch { expected: usize, consumed: usize },
}

impl TemplateError {
    /// True for mismatches between extraction and injection, which indicate
    /// a bug rather than a misuse in user code.
    pub fn is_internal(&self) -> bool {
        !matches!(self, Self::OutsideExpansion { .. })
    }
}

#[derive(Debug)]
enum Frame<V> {
    Extract(Vec<V>),
    Inject { values: Vec<V>, used: Vec<bool> },
}

/// Stack of extraction and injection scopes.
#[derive(Debug)]
pub struct TemplateEngine<V> {
    frames: RefCell<Vec<Frame<V>>>,
}

impl<V> Default for TemplateEngine<V> {
    fn default() -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
        }
    }
}

/// Pops every frame above `depth` when dropped.
struct ScopeGuard<'a, V> {
    frames: &'a RefCell<Vec<Frame<V>>>,
    depth: usize,
}

impl<V> Drop for ScopeGuard<'_, V> {
    fn drop(&mut self) {
        if let Ok(mut frames) = self.frames.try_borrow_mut() {
            frames.truncate(self.depth);
        }
    }
}

impl<V: Clone> TemplateEngine<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active scopes.
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    fn enter(&self, frame: Frame<V>) -> ScopeGuard<'_, V> {
        let mut frames = self.frames.borrow_mut();
        let depth = frames.len();
        frames.push(frame);
        ScopeGuard {
            frames: &self.frames,
            depth,
        }
    }

    /// Runs `block` in a fresh extraction scope and returns its result together
    /// with every value captured in that scope, in capture order.
    pub fn extract_values<R>(&self, block: impl FnOnce() -> R) -> (R, Vec<V>) {
        let guard = self.enter(Frame::Extract(Vec::new()));
        let result = block();
        let captured = match self.frames.borrow_mut().pop() {
            Some(Frame::Extract(values)) => values,
            _ => Vec::new(),
        };
        drop(guard);
        trace!(count = captured.len(), "extracted template values");
        (result, captured)
    }

    /// Runs `block` in a fresh injection scope over `values`.
    ///
    /// Fails with [`TemplateError::CountMismatch`] if `block` succeeded but
    /// left some injected value unresolved.
    pub fn inject_values<R, E>(
        &self,
        values: Vec<V>,
        block: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<TemplateError>,
    {
        let expected = values.len();
        let used = vec![false; expected];
        let guard = self.enter(Frame::Inject { values, used });
        let result = block()?;
        let consumed = match self.frames.borrow().last() {
            Some(Frame::Inject { used, .. }) => used.iter().filter(|u| **u).count(),
            _ => 0,
        };
        drop(guard);
        if consumed != expected {
            return Err(TemplateError::CountMismatch { expected, consumed }.into());
        }
        Ok(result)
    }

    /// Appends `value` to the innermost extraction scope and returns its ordinal.
    pub fn capture(&self, value: V) -> Result<usize, TemplateError> {
        let mut frames = self.frames.borrow_mut();
        match frames.last_mut() {
            Some(Frame::Extract(values)) => {
                values.push(value);
                trace!(ordinal = values.len() - 1, "captured template hole");
                Ok(values.len() - 1)
            }
            _ => Err(TemplateError::OutsideExpansion {
                hole: "capture".into(),
            }),
        }
    }

    /// Resolves `ordinal` in the innermost injection scope to a duplicate of
    /// the injected value. The original is never handed out.
    pub fn resolve(&self, ordinal: usize) -> Result<V, TemplateError> {
        let mut frames = self.frames.borrow_mut();
        match frames.last_mut() {
            Some(Frame::Inject { values, used }) => match values.get(ordinal) {
                Some(value) => {
                    used[ordinal] = true;
                    Ok(value.clone())
                }
                None => Err(TemplateError::OrdinalOutOfRange {
                    ordinal,
                    available: values.len(),
                }),
            },
            _ => Err(TemplateError::OutsideExpansion {
                hole: format!("`${}`", ordinal),
            }),
        }
    }
}
