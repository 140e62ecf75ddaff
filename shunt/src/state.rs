//! User dispatch preferences: scoped frames, the process-global base frame,
//! and the collapse into one effective state per call.
//!
//! Each thread owns an independent stack of preference frames; entering a
//! scope pushes a frame, dropping the scope guard pops it on any exit path.
//! A single optional process-global frame replaces the base of every
//! thread's stack. Reads never block: the global frame lives behind an
//! `ArcSwap`, and thread frames are thread-local by construction.
//!
//! Stacking semantics:
//!
//! - `prioritize` lists concatenate innermost-first, de-duplicated keeping
//!   the first occurrence.
//! - A backend is disabled if some frame disables it and no frame nested
//!   inside that one re-prioritizes it. Prioritizing and disabling a backend
//!   in the same frame disables it.
//! - `forced_type` and `trace` are taken from the innermost frame alone;
//!   an inner scope that does not set them clears them for its extent.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::ident::TypeKey;
use crate::trace::SharedSink;

/// One immutable preference frame.
#[derive(Default)]
pub struct PreferenceState {
    pub prioritize: Vec<Arc<str>>,
    pub disable: Vec<Arc<str>>,
    pub forced_type: Option<TypeKey>,
    pub trace: Option<SharedSink>,
}

impl fmt::Debug for PreferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceState")
            .field("prioritize", &self.prioritize)
            .field("disable", &self.disable)
            .field("forced_type", &self.forced_type)
            .field("tracing", &self.trace.is_some())
            .finish()
    }
}

/// The collapse of the active frame stack, captured atomically at call time.
#[derive(Clone, Default)]
pub struct EffectivePrefs {
    pub prioritize: Vec<Arc<str>>,
    pub disabled: BTreeSet<Arc<str>>,
    pub forced_type: Option<TypeKey>,
    pub trace: Option<SharedSink>,
}

impl EffectivePrefs {
    pub fn is_prioritized(&self, name: &str) -> bool {
        self.prioritize.iter().any(|n| &**n == name)
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|n| &**n == name)
    }

    /// The part of the state that can affect candidate selection; trace
    /// sinks are excluded.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            prioritize: self.prioritize.clone(),
            disabled: self.disabled.iter().cloned().collect(),
            forced_type: self.forced_type.clone(),
        }
    }
}

impl fmt::Debug for EffectivePrefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectivePrefs")
            .field("prioritize", &self.prioritize)
            .field("disabled", &self.disabled)
            .field("forced_type", &self.forced_type)
            .field("tracing", &self.trace.is_some())
            .finish()
    }
}

/// Compact summary of [`EffectivePrefs`] used in dispatch cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    prioritize: Vec<Arc<str>>,
    disabled: Vec<Arc<str>>,
    forced_type: Option<TypeKey>,
}

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Frames per backend system, outermost first.
    static FRAMES: RefCell<HashMap<u64, Vec<Arc<PreferenceState>>>> =
        RefCell::new(HashMap::new());
}

/// Per-system scope storage: a shared base frame (optionally replaced by a
/// process-global frame) plus a thread-local stack of user frames.
pub(crate) struct ScopeStack {
    id: u64,
    base: Arc<PreferenceState>,
    global: ArcSwapOption<PreferenceState>,
}

impl ScopeStack {
    pub(crate) fn new(base: PreferenceState) -> Self {
        ScopeStack {
            id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            base: Arc::new(base),
            global: ArcSwapOption::const_empty(),
        }
    }

    /// Installs (or replaces) the process-global base frame.
    pub(crate) fn set_global(&self, frame: Arc<PreferenceState>) -> bool {
        self.global.swap(Some(frame)).is_some()
    }

    pub(crate) fn push(&self, frame: Arc<PreferenceState>) -> Scope {
        FRAMES.with(|f| {
            f.borrow_mut().entry(self.id).or_default().push(Arc::clone(&frame));
        });
        Scope { stack_id: self.id, frame }
    }

    /// The current collapse for the calling thread.
    pub(crate) fn effective(&self) -> EffectivePrefs {
        let base = self.global.load_full().unwrap_or_else(|| Arc::clone(&self.base));
        FRAMES.with(|f| {
            let map = f.borrow();
            let thread_frames = map.get(&self.id).map(Vec::as_slice).unwrap_or(&[]);
            collapse(&base, thread_frames)
        })
    }
}

fn collapse(base: &Arc<PreferenceState>, thread_frames: &[Arc<PreferenceState>]) -> EffectivePrefs {
    let mut disabled: BTreeSet<Arc<str>> = BTreeSet::new();
    for frame in std::iter::once(base).chain(thread_frames.iter()) {
        for p in &frame.prioritize {
            disabled.remove(p);
        }
        for d in &frame.disable {
            disabled.insert(Arc::clone(d));
        }
    }

    let mut prioritize: Vec<Arc<str>> = Vec::new();
    for frame in thread_frames.iter().rev().chain(std::iter::once(base)) {
        for p in &frame.prioritize {
            if !prioritize.iter().any(|seen| seen == p) {
                prioritize.push(Arc::clone(p));
            }
        }
    }

    let innermost = thread_frames.last().unwrap_or(base);
    EffectivePrefs {
        prioritize,
        disabled,
        forced_type: innermost.forced_type.clone(),
        trace: innermost.trace.clone(),
    }
}

/// RAII handle for an open preference scope; dropping it pops the frame.
#[must_use = "dropping the scope immediately restores the previous preferences"]
pub struct Scope {
    stack_id: u64,
    frame: Arc<PreferenceState>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        FRAMES.with(|f| {
            let mut map = f.borrow_mut();
            if let Some(stack) = map.get_mut(&self.stack_id) {
                if let Some(pos) = stack.iter().rposition(|s| Arc::ptr_eq(s, &self.frame)) {
                    stack.remove(pos);
                }
                if stack.is_empty() {
                    map.remove(&self.stack_id);
                }
            }
        });
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("frame", &self.frame).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(prioritize: &[&str], disable: &[&str]) -> Arc<PreferenceState> {
        Arc::new(PreferenceState {
            prioritize: prioritize.iter().map(|s| Arc::from(*s)).collect(),
            disable: disable.iter().map(|s| Arc::from(*s)).collect(),
            forced_type: None,
            trace: None,
        })
    }

    #[test]
    fn scope_push_pop_restores_state() {
        let stack = ScopeStack::new(PreferenceState::default());
        assert!(stack.effective().prioritize.is_empty());

        {
            let _scope = stack.push(frame(&["b1"], &[]));
            assert_eq!(stack.effective().prioritize, vec![Arc::<str>::from("b1")]);
        }
        assert!(stack.effective().prioritize.is_empty());
    }

    #[test]
    fn nested_prioritize_is_innermost_first() {
        let stack = ScopeStack::new(PreferenceState::default());
        let _outer = stack.push(frame(&["b2", "b1"], &[]));
        let _inner = stack.push(frame(&["b1"], &[]));

        let prefs = stack.effective();
        let names: Vec<&str> = prefs.prioritize.iter().map(|s| &**s).collect();
        assert_eq!(names, ["b1", "b2"]);
    }

    #[test]
    fn inner_prioritize_reenables_outer_disable() {
        let stack = ScopeStack::new(PreferenceState::default());
        let _outer = stack.push(frame(&[], &["b1"]));
        assert!(stack.effective().is_disabled("b1"));

        let _inner = stack.push(frame(&["b1"], &[]));
        assert!(!stack.effective().is_disabled("b1"));
    }

    #[test]
    fn same_frame_disable_beats_prioritize() {
        let stack = ScopeStack::new(PreferenceState::default());
        let _scope = stack.push(frame(&["b1"], &["b1"]));
        assert!(stack.effective().is_disabled("b1"));
    }

    #[test]
    fn forced_type_is_innermost_only() {
        let stack = ScopeStack::new(PreferenceState::default());
        let forced = Arc::new(PreferenceState {
            forced_type: Some(TypeKey::parse("m:float").unwrap()),
            ..PreferenceState::default()
        });
        let _outer = stack.push(forced);
        assert!(stack.effective().forced_type.is_some());

        let _inner = stack.push(frame(&[], &[]));
        assert!(stack.effective().forced_type.is_none(), "inner scope replaces");
    }

    #[test]
    fn global_frame_replaces_base() {
        let stack = ScopeStack::new(PreferenceState {
            prioritize: vec![Arc::from("env")],
            ..PreferenceState::default()
        });
        assert!(stack.effective().is_prioritized("env"));

        let replaced = stack.set_global(frame(&["g"], &[]));
        assert!(!replaced);
        let prefs = stack.effective();
        assert!(prefs.is_prioritized("g"));
        assert!(!prefs.is_prioritized("env"));

        assert!(stack.set_global(frame(&["g2"], &[])), "second install replaces");
    }

    #[test]
    fn fingerprint_ignores_trace() {
        let sink: SharedSink = crate::trace::VecSink::new();
        let with_trace = EffectivePrefs { trace: Some(sink), ..EffectivePrefs::default() };
        let without = EffectivePrefs::default();
        assert_eq!(with_trace.fingerprint(), without.fingerprint());
    }

    #[test]
    fn stacks_are_independent_per_thread() {
        let stack = Arc::new(ScopeStack::new(PreferenceState::default()));
        let _scope = stack.push(frame(&["main-only"], &[]));

        let remote = Arc::clone(&stack);
        std::thread::spawn(move || {
            assert!(remote.effective().prioritize.is_empty());
        })
        .join()
        .unwrap();

        assert!(stack.effective().is_prioritized("main-only"));
    }
}
