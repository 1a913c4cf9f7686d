//! Redraw scheduling
//!
//! A render function typically reads many cells; re-running it eagerly on
//! every write would redraw once per keystroke of a storm. [`RedrawBinding`]
//! runs the render inside a trigger, so the first invalidation after a
//! frame asks the host for a redraw and the rest coalesce until the host
//! actually renders.

use std::sync::Arc;
use weft_core::{trigger, Lifetime, Trigger};

/// The one capability the engine needs from a UI host: ask for a redraw.
///
/// Implementations decide where the request lands: an event-loop wakeup, a
/// dirty flag the compositor polls, a channel send. The engine only
/// promises it calls this at most once per rendered frame.
pub trait RedrawRequester: Send + Sync {
    fn request_redraw(&self);
}

/// Couples a render action to a redraw requester.
pub struct RedrawBinding {
    render: Trigger,
    _update: Lifetime,
}

impl RedrawBinding {
    /// Wrap `render` so that writes to any cell it read schedule exactly
    /// one redraw request until [`render`](RedrawBinding::render) runs
    /// again.
    pub fn new(
        render: impl Fn() + Send + Sync + 'static,
        requester: Arc<dyn RedrawRequester>,
    ) -> Self {
        let (render, update) = trigger(render, move || {
            tracing::trace!("requesting redraw");
            requester.request_redraw();
        });
        RedrawBinding {
            render,
            _update: update,
        }
    }

    /// Run the render action now, re-capturing what it reads.
    pub fn render(&self) {
        self.render.invoke();
    }
}

impl std::fmt::Debug for RedrawBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedrawBinding").finish()
    }
}
