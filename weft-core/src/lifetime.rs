//! Subscription lifetime tokens
//!
//! Every subscription in the engine is owned by a [`Lifetime`]: a token that
//! runs a release closure exactly once, either when [`done`](Lifetime::done)
//! is called or when the token is dropped while still active. A token can
//! instead be pinned with [`forever`](Lifetime::forever), after which the
//! release closure can never run and the subscription survives for the life
//! of the process.
//!
//! Lifetimes compose: [`join`](Lifetime::join) produces a flat composite
//! whose `done()` releases every member. Composites are flattened at
//! construction, never nested.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};

/// One release slot. `finish` runs the closure at most once.
struct Token {
    state: Mutex<TokenState>,
}

enum TokenState {
    Active(Box<dyn FnOnce() + Send>),
    Done,
}

impl Token {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Token {
            state: Mutex::new(TokenState::Active(Box::new(release))),
        }
    }

    fn finish(&self) {
        let release = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, TokenState::Done) {
                TokenState::Active(release) => Some(release),
                TokenState::Done => None,
            }
        };
        // Run outside the lock; release closures may re-enter the engine.
        if let Some(release) = release {
            release();
        }
    }
}

/// A disposable subscription token.
///
/// States: *active* (release pending), *done* (release has run), *pinned*
/// (release suppressed forever). Dropping an active token releases it.
#[must_use = "dropping a Lifetime releases its subscription immediately"]
pub struct Lifetime {
    tokens: Vec<Token>,
}

impl Lifetime {
    /// A token that runs `release` once on `done()` or drop.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Lifetime {
            tokens: vec![Token::new(release)],
        }
    }

    /// A token with nothing to release.
    pub fn empty() -> Self {
        Lifetime { tokens: Vec::new() }
    }

    /// A token whose only job is to keep `value` alive until released.
    pub(crate) fn holding<X: ?Sized>(value: Arc<X>) -> Self
    where
        Arc<X>: Send + 'static,
    {
        Lifetime::new(move || drop(value))
    }

    /// Release the subscription now. Idempotent: each member's release
    /// closure runs at most once across all `done()` calls and the drop.
    pub fn done(&self) {
        for token in &self.tokens {
            token.finish();
        }
    }

    /// Pin the subscription for the rest of the process. The release
    /// closures are leaked, so they can never run, not even on drop.
    pub fn forever(self) {
        std::mem::forget(self);
    }

    /// Combine two lifetimes into one flat composite. `done()` on the
    /// result releases every member, in order.
    pub fn join(mut self, mut other: Lifetime) -> Lifetime {
        let mut tokens = std::mem::take(&mut self.tokens);
        tokens.append(&mut other.tokens);
        Lifetime { tokens }
    }

    /// Tie this lifetime to the life of an arbitrary host object.
    ///
    /// The token moves into a process-wide side table keyed by a weak
    /// reference to `host`. The table is swept lazily: entries whose host
    /// has been dropped are released during later registrations. Hosts that
    /// want release at the exact instant of their own drop should store the
    /// `Lifetime` in a field instead.
    pub fn live_as_long_as<H: Send + Sync + 'static>(self, host: &Arc<H>) {
        let table = host_table();
        let expired: Vec<Lifetime> = {
            let mut entries = table.lock();
            let mut expired = Vec::new();
            entries.retain_mut(|(host, lifetime)| {
                if host.strong_count() > 0 {
                    true
                } else {
                    expired.push(std::mem::replace(lifetime, Lifetime::empty()));
                    false
                }
            });
            let weak = Arc::downgrade(host);
            let weak: Weak<dyn Any + Send + Sync> = weak;
            entries.push((weak, self));
            expired
        };
        // Dead hosts' release closures run outside the table lock.
        drop(expired);
    }
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        for token in &self.tokens {
            token.finish();
        }
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime")
            .field("members", &self.tokens.len())
            .finish()
    }
}

type HostEntry = (Weak<dyn Any + Send + Sync>, Lifetime);

fn host_table() -> &'static Mutex<Vec<HostEntry>> {
    static TABLE: OnceLock<Mutex<Vec<HostEntry>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(Vec::new()))
}
