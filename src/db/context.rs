//! Request-scoped execution context.
//!
//! A [`Context`] is an immutable value passed down the call chain. It carries:
//! - the active transaction of every database, keyed by [`DbId`], so nested
//!   calls join the transaction their caller opened;
//! - a cancellation token and a deadline that bound every database call made
//!   through it.
//!
//! Every derivation returns a new `Context`; the parent is never changed, so a
//! context can be cloned freely across tasks.

use crate::db::scope::Transaction;
use crate::error::DriverError;
use std::fmt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifier of a database, used as the key for its active scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbId(Arc<str>);

impl DbId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DbId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DbId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Append-only list of scope bindings; the newest binding for an id wins.
struct ScopeNode {
    id: DbId,
    /// `None` masks any binding further up the list
    tx: Option<Transaction>,
    parent: Option<Arc<ScopeNode>>,
}

#[derive(Clone, Default)]
pub struct Context {
    scopes: Option<Arc<ScopeNode>>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
    /// Deadline of the context this one was detached from; informational only
    detached_deadline: Option<Instant>,
    shielded: bool,
}

impl Context {
    /// An empty context with no scopes, no cancellation and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context in which `tx` is the active scope of its database.
    pub fn with_scope(&self, tx: Transaction) -> Self {
        self.push_scope(tx.db_id().clone(), Some(tx))
    }

    /// Derive a context in which database `id` has no active scope.
    pub fn without_scope(&self, id: &DbId) -> Self {
        self.push_scope(id.clone(), None)
    }

    fn push_scope(&self, id: DbId, tx: Option<Transaction>) -> Self {
        Self {
            scopes: Some(Arc::new(ScopeNode {
                id,
                tx,
                parent: self.scopes.clone(),
            })),
            ..self.clone()
        }
    }

    /// The active transaction of database `id`, if any.
    pub fn scope(&self, id: &DbId) -> Option<&Transaction> {
        let mut node = self.scopes.as_deref();
        while let Some(n) = node {
            if &n.id == id {
                return n.tx.as_ref();
            }
            node = n.parent.as_deref();
        }
        None
    }

    /// Derive a cancelable context.
    ///
    /// Cancelling the returned token cancels the new context and everything
    /// derived from it, but not this one.
    pub fn with_cancellation(&self) -> (Self, CancellationToken) {
        let token = match &self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = Self {
            cancel: Some(token.clone()),
            shielded: false,
            ..self.clone()
        };
        (ctx, token)
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline`, or earlier if this one does.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            shielded: false,
            ..self.clone()
        }
    }

    /// Derive a context that ignores the cancellation and deadline of this one.
    ///
    /// Scopes are kept, and the deadline stays readable through
    /// [`Context::deadline`].
    pub fn without_cancel(&self) -> Self {
        Self {
            scopes: self.scopes.clone(),
            cancel: None,
            deadline: None,
            detached_deadline: self.deadline(),
            shielded: true,
        }
    }

    /// The deadline of this context, or of the context it was detached from.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.or(self.detached_deadline)
    }

    pub fn is_shielded(&self) -> bool {
        self.shielded
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Why this context is done, if it is.
    pub fn err(&self) -> Option<DriverError> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(DriverError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(DriverError::DeadlineExceeded);
        }
        None
    }

    /// Drive `fut` to completion unless this context is cancelled or expires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        if self.cancel.is_none() && self.deadline.is_none() {
            return fut.await;
        }

        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = fut => result,
            _ = cancelled => Err(DriverError::Canceled),
            _ = expired => Err(DriverError::DeadlineExceeded),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scopes = Vec::new();
        let mut node = self.scopes.as_deref();
        while let Some(n) = node {
            scopes.push((n.id.as_str(), n.tx.as_ref().map(|tx| tx.level())));
            node = n.parent.as_deref();
        }
        f.debug_struct("Context")
            .field("scopes", &scopes)
            .field("deadline", &self.deadline())
            .field("shielded", &self.shielded)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
