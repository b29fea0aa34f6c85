//! Recipe registry: keyed index, predicate list, scoped overrides

use crate::error::InterceptError;
use crate::matcher::{match_all, matcher_fingerprint, CanonicalKey, RequestKey};
use crate::recipe::{InterceptedResponse, Recipe};
use crate::request::InterceptedRequest;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fallback producer consulted when no recipe matches; `None` abstains.
/// Receives an owned request clone sharing the original's body buffer.
pub type MissingRecipeFallback =
    Arc<dyn Fn(InterceptedRequest) -> BoxFuture<'static, Option<InterceptedResponse>> + Send + Sync>;

/// Mutator applied to every synthesized response
pub type ResponseMutator = Arc<dyn Fn(&mut InterceptedResponse) + Send + Sync>;

/// Reference to a registered recipe: drives deregistration and exposes the
/// dispatch counter. Cloneable; all clones refer to the same registration.
#[derive(Clone)]
pub struct RecipeHandle {
    pub(crate) id: u64,
    pub(crate) recipe: Arc<Recipe>,
}

impl RecipeHandle {
    /// How many times this recipe has produced a response
    pub fn times_dispatched(&self) -> u64 {
        self.recipe.hits()
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }
}

impl fmt::Debug for RecipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeHandle")
            .field("id", &self.id)
            .finish()
    }
}

/// Handle returned by [`Registry::begin_scope`]; must be closed in LIFO
/// order via [`Registry::end_scope`].
#[derive(Debug)]
#[must_use = "a scope stays open until end_scope is called with its handle"]
pub struct ScopeHandle {
    pub(crate) id: u64,
}

struct Entry {
    id: u64,
    recipe: Arc<Recipe>,
}

#[derive(Default)]
struct Layer {
    scope_id: u64,
    keyed: Vec<Entry>,
    predicates: Vec<Entry>,
}

struct State {
    layers: Vec<Layer>,
    next_entry_id: u64,
    next_scope_id: u64,
}

/// Holds registered recipes and resolves requests against them.
///
/// Lookups run in parallel; registrations, deregistrations and scope
/// push/pop serialize on the write side of one lock. Scopes are global to
/// the registry, not task-local; parallel test bodies that need isolated
/// overrides should each own a registry.
pub struct Registry {
    state: RwLock<State>,
    strict: bool,
    on_missing: Option<MissingRecipeFallback>,
    mutators: Vec<ResponseMutator>,
}

impl Registry {
    /// An empty, permissive registry
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                layers: vec![Layer::default()],
                next_entry_id: 0,
                next_scope_id: 1,
            }),
            strict: false,
            on_missing: None,
            mutators: Vec::new(),
        }
    }

    /// Fail unmatched requests with
    /// [`InterceptError::UnmatchedRequest`] instead of returning the
    /// empty-200 sentinel
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Consult this producer before the strict/permissive decision when no
    /// recipe matches; returning `None` abstains
    pub fn with_missing_recipe_fallback(
        mut self,
        fallback: impl Fn(InterceptedRequest) -> BoxFuture<'static, Option<InterceptedResponse>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_missing = Some(Arc::new(fallback));
        self
    }

    /// Apply a mutator to every synthesized response, in registration order
    pub fn with_response_mutator(
        mut self,
        mutator: impl Fn(&mut InterceptedResponse) + Send + Sync + 'static,
    ) -> Self {
        self.mutators.push(Arc::new(mutator));
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub(crate) fn missing_fallback(&self) -> Option<&MissingRecipeFallback> {
        self.on_missing.as_ref()
    }

    pub(crate) fn mutators(&self) -> &[ResponseMutator] {
        &self.mutators
    }

    /// Install a recipe into the current (top) scope layer. A keyed recipe
    /// replaces any prior recipe in that layer with the same canonical key
    /// and the same describable matcher signature (recipes that differ in
    /// header requirements, or carry opaque predicates, coexist and are
    /// resolved newest-first at lookup); predicate recipes append in
    /// registration order.
    pub(crate) async fn register(&self, recipe: Recipe) -> RecipeHandle {
        let mut state = self.state.write().await;
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        let recipe = Arc::new(recipe);
        let handle = RecipeHandle {
            id,
            recipe: Arc::clone(&recipe),
        };
        let layer = state.layers.last_mut().expect("base layer always present");
        match recipe.key.clone() {
            Some(key) => {
                let fingerprint = matcher_fingerprint(&recipe.matchers);
                if fingerprint.is_some() {
                    layer.keyed.retain(|entry| {
                        entry.recipe.key.as_ref() != Some(&key)
                            || matcher_fingerprint(&entry.recipe.matchers) != fingerprint
                    });
                }
                tracing::debug!(entry = id, scope = layer.scope_id, ?key, "registered recipe");
                layer.keyed.push(Entry { id, recipe });
            }
            None => {
                tracing::debug!(
                    entry = id,
                    scope = layer.scope_id,
                    priority = ?recipe.priority,
                    "registered predicate recipe"
                );
                layer.predicates.push(Entry { id, recipe });
            }
        }
        handle
    }

    /// Remove a recipe from the top scope layer. Returns false when the
    /// registration is not present there (consumed, replaced, or owned by a
    /// lower layer, which stays untouched).
    pub async fn deregister(&self, handle: &RecipeHandle) -> bool {
        let mut state = self.state.write().await;
        let layer = state.layers.last_mut().expect("base layer always present");
        let before = layer.keyed.len() + layer.predicates.len();
        layer.keyed.retain(|entry| entry.id != handle.id);
        layer.predicates.retain(|entry| entry.id != handle.id);
        before != layer.keyed.len() + layer.predicates.len()
    }

    /// Remove every keyed recipe with exactly this canonical key from the
    /// top scope layer
    pub async fn deregister_key(&self, key: &CanonicalKey) -> bool {
        let mut state = self.state.write().await;
        let layer = state.layers.last_mut().expect("base layer always present");
        let before = layer.keyed.len();
        layer
            .keyed
            .retain(|entry| entry.recipe.key.as_ref() != Some(key));
        before != layer.keyed.len()
    }

    /// Drop every registration in every layer; open scopes stay open
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        for layer in &mut state.layers {
            layer.keyed.clear();
            layer.predicates.clear();
        }
    }

    /// Push a scope layer. Registrations now target the new layer and
    /// shadow same-key recipes below until the scope ends.
    pub async fn begin_scope(&self) -> ScopeHandle {
        let mut state = self.state.write().await;
        let id = state.next_scope_id;
        state.next_scope_id += 1;
        state.layers.push(Layer {
            scope_id: id,
            ..Layer::default()
        });
        tracing::debug!(scope = id, depth = state.layers.len() - 1, "scope opened");
        ScopeHandle { id }
    }

    /// Pop the scope opened by `handle`, discarding its registrations.
    /// Scopes close in LIFO order; anything else is a programming error.
    pub async fn end_scope(&self, handle: ScopeHandle) -> Result<(), InterceptError> {
        let mut state = self.state.write().await;
        let top = state.layers.last().expect("base layer always present");
        if state.layers.len() == 1 {
            tracing::warn!(scope = handle.id, "end_scope with no scope open");
            return Err(InterceptError::ScopeMisuse(format!(
                "no scope is open (handle {})",
                handle.id
            )));
        }
        if top.scope_id != handle.id {
            tracing::warn!(scope = handle.id, top = top.scope_id, "end_scope out of order");
            return Err(InterceptError::ScopeMisuse(format!(
                "scope {} is not the innermost open scope ({} is)",
                handle.id, top.scope_id
            )));
        }
        state.layers.pop();
        tracing::debug!(scope = handle.id, "scope closed");
        Ok(())
    }

    /// Resolve a request to a recipe, if any.
    ///
    /// Canonical recipes win over predicate recipes: the topmost layer with
    /// a covering key whose sub-matchers accept decides. Failing that,
    /// accepting predicate recipes compete by priority, then scope
    /// recency, then registration recency.
    pub async fn lookup(
        &self,
        req: &InterceptedRequest,
    ) -> Result<Option<RecipeHandle>, InterceptError> {
        let state = self.state.read().await;
        let req_key = RequestKey::of(req);

        for layer in state.layers.iter().rev() {
            for entry in layer.keyed.iter().rev() {
                let covered = entry
                    .recipe
                    .key
                    .as_ref()
                    .is_some_and(|key| key.covers(&req_key));
                if !covered {
                    continue;
                }
                if match_all(&entry.recipe.matchers, req)
                    .await
                    .map_err(|err| InterceptError::Callback(Box::new(err)))?
                {
                    tracing::trace!(entry = entry.id, "canonical match");
                    return Ok(Some(RecipeHandle {
                        id: entry.id,
                        recipe: Arc::clone(&entry.recipe),
                    }));
                }
            }
        }

        // rank candidates before evaluating: priority, scope recency,
        // registration recency; first accepting candidate wins
        let mut candidates: Vec<(i64, usize, u64, &Entry)> = Vec::new();
        for (depth, layer) in state.layers.iter().enumerate() {
            for entry in &layer.predicates {
                let priority = entry.recipe.priority.map_or(-1, i64::from);
                candidates.push((priority, depth, entry.id, entry));
            }
        }
        candidates.sort_by(|a, b| (b.0, b.1, b.2).cmp(&(a.0, a.1, a.2)));

        for (_, _, _, entry) in candidates {
            let predicate = entry
                .recipe
                .predicate
                .as_ref()
                .expect("predicate list entries always carry a predicate");
            if !predicate.accepts(req).await {
                continue;
            }
            if match_all(&entry.recipe.matchers, req)
                .await
                .map_err(|err| InterceptError::Callback(Box::new(err)))?
            {
                tracing::trace!(entry = entry.id, "predicate match");
                return Ok(Some(RecipeHandle {
                    id: entry.id,
                    recipe: Arc::clone(&entry.recipe),
                }));
            }
        }

        tracing::trace!(method = %req.method(), uri = %req.uri(), "no recipe matched");
        Ok(None)
    }

    /// Atomically claim a single-use recipe: removes it from whichever
    /// layer still holds it. Returns false when another dispatch got there
    /// first.
    pub(crate) async fn try_claim(&self, handle: &RecipeHandle) -> bool {
        let mut state = self.state.write().await;
        for layer in &mut state.layers {
            let before = layer.keyed.len() + layer.predicates.len();
            layer.keyed.retain(|entry| entry.id != handle.id);
            layer.predicates.retain(|entry| entry.id != handle.id);
            if before != layer.keyed.len() + layer.predicates.len() {
                tracing::debug!(entry = handle.id, "single-use recipe consumed");
                return true;
            }
        }
        false
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
