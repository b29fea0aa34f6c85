//! Turns an outgoing request into a synthesized response

use crate::error::InterceptError;
use crate::recipe::InterceptedResponse;
use crate::registry::Registry;
use crate::request::InterceptedRequest;

/// Dispatch one request against the registry.
///
/// The request's cancellation signal is honored at every suspension point:
/// a signal that is already fired short-circuits before any user code runs,
/// and one that fires mid-callback propagates [`InterceptError::Cancelled`]
/// instead of a half-built response.
#[tracing::instrument(skip_all, fields(http.method = %request.method(), http.uri = %request.uri()))]
pub async fn dispatch(
    registry: &Registry,
    request: &InterceptedRequest,
) -> Result<InterceptedResponse, InterceptError> {
    if request.cancellation().is_cancelled() {
        return Err(InterceptError::Cancelled);
    }

    loop {
        let Some(handle) = registry.lookup(request).await? else {
            return missing_recipe(registry, request).await;
        };
        let recipe = handle.recipe();

        // Claim single-use recipes before running user code so a dispatch
        // race cannot synthesize two responses from one registration. A
        // lost claim means another dispatch consumed it: resolve again.
        if !recipe.is_reusable() && !registry.try_claim(&handle).await {
            tracing::debug!("lost claim on single-use recipe, retrying lookup");
            continue;
        }

        if let Some(callback) = &recipe.callback {
            tokio::select! {
                _ = request.cancellation().cancelled() => return Err(InterceptError::Cancelled),
                outcome = callback.invoke(request, recipe.user_data()) => {
                    outcome.map_err(InterceptError::Callback)?;
                }
            }
        }

        if let Some(delay) = recipe.delay {
            tokio::select! {
                _ = request.cancellation().cancelled() => return Err(InterceptError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut response = recipe.synthesize(request).await?;
        for mutator in registry.mutators() {
            mutator(&mut response);
        }
        recipe.record_hit();
        tracing::debug!(status = %response.status, "request intercepted");
        return Ok(response);
    }
}

async fn missing_recipe(
    registry: &Registry,
    request: &InterceptedRequest,
) -> Result<InterceptedResponse, InterceptError> {
    if let Some(fallback) = registry.missing_fallback() {
        let produced = tokio::select! {
            _ = request.cancellation().cancelled() => return Err(InterceptError::Cancelled),
            produced = fallback(request.clone()) => produced,
        };
        if let Some(response) = produced {
            tracing::debug!(status = %response.status, "missing-recipe fallback produced a response");
            return Ok(response);
        }
    }
    if registry.is_strict() {
        tracing::debug!("unmatched request in strict mode");
        return Err(InterceptError::UnmatchedRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
        });
    }
    // permissive mode keeps the legacy default: empty 200
    Ok(InterceptedResponse::empty_ok())
}
