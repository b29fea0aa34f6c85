//! Scoped overrides and registration-snapshot semantics

use interpose::hyper::{HeaderMap, Method, StatusCode};
use interpose::{dispatch, BodyBuffer, InterceptError, InterceptedRequest, RecipeBuilder, Registry};

fn get(uri: &str) -> InterceptedRequest {
    InterceptedRequest::new(
        Method::GET,
        uri.parse().unwrap(),
        HeaderMap::new(),
        BodyBuffer::empty(),
    )
}

async fn body_of(registry: &Registry, uri: &str) -> Vec<u8> {
    dispatch(registry, &get(uri))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn scope_override_restores_outer_recipe() -> Result<(), InterceptError> {
    let registry = Registry::new();
    RecipeBuilder::new()
        .for_host("api.example")
        .with_content(r#"{"v":1}"#)
        .register_with(&registry)
        .await?;

    let scope = registry.begin_scope().await;
    RecipeBuilder::new()
        .for_host("api.example")
        .with_content(r#"{"v":2}"#)
        .register_with(&registry)
        .await?;

    assert_eq!(body_of(&registry, "https://api.example/").await, br#"{"v":2}"#);

    registry.end_scope(scope).await?;
    assert_eq!(body_of(&registry, "https://api.example/").await, br#"{"v":1}"#);
    Ok(())
}

#[tokio::test]
async fn scope_additions_vanish_on_end_scope() -> Result<(), InterceptError> {
    let registry = Registry::new();
    let scope = registry.begin_scope().await;
    RecipeBuilder::new()
        .for_host("inner.example")
        .with_status(StatusCode::CREATED)
        .register_with(&registry)
        .await?;

    assert_eq!(
        dispatch(&registry, &get("https://inner.example/")).await?.status,
        StatusCode::CREATED
    );

    registry.end_scope(scope).await?;

    // permissive default takes over: the inner recipe is gone for good
    let after = dispatch(&registry, &get("https://inner.example/")).await?;
    assert_eq!(after.status, StatusCode::OK);
    assert!(after.bytes().await.unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn nested_scopes_unwind_in_order() -> Result<(), InterceptError> {
    let registry = Registry::new();
    RecipeBuilder::new()
        .for_host("api.example")
        .with_content("base")
        .register_with(&registry)
        .await?;

    let outer = registry.begin_scope().await;
    RecipeBuilder::new()
        .for_host("api.example")
        .with_content("outer")
        .register_with(&registry)
        .await?;

    let inner = registry.begin_scope().await;
    RecipeBuilder::new()
        .for_host("api.example")
        .with_content("inner")
        .register_with(&registry)
        .await?;

    assert_eq!(body_of(&registry, "https://api.example/").await, b"inner");
    registry.end_scope(inner).await?;
    assert_eq!(body_of(&registry, "https://api.example/").await, b"outer");
    registry.end_scope(outer).await?;
    assert_eq!(body_of(&registry, "https://api.example/").await, b"base");
    Ok(())
}

#[tokio::test]
async fn registration_snapshots_ignore_later_builder_mutation() -> Result<(), InterceptError> {
    let registry = Registry::new();
    let builder = RecipeBuilder::new()
        .for_uri("https://api.example/resource")
        .with_status(StatusCode::OK)
        .with_content("first");
    builder.register_with(&registry).await?;

    // mutate the same builder for a follow-up registration elsewhere;
    // the recipe already installed must not move
    let builder = builder
        .for_uri("https://api.example/other")
        .with_status(StatusCode::ACCEPTED)
        .with_content("second");

    let untouched = dispatch(&registry, &get("https://api.example/resource")).await?;
    assert_eq!(untouched.status, StatusCode::OK);
    assert_eq!(untouched.bytes().await.unwrap().as_ref(), b"first");

    builder.register_with(&registry).await?;
    let added = dispatch(&registry, &get("https://api.example/other")).await?;
    assert_eq!(added.status, StatusCode::ACCEPTED);
    assert_eq!(added.bytes().await.unwrap().as_ref(), b"second");

    // and the original is still what it was at its registration
    let still = dispatch(&registry, &get("https://api.example/resource")).await?;
    assert_eq!(still.bytes().await.unwrap().as_ref(), b"first");
    Ok(())
}

#[tokio::test]
async fn end_scope_out_of_order_fails_fast() {
    let registry = Registry::new();
    let outer = registry.begin_scope().await;
    let inner = registry.begin_scope().await;

    match registry.end_scope(outer).await {
        Err(InterceptError::ScopeMisuse(msg)) => {
            assert!(msg.contains("not the innermost"));
        }
        other => panic!("expected ScopeMisuse, got {:?}", other),
    }
    registry.end_scope(inner).await.unwrap();
}

#[tokio::test]
async fn deregistered_recipe_stops_matching() -> Result<(), InterceptError> {
    let registry = Registry::new();
    let handle = RecipeBuilder::new()
        .for_host("api.example")
        .with_content("here")
        .register_with(&registry)
        .await?;

    assert_eq!(body_of(&registry, "https://api.example/").await, b"here");
    assert!(registry.deregister(&handle).await);
    assert!(body_of(&registry, "https://api.example/").await.is_empty());
    Ok(())
}
