use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Header carrying the acting user's id.
pub const ACTOR_HEADER: &str = "X-Isle-Actor";

/// The acting user, stored in request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorContext(pub String);

/// Resolves the actor from `X-Isle-Actor`.
///
/// Authentication happens upstream; this layer only refuses requests that
/// arrive without an actor.
pub async fn actor_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let actor = req
        .headers()
        .get(ACTOR_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_str()
        .map_err(|_| StatusCode::UNAUTHORIZED)?
        .trim()
        .to_string();

    if actor.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    req.extensions_mut().insert(ActorContext(actor));
    Ok(next.run(req).await)
}
