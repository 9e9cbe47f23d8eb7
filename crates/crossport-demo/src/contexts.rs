//! The two demo contexts.
//!
//! `Background` owns the logged-in user and publishes it along with
//! `login`/`logout`. `Options` binds that user into its own scope and drives
//! a login through the published method.

use anyhow::{Context, Result};
use crossport_core::{sync_method, Messenger, PublishOptions, Scope};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const BACKGROUND: &str = "Background";
pub const OPTIONS: &str = "Options";

const USER: &str = "user";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

fn is_logged_in(user: &Value) -> bool {
    user.get("email").and_then(Value::as_str).is_some()
}

/// Publish the background context's state and methods.
///
/// Returns the scope holding `user`.
pub fn start_background(messenger: &Messenger) -> Result<Scope> {
    let scope = Scope::new();
    scope.declare(USER, json!({}));

    let login_scope = scope.clone();
    messenger.publish(
        "login",
        sync_method(move |user| {
            if !is_logged_in(&user) {
                return Err(json!("login requires an email"));
            }
            info!("Logging in {}", user["email"]);
            login_scope
                .set(USER, user.clone())
                .map(|_| user)
                .map_err(|e| Value::String(e.to_string()))
        }),
        PublishOptions::default(),
    )?;

    let logout_scope = scope.clone();
    messenger.publish(
        "logout",
        sync_method(move |_| {
            logout_scope
                .set(USER, json!({}))
                .map(|_| Value::Null)
                .map_err(|e| Value::String(e.to_string()))
        }),
        PublishOptions::default(),
    )?;

    messenger.publish_variable(&scope, USER)?;
    debug!("Background published {:?}", messenger.registry().published());

    Ok(scope)
}

/// Bind the background user, log in, and wait for the login to come back
/// through the binding.
pub async fn run_options(messenger: &Messenger, email: &str, name: &str) -> Result<Value> {
    let scope = Scope::new();
    scope.declare(USER, json!({}));

    let initial = messenger
        .bind_variable(BACKGROUND, USER)
        .to(&scope, USER)?
        .await
        .context("Failed to bind the background user")?;
    info!("Bound {}.{}: {}", BACKGROUND, USER, initial);

    let mut user = scope.watch(USER)?;
    messenger
        .call_method(BACKGROUND, "login", json!({ "email": email, "name": name }))
        .await
        .context("Login was rejected")?;

    let logged_in = tokio::time::timeout(LOGIN_TIMEOUT, user.wait_for(is_logged_in))
        .await
        .context("Timed out waiting for the login to reach the bound user")??
        .clone();

    Ok(logged_in)
}
