pub mod oauth2;
pub mod saml;
pub mod session;

use axum::response::Redirect;

use crate::error::FederationError;
use crate::models::User;
use crate::services::IssuedToken;
use crate::AppState;

/// Session token for a user who just completed a federated login. The
/// token carries the organization the user now belongs to.
pub(crate) fn issue_session(state: &AppState, user: &User) -> Result<IssuedToken, FederationError> {
    Ok(state.tokens.issue(user, user.organization_id)?)
}

/// 303 to the frontend callback page with the token (and the sanitized
/// landing path, when one was requested) in the query string.
pub(crate) fn frontend_redirect(
    frontend_callback_url: &str,
    token: &str,
    redirect_to: Option<&str>,
) -> Redirect {
    let separator = if frontend_callback_url.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}token={}",
        frontend_callback_url,
        separator,
        urlencoding::encode(token)
    );
    if let Some(path) = redirect_to {
        url.push_str("&redirect_to=");
        url.push_str(&urlencoding::encode(path));
    }
    Redirect::to(&url)
}
