//! OAuth2 provider descriptions and the code-for-profile exchange.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use url::Url;

use specgate_core::{Error, Result};
use specgate_http::HttpClient;

/// One configured OAuth2 provider.
#[derive(Debug, Clone)]
pub struct OAuth2Provider {
    pub name: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub profile_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    /// Base URL the provider redirects back to; the login endpoint path
    /// is appended.
    pub redirect_base: Option<Url>,
}

struct ProviderDefaults {
    auth: &'static str,
    token: &'static str,
    profile: &'static str,
    scope: &'static str,
}

fn defaults_for(name: &str) -> Option<ProviderDefaults> {
    match name {
        "google" => Some(ProviderDefaults {
            auth: "https://accounts.google.com/o/oauth2/v2/auth",
            token: "https://oauth2.googleapis.com/token",
            profile: "https://www.googleapis.com/oauth2/v2/userinfo",
            scope: "openid email profile",
        }),
        "github" => Some(ProviderDefaults {
            auth: "https://github.com/login/oauth/authorize",
            token: "https://github.com/login/oauth/access_token",
            profile: "https://api.github.com/user",
            scope: "user:email",
        }),
        "facebook" => Some(ProviderDefaults {
            auth: "https://www.facebook.com/v12.0/dialog/oauth",
            token: "https://graph.facebook.com/v12.0/oauth/access_token",
            profile: "https://graph.facebook.com/me?fields=id,name,email",
            scope: "email",
        }),
        _ => None,
    }
}

fn url_key(config: &Value, key: &str, default: Option<&str>) -> Result<Url> {
    let raw = config
        .get(key)
        .and_then(|v| v.as_str())
        .or(default)
        .ok_or_else(|| Error::Validation(format!("OAuth2 provider missing '{key}'")))?;
    Url::parse(raw).map_err(|e| Error::Validation(format!("invalid {key} '{raw}': {e}")))
}

impl OAuth2Provider {
    pub fn from_config(name: &str, config: &Value) -> Result<OAuth2Provider> {
        let defaults = defaults_for(name);

        let redirect_base = match config.get("redirect-base").and_then(|v| v.as_str()) {
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|e| Error::Validation(format!("invalid redirect-base: {e}")))?,
            ),
            None => None,
        };

        Ok(OAuth2Provider {
            name: name.to_string(),
            auth_url: url_key(config, "auth-url", defaults.as_ref().map(|d| d.auth))?,
            token_url: url_key(config, "token-url", defaults.as_ref().map(|d| d.token))?,
            profile_url: url_key(config, "profile-url", defaults.as_ref().map(|d| d.profile))?,
            client_id: config
                .get("client-id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            client_secret: config
                .get("client-secret")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            scope: config
                .get("scope")
                .and_then(|v| v.as_str())
                .or(defaults.as_ref().map(|d| d.scope))
                .unwrap_or("")
                .to_string(),
            redirect_base,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
    }

    fn redirect_uri(&self, callback_path: &str) -> Option<String> {
        let base = self.redirect_base.as_ref()?;
        base.join(callback_path).ok().map(|u| u.to_string())
    }

    /// The provider URL the browser is sent to, carrying the session id
    /// as `state`.
    pub fn authorize_url(&self, callback_path: &str, state: &str) -> Url {
        let mut url = self.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("response_type", "code");
            if !self.scope.is_empty() {
                query.append_pair("scope", &self.scope);
            }
            query.append_pair("state", state);
            if let Some(redirect_uri) = self.redirect_uri(callback_path) {
                query.append_pair("redirect_uri", &redirect_uri);
            }
        }
        url
    }

    /// Exchange the authorization code and fetch the user profile.
    pub async fn verify(
        &self,
        client: &HttpClient,
        code: &str,
        callback_path: &str,
    ) -> Result<Value> {
        let redirect_uri = self.redirect_uri(callback_path).unwrap_or_default();
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ];
        if !redirect_uri.is_empty() {
            params.push(("redirect_uri", redirect_uri.as_str()));
        }

        let response = client.post_form(&self.token_url, &params).await?;
        if !response.is_success() {
            return Err(Error::Upstream(format!(
                "OAuth2 token exchange failed with {}",
                response.status
            )));
        }

        // Token responses are JSON or form-encoded depending on provider
        let token = match response.json() {
            Ok(body) => body
                .get("access_token")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(_) => response
                .form()
                .into_iter()
                .find(|(k, _)| k == "access_token")
                .map(|(_, v)| v),
        }
        .ok_or_else(|| Error::Upstream("OAuth2 response carried no access token".into()))?;

        debug!("fetching {} profile", self.name);
        let auth = format!("Bearer {token}");
        let response = client
            .get_with_headers(
                &self.profile_url,
                &[
                    ("Authorization", auth.as_str()),
                    ("Accept", "application/json"),
                    ("User-Agent", "specgate"),
                ],
            )
            .await?;
        if !response.is_success() {
            return Err(Error::Upstream(format!(
                "OAuth2 profile fetch failed with {}",
                response.status
            )));
        }

        let mut profile = response.json()?;
        if let Some(map) = profile.as_object_mut() {
            map.insert("provider".into(), Value::from(self.name.clone()));
        }
        Ok(profile)
    }
}

/// The configured provider table.
#[derive(Default)]
pub struct OAuth2Providers {
    providers: HashMap<String, Arc<OAuth2Provider>>,
}

impl OAuth2Providers {
    pub fn from_config(config: &Value) -> Result<OAuth2Providers> {
        let mut providers = HashMap::new();

        if let Some(map) = config.as_object() {
            for (name, provider_config) in map {
                providers.insert(
                    name.clone(),
                    Arc::new(OAuth2Provider::from_config(name, provider_config)?),
                );
            }
        }

        Ok(OAuth2Providers { providers })
    }

    pub fn get(&self, name: &str) -> Option<Arc<OAuth2Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
