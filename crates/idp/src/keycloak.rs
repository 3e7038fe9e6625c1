//! Keycloak admin REST client over reqwest.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hubkit_core::{HubError, HubResult, KeycloakSettings};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{GroupRepresentation, IdentityProvider, RoleRepresentation, UserRepresentation};

/// Refresh this long before the token actually expires.
const TOKEN_SKEW: Duration = Duration::from_secs(10);

enum Auth {
    Static(String),
    ClientCredentials { client_id: String, client_secret: String },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

pub struct KeycloakAdmin {
    http: Client,
    base: Url,
    realm: String,
    auth: Auth,
    token: Mutex<Option<CachedToken>>,
}

fn status_error(status: StatusCode, what: &str, name: &str, body: &str) -> HubError {
    match status {
        StatusCode::NOT_FOUND => HubError::not_found(what, name),
        StatusCode::CONFLICT => HubError::ResourceConflict(format!("{what} {name}")),
        _ => HubError::ApiUnavailable(format!("{what} {name}: {status} {body}")),
    }
}

impl KeycloakAdmin {
    pub fn new(settings: &KeycloakSettings) -> HubResult<Self> {
        let base = Url::parse(&settings.base_url)
            .map_err(|e| HubError::Invalid(format!("keycloak url {}: {e}", settings.base_url)))?;
        let auth = match (&settings.token, &settings.client_secret) {
            (Some(token), _) => Auth::Static(token.clone()),
            (None, Some(secret)) => {
                Auth::ClientCredentials { client_id: settings.client_id.clone(), client_secret: secret.clone() }
            }
            (None, None) => {
                return Err(HubError::Invalid("keycloak needs either a static token or a client secret".into()))
            }
        };
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| HubError::Invalid(format!("http client: {e}")))?;
        Ok(Self { http, base, realm: settings.realm.clone(), auth, token: Mutex::new(None) })
    }

    fn url(&self, segments: &[&str]) -> HubResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HubError::Invalid(format!("keycloak url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn admin_url(&self, segments: &[&str]) -> HubResult<Url> {
        let mut all = vec!["admin", "realms", self.realm.as_str()];
        all.extend_from_slice(segments);
        self.url(&all)
    }

    async fn bearer(&self) -> HubResult<String> {
        let (client_id, client_secret) = match &self.auth {
            Auth::Static(token) => return Ok(token.clone()),
            Auth::ClientCredentials { client_id, client_secret } => (client_id, client_secret),
        };
        let mut cached = self.token.lock().await;
        if let Some(tok) = cached.as_ref() {
            if Instant::now() < tok.expires_at {
                return Ok(tok.value.clone());
            }
        }
        let url = self.url(&["realms", &self.realm, "protocol", "openid-connect", "token"])?;
        let resp = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "keycloak: token request failed");
                HubError::ApiUnavailable(format!("token: {e}"))
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            error!(%status, "keycloak: token rejected");
            return Err(HubError::ApiUnavailable(format!("token: {status}")));
        }
        let body: TokenResponse =
            resp.json().await.map_err(|e| HubError::Decode(format!("token response: {e}")))?;
        let ttl = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_SKEW);
        debug!(ttl_secs = ttl.as_secs(), "keycloak: token refreshed");
        *cached = Some(CachedToken { value: body.access_token.clone(), expires_at: Instant::now() + ttl });
        Ok(body.access_token)
    }

    async fn send(&self, req: RequestBuilder, what: &str, name: &str) -> HubResult<Response> {
        let token = self.bearer().await?;
        let resp = req.bearer_auth(token).send().await.map_err(|e| {
            error!(resource = what, name, error = %e, "keycloak: request failed");
            HubError::ApiUnavailable(format!("{what} {name}: {e}"))
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let err = status_error(status, what, name, &body);
        if !err.is_not_found() {
            error!(resource = what, name, %status, "keycloak: request rejected");
        }
        Err(err)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url)
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response, what: &str) -> HubResult<T> {
        resp.json().await.map_err(|e| HubError::Decode(format!("{what}: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for KeycloakAdmin {
    async fn create_role(&self, name: &str) -> HubResult<()> {
        let req = self.request(Method::POST, self.admin_url(&["roles"])?).json(&RoleRepresentation::named(name));
        self.send(req, "role", name).await?;
        info!(role = name, "keycloak: role created");
        Ok(())
    }

    async fn find_role_by_name(&self, name: &str) -> HubResult<Option<RoleRepresentation>> {
        let req = self.request(Method::GET, self.admin_url(&["roles", name])?);
        match self.send(req, "role", name).await {
            Ok(resp) => Ok(Some(Self::json(resp, "role").await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_role_by_name(&self, name: &str) -> HubResult<()> {
        let req = self.request(Method::DELETE, self.admin_url(&["roles", name])?);
        self.send(req, "role", name).await?;
        info!(role = name, "keycloak: role deleted");
        Ok(())
    }

    async fn find_groups(&self, max: Option<u32>) -> HubResult<Vec<GroupRepresentation>> {
        let mut req = self.request(Method::GET, self.admin_url(&["groups"])?);
        if let Some(max) = max {
            req = req.query(&[("max", max)]);
        }
        let resp = self.send(req, "groups", "").await?;
        Self::json(resp, "groups").await
    }

    async fn find_group(&self, id: &str) -> HubResult<Option<GroupRepresentation>> {
        let req = self.request(Method::GET, self.admin_url(&["groups", id])?);
        match self.send(req, "group", id).await {
            Ok(resp) => Ok(Some(Self::json(resp, "group").await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_group(&self, name: &str, attributes: BTreeMap<String, Vec<String>>) -> HubResult<String> {
        let group = GroupRepresentation { name: name.to_string(), attributes, ..Default::default() };
        let req = self.request(Method::POST, self.admin_url(&["groups"])?).json(&group);
        let resp = self.send(req, "group", name).await?;
        // 201 Created carries `Location: .../groups/{id}`
        let id = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| HubError::Decode(format!("group {name}: no Location header")))?;
        info!(group = name, id = %id, "keycloak: group created");
        Ok(id)
    }

    async fn delete_group(&self, id: &str) -> HubResult<()> {
        let req = self.request(Method::DELETE, self.admin_url(&["groups", id])?);
        self.send(req, "group", id).await?;
        info!(group = id, "keycloak: group deleted");
        Ok(())
    }

    async fn list_group_members(&self, id: &str) -> HubResult<Vec<UserRepresentation>> {
        let req = self.request(Method::GET, self.admin_url(&["groups", id, "members"])?);
        let resp = self.send(req, "group", id).await?;
        Self::json(resp, "group members").await
    }

    async fn list_group_role_mappings(&self, group_id: &str) -> HubResult<Vec<RoleRepresentation>> {
        let req = self.request(Method::GET, self.admin_url(&["groups", group_id, "role-mappings", "realm"])?);
        let resp = self.send(req, "group", group_id).await?;
        Self::json(resp, "role mappings").await
    }

    async fn add_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()> {
        let req =
            self.request(Method::POST, self.admin_url(&["groups", group_id, "role-mappings", "realm"])?).json(roles);
        self.send(req, "group", group_id).await?;
        debug!(group = group_id, count = roles.len(), "keycloak: role mappings added");
        Ok(())
    }

    async fn remove_group_role_mappings(&self, group_id: &str, roles: &[RoleRepresentation]) -> HubResult<()> {
        let req =
            self.request(Method::DELETE, self.admin_url(&["groups", group_id, "role-mappings", "realm"])?).json(roles);
        self.send(req, "group", group_id).await?;
        debug!(group = group_id, count = roles.len(), "keycloak: role mappings removed");
        Ok(())
    }
}
