// ABOUTME: Org-admin Webex client driven by a room's OAuth access token
// ABOUTME: Verifies admin rights, finds or creates workspaces and requests device activation codes

use anyhow::{Context, Result};
use async_trait::async_trait;
use boardbot_core::{OrgAdmin, OrgInspection, Workspace};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{ensure_success, http_client, join_url, ItemList};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Me {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    org_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Organization {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkspace {
    id: String,
    #[serde(default)]
    display_name: String,
}

impl From<RawWorkspace> for Workspace {
    fn from(raw: RawWorkspace) -> Self {
        Workspace {
            id: raw.id,
            display_name: raw.display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActivationCode {
    code: String,
}

/// Calls the admin APIs on behalf of whoever authorized the room
pub struct WebexAdmin {
    http: reqwest::Client,
    api_base: String,
}

impl WebexAdmin {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            api_base: api_base.into(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .http
            .get(join_url(&self.api_base, path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        ensure_success(response, &format!("GET {path}"))
            .await?
            .json()
            .await
            .with_context(|| format!("GET {path} returned an unexpected body"))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(join_url(&self.api_base, path))
            .bearer_auth(token)
            .query(query)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        ensure_success(response, &format!("POST {path}"))
            .await?
            .json()
            .await
            .with_context(|| format!("POST {path} returned an unexpected body"))
    }
}

#[async_trait]
impl OrgAdmin for WebexAdmin {
    async fn inspect(&self, access_token: &str) -> Result<OrgInspection> {
        let me: Me = self.get(access_token, "people/me", &[]).await?;
        let org_name = match self
            .get::<Organization>(access_token, &format!("organizations/{}", me.org_id), &[])
            .await
        {
            Ok(org) if !org.display_name.is_empty() => org.display_name,
            Ok(_) => me.org_id.clone(),
            Err(e) => {
                tracing::warn!(org_id = %me.org_id, error = %e, "Could not read organization name");
                me.org_id.clone()
            }
        };

        // Only admins can list the org's workspaces
        let has_admin_access = !me.org_id.is_empty()
            && self
                .get::<ItemList<RawWorkspace>>(access_token, "workspaces", &[("orgId", me.org_id.as_str())])
                .await
                .inspect_err(|e| tracing::info!(error = %e, "Token cannot list workspaces"))
                .is_ok();

        Ok(OrgInspection {
            admin_name: me.display_name,
            admin_email: me.emails.into_iter().next().unwrap_or_default(),
            org_id: me.org_id,
            org_name,
            has_admin_access,
        })
    }

    async fn list_workspaces(&self, access_token: &str, org_id: &str) -> Result<Vec<Workspace>> {
        let list: ItemList<RawWorkspace> = self
            .get(access_token, "workspaces", &[("orgId", org_id)])
            .await?;
        Ok(list.items.into_iter().map(Workspace::from).collect())
    }

    async fn ensure_workspace(
        &self,
        access_token: &str,
        org_id: &str,
        display_name: &str,
    ) -> Result<Workspace> {
        let found: ItemList<RawWorkspace> = self
            .get(
                access_token,
                "workspaces",
                &[("orgId", org_id), ("displayName", display_name)],
            )
            .await?;
        if let Some(existing) = found
            .items
            .into_iter()
            .find(|w| w.display_name == display_name)
        {
            tracing::debug!(workspace_id = %existing.id, "Workspace exists");
            return Ok(existing.into());
        }

        tracing::info!(org_id = %org_id, workspace = %display_name, "Creating workspace");
        let created: RawWorkspace = self
            .post(
                access_token,
                "workspaces",
                &[],
                json!({ "displayName": display_name, "orgId": org_id }),
            )
            .await?;
        Ok(created.into())
    }

    async fn activation_code(
        &self,
        access_token: &str,
        org_id: &str,
        workspace_id: &str,
    ) -> Result<String> {
        let activation: ActivationCode = self
            .post(
                access_token,
                "devices/activationCode",
                &[("orgId", org_id)],
                json!({ "workspaceId": workspace_id }),
            )
            .await?;
        Ok(activation.code)
    }
}
