use crate::{
    Action, ActionStatus, Artifact, DistributionSet, RemoteError, Rollout, RolloutConfig,
    RolloutServer, RolloutSpec, SoftwareModule, Target, TargetFilter,
};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::Path;

const MULTIPART_BOUNDARY: &str = "fleetforge-artifact-boundary-7f3a9c";

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    content: Vec<T>,
}

/// hawkBit Management API client.
///
/// Paths are relative to `{url}/rest/v1/`; every request carries HTTP
/// basic authentication.
pub struct HawkbitClient {
    base: String,
    authorization: String,
    agent: ureq::Agent,
}

impl HawkbitClient {
    pub fn new(config: &RolloutConfig) -> Self {
        let credentials = format!("{}:{}", config.username, config.password);
        Self {
            base: format!("{}/rest/v1", config.url.trim_end_matches('/')),
            authorization: format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ),
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base, endpoint)
    }

    fn read_response(
        url: &str,
        result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<Vec<u8>, RemoteError> {
        let resp = match result {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(RemoteError::Http(e.to_string())),
        };
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(body)
    }

    fn parse<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, RemoteError> {
        serde_json::from_slice(body).map_err(|e| RemoteError::Protocol(format!("{url}: {e}")))
    }

    fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let url = self.url(endpoint);
        tracing::debug!("GET {url}");
        let mut req = self
            .agent
            .get(&url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        let body = Self::read_response(&url, req.call())?;
        Self::parse(&url, &body)
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<T, RemoteError> {
        let url = self.url(endpoint);
        let data =
            serde_json::to_vec(payload).map_err(|e| RemoteError::Serialization(e.to_string()))?;
        tracing::debug!("POST {url} ({} bytes)", data.len());
        let result = self
            .agent
            .post(&url)
            .header("Authorization", &self.authorization)
            .header("Content-Type", "application/json;charset=UTF-8")
            .send(&data[..]);
        let body = Self::read_response(&url, result)?;
        if body.is_empty() {
            // Some endpoints answer with an empty body.
            return Self::parse(&url, b"null");
        }
        Self::parse(&url, &body)
    }

    /// POST endpoints that create one entity answer with a one-element array.
    fn create_one<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<T, RemoteError> {
        let created: Vec<T> = self.post_json(endpoint, &serde_json::Value::Array(vec![payload]))?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Protocol(format!("{endpoint}: empty create response")))
    }

    fn put_json(&self, endpoint: &str, payload: &serde_json::Value) -> Result<(), RemoteError> {
        let url = self.url(endpoint);
        let data =
            serde_json::to_vec(payload).map_err(|e| RemoteError::Serialization(e.to_string()))?;
        tracing::debug!("PUT {url} ({} bytes)", data.len());
        let result = self
            .agent
            .put(&url)
            .header("Authorization", &self.authorization)
            .header("Content-Type", "application/json;charset=UTF-8")
            .send(&data[..]);
        Self::read_response(&url, result)?;
        Ok(())
    }

    fn delete(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<(), RemoteError> {
        let url = self.url(endpoint);
        tracing::debug!("DELETE {url}");
        let mut req = self
            .agent
            .delete(&url)
            .header("Authorization", &self.authorization);
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        Self::read_response(&url, req.call())?;
        Ok(())
    }
}

/// Opening part of a `multipart/form-data` body with a single `file` field.
/// The file content follows, then [`multipart_tail`].
fn multipart_head(file_name: &str) -> String {
    format!(
        "--{MULTIPART_BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n",
        file_name.replace('"', "")
    )
}

fn multipart_tail() -> String {
    format!("\r\n--{MULTIPART_BOUNDARY}--\r\n")
}

impl RolloutServer for HawkbitClient {
    fn find_software_module(
        &self,
        name: &str,
        module_type: &str,
    ) -> Result<Option<SoftwareModule>, RemoteError> {
        let query = format!("name=={name};type=={module_type}");
        let page: Page<SoftwareModule> = self.get("softwaremodules", &[("q", query.as_str())])?;
        Ok(page.content.into_iter().next())
    }

    fn create_software_module(
        &self,
        name: &str,
        version: &str,
        module_type: &str,
    ) -> Result<SoftwareModule, RemoteError> {
        self.create_one(
            "softwaremodules",
            serde_json::json!({ "name": name, "version": version, "type": module_type }),
        )
    }

    fn list_artifacts(&self, module_id: u64) -> Result<Vec<Artifact>, RemoteError> {
        self.get(&format!("softwaremodules/{module_id}/artifacts"), &[])
    }

    fn delete_artifact(&self, module_id: u64, artifact_id: u64) -> Result<(), RemoteError> {
        self.delete(
            &format!("softwaremodules/{module_id}/artifacts/{artifact_id}"),
            &[],
        )
    }

    fn upload_artifact(
        &self,
        module_id: u64,
        file_name: &str,
        path: &Path,
    ) -> Result<Artifact, RemoteError> {
        let url = self.url(&format!("softwaremodules/{module_id}/artifacts"));
        let file = fs::File::open(path)?;
        let size = file.metadata()?.len();
        let head = multipart_head(file_name);
        let tail = multipart_tail();
        let length = head.len() as u64 + size + tail.len() as u64;
        tracing::info!("uploading {file_name} ({size} bytes) to {url}");
        let mut body = head.as_bytes().chain(file).chain(tail.as_bytes());
        let result = self
            .agent
            .post(&url)
            .header("Authorization", &self.authorization)
            .header(
                "Content-Type",
                &format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            )
            .header("Content-Length", &length.to_string())
            .send(ureq::SendBody::from_reader(&mut body));
        let resp = Self::read_response(&url, result)?;
        Self::parse(&url, &resp)
    }

    fn find_distribution_set(&self, name: &str) -> Result<Option<DistributionSet>, RemoteError> {
        let query = format!("name=={name}");
        let page: Page<DistributionSet> = self.get("distributionsets", &[("q", query.as_str())])?;
        Ok(page.content.into_iter().next())
    }

    fn latest_distribution_set(&self) -> Result<Option<DistributionSet>, RemoteError> {
        let page: Page<DistributionSet> = self.get(
            "distributionsets",
            &[("sort", "createdAt:DESC"), ("limit", "1")],
        )?;
        Ok(page.content.into_iter().next())
    }

    fn create_distribution_set(
        &self,
        name: &str,
        version: &str,
        set_type: &str,
        module_ids: &[u64],
    ) -> Result<DistributionSet, RemoteError> {
        let modules: Vec<serde_json::Value> = module_ids
            .iter()
            .map(|id| serde_json::json!({ "id": id }))
            .collect();
        self.create_one(
            "distributionsets",
            serde_json::json!({
                "name": name,
                "version": version,
                "type": set_type,
                "modules": modules,
            }),
        )
    }

    fn list_target_filters(&self) -> Result<Vec<TargetFilter>, RemoteError> {
        let page: Page<TargetFilter> = self.get("targetfilters", &[("limit", "500")])?;
        Ok(page.content)
    }

    fn create_target_filter(&self, name: &str, query: &str) -> Result<TargetFilter, RemoteError> {
        // Unlike the other creates, this endpoint takes and returns one object.
        self.post_json(
            "targetfilters",
            &serde_json::json!({ "name": name, "query": query }),
        )
    }

    fn set_auto_assign(
        &self,
        filter_id: u64,
        distribution_id: u64,
        action_type: &str,
    ) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.post_json(
            &format!("targetfilters/{filter_id}/autoAssignDS"),
            &serde_json::json!({
                "id": distribution_id,
                "type": action_type,
                "weight": 0,
                "confirmationRequired": false,
            }),
        )?;
        Ok(())
    }

    fn targets_matching(&self, query: &str) -> Result<Vec<Target>, RemoteError> {
        let page: Page<Target> = self.get("targets", &[("q", query), ("limit", "500")])?;
        Ok(page.content)
    }

    fn assign_distribution(
        &self,
        controller_id: &str,
        distribution_id: u64,
        action_type: &str,
    ) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.post_json(
            &format!("targets/{controller_id}/assignedDS"),
            &serde_json::json!([{ "id": distribution_id, "type": action_type }]),
        )?;
        Ok(())
    }

    fn cancel_action(&self, controller_id: &str, action_id: u64) -> Result<(), RemoteError> {
        self.delete(
            &format!("targets/{controller_id}/actions/{action_id}"),
            &[("force", "true")],
        )
    }

    fn list_rollouts(&self) -> Result<Vec<Rollout>, RemoteError> {
        let page: Page<Rollout> = self.get("rollouts", &[("limit", "500")])?;
        Ok(page.content)
    }

    fn delete_rollout(&self, rollout_id: u64) -> Result<(), RemoteError> {
        self.delete(&format!("rollouts/{rollout_id}"), &[])
    }

    fn create_rollout(&self, spec: &RolloutSpec) -> Result<Rollout, RemoteError> {
        let mut payload = serde_json::json!({
            "name": spec.name,
            "distributionSetId": spec.distribution_id,
            "targetFilterQuery": spec.target_filter_query,
            "type": spec.action_type,
            "weight": 0,
            "confirmationRequired": false,
            "amountGroups": 1,
        });
        if let Some(start_at) = spec.start_at {
            payload["startAt"] = serde_json::json!(start_at);
        }
        self.post_json("rollouts", &payload)
    }

    fn set_system_config(&self, key: &str, value: serde_json::Value) -> Result<(), RemoteError> {
        self.put_json(
            &format!("system/configs/{key}"),
            &serde_json::json!({ "value": value }),
        )
    }

    fn target_actions(&self, controller_id: &str) -> Result<Vec<Action>, RemoteError> {
        let page: Page<Action> = self.get(
            &format!("targets/{controller_id}/actions"),
            &[("limit", "10"), ("sort", "id:DESC")],
        )?;
        Ok(page.content)
    }

    fn action_status(
        &self,
        controller_id: &str,
        action_id: u64,
    ) -> Result<Vec<ActionStatus>, RemoteError> {
        let page: Page<ActionStatus> = self.get(
            &format!("targets/{controller_id}/actions/{action_id}/status"),
            &[("offset", "0"), ("limit", "50"), ("sort", "id:DESC")],
        )?;
        Ok(page.content)
    }
}
