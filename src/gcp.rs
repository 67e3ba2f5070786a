use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::process::Command as AsyncCommand;

use crate::types::{
    Database, ExportContext, ExportRequest, ImportContext, ImportRequest, ListResponse,
    NewInstance, Operation, Policy, Secret, SqlInstance, User,
};

const SQL_ADMIN_URL: &str = "https://sqladmin.googleapis.com/v1";
const STORAGE_URL: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_UPLOAD_URL: &str = "https://storage.googleapis.com/upload/storage/v1";
const SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com/v1";

/// Cloud SQL Admin API calls used by backup and restore.
#[mockall::automock]
#[async_trait]
pub trait SqlAdmin: Send + Sync {
    async fn list_instances(&self, project: &str) -> Result<Vec<SqlInstance>>;
    async fn get_instance(&self, project: &str, instance: &str) -> Result<Option<SqlInstance>>;
    async fn insert_instance(&self, project: &str, instance: &NewInstance) -> Result<Operation>;
    async fn delete_instance(&self, project: &str, instance: &str) -> Result<Operation>;
    async fn list_databases(&self, project: &str, instance: &str) -> Result<Vec<Database>>;
    async fn get_database(
        &self,
        project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Option<Database>>;
    async fn insert_database(
        &self,
        project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Operation>;
    async fn list_users(&self, project: &str, instance: &str) -> Result<Vec<User>>;
    async fn insert_user(&self, project: &str, instance: &str, user: &User) -> Result<Operation>;
    async fn export(
        &self,
        project: &str,
        instance: &str,
        context: &ExportContext,
    ) -> Result<Operation>;
    async fn import(
        &self,
        project: &str,
        instance: &str,
        context: &ImportContext,
    ) -> Result<Operation>;
    async fn get_operation(&self, project: &str, operation: &str) -> Result<Operation>;
}

/// Bucket IAM policy access.
#[mockall::automock]
#[async_trait]
pub trait BucketIam: Send + Sync {
    async fn get_bucket_policy(&self, bucket: &str) -> Result<Policy>;
    async fn set_bucket_policy(&self, bucket: &str, policy: &Policy) -> Result<Policy>;
}

/// Flat object storage used for the user list and statistics artifacts.
#[mockall::automock]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write_object(&self, bucket: &str, name: &str, data: Vec<u8>) -> Result<()>;
    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>>;
    /// `Ok(false)` only when the object is known not to exist.
    async fn object_exists(&self, bucket: &str, name: &str) -> Result<bool>;
}

/// Secret storage for restore root credentials. `id` is the short secret id.
#[mockall::automock]
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, project: &str, id: &str) -> Result<Option<Secret>>;
    async fn delete_secret(&self, name: &str) -> Result<()>;
    async fn create_secret(&self, project: &str, id: &str, replica_location: &str)
        -> Result<Secret>;
    async fn add_secret_version(&self, name: &str, payload: &[u8]) -> Result<()>;
    async fn access_latest_version(&self, project: &str, id: &str) -> Result<Option<Vec<u8>>>;
}

pub struct GcpClient {
    client: Client,
}

impl Default for GcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GcpClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn get_access_token(&self) -> Result<String> {
        let output = AsyncCommand::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .context("failed to run gcloud")?;

        if !output.status.success() {
            return Err(anyhow!("Failed to get access token"));
        }

        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.get_access_token().await?;
        Ok(request.bearer_auth(&token).send().await?)
    }

    /// Sends the request and decodes the body, mapping 404 to `None`.
    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Option<T>> {
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::decode(response, what).await?))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self.send(request).await?;
        Self::decode(response, what).await
    }

    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed ({}): {}", what, status, error_text));
        }
        response
            .json()
            .await
            .with_context(|| format!("{what}: unexpected response body"))
    }

    fn sql_url(project: &str, rest: &str) -> String {
        format!("{SQL_ADMIN_URL}/projects/{project}/{rest}")
    }

    fn object_url(base: &str, bucket: &str, name: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(base)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("invalid storage url {}", base))?;
            segments.extend(["b", bucket, "o"]);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SqlAdmin for GcpClient {
    async fn list_instances(&self, project: &str) -> Result<Vec<SqlInstance>> {
        let url = Self::sql_url(project, "instances");
        let list: ListResponse<SqlInstance> =
            self.fetch(self.client.get(&url), "List SQL instances").await?;
        Ok(list.items)
    }

    async fn get_instance(&self, project: &str, instance: &str) -> Result<Option<SqlInstance>> {
        let url = Self::sql_url(project, &format!("instances/{instance}"));
        self.fetch_optional(self.client.get(&url), "Get SQL instance")
            .await
    }

    async fn insert_instance(&self, project: &str, instance: &NewInstance) -> Result<Operation> {
        let url = Self::sql_url(project, "instances");
        self.fetch(self.client.post(&url).json(instance), "Create instance")
            .await
    }

    async fn delete_instance(&self, project: &str, instance: &str) -> Result<Operation> {
        let url = Self::sql_url(project, &format!("instances/{instance}"));
        self.fetch(self.client.delete(&url), "Delete instance").await
    }

    async fn list_databases(&self, project: &str, instance: &str) -> Result<Vec<Database>> {
        let url = Self::sql_url(project, &format!("instances/{instance}/databases"));
        let list: ListResponse<Database> =
            self.fetch(self.client.get(&url), "List databases").await?;
        Ok(list.items)
    }

    async fn get_database(
        &self,
        project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Option<Database>> {
        let url = Self::sql_url(
            project,
            &format!("instances/{instance}/databases/{database}"),
        );
        self.fetch_optional(self.client.get(&url), "Get database")
            .await
    }

    async fn insert_database(
        &self,
        project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Operation> {
        let url = Self::sql_url(project, &format!("instances/{instance}/databases"));
        let body = json!({ "name": database });
        self.fetch(self.client.post(&url).json(&body), "Create database")
            .await
    }

    async fn list_users(&self, project: &str, instance: &str) -> Result<Vec<User>> {
        let url = Self::sql_url(project, &format!("instances/{instance}/users"));
        let list: ListResponse<User> = self.fetch(self.client.get(&url), "List users").await?;
        Ok(list.items)
    }

    async fn insert_user(&self, project: &str, instance: &str, user: &User) -> Result<Operation> {
        let url = Self::sql_url(project, &format!("instances/{instance}/users"));
        self.fetch(self.client.post(&url).json(user), "Create user")
            .await
    }

    async fn export(
        &self,
        project: &str,
        instance: &str,
        context: &ExportContext,
    ) -> Result<Operation> {
        let url = Self::sql_url(project, &format!("instances/{instance}/export"));
        let body = ExportRequest {
            export_context: context.clone(),
        };
        self.fetch(self.client.post(&url).json(&body), "Export operation")
            .await
    }

    async fn import(
        &self,
        project: &str,
        instance: &str,
        context: &ImportContext,
    ) -> Result<Operation> {
        let url = Self::sql_url(project, &format!("instances/{instance}/import"));
        let body = ImportRequest {
            import_context: context.clone(),
        };
        self.fetch(self.client.post(&url).json(&body), "Import operation")
            .await
    }

    async fn get_operation(&self, project: &str, operation: &str) -> Result<Operation> {
        // Accept both the short id and the full resource name.
        let operation_id = operation.rsplit('/').next().unwrap_or(operation);
        let url = Self::sql_url(project, &format!("operations/{operation_id}"));
        self.fetch(self.client.get(&url), "Get operation status")
            .await
    }
}

#[async_trait]
impl BucketIam for GcpClient {
    async fn get_bucket_policy(&self, bucket: &str) -> Result<Policy> {
        let url = format!("{STORAGE_URL}/b/{bucket}/iam");
        self.fetch(self.client.get(&url), "Get bucket IAM policy")
            .await
    }

    async fn set_bucket_policy(&self, bucket: &str, policy: &Policy) -> Result<Policy> {
        let url = format!("{STORAGE_URL}/b/{bucket}/iam");
        self.fetch(self.client.put(&url).json(policy), "Set bucket IAM policy")
            .await
    }
}

#[async_trait]
impl BlobStore for GcpClient {
    async fn write_object(&self, bucket: &str, name: &str, data: Vec<u8>) -> Result<()> {
        let url = Self::object_url(STORAGE_UPLOAD_URL, bucket, None)?;
        let request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        let _: Value = self.fetch(request, "Upload object").await?;
        Ok(())
    }

    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let url = Self::object_url(STORAGE_URL, bucket, Some(name))?;
        let response = self
            .send(self.client.get(url).query(&[("alt", "media")]))
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Download of gs://{}/{} failed ({}): {}",
                bucket,
                name,
                status,
                error_text
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn object_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        let url = Self::object_url(STORAGE_URL, bucket, Some(name))?;
        let metadata: Option<Value> = self
            .fetch_optional(self.client.get(url), "Get object metadata")
            .await?;
        Ok(metadata.is_some())
    }
}

#[async_trait]
impl SecretStore for GcpClient {
    async fn get_secret(&self, project: &str, id: &str) -> Result<Option<Secret>> {
        let url = format!("{SECRET_MANAGER_URL}/projects/{project}/secrets/{id}");
        self.fetch_optional(self.client.get(&url), "Get secret")
            .await
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        let url = format!("{SECRET_MANAGER_URL}/{name}");
        let _: Value = self.fetch(self.client.delete(&url), "Delete secret").await?;
        Ok(())
    }

    async fn create_secret(
        &self,
        project: &str,
        id: &str,
        replica_location: &str,
    ) -> Result<Secret> {
        let url = format!("{SECRET_MANAGER_URL}/projects/{project}/secrets");
        let body = json!({
            "replication": {
                "userManaged": { "replicas": [{ "location": replica_location }] }
            }
        });
        let request = self
            .client
            .post(&url)
            .query(&[("secretId", id)])
            .json(&body);
        self.fetch(request, "Create secret").await
    }

    async fn add_secret_version(&self, name: &str, payload: &[u8]) -> Result<()> {
        let url = format!("{SECRET_MANAGER_URL}/{name}:addVersion");
        let body = json!({ "payload": { "data": STANDARD.encode(payload) } });
        let _: Value = self
            .fetch(self.client.post(&url).json(&body), "Add secret version")
            .await?;
        Ok(())
    }

    async fn access_latest_version(&self, project: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let url =
            format!("{SECRET_MANAGER_URL}/projects/{project}/secrets/{id}/versions/latest:access");
        let response: Option<Value> = self
            .fetch_optional(self.client.get(&url), "Access secret version")
            .await?;
        let Some(response) = response else {
            return Ok(None);
        };
        let data = response
            .pointer("/payload/data")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("No payload returned for secret {}", id))?;
        Ok(Some(STANDARD.decode(data)?))
    }
}
