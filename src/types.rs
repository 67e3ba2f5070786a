use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlInstance {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<IpMapping>,
}

impl SqlInstance {
    pub fn primary_ip(&self) -> Option<&str> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.ip_type == "PRIMARY")
            .map(|ip| ip.ip_address.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpMapping {
    #[serde(rename = "type", default)]
    pub ip_type: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// A long-running Cloud SQL Admin operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationErrors>,
}

impl Operation {
    pub const DONE: &'static str = "DONE";

    pub fn is_done(&self) -> bool {
        self.status == Self::DONE
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.error
            .iter()
            .flat_map(|e| e.errors.iter())
            .map(|e| match (&e.code, &e.message) {
                (_, Some(message)) => message.clone(),
                (Some(code), None) => code.clone(),
                (None, None) => "unknown error".to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub export_context: ExportContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportContext {
    pub kind: String,
    pub file_type: String,
    pub databases: Vec<String>,
    pub uri: String,
}

impl ExportContext {
    pub fn sql(database: &str, uri: &str) -> Self {
        Self {
            kind: "sql#exportContext".to_string(),
            file_type: "SQL".to_string(),
            databases: vec![database.to_string()],
            uri: uri.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub import_context: ImportContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportContext {
    pub kind: String,
    pub file_type: String,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_user: Option<String>,
    pub uri: String,
}

impl ImportContext {
    pub fn sql(database: &str, uri: &str, import_user: Option<&str>) -> Self {
        Self {
            kind: "sql#importContext".to_string(),
            file_type: "SQL".to_string(),
            database: database.to_string(),
            import_user: import_user.map(str::to_string),
            uri: uri.to_string(),
        }
    }
}

/// Body of an instance insert request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstance {
    pub name: String,
    pub instance_type: String,
    pub region: String,
    pub database_version: String,
    pub root_password: String,
    pub settings: InstanceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSettings {
    pub tier: String,
    pub activation_policy: String,
    pub database_flags: Vec<DatabaseFlag>,
    pub insights_config: InsightsConfig,
    pub user_labels: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseFlag {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsConfig {
    pub query_insights_enabled: bool,
}

/// Bucket IAM policy as returned by the Cloud Storage JSON API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

impl Policy {
    /// Unconditional bindings only; conditional grants are never touched.
    pub fn has_role(&self, member: &str, role: &str) -> bool {
        self.bindings
            .iter()
            .filter(|b| b.role == role && b.condition.is_none())
            .any(|b| b.members.iter().any(|m| m == member))
    }

    pub fn add(&mut self, member: &str, role: &str) {
        if self.has_role(member, role) {
            return;
        }
        match self
            .bindings
            .iter_mut()
            .find(|b| b.role == role && b.condition.is_none())
        {
            Some(binding) => binding.members.push(member.to_string()),
            None => self.bindings.push(Binding {
                role: role.to_string(),
                members: vec![member.to_string()],
                condition: None,
            }),
        }
    }

    pub fn remove(&mut self, member: &str, role: &str) {
        for binding in self
            .bindings
            .iter_mut()
            .filter(|b| b.role == role && b.condition.is_none())
        {
            binding.members.retain(|m| m != member);
        }
        self.bindings.retain(|b| !b.members.is_empty());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
}
