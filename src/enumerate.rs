use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::error::Result;
use crate::gcp::SqlAdmin;

/// Engine-reserved names never exported or restored.
pub const SYSTEM_NAMES: [&str; 2] = ["mysql", "postgres"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Databases = Vec<String>;
pub type Instances = BTreeMap<InstanceId, Databases>;

pub fn is_system_name(name: &str) -> bool {
    SYSTEM_NAMES.contains(&name)
}

/// Lists the instances to back up together with their user databases.
///
/// With a filter, only that instance is listed; its existence is not checked here.
pub async fn enumerate(
    admin: &dyn SqlAdmin,
    project: &str,
    instance: Option<&str>,
) -> Result<Instances> {
    info!(project, "Enumerating Cloud SQL instances in project");

    let names = match instance {
        Some(instance) => vec![instance.to_string()],
        None => admin
            .list_instances(project)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect(),
    };

    let mut instances = Instances::new();
    for name in names {
        info!(instance = %name, "Found instance");
        let databases = list_databases(admin, project, &name).await?;
        instances.insert(InstanceId::from(name), databases);
    }
    Ok(instances)
}

pub async fn list_databases(
    admin: &dyn SqlAdmin,
    project: &str,
    instance: &str,
) -> Result<Databases> {
    let mut databases = Databases::new();
    for database in admin.list_databases(project, instance).await? {
        if is_system_name(&database.name) {
            info!(database = %database.name, "Skipping database");
            continue;
        }
        info!(database = %database.name, instance, "Found database for instance");
        databases.push(database.name);
    }
    Ok(databases)
}
