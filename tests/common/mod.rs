#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use sql_snap_crab::app::{App, Services};
use sql_snap_crab::gcp::{BlobStore, BucketIam, SecretStore, SqlAdmin};
use sql_snap_crab::shutdown::Shutdown;
use sql_snap_crab::stats::{DbCredentials, StatsCollector, TableStatistic, TableStatistics};
use sql_snap_crab::types::{
    Database, ExportContext, ImportContext, NewInstance, Operation, OperationError,
    OperationErrors, Policy, Secret, SqlInstance, User,
};
use sql_snap_crab::waiter::PollIntervals;

#[derive(Debug, Clone, Default)]
pub struct FakeInstance {
    pub databases: Vec<String>,
    pub users: Vec<String>,
    pub service_account: String,
    pub root_password: Option<String>,
}

#[derive(Default)]
pub struct State {
    pub instances: BTreeMap<String, FakeInstance>,
    pub policies: BTreeMap<String, Policy>,
    pub policy_writes: usize,
    pub objects: BTreeMap<(String, String), Vec<u8>>,
    pub secrets: BTreeMap<String, Vec<u8>>,
    pub stats: BTreeMap<(String, String), TableStatistics>,
    pub exports: Vec<(String, ExportContext)>,
    pub imports: Vec<(String, ImportContext)>,
    pub created_users: Vec<(String, String)>,
    pub deleted_instances: Vec<String>,
    /// Trigger kinds whose operation finishes with an error.
    pub failing: HashSet<&'static str>,
    /// Remote calls that fail outright.
    pub rejecting: HashSet<&'static str>,
    /// Policy of every bucket at the moment each operation was triggered.
    pub policy_at_trigger: Vec<(String, Policy)>,
    operations: BTreeMap<String, Operation>,
    next_operation: usize,
}

/// In-memory stand-in for Cloud SQL, Cloud Storage, Secret Manager and the database.
#[derive(Clone, Default)]
pub struct FakeCloud {
    pub state: Arc<Mutex<State>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, name: &str, databases: &[&str], users: &[&str]) -> Self {
        self.state.lock().unwrap().instances.insert(
            name.to_string(),
            FakeInstance {
                databases: databases.iter().map(|d| d.to_string()).collect(),
                users: users.iter().map(|u| u.to_string()).collect(),
                service_account: format!("{name}@gcp-sa-cloud-sql.iam.gserviceaccount.com"),
                root_password: None,
            },
        );
        self
    }

    pub fn with_stats(self, instance: &str, database: &str, rows: &[(&str, i64)]) -> Self {
        self.state.lock().unwrap().stats.insert(
            (instance.to_string(), database.to_string()),
            table_stats(rows),
        );
        self
    }

    pub fn fail_operation(self, kind: &'static str) -> Self {
        self.state.lock().unwrap().failing.insert(kind);
        self
    }

    pub fn reject_call(self, call: &'static str) -> Self {
        self.state.lock().unwrap().rejecting.insert(call);
        self
    }

    pub fn put_object(&self, bucket: &str, name: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), name.to_string()), data.to_vec());
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    pub fn policy(&self, bucket: &str) -> Policy {
        self.state
            .lock()
            .unwrap()
            .policies
            .get(bucket)
            .cloned()
            .unwrap_or_default()
    }

    pub fn services(&self) -> Services {
        let fake = Arc::new(self.clone());
        Services {
            admin: fake.clone(),
            iam: fake.clone(),
            blobs: fake.clone(),
            secrets: fake.clone(),
            stats: fake,
        }
    }

    pub fn app(&self) -> App {
        App::new(self.services(), Shutdown::never()).with_intervals(PollIntervals {
            transfer: Duration::from_secs(60),
            provisioning: Duration::from_secs(10),
        })
    }

    fn check(&self, call: &'static str) -> Result<()> {
        if self.state.lock().unwrap().rejecting.contains(call) {
            return Err(anyhow!("{} rejected", call));
        }
        Ok(())
    }

    fn trigger(&self, kind: &'static str) -> Operation {
        let mut state = self.state.lock().unwrap();
        state.next_operation += 1;
        let name = format!("{kind}-{}", state.next_operation);
        let snapshot: Vec<(String, Policy)> = state
            .policies
            .iter()
            .map(|(b, p)| (b.clone(), p.clone()))
            .collect();
        state.policy_at_trigger.extend(snapshot);

        let error = state.failing.contains(kind).then(|| OperationErrors {
            errors: vec![OperationError {
                code: Some("ERROR_RDBMS".to_string()),
                message: Some(format!("{kind} blew up")),
            }],
        });
        let done = Operation {
            name: name.clone(),
            status: Operation::DONE.to_string(),
            error,
            ..Operation::default()
        };
        state.operations.insert(name.clone(), done);
        Operation {
            name,
            status: "PENDING".to_string(),
            ..Operation::default()
        }
    }
}

pub fn table_stats(rows: &[(&str, i64)]) -> TableStatistics {
    rows.iter()
        .map(|(table, count)| {
            (
                table.to_string(),
                TableStatistic {
                    full_table_name: table.to_string(),
                    table_size_bytes: 8192,
                    table_size_bytes_without_indexes: 8192,
                    total_size_bytes: 16384,
                    row_count: *count,
                },
            )
        })
        .collect()
}

#[async_trait]
impl SqlAdmin for FakeCloud {
    async fn list_instances(&self, _project: &str) -> Result<Vec<SqlInstance>> {
        self.check("list_instances")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .keys()
            .map(|name| SqlInstance {
                name: name.clone(),
                ..SqlInstance::default()
            })
            .collect())
    }

    async fn get_instance(&self, _project: &str, instance: &str) -> Result<Option<SqlInstance>> {
        self.check("get_instance")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .get(instance)
            .map(|found| SqlInstance {
                name: instance.to_string(),
                service_account_email_address: Some(found.service_account.clone()),
                ..SqlInstance::default()
            }))
    }

    async fn insert_instance(&self, _project: &str, instance: &NewInstance) -> Result<Operation> {
        self.check("insert_instance")?;
        self.state.lock().unwrap().instances.insert(
            instance.name.clone(),
            FakeInstance {
                databases: vec!["postgres".to_string()],
                users: vec!["postgres".to_string()],
                service_account: format!("{}@gcp-sa-cloud-sql.iam.gserviceaccount.com", instance.name),
                root_password: Some(instance.root_password.clone()),
            },
        );
        Ok(self.trigger("insert_instance"))
    }

    async fn delete_instance(&self, _project: &str, instance: &str) -> Result<Operation> {
        self.check("delete_instance")?;
        {
            let mut state = self.state.lock().unwrap();
            state.instances.remove(instance);
            state.deleted_instances.push(instance.to_string());
        }
        Ok(self.trigger("delete_instance"))
    }

    async fn list_databases(&self, _project: &str, instance: &str) -> Result<Vec<Database>> {
        self.check("list_databases")?;
        let state = self.state.lock().unwrap();
        let found = state
            .instances
            .get(instance)
            .ok_or_else(|| anyhow!("instance {} not found", instance))?;
        Ok(found
            .databases
            .iter()
            .map(|name| Database { name: name.clone() })
            .collect())
    }

    async fn get_database(
        &self,
        _project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Option<Database>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .get(instance)
            .filter(|i| i.databases.iter().any(|d| d == database))
            .map(|_| Database {
                name: database.to_string(),
            }))
    }

    async fn insert_database(
        &self,
        _project: &str,
        instance: &str,
        database: &str,
    ) -> Result<Operation> {
        if let Some(found) = self.state.lock().unwrap().instances.get_mut(instance) {
            found.databases.push(database.to_string());
        }
        Ok(self.trigger("insert_database"))
    }

    async fn list_users(&self, _project: &str, instance: &str) -> Result<Vec<User>> {
        self.check("list_users")?;
        let state = self.state.lock().unwrap();
        let found = state
            .instances
            .get(instance)
            .ok_or_else(|| anyhow!("instance {} not found", instance))?;
        Ok(found
            .users
            .iter()
            .map(|name| User {
                name: name.clone(),
                password: None,
            })
            .collect())
    }

    async fn insert_user(&self, _project: &str, instance: &str, user: &User) -> Result<Operation> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(found) = state.instances.get_mut(instance) {
                found.users.push(user.name.clone());
            }
            state
                .created_users
                .push((instance.to_string(), user.name.clone()));
        }
        Ok(self.trigger("insert_user"))
    }

    async fn export(
        &self,
        _project: &str,
        instance: &str,
        context: &ExportContext,
    ) -> Result<Operation> {
        self.check("export")?;
        self.state
            .lock()
            .unwrap()
            .exports
            .push((instance.to_string(), context.clone()));
        Ok(self.trigger("export"))
    }

    async fn import(
        &self,
        _project: &str,
        instance: &str,
        context: &ImportContext,
    ) -> Result<Operation> {
        self.check("import")?;
        self.state
            .lock()
            .unwrap()
            .imports
            .push((instance.to_string(), context.clone()));
        Ok(self.trigger("import"))
    }

    async fn get_operation(&self, _project: &str, operation: &str) -> Result<Operation> {
        self.state
            .lock()
            .unwrap()
            .operations
            .get(operation)
            .cloned()
            .ok_or_else(|| anyhow!("operation {} not found", operation))
    }
}

#[async_trait]
impl BucketIam for FakeCloud {
    async fn get_bucket_policy(&self, bucket: &str) -> Result<Policy> {
        self.check("get_bucket_policy")?;
        Ok(self.policy(bucket))
    }

    async fn set_bucket_policy(&self, bucket: &str, policy: &Policy) -> Result<Policy> {
        self.check("set_bucket_policy")?;
        let mut state = self.state.lock().unwrap();
        state.policy_writes += 1;
        state.policies.insert(bucket.to_string(), policy.clone());
        Ok(policy.clone())
    }
}

#[async_trait]
impl BlobStore for FakeCloud {
    async fn write_object(&self, bucket: &str, name: &str, data: Vec<u8>) -> Result<()> {
        self.check("write_object")?;
        self.put_object(bucket, name, &data);
        Ok(())
    }

    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        self.object(bucket, name)
            .ok_or_else(|| anyhow!("gs://{}/{} not found", bucket, name))
    }

    async fn object_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        self.check("object_exists")?;
        Ok(self.object(bucket, name).is_some())
    }
}

#[async_trait]
impl SecretStore for FakeCloud {
    async fn get_secret(&self, project: &str, id: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .contains_key(id)
            .then(|| Secret {
                name: format!("projects/{project}/secrets/{id}"),
            }))
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        let id = name.rsplit('/').next().unwrap_or(name);
        self.state.lock().unwrap().secrets.remove(id);
        Ok(())
    }

    async fn create_secret(
        &self,
        project: &str,
        id: &str,
        _replica_location: &str,
    ) -> Result<Secret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(id.to_string(), Vec::new());
        Ok(Secret {
            name: format!("projects/{project}/secrets/{id}"),
        })
    }

    async fn add_secret_version(&self, name: &str, payload: &[u8]) -> Result<()> {
        let id = name.rsplit('/').next().unwrap_or(name);
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(id.to_string(), payload.to_vec());
        Ok(())
    }

    async fn access_latest_version(&self, _project: &str, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().unwrap().secrets.get(id).cloned())
    }
}

#[async_trait]
impl StatsCollector for FakeCloud {
    async fn collect(
        &self,
        instance: &str,
        database: &str,
        _credentials: &DbCredentials,
    ) -> sql_snap_crab::Result<TableStatistics> {
        self.check("collect")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .stats
            .get(&(instance.to_string(), database.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
