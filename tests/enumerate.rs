use sql_snap_crab::enumerate::{enumerate, InstanceId};
use sql_snap_crab::gcp::MockSqlAdmin;
use sql_snap_crab::types::{Database, SqlInstance};

fn databases(names: &[&str]) -> Vec<Database> {
    names
        .iter()
        .map(|name| Database {
            name: name.to_string(),
        })
        .collect()
}

#[tokio::test]
async fn test_enumerates_every_instance_without_system_databases() {
    let mut admin = MockSqlAdmin::new();
    admin.expect_list_instances().times(1).returning(|project| {
        assert_eq!(project, "test-project");
        Ok(vec![
            SqlInstance {
                name: "payments".to_string(),
                ..SqlInstance::default()
            },
            SqlInstance {
                name: "pricing".to_string(),
                ..SqlInstance::default()
            },
        ])
    });
    admin
        .expect_list_databases()
        .times(2)
        .returning(|_, instance| match instance {
            "payments" => Ok(databases(&["postgres", "payment-events", "ledger"])),
            _ => Ok(databases(&["mysql", "pricing", "sys"])),
        });

    let instances = enumerate(&admin, "test-project", None).await.unwrap();

    assert_eq!(instances.len(), 2);
    assert_eq!(
        instances[&InstanceId::from("payments")],
        vec!["payment-events".to_string(), "ledger".to_string()]
    );
    // Only the two reserved names are dropped.
    assert_eq!(
        instances[&InstanceId::from("pricing")],
        vec!["pricing".to_string(), "sys".to_string()]
    );
}

#[tokio::test]
async fn test_filter_lists_only_that_instance() {
    let mut admin = MockSqlAdmin::new();
    admin.expect_list_instances().never();
    admin
        .expect_list_databases()
        .times(1)
        .returning(|_, instance| {
            assert_eq!(instance, "payments");
            Ok(databases(&["a", "b"]))
        });

    let instances = enumerate(&admin, "test-project", Some("payments"))
        .await
        .unwrap();

    assert_eq!(
        instances.into_iter().collect::<Vec<_>>(),
        vec![(
            InstanceId::from("payments"),
            vec!["a".to_string(), "b".to_string()]
        )]
    );
}

#[tokio::test]
async fn test_missing_instance_surfaces_from_database_listing() {
    let mut admin = MockSqlAdmin::new();
    admin
        .expect_list_databases()
        .times(1)
        .returning(|_, _| Err(anyhow::anyhow!("404 instance does not exist")));

    let err = enumerate(&admin, "test-project", Some("ghost"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"));
}
