//! Audit trigger lifecycle against an in-memory catalog, for every dialect

mod common;

use common::FakeCatalog;
use data_load_engine::triggers::{TriggerSql, archive};
use data_load_engine::{
    CollectingNotifier, ConventionNamer, DatabaseBackend, DatabaseDialect, ErrorKind,
    TriggerError, TriggerImplementer, TriggerStatus, TriggerTarget, create_trigger_implementer,
};
use std::sync::Arc;

const TABLE: &str = "Patients";
const ARCHIVE: &str = "Patients_Archive";

const DIALECTS: [DatabaseDialect; 4] = [
    DatabaseDialect::Postgres,
    DatabaseDialect::SqlServer,
    DatabaseDialect::MySql,
    DatabaseDialect::Oracle,
];

fn live_columns(dialect: DatabaseDialect) -> [(&'static str, &'static str, bool); 2] {
    match dialect {
        DatabaseDialect::SqlServer => [("PatientId", "int", true), ("Surname", "nvarchar(100)", false)],
        DatabaseDialect::MySql => [("id", "int(11)", true), ("name", "varchar(50)", false)],
        DatabaseDialect::Oracle => [("ID", "NUMBER(10,0)", true), ("NAME", "VARCHAR2(50)", false)],
        _ => [("id", "integer", true), ("name", "character varying(50)", false)],
    }
}

fn text_type(dialect: DatabaseDialect) -> &'static str {
    match dialect {
        DatabaseDialect::SqlServer => "nvarchar(200)",
        DatabaseDialect::MySql => "varchar(200)",
        DatabaseDialect::Oracle => "VARCHAR2(200)",
        _ => "text",
    }
}

fn implementer_for(catalog: &Arc<FakeCatalog>) -> Box<dyn TriggerImplementer> {
    let schema = (catalog.dialect() == DatabaseDialect::SqlServer).then(|| "dbo".to_string());
    let target = TriggerTarget::new(schema, TABLE, &ConventionNamer::default()).unwrap();
    let backend: Arc<dyn DatabaseBackend> = catalog.clone();
    create_trigger_implementer(catalog.dialect(), backend, target).unwrap()
}

fn setup(dialect: DatabaseDialect) -> (Arc<FakeCatalog>, Box<dyn TriggerImplementer>) {
    let catalog = Arc::new(FakeCatalog::new(dialect));
    catalog.create_table(TABLE, &live_columns(dialect));
    let implementer = implementer_for(&catalog);
    (catalog, implementer)
}

fn is_ddl(label: &str) -> bool {
    label.starts_with("create_")
        || label.starts_with("drop_")
        || label.starts_with("alter_")
        || label.ends_with("_trigger")
}

#[tokio::test]
async fn test_create_then_drop_keeps_archive() {
    for dialect in DIALECTS {
        let (catalog, implementer) = setup(dialect);
        assert_eq!(
            implementer.get_trigger_status().await.unwrap(),
            TriggerStatus::Missing,
            "{dialect}"
        );

        let notifier = CollectingNotifier::new();
        implementer.create_trigger(&notifier).await.unwrap();
        assert!(!notifier.has_failures(), "{dialect}");
        assert_eq!(
            implementer.get_trigger_status().await.unwrap(),
            TriggerStatus::Enabled,
            "{dialect}"
        );

        let archive_columns = catalog.column_names(ARCHIVE);
        assert_eq!(archive_columns.len(), 6, "{dialect}: {archive_columns:?}");
        assert_eq!(&archive_columns[2..], &archive::AUDIT_COLUMNS, "{dialect}");

        catalog.update_row(TABLE, ARCHIVE);
        assert_eq!(catalog.archive_row_count(ARCHIVE), 1, "{dialect}");

        implementer.drop_trigger().await.unwrap();
        assert_eq!(
            implementer.get_trigger_status().await.unwrap(),
            TriggerStatus::Missing,
            "{dialect}"
        );
        assert!(catalog.trigger_names().is_empty(), "{dialect}");
        assert!(catalog.function_names().is_empty(), "{dialect}");

        catalog.update_row(TABLE, ARCHIVE);
        assert!(catalog.has_table(ARCHIVE), "{dialect}");
        assert_eq!(catalog.archive_row_count(ARCHIVE), 1, "{dialect}");
    }
}

#[tokio::test]
async fn test_mysql_creates_a_trigger_pair() {
    let (catalog, implementer) = setup(DatabaseDialect::MySql);
    implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap();
    assert_eq!(
        catalog.trigger_names(),
        vec!["Patients_OnDelete".to_string(), "Patients_OnUpdate".to_string()]
    );
}

#[tokio::test]
async fn test_no_primary_key_issues_no_ddl() {
    for dialect in DIALECTS {
        let catalog = Arc::new(FakeCatalog::new(dialect));
        catalog.create_table(TABLE, &[("id", "int", false), ("name", "int", false)]);
        let implementer = implementer_for(&catalog);

        let notifier = CollectingNotifier::new();
        let err = implementer.create_trigger(&notifier).await.unwrap_err();
        assert!(matches!(err, TriggerError::NoPrimaryKey { .. }), "{dialect}: {err}");
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(notifier.has_failures());

        assert!(!catalog.has_table(ARCHIVE), "{dialect}");
        let labels = catalog.executed_labels();
        assert!(!labels.iter().any(|l| is_ddl(l)), "{dialect}: {labels:?}");
    }
}

#[tokio::test]
async fn test_missing_table() {
    let catalog = Arc::new(FakeCatalog::new(DatabaseDialect::Postgres));
    let implementer = implementer_for(&catalog);
    let err = implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::TableNotFound { .. }));
    assert!(!implementer.table_exists(TABLE).await.unwrap());
}

#[tokio::test]
async fn test_reserved_audit_column_is_rejected() {
    let catalog = Arc::new(FakeCatalog::new(DatabaseDialect::Postgres));
    catalog.create_table(TABLE, &[("id", "integer", true), ("status", "text", false)]);
    let implementer = implementer_for(&catalog);
    let err = implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, TriggerError::AuditColumnCollision { column, .. } if column == "status")
    );
    assert!(!catalog.has_table(ARCHIVE));
}

#[tokio::test]
async fn test_live_valid_from_is_not_duplicated() {
    for dialect in DIALECTS {
        let catalog = Arc::new(FakeCatalog::new(dialect));
        catalog.create_table(
            TABLE,
            &[("id", "int", true), ("validFrom", "timestamp", false)],
        );
        let implementer = implementer_for(&catalog);
        implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap();

        let columns = catalog.column_names(ARCHIVE);
        assert_eq!(
            columns.iter().filter(|c| c.as_str() == "validFrom").count(),
            1,
            "{dialect}: {columns:?}"
        );
        implementer.synchronize().await.unwrap();
    }
}

#[tokio::test]
async fn test_create_twice_is_an_invalid_transition() {
    for dialect in DIALECTS {
        let (catalog, implementer) = setup(dialect);
        implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap();
        catalog.clear_log();

        let err = implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                TriggerError::InvalidTransition {
                    from: TriggerStatus::Enabled,
                    action: "create",
                    ..
                }
            ),
            "{dialect}: {err}"
        );
        assert!(!catalog.executed_labels().iter().any(|l| is_ddl(l)));
    }
}

#[tokio::test]
async fn test_drop_missing_trigger() {
    let (_catalog, implementer) = setup(DatabaseDialect::Oracle);
    let err = implementer.drop_trigger().await.unwrap_err();
    assert!(matches!(
        err,
        TriggerError::InvalidTransition {
            from: TriggerStatus::Missing,
            ..
        }
    ));
}

#[tokio::test]
async fn test_synchronize_detects_new_live_column() {
    for dialect in DIALECTS {
        let (catalog, implementer) = setup(dialect);
        implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap();

        let report = implementer.synchronize().await.unwrap();
        assert_eq!(report.status, TriggerStatus::Enabled);
        assert_eq!(report.column_count, 2);
        assert_eq!(report.body_fingerprint.len(), 64);

        catalog.add_column(TABLE, "Email", text_type(dialect));
        let err = implementer.synchronize().await.unwrap_err();
        assert!(
            matches!(err, TriggerError::TriggerBodyMismatch { .. }),
            "{dialect}: {err}"
        );
        assert_eq!(err.kind(), ErrorKind::Drift);
        // Drift is reported, never repaired
        assert!(!catalog.column_names(ARCHIVE).contains(&"Email".to_string()));
    }
}

#[tokio::test]
async fn test_synchronize_without_trigger() {
    let (_catalog, implementer) = setup(DatabaseDialect::SqlServer);
    let err = implementer.synchronize().await.unwrap_err();
    assert!(matches!(err, TriggerError::TriggerMissing { .. }));
}

#[tokio::test]
async fn test_recreate_widens_archive_and_keeps_rows() {
    for dialect in DIALECTS {
        let (catalog, implementer) = setup(dialect);
        implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap();
        catalog.update_row(TABLE, ARCHIVE);
        catalog.add_column(TABLE, "Email", text_type(dialect));

        let notifier = CollectingNotifier::new();
        implementer.recreate_trigger(&notifier).await.unwrap();
        assert!(!notifier.has_failures(), "{dialect}");
        assert!(catalog.executed_labels().contains(&"alter_archive_table".to_string()));

        let report = implementer.synchronize().await.unwrap();
        assert_eq!(report.column_count, 3, "{dialect}");
        assert!(catalog.column_names(ARCHIVE).contains(&"Email".to_string()));
        assert_eq!(catalog.archive_row_count(ARCHIVE), 1, "{dialect}");
    }
}

#[tokio::test]
async fn test_enable_disable_transitions() {
    for dialect in [
        DatabaseDialect::Postgres,
        DatabaseDialect::SqlServer,
        DatabaseDialect::Oracle,
    ] {
        let (catalog, implementer) = setup(dialect);
        implementer
            .create_trigger(&CollectingNotifier::new())
            .await
            .unwrap();

        let err = implementer.enable_trigger().await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidTransition { action: "enable", .. }));

        implementer.disable_trigger().await.unwrap();
        assert_eq!(
            implementer.get_trigger_status().await.unwrap(),
            TriggerStatus::Disabled,
            "{dialect}"
        );
        catalog.update_row(TABLE, ARCHIVE);
        assert_eq!(catalog.archive_row_count(ARCHIVE), 0, "{dialect}");

        let err = implementer.disable_trigger().await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidTransition { action: "disable", .. }));

        // A disabled trigger still syncs; its body is unchanged
        implementer.synchronize().await.unwrap();

        implementer.enable_trigger().await.unwrap();
        assert_eq!(
            implementer.get_trigger_status().await.unwrap(),
            TriggerStatus::Enabled
        );
    }
}

#[tokio::test]
async fn test_mysql_cannot_toggle() {
    let (_catalog, implementer) = setup(DatabaseDialect::MySql);
    implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap();
    let err = implementer.disable_trigger().await.unwrap_err();
    assert!(matches!(
        err,
        TriggerError::UnsupportedOperation {
            dialect: DatabaseDialect::MySql,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(
        implementer.get_trigger_status().await.unwrap(),
        TriggerStatus::Enabled
    );
}

#[tokio::test]
async fn test_transactional_dialects_roll_back_failed_create() {
    for dialect in [DatabaseDialect::Postgres, DatabaseDialect::SqlServer] {
        let (catalog, implementer) = setup(dialect);
        catalog.fail_on("create_trigger", 1);

        let notifier = CollectingNotifier::new();
        let err = implementer.create_trigger(&notifier).await.unwrap_err();
        assert!(matches!(err, TriggerError::Database(_)), "{dialect}: {err}");
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(notifier.has_failures());

        assert!(!catalog.has_table(ARCHIVE), "{dialect}");
        assert!(catalog.function_names().is_empty(), "{dialect}");
        assert!(
            !catalog.executed_labels().contains(&"drop_archive_table".to_string()),
            "{dialect}"
        );
    }
}

#[tokio::test]
async fn test_mysql_failed_create_is_compensated() {
    let (catalog, implementer) = setup(DatabaseDialect::MySql);
    // The `_OnUpdate` trigger lands, `_OnDelete` fails
    catalog.fail_on("create_trigger", 2);

    implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap_err();

    assert!(catalog.trigger_names().is_empty());
    assert!(!catalog.has_table(ARCHIVE));
    assert_eq!(
        implementer.get_trigger_status().await.unwrap(),
        TriggerStatus::Missing
    );
}

#[tokio::test]
async fn test_oracle_compensation_keeps_existing_archive() {
    let (catalog, implementer) = setup(DatabaseDialect::Oracle);
    catalog.fail_on("create_trigger", 1);
    implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap_err();
    assert!(!catalog.has_table(ARCHIVE));
    assert!(
        catalog
            .executed_labels()
            .contains(&"drop_archive_table".to_string())
    );

    // An archive from an earlier life of the table survives a failed create
    catalog.create_table(
        ARCHIVE,
        &[
            ("ID", "NUMBER(10,0)", false),
            ("NAME", "VARCHAR2(50)", false),
            ("validFrom", "TIMESTAMP", false),
            ("validTo", "TIMESTAMP", false),
            ("updatedByUser", "VARCHAR2(128)", false),
            ("status", "CHAR(1)", false),
        ],
    );
    catalog.fail_on("create_trigger", 1);
    let notifier = CollectingNotifier::new();
    implementer.create_trigger(&notifier).await.unwrap_err();
    assert!(catalog.has_table(ARCHIVE));
    assert!(
        notifier
            .events()
            .iter()
            .any(|e| e.message.contains("already exists"))
    );

    implementer.create_trigger(&notifier).await.unwrap();
    implementer.synchronize().await.unwrap();
}

#[tokio::test]
async fn test_existing_archive_missing_columns_blocks_create() {
    let (catalog, implementer) = setup(DatabaseDialect::Postgres);
    catalog.create_table(ARCHIVE, &[("id", "integer", false)]);
    let err = implementer
        .create_trigger(&CollectingNotifier::new())
        .await
        .unwrap_err();
    match err {
        TriggerError::ArchiveSchemaDrift { missing, .. } => {
            assert_eq!(missing[0], "name");
            assert!(missing.contains(&"status".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(catalog.trigger_names().is_empty());
}

#[tokio::test]
async fn test_target_names() {
    let (_catalog, implementer) = setup(DatabaseDialect::SqlServer);
    let target = implementer.target();
    assert_eq!(target.trigger_name, "Patients_OnUpdate");
    assert_eq!(target.archive_table, ARCHIVE);
    assert_eq!(target.schema.as_deref(), Some("dbo"));
}
