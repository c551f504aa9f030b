//! Schema initialization and migration.
//!
//! `initialize` is run once at pool creation: it creates any missing
//! tables and indexes, then inspects the existing ones for migration
//! markers (a legacy column type, a missing column). Each migration runs
//! inside one transaction so a crash leaves either the old table intact
//! or the new one fully populated.

use kecs_types::Result;
use rusqlite::Connection;

use crate::db_err;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY,
        arn TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        region TEXT NOT NULL,
        account_id TEXT NOT NULL,
        k8s_cluster_name TEXT NOT NULL,
        registered_container_instances_count INTEGER NOT NULL DEFAULT 0,
        running_tasks_count INTEGER NOT NULL DEFAULT 0,
        pending_tasks_count INTEGER NOT NULL DEFAULT 0,
        active_services_count INTEGER NOT NULL DEFAULT 0,
        localstack_state TEXT,
        settings TEXT,
        tags TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_definitions (
        id TEXT PRIMARY KEY,
        arn TEXT NOT NULL UNIQUE,
        family TEXT NOT NULL,
        revision INTEGER NOT NULL,
        network_mode TEXT NOT NULL,
        container_definitions TEXT NOT NULL,
        volumes TEXT NOT NULL,
        cpu TEXT,
        memory TEXT,
        task_role_arn TEXT,
        execution_role_arn TEXT,
        requires_compatibilities TEXT NOT NULL,
        status TEXT NOT NULL,
        registered_at INTEGER NOT NULL,
        deregistered_at INTEGER,
        UNIQUE (family, revision)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS services (
        id TEXT PRIMARY KEY,
        arn TEXT NOT NULL UNIQUE,
        service_name TEXT NOT NULL,
        cluster_arn TEXT NOT NULL,
        task_definition_arn TEXT NOT NULL,
        desired_count INTEGER NOT NULL DEFAULT 0,
        running_count INTEGER NOT NULL DEFAULT 0,
        pending_count INTEGER NOT NULL DEFAULT 0,
        launch_type TEXT NOT NULL,
        status TEXT NOT NULL,
        load_balancers TEXT NOT NULL,
        service_registries TEXT NOT NULL,
        network_configuration TEXT,
        deployment_configuration TEXT,
        scheduling_strategy TEXT NOT NULL,
        role_arn TEXT,
        platform_version TEXT,
        primary_task_set TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (cluster_arn, service_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        arn TEXT NOT NULL UNIQUE,
        cluster_arn TEXT NOT NULL,
        task_definition_arn TEXT NOT NULL,
        container_instance_arn TEXT,
        last_status TEXT NOT NULL,
        desired_status TEXT NOT NULL,
        containers TEXT NOT NULL,
        launch_type TEXT NOT NULL,
        started_by TEXT,
        stopped_reason TEXT,
        stop_code TEXT,
        connectivity TEXT,
        pull_started_at INTEGER,
        pull_stopped_at INTEGER,
        started_at INTEGER,
        stopping_at INTEGER,
        stopped_at INTEGER,
        execution_stopped_at INTEGER,
        pod_name TEXT,
        namespace TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_sets (
        id TEXT NOT NULL,
        arn TEXT NOT NULL UNIQUE,
        service_arn TEXT NOT NULL,
        cluster_arn TEXT NOT NULL,
        external_id TEXT,
        task_definition TEXT NOT NULL,
        scale TEXT,
        computed_desired_count INTEGER NOT NULL DEFAULT 0,
        running_count INTEGER NOT NULL DEFAULT 0,
        pending_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        stability_status TEXT NOT NULL,
        network_configuration TEXT,
        load_balancers TEXT NOT NULL,
        service_registries TEXT NOT NULL,
        launch_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (service_arn, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS container_instances (
        arn TEXT PRIMARY KEY,
        cluster_arn TEXT NOT NULL,
        ec2_instance_id TEXT NOT NULL,
        status TEXT NOT NULL,
        agent_connected INTEGER NOT NULL DEFAULT 0,
        running_tasks_count INTEGER NOT NULL DEFAULT 0,
        pending_tasks_count INTEGER NOT NULL DEFAULT 0,
        registered_resources TEXT,
        remaining_resources TEXT,
        version_info TEXT,
        attributes TEXT,
        registered_at INTEGER NOT NULL,
        deregistered_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attributes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        value TEXT,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        cluster TEXT NOT NULL,
        UNIQUE (name, target_type, target_id, cluster)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS load_balancers (
        arn TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        dns_name TEXT NOT NULL,
        lb_type TEXT NOT NULL,
        scheme TEXT NOT NULL,
        state TEXT NOT NULL,
        vpc_id TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS target_groups (
        arn TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        protocol TEXT NOT NULL,
        port INTEGER NOT NULL,
        target_type TEXT NOT NULL,
        vpc_id TEXT,
        health_check_path TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listeners (
        arn TEXT PRIMARY KEY,
        load_balancer_arn TEXT NOT NULL,
        protocol TEXT NOT NULL,
        port INTEGER NOT NULL,
        default_target_group_arn TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        arn TEXT PRIMARY KEY,
        listener_arn TEXT NOT NULL,
        priority INTEGER NOT NULL,
        conditions TEXT NOT NULL,
        target_group_arn TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS targets (
        target_group_arn TEXT NOT NULL,
        target_id TEXT NOT NULL,
        port INTEGER,
        health TEXT NOT NULL,
        registered_at INTEGER NOT NULL,
        UNIQUE (target_group_arn, target_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_arn TEXT NOT NULL,
        container_name TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        log_line TEXT NOT NULL,
        log_level TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account_settings (
        id TEXT PRIMARY KEY,
        principal_arn TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (principal_arn, name)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_clusters_status ON clusters (status)",
    "CREATE INDEX IF NOT EXISTS idx_task_definitions_family ON task_definitions (family)",
    "CREATE INDEX IF NOT EXISTS idx_task_definitions_status ON task_definitions (status)",
    "CREATE INDEX IF NOT EXISTS idx_services_cluster ON services (cluster_arn)",
    "CREATE INDEX IF NOT EXISTS idx_services_status ON services (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_cluster ON tasks (cluster_arn)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_last_status ON tasks (last_status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_started_by ON tasks (started_by)",
    "CREATE INDEX IF NOT EXISTS idx_task_sets_service ON task_sets (service_arn)",
    "CREATE INDEX IF NOT EXISTS idx_task_sets_cluster ON task_sets (cluster_arn)",
    "CREATE INDEX IF NOT EXISTS idx_container_instances_cluster ON container_instances (cluster_arn)",
    "CREATE INDEX IF NOT EXISTS idx_attributes_cluster ON attributes (cluster)",
    "CREATE INDEX IF NOT EXISTS idx_listeners_lb ON listeners (load_balancer_arn)",
    "CREATE INDEX IF NOT EXISTS idx_rules_listener ON rules (listener_arn)",
    "CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_arn)",
    "CREATE INDEX IF NOT EXISTS idx_task_logs_timestamp ON task_logs (timestamp)",
];

pub fn initialize(conn: &mut Connection) -> Result<()> {
    for ddl in TABLES {
        conn.execute(ddl, []).map_err(db_err)?;
    }
    for ddl in INDEXES {
        conn.execute(ddl, []).map_err(db_err)?;
    }
    migrate_cluster_tags(conn)?;
    migrate_task_pod_columns(conn)?;
    Ok(())
}

/// Declared type of a column, or None when the column is absent.
fn column_type(conn: &Connection, table: &str, column: &str) -> Result<Option<String>> {
    let mut stmt = conn
        .prepare_cached(&format!("PRAGMA table_info({table})"))
        .map_err(db_err)?;
    let mut rows = stmt.query([]).map_err(db_err)?;
    while let Some(row) = rows.next().map_err(db_err)? {
        let name: String = row.get(1).map_err(db_err)?;
        if name == column {
            let ty: String = row.get(2).map_err(db_err)?;
            return Ok(Some(ty));
        }
    }
    Ok(None)
}

/// Older databases declared `clusters.tags` (and the other blob columns)
/// as JSON. Rebuild the table with TEXT blobs, copying rows with casts.
fn migrate_cluster_tags(conn: &mut Connection) -> Result<()> {
    let Some(ty) = column_type(conn, "clusters", "tags")? else {
        return Ok(());
    };
    if !ty.eq_ignore_ascii_case("JSON") {
        return Ok(());
    }
    tracing::info!("migrating clusters table: JSON blob columns -> TEXT");

    let tx = conn.transaction().map_err(db_err)?;
    tx.execute(
        r#"
        CREATE TABLE clusters_new (
            id TEXT PRIMARY KEY,
            arn TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            region TEXT NOT NULL,
            account_id TEXT NOT NULL,
            k8s_cluster_name TEXT NOT NULL,
            registered_container_instances_count INTEGER NOT NULL DEFAULT 0,
            running_tasks_count INTEGER NOT NULL DEFAULT 0,
            pending_tasks_count INTEGER NOT NULL DEFAULT 0,
            active_services_count INTEGER NOT NULL DEFAULT 0,
            localstack_state TEXT,
            settings TEXT,
            tags TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .map_err(db_err)?;
    tx.execute(
        r#"
        INSERT INTO clusters_new
        SELECT id, arn, name, status, region, account_id, k8s_cluster_name,
               registered_container_instances_count, running_tasks_count,
               pending_tasks_count, active_services_count,
               CAST(localstack_state AS TEXT), CAST(settings AS TEXT),
               CAST(tags AS TEXT), created_at, updated_at
        FROM clusters
        "#,
        [],
    )
    .map_err(db_err)?;
    tx.execute("DROP TABLE clusters", []).map_err(db_err)?;
    tx.execute("ALTER TABLE clusters_new RENAME TO clusters", [])
        .map_err(db_err)?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_clusters_status ON clusters (status)",
        [],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)
}

/// `pod_name`/`namespace` arrived after the first schema shipped; add them
/// to databases that predate the columns.
fn migrate_task_pod_columns(conn: &mut Connection) -> Result<()> {
    let mut missing = Vec::new();
    for col in ["pod_name", "namespace"] {
        if column_type(conn, "tasks", col)?.is_none() {
            missing.push(col);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    tracing::info!(columns = ?missing, "migrating tasks table: adding pod columns");
    let tx = conn.transaction().map_err(db_err)?;
    for col in missing {
        tx.execute(&format!("ALTER TABLE tasks ADD COLUMN {col} TEXT"), [])
            .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)
}

/// Verify a table exists; used by the detailed health probe.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        initialize(&mut conn).unwrap();
        assert!(table_exists(&conn, "clusters").unwrap());
        assert!(table_exists(&conn, "task_logs").unwrap());
    }

    #[test]
    fn legacy_json_tags_column_is_rebuilt() {
        let mut conn = Connection::open_in_memory().unwrap();
        // An old-layout clusters table with JSON-typed blob columns.
        conn.execute(
            r#"
            CREATE TABLE clusters (
                id TEXT PRIMARY KEY,
                arn TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                region TEXT NOT NULL,
                account_id TEXT NOT NULL,
                k8s_cluster_name TEXT NOT NULL,
                registered_container_instances_count INTEGER NOT NULL DEFAULT 0,
                running_tasks_count INTEGER NOT NULL DEFAULT 0,
                pending_tasks_count INTEGER NOT NULL DEFAULT 0,
                active_services_count INTEGER NOT NULL DEFAULT 0,
                localstack_state JSON,
                settings JSON,
                tags JSON,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .unwrap();
        conn.execute(
            r#"
            INSERT INTO clusters (id, arn, name, status, region, account_id,
                                  k8s_cluster_name, tags, created_at, updated_at)
            VALUES ('c1', 'arn:aws:ecs:us-east-1:000000000000:cluster/default',
                    'default', 'ACTIVE', 'us-east-1', '000000000000',
                    'kecs-brisk-otter', '[{"key":"env","value":"dev"}]', 0, 0)
            "#,
            [],
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        let ty = column_type(&conn, "clusters", "tags").unwrap().unwrap();
        assert!(ty.eq_ignore_ascii_case("TEXT"));
        let tags: String = conn
            .query_row("SELECT tags FROM clusters WHERE name = 'default'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&tags).unwrap();
        assert_eq!(parsed[0]["key"], "env");
    }

    #[test]
    fn missing_pod_columns_are_added() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute(
            r#"
            CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                arn TEXT NOT NULL UNIQUE,
                cluster_arn TEXT NOT NULL,
                task_definition_arn TEXT NOT NULL,
                container_instance_arn TEXT,
                last_status TEXT NOT NULL,
                desired_status TEXT NOT NULL,
                containers TEXT NOT NULL,
                launch_type TEXT NOT NULL,
                started_by TEXT,
                stopped_reason TEXT,
                stop_code TEXT,
                connectivity TEXT,
                pull_started_at INTEGER,
                pull_stopped_at INTEGER,
                started_at INTEGER,
                stopping_at INTEGER,
                stopped_at INTEGER,
                execution_stopped_at INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        assert!(column_type(&conn, "tasks", "pod_name").unwrap().is_some());
        assert!(column_type(&conn, "tasks", "namespace").unwrap().is_some());
    }
}
