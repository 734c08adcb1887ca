use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fleetbook::audit::TracingAuditSink;
use fleetbook::config::BookingHours;
use fleetbook::engine::Engine;
use fleetbook::notify::NotifyHub;
use fleetbook::model::Role;
use fleetbook::registry::{InMemoryRegistry, User, Vehicle};
use fleetbook::wire::{self, FleetFactory};

// ── Test infrastructure ──────────────────────────────────────

/// 2024-01-10T00:00:00Z
const JAN10: i64 = 1_704_844_800_000;
const HOUR: i64 = 3_600_000;
const PASSWORD: &str = "test-secret";

struct TestServer {
    addr: SocketAddr,
    vehicle: Ulid,
    registry: Arc<InMemoryRegistry>,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fleetbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let registry = Arc::new(InMemoryRegistry::new());
    let vehicle = Ulid::new();
    registry.upsert_vehicle(Vehicle {
        id: vehicle,
        plate: "B 1 TST".into(),
        model: "Avanza".into(),
        active: true,
    });
    let engine = Arc::new(
        Engine::new(
            dir.join("bookings.wal"),
            registry.clone(),
            Arc::new(TracingAuditSink),
            Arc::new(NotifyHub::new()),
        )
        .unwrap(),
    );
    let factory = FleetFactory::new(engine, BookingHours::default(), PASSWORD.into());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    TestServer {
        addr,
        vehicle,
        registry,
    }
}

async fn connect_as(addr: SocketAddr, login: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fleet")
        .user(login)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

/// Register a user with `role` and log in as them.
async fn connect(server: &TestServer, role: Role) -> (tokio_postgres::Client, Ulid) {
    let id = Ulid::new();
    server.registry.upsert_user(User {
        id,
        name: format!("{} {id}", role.as_str()),
        role,
        active: true,
    });
    let client = connect_as(server.addr, &id.to_string()).await.unwrap();
    (client, id)
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    let messages = client.simple_query(sql).await?;
    Ok(messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect())
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.as_db_error().map(|db| db.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn member_request_then_manager_decision() {
    let server = start_test_server().await;
    let (member, member_id) = connect(&server, Role::User).await;
    let (manager, manager_id) = connect(&server, Role::Manager).await;

    let id = Ulid::new();
    let created = rows(
        &member,
        &format!(
            "INSERT INTO bookings (id, start_at, end_at) VALUES ('{id}', '2024-01-10T08:00:00Z', '2024-01-10T12:00:00Z')"
        ),
    )
    .await
    .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("status"), Some("PENDING"));
    assert_eq!(created[0].get("requester_id"), Some(member_id.to_string().as_str()));
    assert_eq!(created[0].get("start_at"), Some((JAN10 + 8 * HOUR).to_string().as_str()));
    assert_eq!(created[0].get("vehicle_id"), None);

    let vehicle = server.vehicle;
    rows(
        &manager,
        &format!("INSERT INTO vehicle_assignments (booking_id, vehicle_id) VALUES ('{id}', '{vehicle}')"),
    )
    .await
    .unwrap();
    let approved = rows(&manager, &format!("INSERT INTO approvals (booking_id) VALUES ('{id}')"))
        .await
        .unwrap();
    assert_eq!(approved[0].get("status"), Some("APPROVED"));
    assert_eq!(approved[0].get("decided_by"), Some(manager_id.to_string().as_str()));

    let mine = rows(&member, &format!("SELECT * FROM bookings WHERE requested_for = '{member_id}'"))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("vehicle_id"), Some(vehicle.to_string().as_str()));
}

#[tokio::test]
async fn overlap_reports_exclusion_violation() {
    let server = start_test_server().await;
    let (manager, _) = connect(&server, Role::Manager).await;
    let vehicle = server.vehicle;

    let first = format!(
        "INSERT INTO bookings (id, start_at, end_at, vehicle_id) VALUES ('{}', {}, {}, '{vehicle}')",
        Ulid::new(),
        JAN10 + 8 * HOUR,
        JAN10 + 12 * HOUR
    );
    rows(&manager, &first).await.unwrap();

    let overlapping = format!(
        "INSERT INTO bookings (id, start_at, end_at, vehicle_id) VALUES ('{}', {}, {}, '{vehicle}')",
        Ulid::new(),
        JAN10 + 11 * HOUR,
        JAN10 + 13 * HOUR
    );
    let err = rows(&manager, &overlapping).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::EXCLUSION_VIOLATION));

    let adjacent = format!(
        "INSERT INTO bookings (id, start_at, end_at, vehicle_id) VALUES ('{}', {}, {}, '{vehicle}')",
        Ulid::new(),
        JAN10 + 12 * HOUR,
        JAN10 + 14 * HOUR
    );
    rows(&manager, &adjacent).await.unwrap();

    let on_vehicle = rows(&manager, &format!("SELECT * FROM bookings WHERE vehicle_id = '{vehicle}'"))
        .await
        .unwrap();
    assert_eq!(on_vehicle.len(), 2);
}

#[tokio::test]
async fn member_cannot_approve() {
    let server = start_test_server().await;
    let (member, _) = connect(&server, Role::User).await;

    let id = Ulid::new();
    rows(
        &member,
        &format!("INSERT INTO period_bookings (id, date, period) VALUES ('{id}', '2024-01-10', 'AM')"),
    )
    .await
    .unwrap();
    let err = rows(&member, &format!("INSERT INTO approvals (booking_id) VALUES ('{id}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
}

#[tokio::test]
async fn approving_twice_is_refused() {
    let server = start_test_server().await;
    let (admin, _) = connect(&server, Role::Admin).await;

    let id = Ulid::new();
    rows(
        &admin,
        &format!("INSERT INTO bookings VALUES ('{id}', {}, {}, NULL, NULL)", JAN10, JAN10 + HOUR),
    )
    .await
    .unwrap();
    rows(&admin, &format!("INSERT INTO rejections VALUES ('{id}', 'no driver')"))
        .await
        .unwrap();
    let err = rows(&admin, &format!("INSERT INTO approvals VALUES ('{id}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));

    let current = rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(current[0].get("status"), Some("REJECTED"));
    assert_eq!(current[0].get("reject_reason"), Some("no driver"));
}

#[tokio::test]
async fn calendar_reports_hours_and_blocked_dates() {
    let server = start_test_server().await;
    let (manager, _) = connect(&server, Role::Manager).await;
    let vehicle = server.vehicle;

    rows(
        &manager,
        &format!(
            "INSERT INTO period_bookings (id, date, period, vehicle_id) VALUES ('{}', '2024-01-10', 'FULL', '{vehicle}')",
            Ulid::new()
        ),
    )
    .await
    .unwrap();

    let dates = rows(&manager, &format!("SELECT * FROM blocked_dates WHERE vehicle_id = '{vehicle}'"))
        .await
        .unwrap();
    assert_eq!(dates.len(), 1);
    assert_eq!(dates[0].get("date"), Some("2024-01-10"));

    let meta = rows(&manager, "SELECT * FROM calendar_meta").await.unwrap();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].get("open_time"), Some("08:00"));
    assert_eq!(meta[0].get("close_time"), Some("18:00"));
    assert_eq!(meta[0].get("blocked_dates"), Some("2024-01-10"));
}

#[tokio::test]
async fn unknown_booking_and_bad_sql() {
    let server = start_test_server().await;
    let (manager, _) = connect(&server, Role::Manager).await;

    let err = rows(&manager, &format!("SELECT * FROM bookings WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));

    let err = rows(&manager, "SELECT * FROM vehicles").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn login_must_be_a_registered_user() {
    let server = start_test_server().await;
    assert!(connect_as(server.addr, "postgres").await.is_err());
    assert!(connect_as(server.addr, &Ulid::new().to_string()).await.is_err());

    // The role is the registry's, whatever the login string claims.
    let (_, id) = connect(&server, Role::User).await;
    assert!(connect_as(server.addr, &format!("admin:{id}")).await.is_err());
    let member = connect_as(server.addr, &id.to_string()).await.unwrap();
    let booking = Ulid::new();
    rows(
        &member,
        &format!("INSERT INTO period_bookings (id, date, period) VALUES ('{booking}', '2024-01-10', 'AM')"),
    )
    .await
    .unwrap();
    let err = rows(&member, &format!("INSERT INTO approvals (booking_id) VALUES ('{booking}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));

    // Deactivation cuts off an open session at its next statement.
    server.registry.deactivate_user(&id);
    assert!(rows(&member, "SELECT * FROM calendar_meta").await.is_err());
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let server = start_test_server().await;
    let (_, id) = connect(&server, Role::Manager).await;
    let mut config = Config::new();
    config
        .host(server.addr.ip().to_string())
        .port(server.addr.port())
        .dbname("fleet")
        .user(id.to_string())
        .password("fleetbook");
    assert!(config.connect(NoTls).await.is_err());
}

#[tokio::test]
async fn members_cannot_read_each_others_bookings() {
    let server = start_test_server().await;
    let (alice, alice_id) = connect(&server, Role::User).await;
    let (bob, bob_id) = connect(&server, Role::User).await;
    let (manager, _) = connect(&server, Role::Manager).await;

    let id = Ulid::new();
    let created = rows(
        &alice,
        &format!("INSERT INTO period_bookings (id, date, period) VALUES ('{id}', '2024-01-10', 'PM')"),
    )
    .await
    .unwrap();
    let ticket = created[0].get("ticket").unwrap().to_string();

    let err = rows(&bob, &format!("SELECT * FROM bookings WHERE requested_for = '{alice_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
    let err = rows(&bob, &format!("SELECT * FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));
    let err = rows(&bob, &format!("SELECT * FROM bookings WHERE ticket = '{ticket}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));
    let err = rows(&bob, &format!("SELECT * FROM bookings WHERE vehicle_id = '{}'", server.vehicle))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INSUFFICIENT_PRIVILEGE));
    assert!(
        rows(&bob, &format!("SELECT * FROM bookings WHERE requested_for = '{bob_id}'"))
            .await
            .unwrap()
            .is_empty()
    );

    assert_eq!(
        rows(&alice, &format!("SELECT * FROM bookings WHERE ticket = '{ticket}'"))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        rows(&manager, &format!("SELECT * FROM bookings WHERE requested_for = '{alice_id}'"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn bad_values_are_invalid_parameters() {
    let server = start_test_server().await;
    let (manager, _) = connect(&server, Role::Manager).await;

    let err = rows(
        &manager,
        &format!(
            "INSERT INTO bookings (id, start_at, end_at) VALUES ('{}', 'yesterday-ish', '2024-01-10T12:00:00Z')",
            Ulid::new()
        ),
    )
    .await
    .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_DATETIME_FORMAT));

    let err = rows(&manager, "SELECT * FROM bookings WHERE id = 'not-a-ulid'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = rows(&manager, &format!("INSERT INTO bookings (id, start_at) VALUES ('{}', {JAN10})", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));
}

#[tokio::test]
async fn multi_statement_batch_is_refused_whole() {
    let server = start_test_server().await;
    let (manager, manager_id) = connect(&server, Role::Manager).await;

    let batch = format!(
        "INSERT INTO bookings (id, start_at, end_at) VALUES ('{}', {}, {}); \
         INSERT INTO bookings (id, start_at, end_at) VALUES ('{}', {}, {})",
        Ulid::new(),
        JAN10,
        JAN10 + HOUR,
        Ulid::new(),
        JAN10 + 2 * HOUR,
        JAN10 + 3 * HOUR
    );
    let err = rows(&manager, &batch).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::SYNTAX_ERROR));
    assert!(
        rows(&manager, &format!("SELECT * FROM bookings WHERE requested_for = '{manager_id}'"))
            .await
            .unwrap()
            .is_empty()
    );
}
