use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

/// The login user name is the booking owner, so each test persona gets its
/// own connection.
async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_room(client: &tokio_postgres::Client, slots: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, description, category, slots) \
             VALUES ('{rid}', 'Room A', 'Small meeting room', 'meeting', ARRAY[{slots}])"
        ))
        .await
        .unwrap();
    rid
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_and_list_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let rid = create_room(&alice, "'9am', '10am'").await;
    let bid = Ulid::new();
    alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{bid}', '{rid}', '9am')"
        ))
        .await
        .unwrap();

    let messages = alice.simple_query("SELECT * FROM bookings").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(bid.to_string().as_str()));
    assert_eq!(rows[0].get("resource_name"), Some("Room A"));
    assert_eq!(rows[0].get("resource_category"), Some("meeting"));
    assert_eq!(rows[0].get("slot"), Some("9am"));
    assert_eq!(rows[0].get("status"), Some("confirmed"));

    // Only 10am is still offered
    let messages = alice
        .simple_query(&format!("SELECT * FROM slots WHERE resource_id = '{rid}'"))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("slot"), Some("10am"));
}

#[tokio::test]
async fn double_booking_rejected_with_exclusion_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    let rid = create_room(&alice, "'9am'").await;
    alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{}', '{rid}', '9am')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = bob
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{}', '{rid}', '9am')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn missing_resource_yields_no_data_found() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let err = alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{}', '{}', '9am')",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn bookings_are_scoped_to_the_connection_user() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    let rid = create_room(&alice, "'9am', '10am'").await;
    let bid = Ulid::new();
    alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{bid}', '{rid}', '9am')"
        ))
        .await
        .unwrap();

    // Bob's listing does not include alice's booking
    let messages = bob.simple_query("SELECT * FROM bookings").await.unwrap();
    assert!(data_rows(&messages).is_empty());

    // Bob cannot release or rebook it either
    let err = bob
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
    let err = bob
        .batch_execute(&format!("UPDATE bookings SET slot = '10am' WHERE id = '{bid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    // Alice still holds 9am
    let messages = alice.simple_query("SELECT * FROM bookings").await.unwrap();
    assert_eq!(data_rows(&messages).len(), 1);
}

#[tokio::test]
async fn rebook_and_release_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    let rid = create_room(&alice, "'9am', '10am'").await;
    let bid = Ulid::new();
    alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{bid}', '{rid}', '9am')"
        ))
        .await
        .unwrap();

    alice
        .batch_execute(&format!("UPDATE bookings SET slot = '10am' WHERE id = '{bid}'"))
        .await
        .unwrap();

    // 9am freed by the rebook, bookable by bob
    bob.batch_execute(&format!(
        "INSERT INTO bookings (id, resource_id, slot) VALUES ('{}', '{rid}', '9am')",
        Ulid::new()
    ))
    .await
    .unwrap();

    // Release returns 10am to the pool
    alice
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();
    let messages = alice
        .simple_query(&format!("SELECT * FROM slots WHERE resource_id = '{rid}'"))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("slot"), Some("10am"));
}

#[tokio::test]
async fn resource_catalog_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let rid = create_room(&alice, "'9am'").await;
    alice
        .batch_execute(&format!(
            "INSERT INTO slots (resource_id, slot) VALUES ('{rid}', '10am'), ('{rid}', '11am')"
        ))
        .await
        .unwrap();
    alice
        .batch_execute(&format!("DELETE FROM slots WHERE resource_id = '{rid}' AND slot = '11am'"))
        .await
        .unwrap();

    let messages = alice.simple_query("SELECT * FROM resources").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some("Room A"));
    assert_eq!(rows[0].get("available_slots"), Some("10am,9am"));

    alice
        .batch_execute(&format!(
            "UPDATE resources SET name = 'Room B', description = 'Bigger', category = 'conference' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();
    let messages = alice.simple_query("SELECT * FROM resources").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows[0].get("name"), Some("Room B"));

    alice
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{rid}'"))
        .await
        .unwrap();
    let messages = alice.simple_query("SELECT * FROM resources").await.unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn delete_resource_with_bookings_rejected_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let rid = create_room(&alice, "'9am'").await;
    alice
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ('{}', '{rid}', '9am')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = alice
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let rid = create_room(&alice, "'9am'").await;
    let bid = Ulid::new();
    alice
        .execute(
            "INSERT INTO bookings (id, resource_id, slot) VALUES ($1, $2, $3)",
            &[&bid.to_string(), &rid.to_string(), &"9am"],
        )
        .await
        .unwrap();

    let messages = alice.simple_query("SELECT * FROM bookings").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(bid.to_string().as_str()));
}

#[tokio::test]
async fn tenants_isolated_by_database_name() {
    let (addr, _tm) = start_test_server().await;

    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other_tenant")
        .user("alice")
        .password("slotd");
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let alice = connect(addr, "alice").await;
    create_room(&alice, "'9am'").await;

    // The other tenant sees an empty catalog
    let messages = other.simple_query("SELECT * FROM resources").await.unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn listen_command_accepted() {
    let (addr, _tm) = start_test_server().await;
    let alice = connect(addr, "alice").await;

    let rid = create_room(&alice, "'9am'").await;
    alice
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();

    // Malformed channel is rejected
    let err = alice.batch_execute("LISTEN not_a_resource").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42000"));
}
