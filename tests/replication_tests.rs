//! End-to-end master/replica tests: handshake, propagation, backlog
//! replay and WAIT acknowledgement counting.

mod support;

use std::thread;
use std::time::Duration;

use support::{start_master, start_replica, TestClient};

#[test]
fn writes_propagate_to_an_attached_replica() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["SET", "k", "v"], "+OK\r\n");

    let mut replica = TestClient::connect(replica_addr);
    replica.poll_until(&["GET", "k"], "+v\r\n", Duration::from_secs(3));
}

#[test]
fn late_replica_receives_the_backlog() {
    let master_addr = start_master();

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["SET", "early", "1"], "+OK\r\n");
    master.roundtrip(&["SET", "early2", "2"], "+OK\r\n");

    // attach only after the writes happened
    let replica_addr = start_replica(master_addr);
    let mut replica = TestClient::connect(replica_addr);
    replica.poll_until(&["GET", "early"], "+1\r\n", Duration::from_secs(3));
    replica.poll_until(&["GET", "early2"], "+2\r\n", Duration::from_secs(3));
}

#[test]
fn del_propagates_too() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["SET", "k", "v"], "+OK\r\n");
    let mut replica = TestClient::connect(replica_addr);
    replica.poll_until(&["GET", "k"], "+v\r\n", Duration::from_secs(3));

    master.roundtrip(&["DEL", "k"], ":1\r\n");
    replica.poll_until(&["GET", "k"], "$-1\r\n", Duration::from_secs(3));
}

#[test]
fn wait_counts_acknowledged_replicas() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["SET", "k", "v"], "+OK\r\n");

    // make sure the replica caught up before asking
    let mut replica = TestClient::connect(replica_addr);
    replica.poll_until(&["GET", "k"], "+v\r\n", Duration::from_secs(3));

    master.roundtrip(&["WAIT", "1", "500"], ":1\r\n");
}

#[test]
fn wait_without_writes_reports_the_replica_count() {
    let master_addr = start_master();
    start_replica(master_addr);

    // give the handshake a moment to register the replica
    thread::sleep(Duration::from_millis(500));

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["WAIT", "5", "100"], ":1\r\n");
}

#[test]
fn wait_on_a_lonely_master_replies_zero() {
    let master_addr = start_master();
    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["WAIT", "1", "100"], ":0\r\n");
}

#[test]
fn replica_refuses_client_writes() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut replica = TestClient::connect(replica_addr);
    replica.roundtrip(
        &["SET", "k", "v"],
        "-READONLY You can't write against a read only replica.\r\n",
    );
    // the connection survives and reads still work
    replica.roundtrip(&["GET", "k"], "$-1\r\n");
}

#[test]
fn replica_reports_the_slave_role() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut replica = TestClient::connect(replica_addr);
    replica.send(&["INFO", "replication"]);
    let reply = replica.read_reply();
    assert!(reply.contains("role:slave"), "unexpected INFO reply: {reply:?}");
}

#[test]
fn transactional_writes_propagate_at_exec_time() {
    let master_addr = start_master();
    let replica_addr = start_replica(master_addr);

    let mut master = TestClient::connect(master_addr);
    master.roundtrip(&["MULTI"], "+OK\r\n");
    master.roundtrip(&["SET", "a", "1"], "+QUEUED\r\n");
    master.roundtrip(&["SET", "b", "2"], "+QUEUED\r\n");
    master.roundtrip(&["EXEC"], "*2\r\n+OK\r\n+OK\r\n");

    let mut replica = TestClient::connect(replica_addr);
    replica.poll_until(&["GET", "a"], "+1\r\n", Duration::from_secs(3));
    replica.poll_until(&["GET", "b"], "+2\r\n", Duration::from_secs(3));
}
