//! Loopback integration suites for the remoting runtime.
//!
//! Each test runs two runtimes with distinct instance identifiers over a
//! real TCP connection pair, the way two processes would talk.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use farlink_core::{Delegate, Error, Invocation, Remotable};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Basic calls
// =============================================================================

#[test]
fn calls_reach_the_serving_runtime() {
    let net = loopback("basic");
    let reckoner = net.reckoner();
    let identity = reckoner.identity().unwrap();
    assert_eq!(identity, net.server_runtime.identifier().to_string());
    assert_ne!(identity, net.client_runtime.identifier().to_string());
    assert!(reckoner.call_count().unwrap() >= 1);

    // type-resolution hints are fire-and-forget and must not disturb the
    // request stream
    net.connection.client().announce_assembly("farlink.tests").unwrap();
    assert_eq!(reckoner.echo("after hint").unwrap(), "after hint");
}

#[test]
fn by_ref_arguments_travel_back() {
    let net = loopback("byref");
    let reckoner = net.reckoner();
    let mut value = 4;
    reckoner.bump(&mut value).unwrap();
    assert_eq!(value, 6);
}

#[test]
fn separate_instances_get_separate_ids() {
    let net = loopback("instances");
    let a = net.connection.create_remote_instance(RECKONER).unwrap();
    let b = net.connection.create_remote_instance(RECKONER).unwrap();
    let id_a = a.proxy_target().unwrap().id.clone();
    let id_b = b.proxy_target().unwrap().id.clone();
    assert_ne!(id_a, id_b);
    assert!(id_a.is_owned_by(net.server_runtime.identifier()));
}

// =============================================================================
// Callbacks and events over the reverse channel
// =============================================================================

#[test]
fn callbacks_flow_over_the_reverse_channel() {
    let net = loopback("callback");
    let reckoner = net.reckoner();
    let receiver = Arc::new(CallbackReceiver::default());
    reckoner.register_callback(receiver.clone()).unwrap();
    // the server worker calls back into this runtime while the original
    // request is still outstanding; replies arriving on separate streams
    // keep this from deadlocking
    reckoner.run_callbacks().unwrap();
    assert!(receiver.called.load(Ordering::SeqCst));
}

#[test]
fn event_sinks_add_and_remove() {
    let net = loopback("events");
    let reckoner = net.reckoner();
    let sink = Arc::new(TickSink::default());
    let handler = Delegate::bound(sink.clone() as Arc<dyn Remotable>, SINK_ON_TICK, TICK_SINK);

    reckoner.add_on_tick(handler.clone()).unwrap();
    reckoner.raise_tick("first").unwrap();
    assert_eq!(*sink.seen.lock().unwrap(), vec!["first".to_string()]);

    reckoner.remove_on_tick(handler.clone()).unwrap();
    // a second removal of the same handler must be a no-op
    reckoner.remove_on_tick(handler).unwrap();
    reckoner.raise_tick("second").unwrap();
    assert_eq!(*sink.seen.lock().unwrap(), vec!["first".to_string()]);
}

#[test]
fn object_references_survive_inside_payloads() {
    let net = loopback("objref");
    let reckoner = net.reckoner();
    let receiver = Arc::new(CallbackReceiver::default());
    let envelope = Envelope {
        label: "knock knock".to_string(),
        payload: net.client_runtime.obj_ref(receiver.clone()),
    };
    reckoner.open_envelope(&envelope).unwrap();
    assert!(receiver.called.load(Ordering::SeqCst));
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn unserializable_arguments_fail_at_the_caller() {
    let net = loopback("unserializable");
    let reckoner = net.reckoner();
    let err = reckoner.send_anything(&Unserializable).unwrap_err();
    assert!(matches!(err, Error::SerializationFailure(_)));
    // nothing reached the wire; the connection is still usable
    assert_eq!(reckoner.echo("still up").unwrap(), "still up");
}

#[test]
fn unserializable_replies_come_back_as_exceptions() {
    let net = loopback("badreply");
    let reckoner = net.reckoner();
    let err = reckoner.bad_return().unwrap_err();
    assert!(matches!(err, Error::SerializationFailure(_)));
    assert_eq!(reckoner.echo("still up").unwrap(), "still up");
}

// =============================================================================
// Distributed GC
// =============================================================================

#[test]
fn released_proxies_are_reported_and_reclaimed() {
    let net = loopback("gc");
    let reckoner = net.reckoner();

    let component = reckoner.component().unwrap();
    let id = net
        .client_runtime
        .instances
        .try_get_id(&component)
        .expect("stub should be registered");
    assert!(id.is_owned_by(net.server_runtime.identifier()));

    let held_before = net.server_runtime.instances.len();
    drop(component);
    net.connection.collect_garbage().unwrap();
    wait_until("cleanup notice to land", || {
        net.server_runtime.instances.len() < held_before
    });

    // a fresh fetch may or may not come back under the old id, but no
    // call may fail
    let component = reckoner.component().unwrap();
    component
        .dispatch(Invocation::new(W_PING, vec![]))
        .unwrap();
}

#[test]
fn hard_references_survive_until_the_notice() {
    let net = loopback("gc-hard");
    let reckoner = net.reckoner();
    let receiver = Arc::new(CallbackReceiver::default());
    reckoner.register_callback(receiver.clone()).unwrap();

    // the receiver's id is held hard here until the peer reports release
    let id = net
        .client_runtime
        .instances
        .try_get_id(&(receiver.clone() as Arc<dyn Remotable>))
        .expect("receiver should be pinned");
    assert!(id.is_owned_by(net.client_runtime.identifier()));
    assert!(net.client_runtime.instances.try_get(&id).is_some());
}

// =============================================================================
// Services and shutdown
// =============================================================================

#[test]
fn well_known_services_resolve_by_type_name() {
    let net = loopback("services");
    let first = net.connection.get_service(RECKONER).unwrap();
    let second = net.connection.get_service(RECKONER).unwrap();
    // both requests resolve to the same proxy, object identity included
    assert!(farlink_core::same_object(&first, &second));

    let proxy = farlink_core::downcast::<ReckonerProxy>(first).unwrap();
    assert_eq!(
        proxy.identity().unwrap(),
        net.server_runtime.identifier().to_string()
    );

    let err = net.connection.get_service("farlink.tests.NoSuchService").unwrap_err();
    assert!(matches!(err, Error::ProxyManagement(_)));
}

#[test]
fn shutdown_notice_fails_pending_work() {
    let net = loopback("shutdown");
    let reckoner = net.reckoner();
    assert_eq!(reckoner.echo("before").unwrap(), "before");

    net.connection.client().send_shutdown_server().unwrap();
    wait_until("server shutdown", || !net.server_runtime.is_running());
    wait_until("channel teardown", || !net.connection.client().is_alive());

    let err = reckoner.identity().unwrap_err();
    assert!(matches!(err, Error::ConnectionLost));
}
