use super::*;
use crate::catalog::actions;
use crate::extract::ScalarType;
use crate::testing::{init_tracing, FaultyKb};
use kbagent_graph::{AgentVerdict, MemoryKb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Upper slack allowed on top of a deadline
const SLACK: Duration = Duration::from_millis(250);

fn setup() -> (MemoryKb, AgentInvoker) {
    init_tracing();
    let kb = MemoryKb::with_protocol_markers();
    let invoker = AgentInvoker::new(Arc::new(kb.clone()));
    (kb, invoker)
}

fn rating_agent(kb: &MemoryKb, value: &'static str) {
    kb.register_agent(actions::UPDATE_RATING, move |kb, request| {
        let link = kb.create_link(value).unwrap();
        kb.attach_result(request.action, &[link]).unwrap();
        AgentVerdict::Succeeded
    });
}

#[test]
fn test_call_returns_typed_scalar() {
    let (kb, invoker) = setup();
    rating_agent(&kb, "7");
    let user = kb.create_node(NodeKind::Node).unwrap();

    let result = invoker
        .call(actions::UPDATE_RATING, &[RoleArg::node(1, user)])
        .unwrap();
    assert_eq!(result, Invocation::Ok(Payload::Int(7)));
    assert_eq!(kb.subscription_count(), 0);
}

#[test]
fn test_arguments_reach_the_agent() {
    let (kb, invoker) = setup();
    kb.register_agent(actions::AUTHENTICATION, |kb, request| {
        match (kb.argument_text(request, 1).as_deref(), kb.argument_text(request, 2).as_deref()) {
            (Some("alice"), Some("secret")) => AgentVerdict::Succeeded,
            _ => AgentVerdict::Failed,
        }
    });

    let ok = invoker
        .call(
            actions::AUTHENTICATION,
            &[RoleArg::text(1, "alice"), RoleArg::text(2, "secret")],
        )
        .unwrap();
    assert_eq!(ok, Invocation::Ok(Payload::Unit));

    let rejected = invoker
        .call(
            actions::AUTHENTICATION,
            &[RoleArg::text(1, "alice"), RoleArg::text(2, "wrong")],
        )
        .unwrap();
    assert_eq!(rejected, Invocation::Failed);
}

#[test]
fn test_errored_is_distinct_from_failed() {
    let (kb, invoker) = setup();
    kb.register_agent(actions::DELETE_EVENT, |_, _| AgentVerdict::Errored);

    let result = invoker
        .call(
            actions::DELETE_EVENT,
            &[RoleArg::text(1, "alice"), RoleArg::text(2, "meeting")],
        )
        .unwrap();
    assert_eq!(result, Invocation::Errored);
}

#[test]
fn test_silent_agent_times_out_without_leaking() {
    let (kb, invoker) = setup();
    kb.register_agent(actions::ADD_TOPIC, |_, _| AgentVerdict::Silent);
    let baseline = kb.subscription_count();

    let timeout = Duration::from_millis(150);
    let started = Instant::now();
    let result = invoker
        .invoke(
            actions::ADD_TOPIC,
            &[
                RoleArg::text(1, "alice"),
                RoleArg::text(2, "title"),
                RoleArg::text(3, "description"),
            ],
            &ResultSpec::Unit,
            timeout,
        )
        .unwrap();

    let elapsed = started.elapsed();
    match result {
        Invocation::TimedOut(after) => {
            assert!(after >= timeout, "{after:?}");
            assert!(after < timeout + SLACK, "{after:?}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= timeout, "{elapsed:?}");
    assert!(elapsed < timeout + SLACK, "{elapsed:?}");
    assert_eq!(kb.subscription_count(), baseline);
}

#[test]
fn test_disconnected_fails_fast() {
    let (kb, invoker) = setup();
    kb.set_connected(false);

    let err = invoker
        .call(actions::USER_EVENTS, &[RoleArg::text(1, "alice")])
        .unwrap_err();
    assert!(matches!(err, InvokeError::Disconnected));
}

#[test]
fn test_unknown_kind_marker_is_unresolved() {
    let (kb, invoker) = setup();
    let edges = kb.edge_count();

    let err = invoker
        .invoke(
            "action_not_on_server",
            &[RoleArg::text(1, "x")],
            &ResultSpec::Unit,
            Duration::from_secs(1),
        )
        .unwrap_err();
    assert!(
        matches!(&err, InvokeError::UnresolvedIdentifier { idtf, .. } if idtf == "action_not_on_server"),
        "{err}"
    );
    assert_eq!(kb.edge_count(), edges);
    assert_eq!(kb.subscription_count(), 0);
    assert!(invoker.markers().resolve(&kb, &MarkerRef::class("action_not_on_server")).is_err());
}

#[test]
fn test_catalog_mismatch_writes_nothing() {
    let (kb, invoker) = setup();
    let edges = kb.edge_count();

    let err = invoker
        .call(actions::AUTHENTICATION, &[RoleArg::text(1, "alice")])
        .unwrap_err();
    assert!(matches!(err, InvokeError::CatalogMismatch { .. }));

    let err = invoker
        .invoke(
            actions::AUTHENTICATION,
            &[RoleArg::text(1, "a"), RoleArg::text(1, "b")],
            &ResultSpec::Unit,
            Duration::from_secs(1),
        )
        .unwrap_err();
    assert!(matches!(err, InvokeError::InvalidArgumentSpec(_)));
    assert_eq!(kb.edge_count(), edges);
}

#[test]
fn test_uncatalogued_kind_needs_explicit_invoke() {
    let (kb, invoker) = setup();
    kb.register_agent("action_echo", |kb, request| {
        let text = kb.argument_text(request, 1).unwrap_or_default();
        let link = kb.create_link(&text).unwrap();
        kb.attach_result(request.action, &[link]).unwrap();
        AgentVerdict::Succeeded
    });

    let err = invoker.call("action_echo", &[RoleArg::text(1, "hi")]).unwrap_err();
    assert!(matches!(err, InvokeError::UnknownAction(_)));

    let result = invoker
        .invoke_shape("action_echo", &[RoleArg::text(1, "hi")], &ResultSpec::ScalarLink)
        .unwrap();
    assert_eq!(result.payload().and_then(Payload::as_text), Some("hi"));
    assert_eq!(invoker.timeout_for("action_echo"), Duration::from_secs(10));
}

#[test]
fn test_restart_refreshes_cached_markers() {
    let (kb, invoker) = setup();
    rating_agent(&kb, "3");
    let user = kb.create_node(NodeKind::Node).unwrap();
    let first = invoker
        .call(actions::UPDATE_RATING, &[RoleArg::node(1, user)])
        .unwrap();
    assert_eq!(first, Invocation::Ok(Payload::Int(3)));

    kb.restart();
    let user = kb.create_node(NodeKind::Node).unwrap();
    let second = invoker
        .call(actions::UPDATE_RATING, &[RoleArg::node(1, user)])
        .unwrap();
    assert_eq!(second, Invocation::Ok(Payload::Int(3)));
}

#[test]
fn test_malformed_result_is_reported() {
    let (kb, invoker) = setup();
    kb.register_agent(actions::CHECK_ANSWER, |kb, request| {
        let link = kb.create_link("maybe").unwrap();
        kb.attach_result(request.action, &[link]).unwrap();
        AgentVerdict::Succeeded
    });
    let question = kb.create_node(NodeKind::Node).unwrap();
    let user = kb.create_node(NodeKind::Node).unwrap();

    let result = invoker
        .call(
            actions::CHECK_ANSWER,
            &[RoleArg::node(1, question), RoleArg::node(2, user)],
        )
        .unwrap();
    match result {
        Invocation::Malformed(malformed) => assert_eq!(malformed.raw.as_deref(), Some("maybe")),
        other => panic!("expected malformed, got {other:?}"),
    }

    let direct = invoker
        .invoke(
            actions::CHECK_ANSWER,
            &[RoleArg::node(1, question), RoleArg::node(2, user)],
            &ResultSpec::TypedScalar(ScalarType::Text),
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(direct, Invocation::Ok(Payload::Text("maybe".to_string())));
}

#[test]
fn test_read_failure_after_success_does_not_reinitiate() {
    init_tracing();
    let kb = MemoryKb::with_protocol_markers();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    kb.register_agent("action_count_once", move |kb, request| {
        counter.fetch_add(1, Ordering::SeqCst);
        let link = kb.create_link("7").unwrap();
        kb.attach_result(request.action, &[link]).unwrap();
        AgentVerdict::Succeeded
    });
    let transport = FaultyKb::new(kb.clone()).failing_reads(TransportError::UnknownElement(7));
    let invoker = AgentInvoker::new(Arc::new(transport));

    let err = invoker
        .invoke(
            "action_count_once",
            &[],
            &ResultSpec::TypedScalar(ScalarType::Int),
            Duration::from_secs(2),
        )
        .unwrap_err();
    assert!(
        matches!(err, InvokeError::Transport(TransportError::UnknownElement(7))),
        "{err}"
    );

    // Give a stray second agent run time to show up.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(kb.subscription_count(), 0);
}

#[test]
fn test_stale_write_is_retried_once() {
    init_tracing();
    let kb = MemoryKb::with_protocol_markers();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    kb.register_agent("action_count_once", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        AgentVerdict::Succeeded
    });
    let transport = FaultyKb::new(kb.clone()).stale_write_after(Duration::ZERO);
    let invoker = AgentInvoker::new(Arc::new(transport));

    let result = invoker
        .invoke("action_count_once", &[], &ResultSpec::Unit, Duration::from_secs(2))
        .unwrap();
    assert_eq!(result, Invocation::Ok(Payload::Unit));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(kb.subscription_count(), 0);
}

#[test]
fn test_retry_shares_the_callers_deadline() {
    init_tracing();
    let kb = MemoryKb::with_protocol_markers();
    kb.register_agent("action_never_answers", |_, _| AgentVerdict::Silent);
    let timeout = Duration::from_millis(300);

    // The first write burns most of the deadline before it is rejected.
    let transport = FaultyKb::new(kb.clone()).stale_write_after(Duration::from_millis(200));
    let invoker = AgentInvoker::new(Arc::new(transport));
    let started = Instant::now();
    let result = invoker
        .invoke("action_never_answers", &[], &ResultSpec::Unit, timeout)
        .unwrap();
    let elapsed = started.elapsed();
    match result {
        Invocation::TimedOut(after) => assert!(after >= timeout && after < timeout + SLACK, "{after:?}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed < timeout + SLACK, "{elapsed:?}");

    // A write that outlasts the whole deadline is not initiated again.
    let transport = FaultyKb::new(kb.clone()).stale_write_after(timeout);
    let invoker = AgentInvoker::new(Arc::new(transport));
    let started = Instant::now();
    let result = invoker
        .invoke("action_never_answers", &[], &ResultSpec::Unit, timeout)
        .unwrap();
    assert!(matches!(result, Invocation::TimedOut(_)), "{result:?}");
    assert!(started.elapsed() < timeout + SLACK);
    assert_eq!(kb.subscription_count(), 0);
}

#[test]
fn test_success_payload_is_never_reported_as_failure() {
    let (kb, invoker) = setup();
    kb.register_agent("action_empty_success", |_, _| AgentVerdict::Succeeded);

    // No result structure: the discrepancy surfaces as malformed.
    let result = invoker
        .invoke("action_empty_success", &[], &ResultSpec::ScalarLink, Duration::from_secs(2))
        .unwrap();
    assert!(matches!(result, Invocation::Malformed(_)), "{result:?}");
    assert_ne!(result, Invocation::Failed);
}
