use std::sync::atomic::{AtomicUsize, Ordering};

use shared::domain::MessageStatus;

use super::*;

const STATUS_FRAME: &str = r#"{"type":"message_status","messageId":"9","status":"delivered"}"#;

#[test]
fn routes_frame_to_registered_handler() {
    let dispatcher = EventDispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher.on(EventKind::MessageStatus, move |event| {
        sink.lock().expect("lock").push(event);
    });

    let outcome = dispatcher.dispatch(STATUS_FRAME);

    assert_eq!(outcome, DispatchOutcome::Delivered(EventKind::MessageStatus));
    let seen = seen.lock().expect("lock");
    assert!(matches!(
        seen.as_slice(),
        [InboundEvent::MessageStatus {
            status: MessageStatus::Delivered,
            ..
        }]
    ));
}

#[test]
fn second_registration_replaces_first() {
    let dispatcher = EventDispatcher::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first);
    dispatcher.on(EventKind::MessageStatus, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&second);
    dispatcher.on(EventKind::MessageStatus, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    dispatcher.dispatch(STATUS_FRAME);

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn off_clears_the_slot() {
    let dispatcher = EventDispatcher::new();
    dispatcher.on(EventKind::MessageStatus, |_| {});
    dispatcher.off(EventKind::MessageStatus);

    assert!(!dispatcher.has_handler(EventKind::MessageStatus));
    assert_eq!(
        dispatcher.dispatch(STATUS_FRAME),
        DispatchOutcome::NoHandler(EventKind::MessageStatus)
    );
}

#[test]
fn malformed_and_unknown_frames_are_dropped() {
    let dispatcher = EventDispatcher::new();
    let calls = Arc::new(AtomicUsize::new(0));
    for kind in EventKind::ALL {
        let counter = Arc::clone(&calls);
        dispatcher.on(kind, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(dispatcher.dispatch("{oops"), DispatchOutcome::Dropped);
    assert_eq!(
        dispatcher.dispatch(r#"{"type":"presence","userId":"1"}"#),
        DispatchOutcome::Dropped
    );
    assert_eq!(
        dispatcher.dispatch(r#"{"type":"typing","chatId":"1"}"#),
        DispatchOutcome::Dropped
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn handler_may_unregister_itself() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let weak = Arc::downgrade(&dispatcher);
    dispatcher.on(EventKind::MessageStatus, move |_| {
        if let Some(dispatcher) = weak.upgrade() {
            dispatcher.off(EventKind::MessageStatus);
        }
    });

    assert_eq!(
        dispatcher.dispatch(STATUS_FRAME),
        DispatchOutcome::Delivered(EventKind::MessageStatus)
    );
    assert!(!dispatcher.has_handler(EventKind::MessageStatus));
}
