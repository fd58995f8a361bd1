//! End-to-end confirmation scenarios on virtual time.

use std::time::Duration;

use tokio::time::Instant;
use voice_lifecycle::config::LifecycleConfig;
use voice_lifecycle::confirmation::{LifecycleState, RejectReason};
use voice_lifecycle::events::{SideEffect, TransportEvent};
use voice_lifecycle::timers::TimerKind;
use voice_lifecycle::tool_call::FINALIZE_TOOL_NAME;
use voice_lifecycle::transcript::Speaker;

use crate::helpers::{Harness, MOCK_CONVERSATION_ID, QUESTION, has};

#[tokio::test(start_paused = true)]
async fn yes_without_tool_call_finalizes_from_client_after_delay() {
    let mut h = Harness::new(LifecycleConfig::default());
    let mut notices = h.controller.subscribe();
    h.start("sess_yes").await;

    let asked = h.say(Speaker::Assistant, QUESTION).await;
    assert_eq!(asked.to, LifecycleState::PendingConfirm);
    assert!(has(&asked, &SideEffect::ConfirmationRequested { turn_index: 0 }));

    let reply = h.say(Speaker::User, "yes").await;
    assert!(has(&reply, &SideEffect::ConfirmationGranted));
    assert!(has(&reply, &SideEffect::FallbackArmed { delay_ms: 1_800 }));
    assert!(h.controller.is_timer_armed(TimerKind::FallbackFinalize));

    let armed_at = Instant::now();
    let fired = h.until_timer(TimerKind::FallbackFinalize).await;
    assert!(armed_at.elapsed() >= Duration::from_millis(1_800));
    assert_eq!(fired.to, LifecycleState::Ended);
    assert!(has(
        &fired,
        &SideEffect::Finalized {
            conversation_id: Some(MOCK_CONVERSATION_ID)
        }
    ));

    let requests = h.store.requests();
    assert_eq!(requests.len(), 2, "snapshot then finalize: {requests:?}");
    assert!(!requests[0].finalize && !requests[0].autosave);
    assert!(requests[1].finalize && requests[1].confirmed && requests[1].close);
    assert_eq!(requests[1].reason, "client_fallback");
    assert_eq!(requests[1].conversation_id, Some(MOCK_CONVERSATION_ID));
    assert_eq!(requests[1].user_text, "yes\n");

    let session = h.controller.session().unwrap();
    assert!(session.is_finalized());
    assert_eq!(session.conversation_id(), Some(MOCK_CONVERSATION_ID));
    assert_eq!(
        h.model.sent().last(),
        Some(&h.controller.config().directives.closing_text)
    );

    let mut states = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        assert_eq!(notice.session_id, "sess_yes");
        states.push(notice.state);
    }
    assert_eq!(
        states,
        vec![
            LifecycleState::Active,
            LifecycleState::PendingConfirm,
            LifecycleState::Ended
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn no_keep_going_locks_out_a_late_tool_call() {
    let mut h = Harness::new(LifecycleConfig::default());
    h.start("sess_no").await;
    h.say(Speaker::Assistant, QUESTION).await;

    let declined_at = Instant::now();
    let reply = h.say(Speaker::User, "no, keep going").await;
    assert_eq!(reply.to, LifecycleState::Active);
    assert!(has(&reply, &SideEffect::ConfirmationDeclined { lockout_ms: 6_000 }));
    let ctx = h.controller.confirmation();
    assert!(!ctx.granted && !ctx.requested);
    assert_eq!(
        ctx.reject_finalize_until,
        Some(declined_at + Duration::from_secs(6))
    );
    assert_eq!(
        h.model.sent(),
        vec![h.controller.config().directives.continue_text.clone()]
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    let call = h
        .finalize_call("call_late", r#"{"reason":"user said bye","confirmed":true}"#)
        .await;
    assert!(has(
        &call,
        &SideEffect::FinalizeRejected {
            reason: RejectReason::Lockout
        }
    ));
    assert_eq!(call.to, LifecycleState::Active);
    assert!(h.store.finalize_requests().is_empty());
    assert_eq!(
        h.model.sent().last(),
        Some(&h.controller.config().directives.reject_finalize_text)
    );

    let expired = h.until_timer(TimerKind::LockoutExpiry).await;
    assert!(has(&expired, &SideEffect::LockoutExpired));
    assert!(Instant::now() >= declined_at + Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn yes_inside_lockout_does_not_finalize_from_client() {
    let mut h = Harness::without_autosave();
    h.start("sess_regrant").await;
    h.say(Speaker::Assistant, QUESTION).await;
    let declined_at = Instant::now();
    h.say(Speaker::User, "no").await;

    tokio::time::advance(Duration::from_millis(500)).await;
    h.say(Speaker::Assistant, QUESTION).await;
    let reply = h.say(Speaker::User, "yes").await;
    assert!(has(&reply, &SideEffect::ConfirmationGranted));

    let fired = h.until_timer(TimerKind::FallbackFinalize).await;
    assert!(Instant::now() < declined_at + Duration::from_secs(6));
    assert!(has(
        &fired,
        &SideEffect::FinalizeRejected {
            reason: RejectReason::Lockout
        }
    ));
    assert_eq!(fired.to, LifecycleState::Active);
    assert!(h.store.requests().is_empty());
    assert!(!h.controller.session().unwrap().is_finalized());

    // Once the lockout is over the standing grant lets the model close.
    h.until_timer(TimerKind::LockoutExpiry).await;
    let call = h
        .finalize_call("call_after", r#"{"reason":"bye","confirmed":true}"#)
        .await;
    assert_eq!(call.to, LifecycleState::Ended);
    assert_eq!(h.store.finalize_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hesitant_reply_declines_instead_of_ending() {
    let mut h = Harness::new(LifecycleConfig::default());
    h.start("sess_unsure").await;
    h.say(Speaker::Assistant, QUESTION).await;

    let reply = h.say(Speaker::User, "I'm not sure").await;
    assert_eq!(reply.to, LifecycleState::Active);
    assert!(has(&reply, &SideEffect::ConfirmationDeclined { lockout_ms: 6_000 }));
    assert!(!h.controller.confirmation().granted);
    assert!(!h.controller.is_timer_armed(TimerKind::FallbackFinalize));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(h.store.finalize_requests().is_empty());
    assert_eq!(h.controller.state(), LifecycleState::Active);
}

#[tokio::test(start_paused = true)]
async fn ok_after_stop_intent_finalizes_without_a_question() {
    let mut h = Harness::without_autosave();
    h.start("sess_ok").await;
    h.say(Speaker::Assistant, "Happy to help with anything else.").await;

    let stop = h.say(Speaker::User, "I think we're done, bye").await;
    assert!(has(&stop, &SideEffect::StopIntentObserved));
    assert_eq!(stop.to, LifecycleState::Active);

    tokio::time::advance(Duration::from_secs(5)).await;
    let ok = h.say(Speaker::User, "ok").await;
    assert!(has(&ok, &SideEffect::ConfirmationGranted));
    assert_eq!(ok.to, LifecycleState::PendingConfirm);
    assert!(!h.controller.confirmation().requested);

    let fired = h.until_timer(TimerKind::FallbackFinalize).await;
    assert_eq!(fired.to, LifecycleState::Ended);
    assert_eq!(h.store.finalize_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ok_long_after_stop_intent_is_ignored() {
    let mut h = Harness::without_autosave();
    h.start("sess_late_ok").await;
    h.say(Speaker::User, "that's all for today").await;

    tokio::time::advance(Duration::from_secs(30)).await;
    let ok = h.say(Speaker::User, "ok").await;
    assert!(ok.effects.is_empty(), "unexpected effects: {:?}", ok.effects);
    assert!(!h.controller.is_timer_armed(TimerKind::FallbackFinalize));
}

#[tokio::test(start_paused = true)]
async fn broken_reply_stays_pending() {
    let mut h = Harness::without_autosave();
    h.start("sess_broken").await;
    h.say(Speaker::Assistant, QUESTION).await;

    let reply = h.say(Speaker::User, "broken").await;
    assert!(has(&reply, &SideEffect::AmbiguousReply));
    assert_eq!(reply.to, LifecycleState::PendingConfirm);
    assert!(!h.controller.is_timer_armed(TimerKind::FallbackFinalize));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(h.controller.state(), LifecycleState::PendingConfirm);

    let later = h.say(Speaker::User, "yes").await;
    assert!(has(&later, &SideEffect::ConfirmationGranted));
}

#[tokio::test(start_paused = true)]
async fn streamed_tool_call_after_yes_finalizes_and_cancels_fallback() {
    let mut h = Harness::without_autosave();
    h.start("sess_tool").await;
    h.stream(Speaker::Assistant, "Are you sure you want ").await;
    let asked = h.stream(Speaker::Assistant, "to end the call?").await;
    assert_eq!(asked.to, LifecycleState::PendingConfirm);
    h.say(Speaker::Assistant, "").await;
    h.say(Speaker::User, "yes please").await;

    let c = &mut h.controller;
    c.handle(TransportEvent::ToolCallStart {
        call_id: "call_1".into(),
        name: FINALIZE_TOOL_NAME.into(),
    })
    .await;
    for delta in [r#"{"reason":"user "#, r#"confirmed","confirmed":"#, "true}"] {
        c.handle(TransportEvent::ToolCallArgsDelta {
            call_id: "call_1".into(),
            delta: delta.into(),
        })
        .await;
    }
    let done = c
        .handle(TransportEvent::ToolCallDone {
            call_id: "call_1".into(),
            name: None,
            arguments: None,
        })
        .await;

    assert!(has(&done, &SideEffect::FallbackCancelled));
    assert_eq!(done.to, LifecycleState::Ended);
    assert!(!h.controller.is_timer_armed(TimerKind::FallbackFinalize));
    let finals = h.store.finalize_requests();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].reason, "user confirmed");

    // A second call after the end is ignored without another save.
    let again = h.finalize_call("call_2", r#"{"reason":"x","confirmed":true}"#).await;
    assert!(has(
        &again,
        &SideEffect::FinalizeRejected {
            reason: RejectReason::AlreadyEnded
        }
    ));
    assert_eq!(h.store.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn tool_call_saying_unconfirmed_is_rejected() {
    let mut h = Harness::without_autosave();
    h.start("sess_unconfirmed").await;
    h.say(Speaker::Assistant, QUESTION).await;
    h.say(Speaker::User, "yes").await;

    let call = h
        .finalize_call("call_u", r#"{"reason":"asked","confirmed":false}"#)
        .await;
    assert!(has(
        &call,
        &SideEffect::FinalizeRejected {
            reason: RejectReason::ModelUnconfirmed
        }
    ));
    assert!(has(&call, &SideEffect::FallbackCancelled));
    assert_eq!(call.to, LifecycleState::Active);
    assert!(h.store.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unprompted_tool_call_is_rejected() {
    let mut h = Harness::without_autosave();
    h.start("sess_unprompted").await;
    h.say(Speaker::User, "what are your prices").await;

    let call = h.finalize_call("call_x", "{not json").await;
    assert!(has(
        &call,
        &SideEffect::FinalizeRejected {
            reason: RejectReason::NoPermission
        }
    ));
    assert!(h.store.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unrelated_tool_calls_are_ignored() {
    let mut h = Harness::without_autosave();
    h.start("sess_other_tool").await;
    let done = h
        .controller
        .handle(TransportEvent::ToolCallDone {
            call_id: "c".into(),
            name: Some("lookup_price".into()),
            arguments: Some("{}".into()),
        })
        .await;
    assert!(has(
        &done,
        &SideEffect::ToolCallIgnored {
            name: "lookup_price".into()
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn connection_loss_runs_two_phase_stop() {
    let mut h = Harness::without_autosave();
    h.start("sess_lost").await;
    h.say(Speaker::Assistant, "Hello, how can I help?").await;
    h.say(Speaker::User, "tell me about pricing").await;

    let lost = h.controller.handle(TransportEvent::ConnectionLost).await;
    assert!(has(
        &lost,
        &SideEffect::SessionStopped {
            session_id: "sess_lost".into(),
            reason: "connection_lost".into()
        }
    ));
    assert_eq!(lost.to, LifecycleState::Ended);
    assert!(h.controller.session().is_none());

    let requests = h.store.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.reason == "connection_lost"));
    assert_eq!(requests[0].ai_text, "Hello, how can I help?\n");
    // No one is listening for model instructions after a stop.
    assert!(h.model.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_persists_previous_session_and_starts_clean() {
    let mut h = Harness::new(LifecycleConfig::default());
    h.start("sess_a").await;
    h.say(Speaker::Assistant, QUESTION).await;
    h.say(Speaker::User, "no").await;

    let restarted = h.start("sess_b").await;
    assert!(has(
        &restarted,
        &SideEffect::SessionStopped {
            session_id: "sess_a".into(),
            reason: "restart".into()
        }
    ));
    assert!(has(
        &restarted,
        &SideEffect::SessionStarted {
            session_id: "sess_b".into()
        }
    ));
    assert_eq!(restarted.to, LifecycleState::Active);
    assert_eq!(h.controller.session().map(|s| s.session_id()), Some("sess_b"));
    assert_eq!(h.controller.confirmation().reject_finalize_until, None);
    for kind in [
        TimerKind::Autosave,
        TimerKind::FallbackFinalize,
        TimerKind::LockoutExpiry,
    ] {
        assert!(!h.controller.is_timer_armed(kind));
    }
    assert!(
        h.store
            .requests()
            .iter()
            .all(|r| r.session_id == "sess_a")
    );
}
