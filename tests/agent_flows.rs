//! End-to-end call-control scenarios against a recording engine

mod common;

use common::*;
use sipua::infrastructure::protocols::sip::{
    DialogState, EngineEvent, HeaderAccess, SipMethod, TransactionId,
};
use sipua::{AgentState, CallDirection, SipEventType};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

const BOB: &str = "sip:bob@10.0.0.1";

// ---- registration ----

#[tokio::test]
async fn test_register_challenge_then_accept_clears_retries() {
    let (agent, engine, log) = started_agent().await;

    agent.register(3600).await.unwrap();
    agent.flush().await;
    let register = engine.requests_of(SipMethod::Register)[0].clone();
    let call_id = register.call_id().unwrap();
    assert_eq!(register.header("Expires").as_deref(), Some("3600"));

    agent
        .process_event(response_event(digest_challenge(&register), &register, None))
        .await;
    let registers = engine.requests_of(SipMethod::Register);
    assert_eq!(registers.len(), 2);
    let retry = registers[1].clone();
    assert!(retry.header("Authorization").unwrap().contains("realm=\"example.com\""));
    assert_eq!(retry.call_id().as_deref(), Some(call_id.as_str()));
    assert_eq!(agent.auth_attempts(&call_id).await, 1);

    agent
        .process_event(response_event(response_to(&retry, 200, None), &retry, None))
        .await;
    assert_eq!(agent.auth_attempts(&call_id).await, 0);
    assert!(log.types().is_empty());
}

#[tokio::test]
async fn test_register_challenges_stop_after_three_attempts() {
    let (agent, engine, log) = started_agent().await;

    agent.register(3600).await.unwrap();
    agent.flush().await;
    let register = engine.requests_of(SipMethod::Register)[0].clone();

    for _ in 0..4 {
        agent
            .process_event(response_event(digest_challenge(&register), &register, None))
            .await;
    }

    assert_eq!(engine.requests_of(SipMethod::Register).len(), 3);
    // giving up is not reported to the application
    assert!(log.types().is_empty());
}

#[tokio::test]
async fn test_refresh_networking_unregisters_old_contact_first() {
    let engine = Arc::new(RecordingEngine::default());
    let (collaborators, _) = collaborators(engine.clone());
    let addresses = Arc::new(Mutex::new(vec!["192.168.1.30".to_string(), LOCAL_IP.to_string()]));
    let collaborators = collaborators.with_local_ip(move || {
        addresses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| "192.168.1.30".to_string())
    });
    let (agent, _log) = start_with(collaborators).await;

    agent.refresh_networking(1800).await.unwrap();
    agent.flush().await;

    let registers = engine.requests_of(SipMethod::Register);
    assert_eq!(registers.len(), 2);
    assert_eq!(registers[0].header("Expires").as_deref(), Some("0"));
    assert!(registers[0].contact_uri().unwrap().contains("192.168.1.20:5070"));
    assert_eq!(registers[1].header("Expires").as_deref(), Some("1800"));
    assert!(registers[1].contact_uri().unwrap().contains("192.168.1.30:5070"));

    assert_eq!(engine.unlistens.load(Ordering::SeqCst), 1);
    assert_eq!(engine.listens.lock().unwrap().len(), 2);
    assert!(engine.is_listening());
    assert_eq!(agent.profile().await.local_ip, "192.168.1.30");
}

#[tokio::test]
async fn test_registrar_change_reinitializes_stack() {
    let engine = Arc::new(RecordingEngine::default());
    let (collaborators, created) = collaborators(engine.clone());
    let (agent, _log) = start_with(collaborators).await;
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let mut moved = agent.profile().await;
    moved.remote_ip = "10.0.0.2".to_string();
    agent.set_profile(moved).await;

    agent.register(3600).await.unwrap();
    agent.flush().await;

    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert!(engine.stops.load(Ordering::SeqCst) >= 1);
    assert_eq!(agent.state().await, AgentState::Ready);
    assert!(agent.is_bound().await);

    let registers = engine.requests_of(SipMethod::Register);
    assert_eq!(registers.len(), 1);
    assert!(registers[0].uri().to_string().contains("10.0.0.2"));
}

// ---- outgoing calls ----

#[tokio::test]
async fn test_outgoing_call_connect_and_hangup() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    assert_eq!(agent.state().await, AgentState::Calling);
    assert_eq!(agent.direction().await, CallDirection::Outgoing);

    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    assert!(invite.body_text().contains("m=audio 5000 RTP/AVP 0 4 18"));
    assert!(invite.body_text().contains("c=IN IP4 192.168.1.20"));
    let dialog = client_dialog(&invite);

    agent
        .process_event(response_event(response_to(&invite, 180, None), &invite, None))
        .await;
    agent
        .process_event(response_event(
            response_to(&invite, 200, Some(peer_sdp(7000))),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    assert_eq!(*engine.acks.lock().unwrap(), vec![dialog.clone()]);
    assert_eq!(agent.state().await, AgentState::Established);
    assert_eq!(agent.remote_rtp_port().await, Some(7000));

    let events = log.events();
    assert_eq!(
        log.types(),
        vec![SipEventType::RemoteRinging, SipEventType::CallConnected]
    );
    assert_eq!(events[1].remote_rtp_port, Some(7000));
    assert!(events[1].from.contains("sip:bob@10.0.0.1"));
    assert!(events[1].sdp.as_deref().unwrap().contains("m=audio 7000"));

    agent.hangup().await.unwrap();
    agent.flush().await;

    assert_eq!(
        *engine.dialog_requests.lock().unwrap(),
        vec![(dialog.clone(), SipMethod::Bye)]
    );
    let bye = engine.requests_of(SipMethod::Bye)[0].clone();
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(agent.direction().await, CallDirection::None);

    agent
        .process_event(response_event(response_to(&bye, 200, None), &bye, None))
        .await;
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);
    assert_eq!(log.types().last(), Some(&SipEventType::IncomingByeResponse));
}

#[tokio::test]
async fn test_challenged_invite_is_retried_and_connects() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();

    agent
        .process_event(response_event(digest_challenge(&invite), &invite, None))
        .await;
    let invites = engine.requests_of(SipMethod::Invite);
    assert_eq!(invites.len(), 2);
    let retry = invites[1].clone();
    assert!(retry.header("Authorization").is_some());
    assert_ne!(retry.via_branch(), invite.via_branch());

    let dialog = client_dialog(&retry);
    agent
        .process_event(response_event(
            response_to(&retry, 200, Some(peer_sdp(7002))),
            &retry,
            Some(dialog.clone()),
        ))
        .await;

    assert_eq!(*engine.acks.lock().unwrap(), vec![dialog]);
    assert_eq!(agent.state().await, AgentState::Established);
    assert_eq!(log.types(), vec![SipEventType::CallConnected]);
    assert_eq!(log.events()[0].remote_rtp_port, Some(7002));
}

#[tokio::test]
async fn test_call_with_offer_sends_it_verbatim() {
    let (agent, engine, log) = started_agent().await;
    let offer = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                 m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
                 a=rtpmap:111 opus/48000/2\r\na=setup:actpass\r\n";

    agent.call_with_offer(BOB, offer, &[]).await.unwrap();
    agent.flush().await;

    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    assert_eq!(invite.body_text(), offer);

    agent
        .process_event(response_event(
            response_to(&invite, 200, Some(peer_sdp(9000))),
            &invite,
            Some(client_dialog(&invite)),
        ))
        .await;

    let connected = &log.events()[0];
    assert_eq!(connected.event_type, SipEventType::CallConnected);
    assert_eq!(connected.remote_rtp_port, Some(9000));
}

#[tokio::test]
async fn test_declined_and_unavailable_responses() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();

    agent
        .process_event(response_event(response_to(&invite, 503, None), &invite, None))
        .await;
    assert_eq!(agent.state().await, AgentState::Calling);

    agent
        .process_event(response_event(response_to(&invite, 486, None), &invite, None))
        .await;
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);
    assert_eq!(
        log.types(),
        vec![SipEventType::ServiceUnavailable, SipEventType::Declined]
    );
}

#[tokio::test]
async fn test_cancel_before_answer() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    let dialog = client_dialog(&invite);
    agent
        .process_event(response_event(
            response_to(&invite, 180, None),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    agent.cancel().await.unwrap();
    agent.flush().await;
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);

    let cancel = engine.requests_of(SipMethod::Cancel)[0].clone();
    assert_eq!(cancel.call_id(), invite.call_id());
    assert_eq!(cancel.via_branch(), invite.via_branch());

    let invite_txn = TransactionId::from_branch(&invite.via_branch().unwrap());
    engine.set_dialog(&invite_txn, &dialog, DialogState::Early);
    agent
        .process_event(response_event(response_to(&cancel, 200, None), &cancel, None))
        .await;

    assert!(engine.requests_of(SipMethod::Bye).is_empty());
    assert_eq!(log.types(), vec![SipEventType::RemoteRinging]);
}

#[tokio::test]
async fn test_cancel_after_answer_sends_bye() {
    let (agent, engine, _log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    let dialog = client_dialog(&invite);
    agent
        .process_event(response_event(
            response_to(&invite, 180, None),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    agent.cancel().await.unwrap();
    agent.flush().await;
    let cancel = engine.requests_of(SipMethod::Cancel)[0].clone();

    // the INVITE won the race and the dialog is now confirmed
    let invite_txn = TransactionId::from_branch(&invite.via_branch().unwrap());
    engine.set_dialog(&invite_txn, &dialog, DialogState::Confirmed);
    agent
        .process_event(response_event(response_to(&cancel, 200, None), &cancel, None))
        .await;

    assert_eq!(
        *engine.dialog_requests.lock().unwrap(),
        vec![(dialog, SipMethod::Bye)]
    );
    assert_eq!(engine.requests_of(SipMethod::Bye).len(), 1);
}

#[tokio::test]
async fn test_answer_after_cancel_is_acked_and_ended() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    let dialog = client_dialog(&invite);
    agent
        .process_event(response_event(
            response_to(&invite, 180, None),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    agent.cancel().await.unwrap();
    agent.flush().await;
    let cancel = engine.requests_of(SipMethod::Cancel)[0].clone();

    // CANCEL completes while the dialog is still early
    let invite_txn = TransactionId::from_branch(&invite.via_branch().unwrap());
    engine.set_dialog(&invite_txn, &dialog, DialogState::Early);
    agent
        .process_event(response_event(response_to(&cancel, 200, None), &cancel, None))
        .await;
    assert!(engine.requests_of(SipMethod::Bye).is_empty());

    // then the peer answers anyway
    agent
        .process_event(response_event(
            response_to(&invite, 200, Some(peer_sdp(7000))),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    assert_eq!(*engine.acks.lock().unwrap(), vec![dialog.clone()]);
    assert_eq!(
        *engine.dialog_requests.lock().unwrap(),
        vec![(dialog, SipMethod::Bye)]
    );
    assert_eq!(engine.requests_of(SipMethod::Bye).len(), 1);
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);
    assert_eq!(agent.remote_rtp_port().await, None);
    assert_eq!(log.types(), vec![SipEventType::RemoteRinging]);
}

#[tokio::test]
async fn test_stray_cancel_leaves_outgoing_call_up() {
    let (agent, engine, log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    let dialog = client_dialog(&invite);
    agent
        .process_event(response_event(
            response_to(&invite, 200, Some(peer_sdp(7000))),
            &invite,
            Some(dialog.clone()),
        ))
        .await;
    assert_eq!(agent.state().await, AgentState::Established);

    agent
        .process_event(request_event(
            incoming_request(SipMethod::Cancel, "unrelated-call", "cancel3", None),
            None,
        ))
        .await;

    assert_eq!(engine.statuses(), vec![200]);
    assert_eq!(agent.state().await, AgentState::Established);
    assert_eq!(agent.direction().await, CallDirection::Outgoing);
    assert_eq!(agent.remote_rtp_port().await, Some(7000));
    assert_eq!(log.types(), vec![SipEventType::CallConnected]);

    agent.hangup().await.unwrap();
    agent.flush().await;
    assert_eq!(
        *engine.dialog_requests.lock().unwrap(),
        vec![(dialog, SipMethod::Bye)]
    );
}

// ---- incoming calls ----

#[tokio::test]
async fn test_incoming_call_accept_and_busy_second_call() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-1", 6000), None))
        .await;
    assert_eq!(engine.statuses(), vec![100]);
    assert_eq!(agent.state().await, AgentState::Incoming);
    assert_eq!(agent.direction().await, CallDirection::Incoming);

    let ringing = &log.events()[0];
    assert_eq!(ringing.event_type, SipEventType::LocalRinging);
    assert_eq!(ringing.remote_rtp_port, Some(6000));
    assert!(ringing.from.contains("sip:bob@10.0.0.1"));
    assert!(ringing.sdp.as_deref().unwrap().contains("m=audio 6000"));

    agent.accept_call(5000).await.unwrap();
    agent.flush().await;
    assert_eq!(engine.statuses(), vec![100, 200]);
    assert_eq!(agent.state().await, AgentState::Established);

    let invite_txn = TransactionId::from_branch("z9hG4bKinv-1");
    let ok = engine.responses_on(&invite_txn)[1].clone();
    assert!(ok.body_text().contains("m=audio 5000 RTP/AVP 0 4 18"));
    assert!(ok.body_text().contains("c=IN IP4 192.168.1.20"));
    assert!(ok.to_tag().is_some());
    assert!(ok.contact_uri().unwrap().contains("192.168.1.20:5070"));

    let connected = &log.events()[1];
    assert_eq!(connected.event_type, SipEventType::CallConnected);
    assert_eq!(connected.remote_rtp_port, Some(6000));

    // a second caller is turned away without touching the active call
    agent
        .process_event(request_event(incoming_invite("inv-2", 6100), None))
        .await;
    let busy_txn = TransactionId::from_branch("z9hG4bKinv-2");
    let busy = engine.responses_on(&busy_txn);
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].status_code(), 486);
    assert_eq!(agent.state().await, AgentState::Established);
    assert_eq!(agent.remote_rtp_port().await, Some(6000));
    assert_eq!(log.types().len(), 2);

    let dialog = sipua::infrastructure::protocols::sip::DialogId {
        call_id: "inv-1".to_string(),
        local_tag: "alicetag".to_string(),
        remote_tag: "bobtag".to_string(),
    };
    engine.set_dialog(&invite_txn, &dialog, DialogState::Confirmed);
    agent.hangup().await.unwrap();
    agent.flush().await;
    assert_eq!(
        *engine.dialog_requests.lock().unwrap(),
        vec![(dialog, SipMethod::Bye)]
    );
}

#[tokio::test]
async fn test_retransmitted_invite_is_ignored() {
    let (agent, engine, log) = started_agent().await;
    let invite = incoming_invite("inv-r", 6000);

    agent.process_event(request_event(invite.clone(), None)).await;
    agent.process_event(request_event(invite, None)).await;

    assert_eq!(engine.statuses(), vec![100]);
    assert_eq!(log.types(), vec![SipEventType::LocalRinging]);
    assert_eq!(agent.state().await, AgentState::Incoming);
}

#[tokio::test]
async fn test_incoming_bye_ends_call() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-b", 6000), None))
        .await;
    agent.accept_call(5000).await.unwrap();
    agent.flush().await;

    agent
        .process_event(request_event(
            incoming_request(SipMethod::Bye, "inv-b", "bye1", None),
            None,
        ))
        .await;

    let bye_txn = TransactionId::from_branch("z9hG4bKbye1");
    assert_eq!(engine.responses_on(&bye_txn)[0].status_code(), 200);
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);
    assert_eq!(agent.remote_rtp_port().await, None);
    assert_eq!(log.types().last(), Some(&SipEventType::IncomingByeRequest));
}

#[tokio::test]
async fn test_remote_cancel_terminates_invite() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-c", 6000), None))
        .await;
    agent
        .process_event(request_event(
            incoming_request(SipMethod::Cancel, "inv-c", "cancel1", None),
            None,
        ))
        .await;

    let cancel_txn = TransactionId::from_branch("z9hG4bKcancel1");
    let invite_txn = TransactionId::from_branch("z9hG4bKinv-c");
    assert_eq!(engine.responses_on(&cancel_txn)[0].status_code(), 200);
    let invite_statuses: Vec<u16> = engine
        .responses_on(&invite_txn)
        .iter()
        .map(|r| r.status_code())
        .collect();
    assert_eq!(invite_statuses, vec![100, 487]);

    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(
        log.types(),
        vec![SipEventType::LocalRinging, SipEventType::RemoteCancel]
    );
}

#[tokio::test]
async fn test_cancel_for_unknown_call_is_only_acknowledged() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-k", 6000), None))
        .await;
    agent
        .process_event(request_event(
            incoming_request(SipMethod::Cancel, "other-call", "cancel2", None),
            None,
        ))
        .await;

    assert_eq!(engine.statuses(), vec![100, 200]);
    assert_eq!(agent.state().await, AgentState::Incoming);
    assert_eq!(log.types(), vec![SipEventType::LocalRinging]);
}

#[tokio::test]
async fn test_reject_incoming_call() {
    let (agent, engine, _log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-d", 6000), None))
        .await;
    agent.reject_call().await.unwrap();
    agent.flush().await;

    assert_eq!(engine.statuses(), vec![100, 603]);
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);

    // nothing left to reject
    agent.reject_call().await.unwrap();
    agent.flush().await;
    assert_eq!(engine.statuses(), vec![100, 603]);
}

#[tokio::test]
async fn test_hangup_declines_unanswered_call() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-h", 6000), None))
        .await;
    agent.hangup().await.unwrap();
    agent.flush().await;

    let invite_txn = TransactionId::from_branch("z9hG4bKinv-h");
    let statuses: Vec<u16> = engine
        .responses_on(&invite_txn)
        .iter()
        .map(|r| r.status_code())
        .collect();
    assert_eq!(statuses, vec![100, 603]);
    assert!(engine.requests_of(SipMethod::Bye).is_empty());
    assert_eq!(agent.state().await, AgentState::Idle);
    assert_eq!(agent.direction().await, CallDirection::None);
    assert_eq!(log.types(), vec![SipEventType::LocalRinging]);
}

#[tokio::test]
async fn test_second_accept_is_ignored() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(incoming_invite("inv-a", 6000), None))
        .await;
    agent.accept_call(5000).await.unwrap();
    agent.flush().await;
    agent.accept_call(5002).await.unwrap();
    agent.accept_call_with_answer(&peer_sdp(5004)).await.unwrap();
    agent.flush().await;

    assert_eq!(engine.statuses(), vec![100, 200]);
    assert_eq!(agent.state().await, AgentState::Established);
    assert_eq!(
        log.types(),
        vec![SipEventType::LocalRinging, SipEventType::CallConnected]
    );

    // accepting with nothing offered does nothing either
    let (idle, idle_engine, idle_log) = started_agent().await;
    idle.accept_call(5000).await.unwrap();
    idle.flush().await;
    assert!(idle_engine.statuses().is_empty());
    assert_eq!(idle.state().await, AgentState::Idle);
    assert!(idle_log.types().is_empty());
}

// ---- out-of-dialog requests ----

#[tokio::test]
async fn test_incoming_message_and_unsupported_method() {
    let (agent, engine, log) = started_agent().await;

    agent
        .process_event(request_event(
            incoming_request(SipMethod::Message, "msg-1", "msg1", Some("hello alice")),
            None,
        ))
        .await;
    agent
        .process_event(request_event(
            incoming_request(SipMethod::Options, "opt-1", "opt1", None),
            None,
        ))
        .await;

    assert_eq!(engine.statuses(), vec![200, 501]);
    let events = log.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SipEventType::Message);
    assert_eq!(events[0].content, "hello alice");
    assert!(events[0].from.contains("sip:bob@10.0.0.1"));
    assert_eq!(agent.state().await, AgentState::Ready);
}

#[tokio::test]
async fn test_send_message_goes_out_of_dialog() {
    let (agent, engine, _log) = started_agent().await;

    agent.send_message(BOB, "on my way").await.unwrap();
    agent.flush().await;

    let message = engine.requests_of(SipMethod::Message)[0].clone();
    assert_eq!(message.body_text(), "on my way");
    assert!(message.to_header().unwrap().contains("sip:bob@10.0.0.1"));
    assert_eq!(agent.state().await, AgentState::Ready);
}

// ---- engine notifications ----

#[tokio::test]
async fn test_terminated_dialog_is_forgotten() {
    let (agent, engine, _log) = started_agent().await;

    agent.call(BOB, 5000, &[]).await.unwrap();
    agent.flush().await;
    let invite = engine.requests_of(SipMethod::Invite)[0].clone();
    let dialog = client_dialog(&invite);
    agent
        .process_event(response_event(
            response_to(&invite, 200, Some(peer_sdp(7000))),
            &invite,
            Some(dialog.clone()),
        ))
        .await;

    agent
        .process_event(EngineEvent::Timeout {
            transaction: TransactionId::from_branch("z9hG4bKunrelated"),
        })
        .await;
    assert_eq!(agent.state().await, AgentState::Established);

    agent
        .process_event(EngineEvent::DialogTerminated { dialog })
        .await;
    agent.hangup().await.unwrap();
    agent.flush().await;

    // nothing left to send the BYE on
    assert!(engine.dialog_requests.lock().unwrap().is_empty());
    assert!(engine.requests_of(SipMethod::Bye).is_empty());
}
