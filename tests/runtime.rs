mod fixture;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use scriptflow::core::forward_msg::ForwardMsgPayload;
use scriptflow::{
    script_fn, AppSessionState, BackMsg, ClientState, Delta, Runtime, RuntimeError,
    RuntimeState, Script, SessionClient, UserInfo,
};
use session_store::{session_file_name, FileSessionStorage};

use fixture::{kinds, runtime_lock, test_config, threaded_services, wait_until, RecordingClient, WAIT};

fn hello_script() -> Arc<dyn Script> {
    script_fn(|ctx| {
        ctx.text("hello from the script")?;
        Ok(())
    })
}

fn start_runtime() -> Arc<Runtime> {
    let runtime = Runtime::new(test_config(), hello_script(), threaded_services())
        .expect("no other runtime should be alive");
    runtime.start().expect("loop thread should start");
    runtime
}

fn shut_down(runtime: &Runtime) {
    runtime.stop();
    assert!(
        runtime.wait_until_stopped(Some(WAIT)),
        "runtime should stop in time"
    );
}

fn connect(runtime: &Runtime, client: &Arc<RecordingClient>) -> String {
    runtime
        .connect_session(
            Arc::clone(client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            None,
        )
        .expect("connect should succeed")
}

fn finished_runs(client: &RecordingClient) -> usize {
    client
        .messages()
        .iter()
        .filter(|msg| msg.is_script_finished_successfully())
        .count()
}

fn rerun(runtime: &Runtime, session_id: &str) {
    runtime
        .handle_backmsg(session_id, BackMsg::RerunScript { client_state: None })
        .expect("session should accept a rerun");
}

#[test]
fn connected_session_receives_a_full_run() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);

    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);
    assert_eq!(runtime.state(), RuntimeState::SessionsConnected);
    assert!(runtime.is_active_session(&session_id));

    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || finished_runs(&client) == 1));

    let messages = client.messages();
    assert_eq!(
        kinds(&messages),
        vec![
            "new_session",
            "session_status_changed",
            "delta",
            "script_finished",
            "session_status_changed",
        ]
    );
    assert_eq!(
        messages[2].as_delta(),
        Some(&Delta::text("hello from the script"))
    );
    assert!(messages[2].metadata.cacheable);

    shut_down(&runtime);
}

#[test]
fn repeated_delta_is_sent_as_reference() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);

    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || finished_runs(&client) == 1));
    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || finished_runs(&client) == 2));

    let messages = client.messages();
    let full: Vec<_> = messages.iter().filter(|msg| msg.is_delta()).collect();
    let references: Vec<_> = messages.iter().filter(|msg| msg.is_reference()).collect();
    assert_eq!(full.len(), 1);
    assert_eq!(references.len(), 1);

    let hash = full[0].hash.clone().expect("cached delta should carry its hash");
    assert_eq!(
        references[0].payload,
        ForwardMsgPayload::RefHash { hash: hash.clone() }
    );
    assert_eq!(references[0].metadata.delta_path, full[0].metadata.delta_path);
    assert_eq!(
        runtime
            .cached_message(&hash)
            .and_then(|msg| msg.as_delta().cloned()),
        Some(Delta::text("hello from the script"))
    );

    shut_down(&runtime);
}

#[test]
fn small_deltas_are_not_cached() {
    let _guard = runtime_lock();
    let runtime = Runtime::new(
        test_config().with_min_cached_message_size(1 << 20),
        hello_script(),
        threaded_services(),
    )
    .expect("no other runtime should be alive");
    runtime.start().expect("loop thread should start");
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);

    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || finished_runs(&client) == 1));
    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || finished_runs(&client) == 2));

    let messages = client.messages();
    assert!(messages.iter().all(|msg| !msg.is_reference()));
    assert!(messages.iter().all(|msg| !msg.metadata.cacheable));

    shut_down(&runtime);
}

#[test]
fn failed_write_disconnects_and_session_can_resume() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);
    let session = runtime.session(&session_id).expect("session should be active");

    client.fail_writes();
    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || {
        !runtime.is_active_session(&session_id)
            && runtime
                .stored_session_ids()
                .is_ok_and(|ids| ids.contains(&session_id))
    }));
    assert_eq!(session.state(), AppSessionState::ShutdownRequested);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
    assert_eq!(
        runtime.stored_session_ids().expect("storage should list"),
        vec![session_id.clone()]
    );

    let reconnected = Arc::new(RecordingClient::default());
    let resumed_id = runtime
        .connect_session(
            Arc::clone(&reconnected) as Arc<dyn SessionClient>,
            UserInfo::default(),
            Some(&session_id),
        )
        .expect("reconnect should succeed");
    assert_eq!(resumed_id, session_id);
    assert!(runtime
        .stored_session_ids()
        .expect("storage should list")
        .is_empty());

    rerun(&runtime, &resumed_id);
    assert!(wait_until(WAIT, || finished_runs(&reconnected) == 1));

    shut_down(&runtime);
}

#[test]
fn delta_lost_in_a_failed_write_is_resent_in_full_after_resume() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);

    client.fail_delta_writes();
    rerun(&runtime, &session_id);
    assert!(wait_until(WAIT, || {
        runtime
            .stored_session_ids()
            .is_ok_and(|ids| ids.contains(&session_id))
    }));
    assert!(client.messages().iter().all(|msg| !msg.is_delta()));

    let reconnected = Arc::new(RecordingClient::default());
    let resumed_id = runtime
        .connect_session(
            Arc::clone(&reconnected) as Arc<dyn SessionClient>,
            UserInfo::default(),
            Some(&session_id),
        )
        .expect("reconnect should succeed");
    rerun(&runtime, &resumed_id);
    assert!(wait_until(WAIT, || finished_runs(&reconnected) == 1));

    let messages = reconnected.messages();
    assert!(messages.iter().all(|msg| !msg.is_reference()));
    assert_eq!(
        messages.iter().filter(|msg| msg.is_delta()).count(),
        1,
        "the delta the first client never got must arrive in full"
    );

    shut_down(&runtime);
}

#[test]
fn reconnect_with_unknown_id_starts_a_new_session() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());

    let session_id = runtime
        .connect_session(
            Arc::clone(&client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            Some("never-stored"),
        )
        .expect("connect should succeed");
    assert_ne!(session_id, "never-stored");

    shut_down(&runtime);
}

#[test]
fn disconnect_and_close_are_idempotent() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);

    runtime
        .disconnect_session(&session_id)
        .expect("disconnect should store the session");
    runtime
        .disconnect_session(&session_id)
        .expect("second disconnect is a no-op");
    assert_eq!(
        runtime.stored_session_ids().expect("storage should list"),
        vec![session_id.clone()]
    );

    runtime.close_session(&session_id).expect("close should succeed");
    runtime
        .close_session(&session_id)
        .expect("second close is a no-op");
    assert!(runtime
        .stored_session_ids()
        .expect("storage should list")
        .is_empty());

    shut_down(&runtime);
}

#[test]
fn backmsg_for_unknown_session_is_an_error() {
    let _guard = runtime_lock();
    let runtime = start_runtime();

    let error = runtime
        .handle_backmsg("missing", BackMsg::StopScript)
        .expect_err("unknown session must be reported");
    assert!(matches!(error, RuntimeError::SessionNotFound(id) if id == "missing"));

    shut_down(&runtime);
}

#[test]
fn only_one_live_runtime_per_process() {
    let _guard = runtime_lock();
    let runtime = start_runtime();

    let error = Runtime::new(test_config(), hello_script(), threaded_services())
        .expect_err("a second runtime must be refused");
    assert!(matches!(error, RuntimeError::AlreadyExists));
    assert!(Runtime::instance().is_some_and(|instance| Arc::ptr_eq(&instance, &runtime)));

    shut_down(&runtime);
    let replacement = Runtime::new(test_config(), hello_script(), threaded_services())
        .expect("a stopped runtime does not block a new one");
    replacement.stop();
    assert_eq!(replacement.state(), RuntimeState::Stopped);
}

#[test]
fn stop_closes_sessions_and_refuses_further_work() {
    let _guard = runtime_lock();
    let runtime = start_runtime();
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);
    let session = runtime.session(&session_id).expect("session should be active");

    shut_down(&runtime);
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(session.state(), AppSessionState::ShutdownRequested);
    assert_eq!(runtime.session_count(), 0);

    let error = runtime
        .connect_session(
            Arc::clone(&client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            None,
        )
        .expect_err("stopped runtime must refuse connections");
    assert!(matches!(error, RuntimeError::Stopped));
    assert!(matches!(runtime.start(), Err(RuntimeError::Stopped)));
    runtime.stop();
    assert!(runtime.wait_until_stopped(Some(Duration::from_millis(10))));
}

#[test]
fn stopping_before_start_needs_no_loop() {
    let _guard = runtime_lock();
    let runtime = Runtime::new(test_config(), hello_script(), threaded_services())
        .expect("no other runtime should be alive");
    assert_eq!(runtime.state(), RuntimeState::Initial);

    runtime.stop();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert!(runtime.wait_until_stopped(Some(Duration::from_millis(10))));
}

#[test]
fn file_storage_keeps_disconnected_sessions_on_disk() {
    let _guard = runtime_lock();
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let storage = FileSessionStorage::new(dir.path(), Duration::from_secs(60))
        .expect("storage should open");
    let runtime = Runtime::with_storage(
        test_config(),
        hello_script(),
        threaded_services(),
        Box::new(storage),
    )
    .expect("no other runtime should be alive");
    runtime.start().expect("loop thread should start");

    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client);
    let session = runtime.session(&session_id).expect("session should be active");
    session.request_rerun(Some(ClientState::new("tab=3", Default::default())));
    assert!(wait_until(WAIT, || finished_runs(&client) == 1));

    runtime
        .disconnect_session(&session_id)
        .expect("disconnect should store the session");
    assert!(dir.path().join(session_file_name(&session_id)).is_file());

    let resumed_id = runtime
        .connect_session(
            Arc::clone(&client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            Some(&session_id),
        )
        .expect("reconnect should succeed");
    let resumed = runtime.session(&resumed_id).expect("session should be active");
    assert_eq!(resumed.client_state().query_string, "tab=3");
    assert!(!dir.path().join(session_file_name(&session_id)).exists());

    shut_down(&runtime);
}
