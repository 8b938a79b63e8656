//! Readers, sessions and channels against the simulated driver

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::{AID, ATR, Harness, Outcome, SELECT, SELECT_RESPONSE, echo_card};
use nexum_se_core::sim::{SimApplet, SimCard, SimDriver, SimOp};
use nexum_se_core::{
    Channel, ContextRegistry, ErrorKind, MainLoop, NativeErrorCode, SeService, ServiceConfig,
};

#[test]
fn test_open_transmit_close() {
    let harness = Harness::connected();
    let reader = harness.reader("SIM1");
    assert!(reader.is_present().unwrap());

    let session = harness.open_session(&reader);
    assert_eq!(session.reader().name(), "SIM1");
    assert_eq!(session.atr().unwrap().as_ref(), &ATR);

    let channel = harness.open_channel(&session, true);
    assert!(channel.is_basic_channel());
    assert_eq!(channel.select_response().unwrap().as_ref(), &SELECT_RESPONSE);

    let response = harness.transmit(&channel, &SELECT).unwrap();
    assert_eq!(response.as_ref(), &[0x00, 0xA4, 0x04, 0x00, 0x90, 0x00]);

    channel.close().unwrap();
    assert!(channel.is_closed());
    session.close().unwrap();
    assert!(session.is_closed());

    // Closing twice is a no-op
    channel.close().unwrap();
    session.close().unwrap();
    assert_eq!(harness.driver.calls(SimOp::CloseSession), 1);
    assert_eq!(harness.driver.calls(SimOp::CloseChannel), 1);
}

#[test]
fn test_logical_channel() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));

    let basic = harness.open_channel(&session, true);
    let logical = harness.open_channel(&session, false);
    assert!(basic.is_basic_channel());
    assert!(!logical.is_basic_channel());

    let response = harness.transmit(&logical, &[0x80, 0xCA, 0x00, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x80, 0xCA, 0x00, 0x00, 0x90, 0x00]);
}

#[test]
fn test_wrong_aid_length_fails_synchronously() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));

    for aid in [&[0xA0, 0x00, 0x00][..], &[0xA0; 4][..], &[0xA0; 17][..]] {
        let outcome = Outcome::<Channel>::new();
        let err = session
            .open_channel(aid, true, outcome.completion(harness.context))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValues);
        assert_eq!(err.message(), "wrong AID length");

        harness.settle();
        assert_eq!(outcome.count(), 0);
    }

    assert_eq!(harness.driver.calls(SimOp::OpenBasicChannel), 0);
    assert_eq!(harness.driver.calls(SimOp::OpenLogicalChannel), 0);
}

#[test]
fn test_longest_aid_is_accepted() {
    let long_aid = [0xA0; 16];
    let driver = SimDriver::manual();
    driver.insert_card(
        "SIM1",
        SimCard::new(ATR.to_vec()).with_applet(SimApplet::new(long_aid.to_vec())),
    );
    let harness = Harness::new(driver);
    harness.connect();
    let session = harness.open_session(&harness.reader("SIM1"));

    let outcome = Outcome::new();
    session
        .open_logical_channel(&long_aid, outcome.completion(harness.context))
        .unwrap();
    let channel = harness.outcome(&outcome).unwrap();
    assert!(!channel.is_closed());
}

#[test]
fn test_native_errors_are_translated() {
    let harness = Harness::connected();
    let reader = harness.reader("SIM1");

    harness
        .driver
        .fail(SimOp::OpenSession, NativeErrorCode::SecurityNotAllowed);
    let outcome = Outcome::new();
    reader.open_session(outcome.completion(harness.context)).unwrap();
    assert_eq!(harness.outcome(&outcome).unwrap_err().kind(), ErrorKind::Security);
    harness.driver.clear_failure(SimOp::OpenSession);

    let session = harness.open_session(&reader);
    harness
        .driver
        .fail(SimOp::OpenLogicalChannel, NativeErrorCode::IllegalReference);
    let outcome = Outcome::new();
    session
        .open_logical_channel(&AID, outcome.completion(harness.context))
        .unwrap();
    assert_eq!(
        harness.outcome(&outcome).unwrap_err().kind(),
        ErrorKind::InvalidValues
    );

    let channel = harness.open_channel(&session, true);
    harness.driver.fail(SimOp::Transmit, NativeErrorCode::OperationTimeout);
    let err = harness.transmit(&channel, &SELECT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(err.message().contains("transmitting"));

    // Synchronous accessors report native failures as unknown errors
    harness.driver.fail(SimOp::Atr, NativeErrorCode::IoFailed);
    assert_eq!(session.atr().unwrap_err().kind(), ErrorKind::Unknown);
    harness.driver.fail(SimOp::CloseChannels, NativeErrorCode::IllegalState);
    assert_eq!(session.close_channels().unwrap_err().kind(), ErrorKind::Unknown);
}

#[test]
fn test_unknown_applet_and_missing_card() {
    let driver = SimDriver::manual();
    driver.insert_card("SIM1", SimCard::new(ATR.to_vec()));
    driver.add_reader("SIM2");
    let harness = Harness::new(driver);
    harness.connect();

    let session = harness.open_session(&harness.reader("SIM1"));
    let outcome = Outcome::new();
    session
        .open_basic_channel(&AID, outcome.completion(harness.context))
        .unwrap();
    assert_eq!(
        harness.outcome(&outcome).unwrap_err().kind(),
        ErrorKind::InvalidValues
    );

    let empty = harness.reader("SIM2");
    assert!(!empty.is_present().unwrap());
    let outcome = Outcome::new();
    empty.open_session(outcome.completion(harness.context)).unwrap();
    assert_eq!(
        harness.outcome(&outcome).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_panicking_applet_is_unknown_error() {
    let driver = SimDriver::manual();
    driver.insert_card(
        "SIM1",
        SimCard::new(ATR.to_vec()).with_applet(
            SimApplet::new(AID.to_vec()).with_responder(|_| panic!("applet crashed")),
        ),
    );
    let harness = Harness::new(driver);
    harness.connect();

    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, true);
    let err = harness.transmit(&channel, &SELECT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);

    // The worker survived
    let logical = harness.open_channel(&session, false);
    assert!(!logical.is_closed());
}

#[test]
fn test_closed_session_disables_channels() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, false);

    session.close().unwrap();
    assert!(channel.is_closed());

    let err = harness.transmit(&channel, &SELECT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(harness.driver.calls(SimOp::Transmit), 0);

    let outcome = Outcome::<Channel>::new();
    session
        .open_basic_channel(&AID, outcome.completion(harness.context))
        .unwrap();
    assert_eq!(
        harness.outcome(&outcome).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_close_sessions_and_channels() {
    let harness = Harness::connected();
    let reader = harness.reader("SIM1");
    let first = harness.open_session(&reader);
    let second = harness.open_session(&reader);

    let channel = harness.open_channel(&first, true);
    first.close_channels().unwrap();
    assert!(channel.is_closed());
    assert!(!first.is_closed());

    reader.close_sessions().unwrap();
    assert!(first.is_closed());
    assert!(second.is_closed());
}

#[test]
fn test_dropping_handles_closes_them() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, false);

    drop(channel);
    assert_eq!(harness.driver.calls(SimOp::CloseChannel), 1);
    drop(session);
    assert_eq!(harness.driver.calls(SimOp::CloseSession), 1);
}

#[test]
fn test_closing_channel_of_dropped_session_does_nothing() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, true);

    drop(session);
    assert!(channel.is_closed());
    channel.close().unwrap();
    channel.close().unwrap();
    assert_eq!(harness.driver.calls(SimOp::CloseChannel), 0);
}

#[test]
fn test_handles_are_stale_after_shutdown() {
    let harness = Harness::connected();
    let reader = harness.reader("SIM1");
    let session = harness.open_session(&reader);
    let channel = harness.open_channel(&session, true);

    harness.service.shutdown();

    assert_eq!(reader.is_present().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(session.atr().unwrap_err().kind(), ErrorKind::InvalidState);
    assert!(session.is_closed());
    assert!(channel.is_closed());
    channel.close().unwrap();
    session.close().unwrap();

    let err = harness.transmit(&channel, &SELECT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // New handles after reconnecting do not alias the old ones
    harness.connect();
    let fresh = harness.reader("SIM1");
    assert_ne!(fresh.id(), reader.id());
    assert!(reader.is_present().is_err());
    assert!(fresh.is_present().unwrap());
}

#[test]
fn test_dead_context_drops_result() {
    let harness = Harness::connected();
    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, true);

    let context = harness.contexts.create();
    let outcome = Outcome::<Bytes>::new();
    channel.transmit(&SELECT, outcome.completion(context)).unwrap();
    harness.contexts.destroy(context);
    harness.settle();

    assert_eq!(outcome.count(), 0);
    assert_eq!(harness.driver.calls(SimOp::Transmit), 1);
}

#[test]
fn test_full_queue_rejects_synchronously() {
    let driver = SimDriver::manual();
    driver.insert_card("SIM1", echo_card());
    let config = ServiceConfig::new()
        .with_worker_threads(1)
        .with_queue_capacity(1);
    let harness = Harness::with_config(driver, config);
    harness.connect();

    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, true);
    harness.driver.set_latency(Duration::from_millis(200));

    let mut accepted = Vec::new();
    let mut rejected = None;
    for _ in 0..4 {
        let outcome = Outcome::<Bytes>::new();
        match channel.transmit(&SELECT, outcome.completion(harness.context)) {
            Ok(()) => accepted.push(outcome),
            Err(err) => {
                rejected = Some((err, outcome));
                break;
            }
        }
    }

    let (err, outcome) = rejected.expect("queue never filled up");
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(harness.wait(|| accepted.iter().all(|o| o.count() == 1)));
    harness.settle();
    assert_eq!(outcome.count(), 0);
}

#[test]
fn test_shutdown_cancels_queued_jobs() {
    let driver = SimDriver::manual();
    driver.insert_card("SIM1", echo_card());
    let harness = Harness::with_config(driver, ServiceConfig::new().with_worker_threads(1));
    harness.connect();

    let session = harness.open_session(&harness.reader("SIM1"));
    let channel = harness.open_channel(&session, true);
    harness.driver.set_latency(Duration::from_millis(200));

    let running = Outcome::<Bytes>::new();
    let queued = Outcome::<Bytes>::new();
    channel
        .transmit(&SELECT, running.completion(harness.context))
        .unwrap();
    channel
        .transmit(&SELECT, queued.completion(harness.context))
        .unwrap();
    harness.service.shutdown();

    let err = harness.outcome(&queued).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(harness.wait(|| running.count() == 1));
}

#[test]
fn test_dropped_service_invalidates_handles() {
    let driver = SimDriver::new();
    driver.insert_card("SIM1", echo_card());
    let main_loop = MainLoop::new();
    let contexts = Arc::new(ContextRegistry::new());
    let context = contexts.create();
    let service = SeService::new(
        Arc::new(driver.clone()),
        contexts.clone(),
        main_loop.queue(),
        ServiceConfig::default(),
    )
    .unwrap();
    assert!(main_loop.run_until(common::TIMEOUT, || service.is_initialized()));

    let outcome = Outcome::new();
    service.get_readers(outcome.completion(context)).unwrap();
    assert!(main_loop.run_until(common::TIMEOUT, || outcome.count() == 1));
    let reader = outcome.take().unwrap().unwrap().remove(0);

    drop(service);
    assert_eq!(driver.live_connections(), 0);
    assert_eq!(reader.is_present().unwrap_err().kind(), ErrorKind::InvalidState);
    let outcome = Outcome::new();
    assert!(reader.open_session(outcome.completion(context)).is_err());
}
