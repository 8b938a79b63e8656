//! Tests against the system PC/SC service, skipped when it is not running

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use nexum_se_core::{
    Completion, ContextRegistry, MainLoop, Reader, SeError, SeService, ServiceConfig,
};
use nexum_se_pcsc::{PcscConfig, PcscDriver};

const TIMEOUT: Duration = Duration::from_secs(5);

fn pcsc_available() -> bool {
    pcsc::Context::establish(pcsc::Scope::User).is_ok()
}

#[test]
fn test_enumerate_readers() {
    if !pcsc_available() {
        println!("Skipping test, PC/SC not available");
        return;
    }

    let main_loop = MainLoop::new();
    let contexts = Arc::new(ContextRegistry::new());
    let context = contexts.create();
    let driver = PcscDriver::with_config(
        PcscConfig::new().with_poll_interval(Duration::from_millis(200)),
    );
    let service = SeService::new(
        Arc::new(driver),
        contexts.clone(),
        main_loop.queue(),
        ServiceConfig::default(),
    )
    .expect("service");

    let result: Arc<Mutex<Option<Result<Vec<Reader>, SeError>>>> = Arc::default();
    let ok = Arc::clone(&result);
    let err = Arc::clone(&result);
    service
        .get_readers(Completion::new(
            context,
            move |readers| *ok.lock() = Some(Ok(readers)),
            move |error| *err.lock() = Some(Err(error)),
        ))
        .expect("get readers");

    assert!(main_loop.run_until(TIMEOUT, || result.lock().is_some()));
    assert!(service.is_initialized());

    let readers = result.lock().take().expect("result").expect("readers");
    for reader in &readers {
        assert!(!reader.name().is_empty());
        println!("{}: present={:?}", reader.name(), reader.is_present());
    }

    service.shutdown();
    assert!(!service.is_initialized());
}
