use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rpc_runtime::{handler, na, rpc, Proc, ReturnCode};

#[derive(Default)]
struct EchoPayload {
    data: Vec<u8>,
}

fn echo_in_proc(proc: &mut Proc<'_>, payload: &mut dyn Any) -> rpc_runtime::error::Result<()> {
    let payload = payload
        .downcast_mut::<EchoPayload>()
        .ok_or(ReturnCode::InvalidParam)?;
    proc.process_bytes(&mut payload.data)
}

fn echo_out_proc(proc: &mut Proc<'_>, payload: &mut dyn Any) -> rpc_runtime::error::Result<()> {
    let payload = payload
        .downcast_mut::<EchoPayload>()
        .ok_or(ReturnCode::InvalidParam)?;
    proc.process_bytes(&mut payload.data)
}

/// Verify loopback round trips end-to-end through the process-global API:
/// a no-op call with empty proc functions, then a 16-byte echo.
///
/// This is a lightweight smoke test; one test function owns the global
/// runtime for its whole lifetime.
#[test]
fn self_round_trip_noop_and_echo() -> Result<()> {
    let class = na::initialize("tcp", None, true)?;
    rpc::init(class.clone())?;

    let noop_id = rpc::register("noop", None, None)?;
    let echo_id = rpc::register("echo", Some(echo_in_proc), Some(echo_out_proc))?;

    let (found, id) = rpc::registered("noop")?;
    assert!(found);
    assert_eq!(id, noop_id);
    let (found, _) = rpc::registered("never-registered")?;
    assert!(!found);

    handler::register("noop", |handle| handle.start_response(None))?;
    handler::register("echo", |handle| {
        let mut input = EchoPayload::default();
        handle.get_input(&mut input)?;
        handle.start_response(Some(&mut input))
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let server_shutdown = shutdown.clone();
    let server = std::thread::spawn(move || {
        while !server_shutdown.load(Ordering::Acquire) {
            match handler::process(Duration::from_millis(50)) {
                Ok(()) | Err(ReturnCode::Timeout) => {}
                Err(e) => panic!("handler loop failed: {}", e),
            }
        }
    });

    let self_addr = class.addr_self()?;

    // No-op call: header-only payload, no output.
    let request = rpc::forward(&self_addr, noop_id, None, None)?;
    assert!(rpc::wait(&request, Duration::from_secs(5))?);
    assert!(request.send_buf_released());
    rpc::request_free(request)?;

    // Echo: the decoded output must equal what was sent.
    let mut input = EchoPayload {
        data: b"ABCDEFGHIJKLMNOP".to_vec(),
    };
    let output = rpc::output_slot(EchoPayload::default());
    let request = rpc::forward(&self_addr, echo_id, Some(&mut input), Some(output.clone()))?;
    assert!(rpc::wait(&request, Duration::from_secs(5))?);
    {
        let guard = output.lock();
        let echoed = guard.downcast_ref::<EchoPayload>().expect("echo payload");
        assert_eq!(echoed.data, b"ABCDEFGHIJKLMNOP");
    }
    rpc::request_free(request)?;

    shutdown.store(true, Ordering::Release);
    server.join().expect("server thread");

    rpc::finalize()?;
    class.finalize()?;
    Ok(())
}
