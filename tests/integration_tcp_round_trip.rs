use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rpc_runtime::na::CbInfoKind;
use rpc_runtime::{na, rpc, Addr, Proc, ReturnCode, Runtime};

#[derive(Default)]
struct EchoPayload {
    data: Vec<u8>,
}

#[derive(Default)]
struct BlobSummary {
    len: u64,
    sum: u64,
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

fn summary_out_proc(proc: &mut Proc<'_>, out: &mut dyn Any) -> rpc_runtime::error::Result<()> {
    let out = out
        .downcast_mut::<BlobSummary>()
        .ok_or(ReturnCode::InvalidParam)?;
    proc.process_u64(&mut out.len)?;
    proc.process_u64(&mut out.sum)
}

fn register_procedures(runtime: &Arc<Runtime>) -> Result<(u32, u32)> {
    let echo_id = runtime.register("echo", Some(echo_in_proc), Some(echo_out_proc))?;
    let big_id = runtime.register("big", Some(echo_in_proc), Some(summary_out_proc))?;
    Ok((echo_id, big_id))
}

/// Verify a full client/server round trip across two endpoints in one
/// process: name lookup, small echo, concurrent requests via `wait_all`,
/// and an oversized argument that exercises the one-sided pull over the
/// wire.
#[test]
fn tcp_round_trip_two_endpoints() -> Result<()> {
    let server_class = na::initialize("tcp", Some("127.0.0.1:0"), true)?;
    let client_class = na::initialize("tcp", None, false)?;

    let server_uri = server_class.addr_to_string(&server_class.addr_self()?)?;

    let server_runtime = Runtime::init(server_class.clone())?;
    let client_runtime = Runtime::init(client_class.clone())?;

    let (echo_id, big_id) = register_procedures(&client_runtime)?;
    register_procedures(&server_runtime)?;
    server_runtime.register_handler("echo", |handle| {
        let mut input = EchoPayload::default();
        handle.get_input(&mut input)?;
        handle.start_response(Some(&mut input))
    })?;
    server_runtime.register_handler("big", |handle| {
        let mut input = EchoPayload::default();
        handle.get_input(&mut input)?;
        let mut summary = BlobSummary {
            len: input.data.len() as u64,
            sum: input.data.iter().map(|&b| b as u64).sum(),
        };
        handle.start_response(Some(&mut summary))
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let server_shutdown = shutdown.clone();
    let server_loop = server_runtime.clone();
    let server = std::thread::spawn(move || {
        while !server_shutdown.load(Ordering::Acquire) {
            match server_loop.handler_process(Duration::from_millis(50)) {
                Ok(()) | Err(ReturnCode::Timeout) => {}
                Err(e) => panic!("handler loop failed: {}", e),
            }
        }
    });

    // Resolve the server's URI; the lookup completes through the
    // completion queue and records the URI on the address.
    let resolved: Arc<Mutex<Option<Addr>>> = Arc::new(Mutex::new(None));
    let resolved_slot = resolved.clone();
    client_class.addr_lookup(
        client_runtime.context(),
        Box::new(move |info| {
            assert!(info.result.is_ok());
            if let CbInfoKind::Lookup { addr } = info.kind {
                *resolved_slot.lock() = Some(addr);
            }
        }),
        &server_uri,
    )?;
    client_runtime
        .context()
        .trigger(Duration::from_secs(1), u32::MAX)?;
    let server_addr = resolved.lock().take().expect("lookup resolved");
    assert_eq!(client_class.addr_to_string(&server_addr)?, server_uri);
    assert!(!client_class.addr_is_self(&server_addr));

    // Small echo.
    let mut input = EchoPayload {
        data: b"over-the-wire".to_vec(),
    };
    let output = rpc::output_slot(EchoPayload::default());
    let request =
        client_runtime.forward(&server_addr, echo_id, Some(&mut input), Some(output.clone()))?;
    assert!(client_runtime.wait(&request, Duration::from_secs(10))?);
    {
        let guard = output.lock();
        assert_eq!(
            guard.downcast_ref::<EchoPayload>().expect("echo").data,
            b"over-the-wire"
        );
    }
    client_runtime.request_free(request)?;

    // Two concurrent requests with distinct tags, collected via wait_all.
    let mut first_input = EchoPayload {
        data: vec![0x11; 64],
    };
    let mut second_input = EchoPayload {
        data: vec![0x22; 64],
    };
    let first_output = rpc::output_slot(EchoPayload::default());
    let second_output = rpc::output_slot(EchoPayload::default());
    let requests = vec![
        client_runtime.forward(
            &server_addr,
            echo_id,
            Some(&mut first_input),
            Some(first_output.clone()),
        )?,
        client_runtime.forward(
            &server_addr,
            echo_id,
            Some(&mut second_input),
            Some(second_output.clone()),
        )?,
    ];
    for status in client_runtime.wait_all(&requests, Duration::from_secs(10)) {
        assert!(status?);
    }
    assert_eq!(
        first_output
            .lock()
            .downcast_ref::<EchoPayload>()
            .expect("first echo")
            .data,
        vec![0x11; 64]
    );
    assert_eq!(
        second_output
            .lock()
            .downcast_ref::<EchoPayload>()
            .expect("second echo")
            .data,
        vec![0x22; 64]
    );
    for request in requests {
        client_runtime.request_free(request)?;
    }

    // Oversized argument: it overflows inline framing, so the server pulls
    // it from the client's registered region across the connection and
    // summarizes what it saw.
    let blob: Vec<u8> = (0..100 * 1024usize).map(|i| (i % 199) as u8).collect();
    let expected_sum: u64 = blob.iter().map(|&b| b as u64).sum();
    let mut big_input = EchoPayload { data: blob };
    let big_output = rpc::output_slot(BlobSummary::default());
    let request = client_runtime.forward(
        &server_addr,
        big_id,
        Some(&mut big_input),
        Some(big_output.clone()),
    )?;
    assert!(request.has_extra_buf());
    assert!(client_runtime.wait(&request, Duration::from_secs(30))?);
    assert!(!request.has_extra_buf());
    {
        let guard = big_output.lock();
        let summary = guard.downcast_ref::<BlobSummary>().expect("summary");
        assert_eq!(summary.len, 100 * 1024);
        assert_eq!(summary.sum, expected_sum);
    }
    client_runtime.request_free(request)?;

    shutdown.store(true, Ordering::Release);
    server.join().expect("server thread");

    client_class.addr_free(server_addr)?;
    client_runtime.finalize()?;
    server_runtime.finalize()?;
    client_class.finalize()?;
    server_class.finalize()?;
    Ok(())
}
