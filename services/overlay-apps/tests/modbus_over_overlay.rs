mod common;

use common::context;
use overlay_apps::modbus::{
    decode_response, encode_request, ExceptionCode, Frame, Peripheral, Request, Response,
    READ_HOLDING_REGISTERS, WRITE_SINGLE_REGISTER,
};
use overlay_sdk::transport::OverlaySession;
use overlay_sdk::{
    serve, LoopbackFabric, OverlayStream, OverlayTransport, Permissions, ServeConfig,
    ServeSummary, ServiceDescriptor, Shutdown,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

const SERVICE: &str = "plc-modbus";

async fn start(fabric: &LoopbackFabric, shutdown: Shutdown) -> JoinHandle<ServeSummary> {
    fabric.grant("plc", SERVICE, Permissions::BIND);
    let server = context(fabric, "plc");
    server.authenticate().await.unwrap();
    let mut listener = server.listen(SERVICE).await.unwrap();

    tokio::spawn(async move {
        serve(&mut listener, Arc::new(Peripheral::seeded(42)), ServeConfig::default(), shutdown)
            .await
            .unwrap()
    })
}

async fn dial(fabric: &LoopbackFabric) -> OverlayStream {
    fabric.grant("hmi", SERVICE, Permissions::DIAL);
    let session = fabric.authenticate(&common::bundle("hmi")).await.unwrap();
    session
        .dial(&ServiceDescriptor::new(SERVICE, Permissions::DIAL))
        .await
        .unwrap()
}

async fn call(stream: &mut OverlayStream, transaction_id: u16, body: Request) -> Frame<Response> {
    let request = encode_request(&Frame {
        transaction_id,
        unit_id: 1,
        body,
    });
    stream.write_all(&request).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        if let Some((frame, _)) = decode_response(&buf).unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peripheral closed the connection");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn one_connection_carries_many_requests() {
    let fabric = LoopbackFabric::new();
    let shutdown = Shutdown::new();
    let serving = start(&fabric, shutdown.clone()).await;
    let mut stream = dial(&fabric).await;

    let written = call(
        &mut stream,
        1,
        Request::WriteSingleRegister {
            address: 7,
            value: 1234,
        },
    )
    .await;
    assert_eq!(written.transaction_id, 1);
    assert_eq!(
        written.body,
        Response::Written {
            function: WRITE_SINGLE_REGISTER,
            address: 7,
            value: 1234
        }
    );

    let read = call(
        &mut stream,
        2,
        Request::ReadHoldingRegisters {
            address: 7,
            quantity: 1,
        },
    )
    .await;
    assert_eq!(read.transaction_id, 2);
    assert_eq!(
        read.body,
        Response::Registers {
            function: READ_HOLDING_REGISTERS,
            values: vec![1234]
        }
    );

    // Unknown function codes are answered, the connection stays open
    let unsupported = call(&mut stream, 3, Request::Unsupported { function: 0x11 }).await;
    assert_eq!(
        unsupported.body,
        Response::Exception {
            function: 0x11,
            code: ExceptionCode::IllegalFunction
        }
    );
    let again = call(
        &mut stream,
        4,
        Request::ReadInputRegisters {
            address: 0,
            quantity: 3,
        },
    )
    .await;
    assert!(matches!(again.body, Response::Registers { ref values, .. } if values.len() == 3));

    stream.shutdown().await.unwrap();
    drop(stream);
    shutdown.cancel();
    let summary = serving.await.unwrap();
    assert_eq!(summary.accepted, 1);
}

#[tokio::test]
async fn malformed_header_closes_only_that_connection() {
    let fabric = LoopbackFabric::new();
    let shutdown = Shutdown::new();
    let serving = start(&fabric, shutdown.clone()).await;

    // Protocol id 1 is not Modbus
    let mut bad = dial(&fabric).await;
    bad.write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(bad.read(&mut buf).await.unwrap(), 0);

    let mut good = dial(&fabric).await;
    let read = call(
        &mut good,
        9,
        Request::ReadCoils {
            address: 0,
            quantity: 10,
        },
    )
    .await;
    assert!(matches!(read.body, Response::Bits { ref values, .. } if values.len() >= 10));

    good.shutdown().await.unwrap();
    drop(good);
    shutdown.cancel();
    let summary = serving.await.unwrap();
    assert_eq!(summary.accepted, 2);
    assert!(summary.failed >= 1);
}
