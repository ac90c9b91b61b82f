//! End-to-end behaviour of the gateway pipeline against the mock transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use voltage_gateway::control::{CommandKind, ControlQueue, Priority};
use voltage_gateway::error::ModbusError;
use voltage_gateway::measurement_bus::MeasurementBus;
use voltage_gateway::mock::{MockConnector, MockHandle, MockTransport};
use voltage_gateway::safety::{run_safety_loop, SafetyConfig, SafetyEngine};
use voltage_gateway::session::DeviceSession;
use voltage_gateway::snapshot::{Measurements, Snapshot, SnapshotStatus};
use voltage_gateway::supervisor::StopFlag;
use voltage_gateway::worker::{PollingWorker, TickOutcome};
use voltage_gateway::{
    BusArbiter, BusOp, BusReply, ByteOrder, DataType, DeviceDescriptor, DeviceKind, GatewayConfig,
    ReadFunction, RegisterMap, RegisterMapping, Supervisor, TransportTimeouts,
};

fn meter_map() -> Arc<RegisterMap> {
    Arc::new(
        RegisterMap::new(
            "meter",
            100,
            3,
            ReadFunction::Holding,
            ByteOrder::BigEndian,
            vec![
                RegisterMapping::new("energy", 100, DataType::U32),
                RegisterMapping::new("voltage", 102, DataType::U16).scaled(0.1),
            ],
        )
        .unwrap(),
    )
}

fn device(name: &str, slave_id: u8, map: Arc<RegisterMap>) -> Arc<DeviceDescriptor> {
    Arc::new(DeviceDescriptor {
        name: name.to_string(),
        model: map.model().to_string(),
        slave_id,
        kind: DeviceKind::Meter,
        poll_interval: Duration::from_millis(1000),
        bus: "rs485".to_string(),
        register_map: map,
    })
}

fn mock_bus() -> (Arc<BusArbiter<MockTransport>>, MockHandle) {
    let mock = MockTransport::new();
    let handle = mock.handle();
    let arbiter = Arc::new(BusArbiter::new("rs485", mock, TransportTimeouts::default()));
    (arbiter, handle)
}

#[test]
fn test_decode_big_endian_u32() {
    let map = RegisterMap::new(
        "meter",
        100,
        2,
        ReadFunction::Holding,
        ByteOrder::BigEndian,
        vec![RegisterMapping::new("energy", 100, DataType::U32)],
    )
    .unwrap();

    let decoded = map.decode(&[0x0001, 0x86A0]);
    assert_eq!(decoded.status, SnapshotStatus::Ok);
    assert_eq!(decoded.values.get("energy"), Some(100000.0));
}

#[test]
fn test_scale_applied() {
    let map = RegisterMap::new(
        "meter",
        0,
        1,
        ReadFunction::Input,
        ByteOrder::BigEndian,
        vec![RegisterMapping::new("voltage", 0, DataType::U16).scaled(0.1)],
    )
    .unwrap();

    let voltage = map.decode(&[2301]).values.get("voltage").unwrap();
    assert!((voltage - 230.1).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_bus_serializes_concurrent_workers() {
    let (arbiter, mock) = mock_bus();
    mock.set_delay(Duration::from_millis(50));
    let map = meter_map();
    let mut first = DeviceSession::new(device("meter_1", 1, Arc::clone(&map)), Arc::clone(&arbiter));
    let mut second = DeviceSession::new(device("meter_2", 2, map), Arc::clone(&arbiter));

    let started = Instant::now();
    let (a, b) = tokio::join!(first.read_block(), second.read_block());
    assert!(a.is_ok() && b.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(100));

    let log = mock.requests();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].slave_id, 1);
    assert_eq!(log[1].slave_id, 2);
    assert!(log[0].finished.unwrap() <= log[1].started);
    assert!(!mock.overlapped());
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_exception() {
    let (arbiter, mock) = mock_bus();
    let crc = || {
        Err(ModbusError::Crc {
            computed: 0x1234,
            received: 0x4321,
        })
    };
    mock.push_reply(crc());
    mock.push_reply(crc());
    mock.push_reply(Err(ModbusError::exception(0x03, 2)));
    mock.push_reply(Ok(BusReply::Registers(vec![0; 3])));

    let op = BusOp::read(ReadFunction::Holding, 100, 3);
    let err = arbiter.transact(5, &op).await.unwrap_err();

    assert_eq!(err.exception_code(), Some(2));
    assert_eq!(mock.request_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_then_single_probe() {
    let (arbiter, mock) = mock_bus();
    let bus = Arc::new(MeasurementBus::default());
    let queue = Arc::new(ControlQueue::new(["meter_x"], 16));
    let mut worker = PollingWorker::new(
        DeviceSession::new(device("meter_x", 9, meter_map()), arbiter),
        bus,
        queue,
        StopFlag::new(),
    );
    mock.set_offline(9, ModbusError::timeout("mock", 1000));

    for _ in 0..5 {
        worker.tick().await;
    }
    assert!(worker.session().is_quarantined());

    mock.clear_requests();
    assert_eq!(worker.tick().await, TickOutcome::Skipped);
    assert_eq!(mock.request_count(), 0);

    sleep(Duration::from_secs(2)).await;
    worker.tick().await;
    let log = mock.requests();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].op, BusOp::read(ReadFunction::Holding, 100, 1));
}

#[tokio::test(start_paused = true)]
async fn test_safety_emergency_turn_off() {
    let bus = Arc::new(MeasurementBus::default());
    let queue = Arc::new(ControlQueue::new(["inv_y"], 16));
    let engine = SafetyEngine::new(&SafetyConfig::default(), [("inv_y", DeviceKind::Inverter)]);
    let stop = StopFlag::new();
    let over_voltage = |sequence| {
        let values: Measurements = [("voltage", 260.0)].into_iter().collect();
        Snapshot::new("inv_y", sequence, values, SnapshotStatus::Ok)
    };

    bus.publish_snapshot(over_voltage(1)).unwrap();
    let task = tokio::spawn(run_safety_loop(
        engine,
        Arc::clone(&bus),
        Arc::clone(&queue),
        stop.clone(),
        Duration::from_millis(500),
    ));

    sleep(Duration::from_millis(600)).await;
    let command = queue.pop("inv_y").unwrap();
    assert_eq!(command.kind, CommandKind::TurnOff);
    assert_eq!(command.priority, Priority::Emergency);
    assert!(queue.is_empty("inv_y"));

    bus.publish_snapshot(over_voltage(2)).unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(queue.is_empty("inv_y"));

    stop.set();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_gateway_turns_off_over_voltage_inverter() {
    let config = GatewayConfig::from_json_str(
        r#"{
            "buses": [{ "name": "roof", "transport": { "type": "tcp", "host": "mock" } }],
            "register_maps": {
                "inv": {
                    "start_address": 0, "quantity": 2, "function_code": 3,
                    "mapping": [
                        { "name": "run_state", "address": 0, "type": "u16", "writable": true },
                        { "name": "voltage", "address": 1, "type": "u16", "scale": 0.1 }
                    ]
                }
            },
            "devices": [
                { "device_name": "inv_1", "device_model": "inv", "slave_id": 3,
                  "kind": "inverter", "poll_interval_ms": 500, "bus": "roof" }
            ]
        }"#,
    )
    .unwrap()
    .validate()
    .unwrap();

    let connector = MockConnector::new();
    let handles = connector.handles();
    let running = Supervisor::new(config)
        .with_connector(connector)
        .start()
        .await
        .unwrap();
    let roof = handles.get("roof").unwrap();
    roof.set_registers(3, 0, &[1, 2600]);

    let exit = running
        .run_until(sleep(Duration::from_millis(2000)))
        .await;
    assert!(exit.is_graceful());

    assert_eq!(roof.register(3, 0), 0);
    assert!(roof
        .requests_for(3)
        .iter()
        .any(|r| r.op == BusOp::WriteSingle { address: 0, value: 0 }));
}
