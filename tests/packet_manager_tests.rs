use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tlmgate::bus::{LocalBus, SoftwareBus};
use tlmgate::config::GatewayConfig;
use tlmgate::error::{OutputError, TableError};
use tlmgate::filter::{FilterParams, FilterSpec, FILTER_TYPE_ALWAYS, FILTER_TYPE_BY_SEQ_CNT, FILTER_TYPE_BY_TIME};
use tlmgate::manager::PacketManager;
use tlmgate::message::{BusMessage, MessageId, MsgTime};
use tlmgate::stats::StatsState;
use tlmgate::table::{PacketTable, PacketTableDef, Qos, RouteDef};
use tlmgate::transport::{DatagramSocket, SocketFactory, UdpSocketFactory};

/// Ground link stand-in that records every datagram and can be told to fail.
#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    fail: Arc<Mutex<Option<io::ErrorKind>>>,
}

impl Recorder {
    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().iter().map(|(bytes, _)| bytes.clone()).collect()
    }

    fn last_dest(&self) -> Option<SocketAddr> {
        self.sent.lock().unwrap().last().map(|(_, addr)| *addr)
    }

    fn set_failing(&self, fail: bool) {
        self.fail_with(fail.then_some(io::ErrorKind::ConnectionRefused));
    }

    fn fail_with(&self, kind: Option<io::ErrorKind>) {
        *self.fail.lock().unwrap() = kind;
    }
}

struct RecordingSocket(Recorder);

impl DatagramSocket for RecordingSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        if let Some(kind) = *self.0.fail.lock().unwrap() {
            return Err(io::Error::new(kind, "ground link down"));
        }
        self.0.sent.lock().unwrap().push((buf.to_vec(), dest));
        Ok(buf.len())
    }

    fn socket_id(&self) -> u16 {
        42
    }
}

struct RecordingFactory {
    recorder: Recorder,
}

impl SocketFactory for RecordingFactory {
    type Socket = RecordingSocket;

    fn open(&mut self) -> io::Result<RecordingSocket> {
        Ok(RecordingSocket(self.recorder.clone()))
    }
}

fn setup(config: &GatewayConfig) -> (LocalBus, Recorder, PacketManager<LocalBus, RecordingFactory>) {
    let bus = LocalBus::default();
    let recorder = Recorder::default();
    let factory = RecordingFactory { recorder: recorder.clone() };
    let manager = PacketManager::new(bus.clone(), factory, config);
    (bus, recorder, manager)
}

fn always() -> FilterSpec {
    FilterSpec { filter_type: FILTER_TYPE_ALWAYS, params: FilterParams::default() }
}

fn seq_filter(n: u16, x: u16, o: u16) -> FilterSpec {
    FilterSpec { filter_type: FILTER_TYPE_BY_SEQ_CNT, params: FilterParams::new(n, x, o) }
}

fn packet(id: u16, seq: u16, seconds: u32) -> BusMessage {
    BusMessage::telemetry(MessageId(id), seq, MsgTime::new(seconds, 0), &[0xAB; 8]).unwrap()
}

#[test]
fn test_quarter_decimation_forwards_five_of_twenty() {
    let (bus, recorder, mut mgr) = setup(&GatewayConfig::default());
    mgr.add_packet(MessageId(0x0801), Qos::default(), 32, seq_filter(4, 1, 0)).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();

    let published: Vec<BusMessage> = (0..20).map(|seq| packet(0x0801, seq, 100)).collect();
    for msg in &published {
        bus.publish(msg.clone());
    }

    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.drained, 20);
    assert_eq!(report.packets_sent, 5);
    assert_eq!(report.filtered, 15);
    assert_eq!(report.bytes_sent, 5 * published[0].len() as u64);

    let sent = recorder.sent();
    let expected: Vec<Vec<u8>> = [0, 4, 8, 12, 16].iter().map(|&i| published[i].as_bytes().to_vec()).collect();
    assert_eq!(sent, expected);
    assert_eq!(recorder.last_dest(), Some("127.0.0.1:1235".parse().unwrap()));
}

#[test]
fn test_time_filter_uses_secondary_header_seconds() {
    let (bus, recorder, mut mgr) = setup(&GatewayConfig::default());
    let by_time = FilterSpec { filter_type: FILTER_TYPE_BY_TIME, params: FilterParams::new(2, 1, 1) };
    mgr.add_packet(MessageId(0x0802), Qos::default(), 32, by_time).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();

    // Sequence counts all even, seconds 0..10: the odd seconds pass with O = 1
    for second in 0..10u32 {
        bus.publish(packet(0x0802, 0, second));
    }

    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.packets_sent, 5);
    let seconds: Vec<u32> = recorder
        .sent()
        .into_iter()
        .map(|bytes| BusMessage::from_bytes(bytes).unwrap().time().unwrap().seconds)
        .collect();
    assert_eq!(seconds, [1, 3, 5, 7, 9]);
}

#[test]
fn test_add_duplicate_remove_and_re_add() {
    let (bus, _recorder, mut mgr) = setup(&GatewayConfig::default());
    let id = MessageId(0x0803);

    mgr.add_packet(id, Qos::default(), 4, always()).unwrap();
    assert_eq!(mgr.add_packet(id, Qos::default(), 4, always()), Err(TableError::AlreadyExists(id)));
    assert_eq!(mgr.table().len(), 1);

    let removed = mgr.remove_packet(id).unwrap();
    assert_eq!(removed.id, id);
    assert!(!bus.is_subscribed(id));
    assert_eq!(mgr.remove_packet(id), Err(TableError::NotInTable(id)));

    mgr.add_packet(id, Qos { priority: 1, reliability: 0 }, 8, always()).unwrap();
    let route = mgr.table().get(id).unwrap();
    assert_eq!(route.buffer_limit, 8);
    assert_eq!(bus.subscription(id).unwrap().buffer_limit, 8);
}

#[test]
fn test_invalid_ids_and_filter_types_change_nothing() {
    let (bus, _recorder, mut mgr) = setup(&GatewayConfig::default());

    assert_eq!(
        mgr.add_packet(MessageId(0x2000), Qos::default(), 4, always()),
        Err(TableError::InvalidMessageId(MessageId(0x2000)))
    );
    let bad = FilterSpec { filter_type: 7, params: FilterParams::default() };
    assert_eq!(mgr.add_packet(MessageId(0x0804), Qos::default(), 4, bad), Err(TableError::InvalidFilterType(7)));

    assert!(mgr.table().is_empty());
    assert_eq!(bus.subscription_count(), 0);
}

#[test]
fn test_remove_all_then_load_empty_table() {
    let (bus, _recorder, mut mgr) = setup(&GatewayConfig::default());
    for id in [0x0810u16, 0x0811, 0x0812] {
        mgr.add_packet(MessageId(id), Qos::default(), 4, always()).unwrap();
        bus.publish(packet(id, 0, 0));
    }
    assert_eq!(bus.pipe_len(), 3);

    assert_eq!(mgr.remove_all_packets(), Ok(3));
    assert!(mgr.table().is_empty());
    assert_eq!(bus.subscription_count(), 0);
    assert_eq!(bus.pipe_len(), 0);

    let empty = PacketTable::new(mgr.table().geometry());
    assert_eq!(mgr.load_table(empty), Ok(0));
    assert!(mgr.table().is_empty());
    assert_eq!(mgr.stats().state(), StatsState::Warmup);
}

#[test]
fn test_load_table_replaces_and_reports_partial_failure() {
    let config = GatewayConfig::default();
    let (bus, _recorder, mut mgr) = setup(&config);
    mgr.add_packet(MessageId(0x0820), Qos::default(), 4, always()).unwrap();

    let def = PacketTableDef {
        packets: vec![
            RouteDef { stream_id: MessageId(0x0821), qos: Qos::default(), buf_lim: 4, filter: always() },
            RouteDef { stream_id: MessageId(0x0822), qos: Qos::default(), buf_lim: 4, filter: seq_filter(2, 1, 0) },
            RouteDef { stream_id: MessageId(0x0823), qos: Qos::default(), buf_lim: 4, filter: always() },
        ],
    };
    let table = def.validate(config.geometry(), &bus).unwrap();
    bus.inject_subscribe_failure(MessageId(0x0822));

    assert_eq!(mgr.load_table(table), Err(TableError::PartialLoad { packets: 3, failed: 1 }));

    // Nothing rolled back: every route is in the table, the failed one unsubscribed
    assert_eq!(mgr.table().len(), 3);
    assert!(mgr.table().get(MessageId(0x0820)).is_none());
    assert!(mgr.table().get(MessageId(0x0822)).is_some());
    assert!(!bus.is_subscribed(MessageId(0x0820)));
    assert!(bus.is_subscribed(MessageId(0x0821)));
    assert!(!bus.is_subscribed(MessageId(0x0822)));
}

#[test]
fn test_unsubscribe_failures_are_partial() {
    let (bus, _recorder, mut mgr) = setup(&GatewayConfig::default());
    for id in [0x0830u16, 0x0831] {
        mgr.add_packet(MessageId(id), Qos::default(), 4, always()).unwrap();
    }
    bus.inject_unsubscribe_failure(MessageId(0x0830));

    let err = mgr.remove_packet(MessageId(0x0830)).unwrap_err();
    assert!(matches!(err, TableError::UnsubscribeFailed { id: MessageId(0x0830), .. }));
    assert!(mgr.table().get(MessageId(0x0830)).is_none());

    mgr.add_packet(MessageId(0x0830), Qos::default(), 4, always()).unwrap();
    assert_eq!(mgr.remove_all_packets(), Err(TableError::PartialRemove { packets: 2, failed: 1 }));
    assert!(mgr.table().is_empty());
}

#[test]
fn test_send_failure_latches_and_pipe_keeps_draining() {
    let (bus, recorder, mut mgr) = setup(&GatewayConfig::default());
    mgr.add_packet(MessageId(0x0840), Qos::default(), 16, always()).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();

    recorder.set_failing(true);
    for seq in 0..5 {
        bus.publish(packet(0x0840, seq, 0));
    }

    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.drained, 5);
    assert_eq!(report.send_errors, 1);
    assert_eq!(report.not_sent, 4);
    assert_eq!(report.packets_sent, 0);
    assert!(mgr.destination().suppress_send());
    assert!(mgr.destination().downlink_enabled());

    // Link recovers but output stays suppressed until re-enabled
    recorder.set_failing(false);
    for seq in 5..8 {
        bus.publish(packet(0x0840, seq, 0));
    }
    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.not_sent, 3);
    assert_eq!(bus.pipe_len(), 0);
    assert!(recorder.sent().is_empty());

    mgr.enable_output("127.0.0.1").unwrap();
    bus.publish(packet(0x0840, 8, 0));
    assert_eq!(mgr.output_telemetry(Instant::now()).packets_sent, 1);
    assert_eq!(mgr.totals().send_errors, 1);
}

#[test]
fn test_full_send_buffer_does_not_latch_suppression() {
    let (bus, recorder, mut mgr) = setup(&GatewayConfig::default());
    mgr.add_packet(MessageId(0x0841), Qos::default(), 16, always()).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();

    recorder.fail_with(Some(io::ErrorKind::WouldBlock));
    for seq in 0..3 {
        bus.publish(packet(0x0841, seq, 0));
    }
    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.send_errors, 3);
    assert_eq!(report.not_sent, 0);
    assert!(!mgr.destination().suppress_send());

    // Sending resumes as soon as the buffer drains, without a re-enable
    recorder.fail_with(None);
    bus.publish(packet(0x0841, 3, 0));
    assert_eq!(mgr.output_telemetry(Instant::now()).packets_sent, 1);
    assert_eq!(recorder.sent().len(), 1);
}

#[test]
fn test_unrouted_messages_are_dropped() {
    let (bus, recorder, mut mgr) = setup(&GatewayConfig::default());
    mgr.add_packet(MessageId(0x0801), Qos::default(), 4, always()).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();

    // Same slot as 0x0801, subscribed behind the manager's back
    let mut side = bus.clone();
    side.subscribe(MessageId(0x0001), Qos::default(), 4).unwrap();
    bus.publish(packet(0x0001, 0, 0));
    bus.publish(packet(0x0801, 0, 0));

    let report = mgr.output_telemetry(Instant::now());
    assert_eq!(report.unrouted, 1);
    assert_eq!(report.packets_sent, 1);
    assert_eq!(BusMessage::from_bytes(recorder.sent().remove(0)).unwrap().msg_id(), MessageId(0x0801));
}

#[test]
fn test_enable_output_retargets_without_reopening() {
    let (_bus, _recorder, mut mgr) = setup(&GatewayConfig::default());

    assert!(matches!(mgr.enable_output("not-an-ip"), Err(OutputError::InvalidAddress(_))));
    assert!(!mgr.destination().downlink_enabled());

    assert!(mgr.enable_output("127.0.0.1").unwrap());
    assert!(!mgr.enable_output("10.1.2.3").unwrap());
    assert_eq!(mgr.destination().ip(), "10.1.2.3");
    assert_eq!(mgr.destination().socket_id(), 42);
}

#[test]
fn test_statistics_follow_output_cycles() {
    let config = GatewayConfig {
        run_loop_delay_ms: 100,
        stats_startup_delay_ms: 100,
        stats_interval_ms: 1000,
        ..Default::default()
    };
    let (bus, _recorder, mut mgr) = setup(&config);
    mgr.add_packet(MessageId(0x0850), Qos::default(), 64, always()).unwrap();
    mgr.enable_output("127.0.0.1").unwrap();
    assert_eq!(mgr.stats().warmup_cycles_remaining(), 1);

    let mut now = Instant::now();
    let mut seq = 0;
    let mut cycle = |mgr: &mut PacketManager<LocalBus, RecordingFactory>, now: &mut Instant| {
        for _ in 0..5 {
            bus.publish(packet(0x0850, seq, 0));
            seq += 1;
        }
        *now += Duration::from_millis(100);
        mgr.output_telemetry(*now)
    };

    cycle(&mut mgr, &mut now);
    for _ in 0..10 {
        cycle(&mut mgr, &mut now);
    }
    assert_eq!(mgr.stats().state(), StatsState::FirstInterval);
    assert!((mgr.stats().avg_packets_per_sec() - 50.0).abs() < 1e-6);

    for _ in 0..10 {
        cycle(&mut mgr, &mut now);
    }
    assert_eq!(mgr.stats().state(), StatsState::Steady);
    assert!(mgr.stats().is_valid());

    mgr.set_cycle_period(50);
    assert_eq!(mgr.stats().state(), StatsState::Warmup);
    assert_eq!(mgr.stats().cycle_period_ms(), 50);
    assert_eq!(mgr.stats().warmup_cycles_remaining(), 100);
    assert!(!mgr.stats().is_valid());
}

#[test]
fn test_udp_loopback_downlink() {
    let ground = UdpSocket::bind("127.0.0.1:0").unwrap();
    ground.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let config = GatewayConfig { tlm_port: ground.local_addr().unwrap().port(), ..Default::default() };

    let bus = LocalBus::default();
    let mut mgr = PacketManager::new(bus.clone(), UdpSocketFactory, &config);
    mgr.add_packet(MessageId(0x0860), Qos::default(), 4, always()).unwrap();
    assert!(mgr.enable_output("127.0.0.1").unwrap());
    assert_ne!(mgr.destination().socket_id(), 0);

    let msg = packet(0x0860, 7, 1234);
    bus.publish(msg.clone());
    assert_eq!(mgr.output_telemetry(Instant::now()).packets_sent, 1);

    let mut buf = [0u8; 256];
    let (len, _) = ground.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], msg.as_bytes());

    mgr.shutdown();
    assert!(!mgr.destination().downlink_enabled());
}
