use clap::{App, Arg};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tlmgate::message::{BusMessage, MessageId, MsgTime};
use tlmgate::{GatewayConfig, LocalBus, TelemetryOutputApp, UdpSocketFactory};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type Gateway = TelemetryOutputApp<LocalBus, UdpSocketFactory>;

const DEFAULT_SIM_PERIOD_MS: &str = "100";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("tlmgate")
        .version("0.1.0")
        .about("Telemetry downlink gateway")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Gateway configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("table")
                .short("t")
                .long("table")
                .value_name("FILE")
                .help("Packet table loaded at start-up (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dest")
                .short("d")
                .long("dest")
                .value_name("IP")
                .help("Enable output to this ground address at start-up")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("command-port")
                .short("p")
                .long("command-port")
                .value_name("PORT")
                .help("TCP port for JSON commands")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .value_name("IDS")
                .help("Publish synthetic telemetry on these comma separated message ids")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("sim-period")
                .long("sim-period")
                .value_name("MS")
                .help("Synthetic telemetry period")
                .takes_value(true)
                .default_value(DEFAULT_SIM_PERIOD_MS),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(table) = matches.value_of("table") {
        config.packet_table = Some(PathBuf::from(table));
    }
    if let Some(dest) = matches.value_of("dest") {
        config.default_dest_ip = Some(dest.to_string());
    }
    if let Some(port) = matches.value_of("command-port") {
        config.command_port = port.parse()?;
    }
    let sim_ids = match matches.value_of("simulate") {
        Some(list) => parse_msg_ids(list)?,
        None => Vec::new(),
    };
    let sim_period_ms: u64 = matches.value_of("sim-period").unwrap_or(DEFAULT_SIM_PERIOD_MS).parse()?;

    let bus = LocalBus::new(config.pipe_depth, config.highest_valid_msg_id);
    let command_port = config.command_port;
    let app = Arc::new(Mutex::new(TelemetryOutputApp::new(bus.clone(), UdpSocketFactory, config)?));

    let server_app = Arc::clone(&app);
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_command_server(server_app, command_port).await {
            error!("Command server error: {}", e);
        }
    });

    let publisher = if sim_ids.is_empty() {
        None
    } else {
        info!(streams = sim_ids.len(), period_ms = sim_period_ms, "Publishing synthetic telemetry");
        Some(tokio::spawn(publish_synthetic(bus, sim_ids, sim_period_ms)))
    };

    let mut delay_ms = app.lock().await.run_loop_delay_ms();
    let mut cycle = time::interval(Duration::from_millis(u64::from(delay_ms)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = cycle.tick() => {
                let mut app = app.lock().await;
                let report = app.run_cycle(Instant::now());
                if report.send_errors > 0 {
                    warn!(errors = report.send_errors, "Output cycle had send errors");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }

        // Follow run loop delay commands
        let current_ms = app.lock().await.run_loop_delay_ms();
        if current_ms != delay_ms {
            delay_ms = current_ms;
            cycle = time::interval(Duration::from_millis(u64::from(delay_ms)));
            cycle.reset();
        }
    }

    app.lock().await.shutdown();
    tcp_server.abort();
    if let Some(publisher) = publisher {
        publisher.abort();
    }
    info!("Telemetry gateway stopped");

    Ok(())
}

fn parse_msg_ids(list: &str) -> Result<Vec<MessageId>, std::num::ParseIntError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => s.parse(),
        })
        .map(|id| id.map(MessageId))
        .collect()
}

/// Stand-in for the flight applications: one packet per stream per period,
/// each stream with its own sequence counter.
async fn publish_synthetic(bus: LocalBus, ids: Vec<MessageId>, period_ms: u64) {
    let mut sequence = vec![0u16; ids.len()];
    let mut tick = time::interval(Duration::from_millis(period_ms.max(1)));

    loop {
        tick.tick().await;
        let time = MsgTime::now();
        for (id, seq) in ids.iter().zip(sequence.iter_mut()) {
            let payload = seq.to_be_bytes();
            match BusMessage::telemetry(*id, *seq, time, &payload) {
                Ok(msg) => bus.publish(msg),
                Err(e) => warn!(stream_id = %id, "Synthetic packet not built: {}", e),
            }
            *seq = seq.wrapping_add(1);
        }
    }
}

async fn start_command_server(app: Arc<Mutex<Gateway>>, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Command server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Command client connected: {}", addr);
                let client_app = Arc::clone(&app);

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, addr, client_app).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Command client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    app: Arc<Mutex<Gateway>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if buf_reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = app.lock().await.handle_json(trimmed);
        debug!(client = %addr, id = response.id, status = ?response.status, "command response");

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}
