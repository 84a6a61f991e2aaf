use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tlmgate::filter::{FilterParams, FilterSpec, FILTER_TYPE_ALWAYS, FILTER_TYPE_BY_SEQ_CNT, FILTER_TYPE_BY_TIME};
use tlmgate::message::{BusMessage, MessageId};
use tlmgate::protocol::{HousekeepingTlm, PacketTableTlm};
use tlmgate::transport::DEFAULT_TLM_PORT;
use tlmgate::{Command, CommandResponse, CommandType, PacketTableDef, Qos, ResponseStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";
const COMMAND_TIMEOUT_SECS: u64 = 5;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let filter_args = [
        Arg::with_name("filter")
            .long("filter")
            .value_name("TYPE")
            .help("Filter type")
            .takes_value(true)
            .possible_values(&["always", "seq", "time"])
            .default_value("always"),
        Arg::with_name("n").short("n").long("n").takes_value(true).default_value("1").help("Filter cycle length"),
        Arg::with_name("x").short("x").long("x").takes_value(true).default_value("1").help("Packets passed per cycle"),
        Arg::with_name("o").short("o").long("o").takes_value(true).default_value("0").help("Filter offset"),
    ];

    let matches = App::new("tlmctl")
        .version("0.1.0")
        .about("Operator console for the telemetry downlink gateway")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Gateway host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway command port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("noop").about("Check the gateway answers commands"))
        .subcommand(SubCommand::with_name("reset").about("Reset command counters and statistics"))
        .subcommand(SubCommand::with_name("status").about("Request and show housekeeping"))
        .subcommand(
            SubCommand::with_name("enable")
                .about("Enable telemetry output to a ground address")
                .arg(Arg::with_name("ip").help("Destination IPv4 address").required(true)),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add a packet to the packet table")
                .arg(Arg::with_name("id").help("Message id (decimal or 0x hex)").required(true))
                .arg(Arg::with_name("buf-lim").long("buf-lim").takes_value(true).default_value("4").help("Bus buffer limit"))
                .arg(Arg::with_name("priority").long("priority").takes_value(true).default_value("0"))
                .arg(Arg::with_name("reliability").long("reliability").takes_value(true).default_value("0"))
                .args(&filter_args),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Remove a packet from the packet table")
                .arg(Arg::with_name("id").help("Message id").required(true)),
        )
        .subcommand(SubCommand::with_name("remove-all").about("Remove every packet from the packet table"))
        .subcommand(
            SubCommand::with_name("filter")
                .about("Change the filter of a packet")
                .arg(Arg::with_name("id").help("Message id").required(true))
                .args(&filter_args),
        )
        .subcommand(
            SubCommand::with_name("entry")
                .about("Show the packet table slot of a message id")
                .arg(Arg::with_name("id").help("Message id").required(true)),
        )
        .subcommand(
            SubCommand::with_name("load")
                .about("Load a packet table file")
                .arg(Arg::with_name("file").help("Packet table (JSON)").required(true)),
        )
        .subcommand(
            SubCommand::with_name("delay")
                .about("Set the run loop delay")
                .arg(Arg::with_name("ms").help("Delay in milliseconds").required(true)),
        )
        .subcommand(
            SubCommand::with_name("test-filter")
                .about("Run the gateway's filter self-test")
                .args(&filter_args[1..]),
        )
        .subcommand(
            SubCommand::with_name("listen")
                .about("Print downlinked packets received on a UDP port")
                .arg(
                    Arg::with_name("udp-port")
                        .long("udp-port")
                        .takes_value(true)
                        .default_value("1235")
                        .help("Local UDP port"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");

    let command_type = match matches.subcommand() {
        ("noop", _) => CommandType::Noop,
        ("reset", _) => CommandType::ResetStatus,
        ("status", _) => CommandType::SendHousekeeping,
        ("enable", Some(sub)) => CommandType::EnableOutput {
            dest_ip: sub.value_of("ip").unwrap_or_default().to_string(),
        },
        ("add", Some(sub)) => CommandType::AddPacket {
            stream_id: msg_id_arg(sub)?,
            qos: Qos {
                priority: number_arg(sub, "priority")?,
                reliability: number_arg(sub, "reliability")?,
            },
            buf_lim: number_arg(sub, "buf-lim")?,
            filter: filter_arg(sub)?,
        },
        ("remove", Some(sub)) => CommandType::RemovePacket { stream_id: msg_id_arg(sub)? },
        ("remove-all", _) => CommandType::RemoveAllPackets,
        ("filter", Some(sub)) => CommandType::UpdateFilter {
            stream_id: msg_id_arg(sub)?,
            filter: filter_arg(sub)?,
        },
        ("entry", Some(sub)) => CommandType::SendPacketTableTlm { stream_id: msg_id_arg(sub)? },
        ("load", Some(sub)) => CommandType::LoadTable {
            table: PacketTableDef::from_file(sub.value_of("file").unwrap_or_default())?,
        },
        ("delay", Some(sub)) => CommandType::SetRunLoopDelay { delay_ms: number_arg(sub, "ms")? },
        ("test-filter", Some(sub)) => CommandType::TestFilter { params: params_arg(sub)? },
        ("listen", Some(sub)) => {
            let udp_port = sub.value_of("udp-port").map_or(Ok(DEFAULT_TLM_PORT), |p| p.parse::<u16>())?;
            return listen(udp_port, format).await;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    let command = Command {
        id: SystemTime::now().duration_since(UNIX_EPOCH)?.subsec_nanos(),
        timestamp: SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64,
        command_type,
    };
    let name = command.command_type.name();
    let response = send_command(host, port, &command).await?;
    print_response(name, &response, format)?;

    Ok(())
}

fn parse_msg_id(value: &str) -> Result<MessageId, std::num::ParseIntError> {
    let id = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(MessageId(id))
}

fn msg_id_arg(matches: &ArgMatches<'_>) -> CliResult<MessageId> {
    Ok(parse_msg_id(matches.value_of("id").unwrap_or_default())?)
}

fn number_arg<T>(matches: &ArgMatches<'_>, name: &str) -> CliResult<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    let value = matches.value_of(name).ok_or_else(|| format!("missing {}", name))?;
    Ok(value.parse::<T>()?)
}

fn params_arg(matches: &ArgMatches<'_>) -> CliResult<FilterParams> {
    Ok(FilterParams::new(
        number_arg(matches, "n")?,
        number_arg(matches, "x")?,
        number_arg(matches, "o")?,
    ))
}

fn filter_arg(matches: &ArgMatches<'_>) -> CliResult<FilterSpec> {
    let filter_type = match matches.value_of("filter").unwrap_or("always") {
        "seq" => FILTER_TYPE_BY_SEQ_CNT,
        "time" => FILTER_TYPE_BY_TIME,
        _ => FILTER_TYPE_ALWAYS,
    };
    Ok(FilterSpec { filter_type, params: params_arg(matches)? })
}

async fn send_command(host: &str, port: u16, command: &Command) -> CliResult<CommandResponse> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to gateway at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Gateway is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "tlmgate --dest 127.0.0.1".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let json = serde_json::to_string(command)?;
    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut line = String::new();
        if BufReader::new(reader).read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "Gateway closed connection"));
        }
        Ok(line)
    };

    match tokio::time::timeout(Duration::from_secs(COMMAND_TIMEOUT_SECS), exchange).await {
        Ok(line) => Ok(serde_json::from_str(line?.trim())?),
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "⏰".yellow(), COMMAND_TIMEOUT_SECS);
            Err("Command timeout".into())
        }
    }
}

fn print_response(name: &str, response: &CommandResponse, format: &str) -> CliResult<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    let message = response.message.as_deref().unwrap_or("");
    match response.status {
        ResponseStatus::Success => {
            if let Ok(hk) = serde_json::from_str::<HousekeepingTlm>(message) {
                print_housekeeping(&hk);
            } else if let Ok(entry) = serde_json::from_str::<PacketTableTlm>(message) {
                print_table_entry(&entry);
            } else if message.is_empty() {
                println!("{} {}", "✅".green(), name.bright_white());
            } else {
                println!("{} {}: {}", "✅".green(), name.bright_white(), message.bright_cyan());
            }
        }
        ResponseStatus::InvalidCommand => {
            println!("{} {} rejected: {}", "❌".red(), name.bright_white(), message.bright_red());
        }
        ResponseStatus::PartialFailure => {
            println!("{} {} partly failed: {}", "⚠️".yellow(), name.bright_white(), message.yellow());
        }
        ResponseStatus::ExecutionFailed => {
            println!("{} {} execution failed: {}", "⚠️".yellow(), name.bright_white(), message.bright_red());
        }
    }
    Ok(())
}

fn print_housekeeping(hk: &HousekeepingTlm) {
    println!("\n{}", "📡 Telemetry Gateway Housekeeping".bright_blue().bold());
    println!("{}", "═══════════════════════════════".bright_blue());
    println!("Commands:       {} valid, {} invalid", hk.valid_cmd_cnt.to_string().bright_green(), hk.invalid_cmd_cnt.to_string().bright_red());
    println!("Run loop delay: {} ms", hk.run_loop_delay_ms);
    println!("Packet table:   {} packets, last load {}", hk.packets_in_table, if hk.last_table_load_ok { "OK".bright_green() } else { "FAILED".bright_red() });
    println!(
        "Downlink:       {} to {} (socket {}){}",
        if hk.downlink_enabled { "ENABLED".bright_green() } else { "DISABLED".bright_red() },
        hk.tlm_dest_ip.bright_white(),
        hk.tlm_sock_id,
        if hk.suppress_send { " SUPPRESSED".bright_red().to_string() } else { String::new() }
    );
    let stats = format!("{} pkt/s, {} B/s", hk.pkts_per_sec, hk.bytes_per_sec);
    if hk.stats_valid {
        println!("Throughput:     {}", stats.bright_cyan());
    } else {
        println!("Throughput:     {} ({:?})", stats.dimmed(), hk.stats_state);
    }
}

fn print_table_entry(entry: &PacketTableTlm) {
    if !entry.in_use {
        println!("{} slot for {} is unused", "⚪".dimmed(), entry.stream_id.to_string().bright_white());
        return;
    }
    println!(
        "{} {} buf_lim {} qos {}/{} filter type {} (n {}, x {}, o {})",
        "🟢".green(),
        entry.stream_id.to_string().bright_white(),
        entry.buf_lim,
        entry.qos.priority,
        entry.qos.reliability,
        entry.filter.filter_type,
        entry.filter.params.n,
        entry.filter.params.x,
        entry.filter.params.o
    );
}

async fn listen(port: u16, format: &str) -> CliResult<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    println!("{}", format!("📡 Listening for downlink on UDP port {} (Press Ctrl+C to stop)...", port).bright_blue().bold());

    let mut buf = vec![0u8; tlmgate::message::MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        match BusMessage::from_bytes(buf[..len].to_vec()) {
            Ok(msg) if format == "json" => println!("{}", serde_json::to_string(&msg)?),
            Ok(msg) => {
                let time = msg
                    .time()
                    .map_or_else(|| "-".to_string(), |t| format!("{}.{:05}", t.seconds, t.subseconds));
                println!(
                    "{} {} seq {:5} time {} len {:4} from {}",
                    "▶".bright_green(),
                    msg.msg_id().to_string().bright_white(),
                    msg.sequence_count(),
                    time,
                    msg.len(),
                    from
                );
            }
            Err(e) => println!("{} {} bytes from {}: {}", "❓".yellow(), len, from, e),
        }
    }
}
