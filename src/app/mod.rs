use ble_telemetry_bridge::bridge::EventReceiver;
use ble_telemetry_bridge::config::Config;
use ble_telemetry_bridge::console::{parse_line, render, ConsoleCommand, HELP};
use ble_telemetry_bridge::session::{spawn_session, SessionConfig, SessionHandle};
use ble_telemetry_bridge::sink::CsvSink;
use ble_telemetry_bridge::transport::BtleTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        return Err(format!("unknown command {command}").into());
    }

    let config = Config::load()?;
    let transport =
        BtleTransport::new(&config.device.service_uuid, &config.device.characteristic_uuid)
            .await?;
    let sink = CsvSink::new(&config.storage.output_dir, config.storage.file_prefix.clone());
    let (session, mut events) = spawn_session(transport, sink, SessionConfig::from(&config))?;

    tracing::info!(address = %config.device.address, "console ready, type `help` for commands");

    let json = config.console.json;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.console.poll_interval_ms));

    loop {
        tokio::select! {
            _ = ticker.tick() => print_events(&mut events, json),
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "stdin read failed");
                        break;
                    }
                };
                match parse_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => dispatch(&session, command, json),
                    Ok(None) => {}
                    Err(message) => eprintln!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("shutdown: ctrl-c");
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || session.shutdown()).await?;
    print_events(&mut events, json);
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn dispatch(session: &SessionHandle, command: ConsoleCommand, json: bool) {
    match command {
        ConsoleCommand::Connect => session.connect(),
        ConsoleCommand::Send(command) => session.send(command),
        ConsoleCommand::Close => session.close(),
        ConsoleCommand::Status => {
            let status = session.debug_status();
            if json {
                match serde_json::to_string(&status) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "status serialization failed"),
                }
            } else {
                println!(
                    "status={:?} pending={:?} transfer_active={} blocks_acked={} records={} dropped={} overflowed={}",
                    status.status,
                    status.pending,
                    status.transfer_active,
                    status.blocks_acked,
                    status.records_appended,
                    status.records_dropped,
                    status.events_overflowed,
                );
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
}

fn print_events(events: &mut EventReceiver, json: bool) {
    for event in events.drain() {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "event serialization failed"),
            }
        } else {
            println!("{}", render(&event));
        }
    }
}
