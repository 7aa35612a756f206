mod args;

use std::{
    io::{self, Write},
    process,
    time::{Duration, Instant},
};

use clap::Parser;
use crossbeam_channel::bounded;
use eeg_slurper::{DecryptedPacket, Session, State, NOMINAL_RATE_HZ};
use tracing::{debug, error, info, warn};

use crate::args::{convert_filter, Args};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn print_packet(out: &mut impl Write, packet: &DecryptedPacket) -> io::Result<()> {
    writeln!(
        out,
        "{} {} {}",
        packet.sequence,
        packet.received_at.to_rfc3339(),
        hex::encode(packet.data)
    )
}

fn main() -> eeg_slurper::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let session = Session::open_device(
        &args.device_path,
        &args.serial,
        args.key_schedule(),
        args.capture_config(),
    )?;

    // Ctrl-C just flags the main loop, which does the orderly stop
    let (stop_tx, stop_rx) = bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        warn!("Couldn't install Ctrl-C handler: {}", e);
    }

    session.start()?;
    info!(device = ?args.device_path, "Streaming packets to stdout");

    let queue = session.queue();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut last_report = Instant::now();
    loop {
        if stop_rx.try_recv().is_ok() {
            info!("Interrupted, stopping capture");
            break;
        }
        if let Ok(packet) = queue.pull(Duration::from_millis(100)) {
            print_packet(&mut out, &packet)?;
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            debug!(nominal_hz = NOMINAL_RATE_HZ, "{}", session.status());
            last_report = Instant::now();
        }
        // The capture thread only gets here by itself when the device failed
        if session.state() == State::Stopped {
            break;
        }
    }

    session.stop();
    while let Ok(packet) = queue.try_pull() {
        print_packet(&mut out, &packet)?;
    }
    out.flush()?;

    let status = session.status();
    info!("{}", status);
    if let Some(e) = status.last_error {
        error!("Capture ended: {}", e);
        process::exit(1);
    }
    Ok(())
}
