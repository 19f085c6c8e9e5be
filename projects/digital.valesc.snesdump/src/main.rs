// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Command line front-end of the SNES cartridge dumper.

use std::error::Error;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use log::{info, LevelFilter};
use structopt::StructOpt;

use snesdump::session::{CartridgeSession, ConnectionState, SessionOptions};
use snesdump::transport::{PortOptions, SerialChannel, StopSignal, DEFAULT_BAUD_RATE};

/// Reads and writes SNES cartridges through the serial dumper.
#[derive(Debug, StructOpt)]
struct Args {
    /// Serial port the dumper is attached to, like `/dev/ttyUSB0` or `COM3`.
    #[structopt(long, short, env = "SNESDUMP_PORT")]
    port: Option<String>,

    /// Speed of the serial link.
    #[structopt(long, default_value = "2000000")]
    baud: u32,

    /// Seconds a transfer may go without progress before failing, 0 waits forever.
    #[structopt(long, default_value = "5")]
    idle_timeout: u64,

    /// Seconds the device has to answer once the port is opened, 0 waits forever.
    #[structopt(long, default_value = "2")]
    handshake_timeout: u64,

    /// Which log messages to show: off, error, warn, info, debug or trace.
    #[structopt(long, short, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

impl Args {
    /// The settings of the serial link selected on the command line.
    fn port_options(&self) -> Result<PortOptions, &'static str> {
        let path = self
            .port
            .clone()
            .ok_or("no serial port selected, use `--port` or see the `ports` command")?;

        Ok(PortOptions {
            baud_rate: self.baud,
            handshake_timeout: seconds(self.handshake_timeout),
            idle_timeout: seconds(self.idle_timeout),
            ..PortOptions::new(path)
        })
    }
}

/// A timeout in seconds, where zero means no timeout at all.
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// The operations offered by the dumper.
#[derive(Debug, StructOpt)]
enum Command {
    /// List the serial ports available on this machine.
    Ports,

    /// Show the header of the inserted cartridge.
    Info,

    /// Dump the ROM, rounded up to whole 64 KiB banks.
    DumpRom {
        /// Where to store the dump, usually a `.smc` or `.rom` file.
        #[structopt(parse(from_os_str))]
        output: PathBuf,
    },

    /// Dump the battery backed SRAM.
    DumpSram {
        /// Where to store the dump, usually a `.sram` file.
        #[structopt(parse(from_os_str))]
        output: PathBuf,
    },

    /// Write a save file into the battery backed SRAM.
    WriteSram {
        /// The save file, it must be exactly as large as the SRAM.
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("ERROR: {err}");

        let mut cause = err.source();
        while let Some(inner) = cause {
            eprintln!("  ... caused by: {inner}");
            cause = inner.source();
        }

        process::exit(1);
    }
}

/// The actual main function.
fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::from_args();

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_module("snesdump", args.log_level);
    builder.init();

    if let Command::Ports = args.command {
        return list_ports();
    }

    let port = args.port_options()?;

    if port.baud_rate != DEFAULT_BAUD_RATE {
        info!("Using {} bauds, the firmware expects {DEFAULT_BAUD_RATE}", port.baud_rate);
    }

    // Ctrl-C closes the port from the transfer loop, then the error unwinds to `main`
    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.raise())?;
    }

    let mut connection = ConnectionState::connect(&port, SessionOptions::default(), stop)?;
    let result = execute(connection.session()?, &args.command);
    connection.disconnect();

    result
}

/// Run a cartridge command on a connected session.
fn execute(session: &mut CartridgeSession<SerialChannel>, command: &Command) -> Result<(), Box<dyn Error>> {
    let header = session.read_header()?;

    match command {
        Command::Ports => Ok(()),

        Command::Info => {
            println!("{header}");
            Ok(())
        }

        Command::DumpRom { output } => {
            let mut sink = BufWriter::new(File::create(output)?);

            session.dump_rom(&header, &mut sink, |progress| {
                info!("Dumping ROM: {progress}");
            })?;

            info!("Dump saved to {}", output.display());
            Ok(())
        }

        Command::DumpSram { output } => {
            let mut sink = BufWriter::new(File::create(output)?);

            session.dump_sram(&header, &mut sink, |_| {})?;

            info!("Dump saved to {}", output.display());
            Ok(())
        }

        Command::WriteSram { input } => {
            let source = fs::read(input)?;
            let mut last_kibibyte = 0;

            session.write_sram(&header, &source, |progress| {
                let kibibyte = progress.transferred / 1024;

                if kibibyte != last_kibibyte || progress.transferred == progress.total {
                    last_kibibyte = kibibyte;
                    info!("Writing SRAM: {progress}");
                }
            })?;

            info!("SRAM written from {}", input.display());
            Ok(())
        }
    }
}

/// Print the serial ports the operating system knows about.
fn list_ports() -> Result<(), Box<dyn Error>> {
    let ports = serialport::available_ports()?;

    if ports.is_empty() {
        println!("No serial ports found");
    }

    for port in ports {
        println!("{}", port.port_name);
    }

    Ok(())
}
