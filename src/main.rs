#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use pic_uart_programmer::hexfile::{self, ByteOrder, DecodeOptions, EncodeOptions};
use pic_uart_programmer::memory::{parse_hex, SparseMemory};
use pic_uart_programmer::protocol::BULK_ERASE_ADDR;
use pic_uart_programmer::session::{PhaseResult, SessionError};
use pic_uart_programmer::sim::Simulator;
use pic_uart_programmer::{
    DeviceChannel, DeviceProfile, Mode, Options, Orchestrator, Programmer, Report, Retry,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    /// Serial port to connect to
    #[structopt(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Device profile INI file, required for flash, verify and dump
    #[structopt(short, long)]
    device: Option<PathBuf>,

    /// Use low-voltage programming instead of high-voltage
    #[structopt(long)]
    lvp: bool,

    /// Simulate without hardware
    #[structopt(long)]
    dry_run: bool,

    /// Retries per block command before giving up
    #[structopt(long, default_value = "0")]
    retries: usize,

    /// Word byte order in HEX files being flashed or verified
    #[structopt(long, default_value = "little")]
    hex_order: ByteOrder,

    /// Word byte order in dumped HEX files
    #[structopt(long, default_value = "big")]
    dump_order: ByteOrder,

    /// Reject HEX files with malformed records or bad checksums
    #[structopt(long)]
    strict: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Write a HEX file to program flash, verifying each row
    Flash {
        hexfile: PathBuf,

        /// Also write configuration words
        #[structopt(short, long)]
        config: bool,
    },
    /// Verify device memory against a HEX file
    Verify { hexfile: PathBuf },
    /// Dump program flash and configuration to a HEX file
    Dump { file: PathBuf },
    /// Erase all program flash
    Wipe,
    /// Write hex encoded words at an address, e.g. `write 0x0010 8131FFEE`
    Write {
        #[structopt(parse(try_from_str = parse_addr))]
        addr: u16,
        data: String,
    },
    /// Erase the row containing an address
    EraseRow {
        #[structopt(parse(try_from_str = parse_addr))]
        addr: u16,
    },
    /// Read and display words, e.g. `read 0x0000 128`
    Read {
        #[structopt(parse(try_from_str = parse_addr))]
        addr: u16,
        len: u32,
    },
}

impl Operation {
    fn needs_profile(&self) -> bool {
        matches!(
            self,
            Operation::Flash { .. } | Operation::Verify { .. } | Operation::Dump { .. }
        )
    }
}

fn parse_addr(s: &str) -> Result<u16, String> {
    parse_hex(s)
        .and_then(|a| u16::try_from(a).ok())
        .ok_or_else(|| format!("invalid 16-bit hex address '{}'", s))
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(&o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: &Args) -> anyhow::Result<()> {
    let profile = match &o.device {
        Some(path) => {
            let p = DeviceProfile::load(path)
                .with_context(|| format!("loading device profile {}", path.display()))?;

            info!(
                "Device: {} | Row Size: {} words | Config Range: {}",
                p.name(),
                p.words_per_write_row(),
                p.config_region()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            p
        }
        None if o.operation.needs_profile() => {
            bail!("--device is required for flash, verify and dump")
        }
        None => DeviceProfile::new("Unknown", 0x20, 0, None)?,
    };

    info!("Dry run: {}", o.dry_run);

    let ok = if o.dry_run {
        let row = u16::try_from(profile.words_per_write_row()).unwrap_or(u16::MAX);
        let sim = Simulator::new().with_row_size(row);
        execute(o, Retry::new(sim, o.retries + 1), profile)?
    } else {
        info!("Connecting to serial port");
        let p = Programmer::linux(&o.port, o.baud, o.options.clone())
            .map_err(|e| anyhow!("Error connecting to serial port: {:?}", e))?;
        execute(o, Retry::new(p, o.retries + 1), profile)?
    };

    if !ok {
        bail!("operation failed");
    }

    Ok(())
}

fn load_image(path: &Path, options: &DecodeOptions) -> anyhow::Result<SparseMemory> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let image = hexfile::decode(&text, options)
        .with_context(|| format!("decoding {}", path.display()))?;

    info!("Loaded {} words from {}", image.len(), path.display());

    Ok(image)
}

fn summarise<E: std::fmt::Debug>(name: &str, report: &Report<E>) -> bool {
    for (label, phase) in [("Program", &report.flash), ("Config", &report.config)].iter() {
        match phase {
            PhaseResult::Skipped => debug!("{}: skipped", label),
            PhaseResult::Ok { blocks } => info!("{}: {} blocks OK", label, blocks),
            PhaseResult::Failed(f) => error!("{}: {}", label, f),
        }
    }

    if report.is_success() {
        info!("{} COMPLETE: SUCCESS", name);
    } else {
        error!("{} COMPLETE: FAILED", name);
    }

    report.is_success()
}

fn execute<C: DeviceChannel>(
    o: &Args,
    channel: C,
    profile: DeviceProfile,
) -> anyhow::Result<bool> {
    let decode = DecodeOptions {
        byte_order: o.hex_order,
        strict: o.strict,
    };

    // Load inputs before touching the device
    let image = match &o.operation {
        Operation::Flash { hexfile, .. } | Operation::Verify { hexfile } => {
            load_image(hexfile, &decode)?
        }
        _ => SparseMemory::new(),
    };

    let data = match &o.operation {
        Operation::Write { data, .. } => {
            let d = hex::decode(data).with_context(|| format!("invalid hex data '{}'", data))?;
            if d.len() % 2 != 0 {
                bail!("hex data must be a whole number of 16-bit words");
            }
            d
        }
        _ => Vec::new(),
    };

    let mode = if o.lvp {
        Mode::LowVoltage
    } else {
        Mode::HighVoltage
    };

    let mut orch = Orchestrator::new(channel, profile).simulate(o.dry_run);

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::default_bar().template("{msg:>14} [{bar:40}] {pos}/{len}"));

    let b = bar.clone();
    orch.on_progress(move |phase, done, total| {
        b.set_message(&phase.to_string());
        b.set_length(total as u64);
        b.set_position(done as u64);
    });

    let result = orch.run(mode, |s| -> anyhow::Result<bool> {
        match &o.operation {
            Operation::Flash { config, .. } => {
                let report = s.flash(&image, *config);
                Ok(summarise("FLASH", &report))
            }
            Operation::Verify { .. } => {
                let report = s.verify(&image);
                Ok(summarise("VERIFY", &report))
            }
            Operation::Dump { file } => {
                let dump = s.dump();

                let text = hexfile::encode(
                    &dump.memory,
                    &EncodeOptions {
                        byte_order: o.dump_order,
                    },
                )?;
                fs::write(file, &text).with_context(|| format!("writing {}", file.display()))?;

                info!(
                    "Saved {} words ({}) to {}",
                    dump.memory.len(),
                    bytefmt::format(text.len() as u64),
                    file.display()
                );

                for f in &dump.failures {
                    error!("Missing block: {}", f);
                }
                Ok(dump.failures.is_empty())
            }
            Operation::Wipe => {
                info!("Wiping device flash");
                match s.bulk_erase(BULK_ERASE_ADDR) {
                    Ok(()) => {
                        info!("Wipe OK");
                        Ok(true)
                    }
                    Err(e) => {
                        error!("Wipe failed: {:?}", e);
                        Ok(false)
                    }
                }
            }
            Operation::Write { addr, .. } => {
                info!(
                    "Writing {} ({} words) to 0x{:04X}",
                    hex::encode(&data),
                    data.len() / 2,
                    addr
                );
                match s.write_words(*addr, &data) {
                    Ok(()) if o.dry_run => info!("Success (Simulated)"),
                    Ok(()) => info!("Success, verify match"),
                    Err(f) => {
                        error!("{}", f);
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Operation::EraseRow { addr } => {
                info!("Erasing row at 0x{:04X}", addr);
                match s.erase_row(*addr) {
                    Ok(()) => {
                        info!("Erase OK");
                        Ok(true)
                    }
                    Err(e) => {
                        error!("Erase failed: {:?}", e);
                        Ok(false)
                    }
                }
            }
            Operation::Read { addr, len } => {
                info!("Reading {} words from 0x{:04X}", len, addr);
                let words = match s.read_words(*addr as u32, *len) {
                    Ok(w) => w,
                    Err(f) => {
                        error!("{}", f);
                        return Ok(false);
                    }
                };

                for (i, line) in words.chunks(8).enumerate() {
                    let text: Vec<_> = line.iter().map(|w| format!("{:04X}", w)).collect();
                    println!("0x{:04X}: {}", *addr as usize + i * 8, text.join(" "));
                }
                Ok(true)
            }
        }
    });

    bar.finish_and_clear();

    match result {
        Ok(r) => r,
        Err(SessionError::Connection(e)) => Err(anyhow!("Error connecting to programmer: {:?}", e)),
        Err(e) => Err(anyhow!("{}", e)),
    }
}
