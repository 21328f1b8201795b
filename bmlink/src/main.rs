// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line front end for the Black Magic Probe driver: program,
//! verify, erase and dump target flash, and bring up SWO tracing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bmlink_firmware::{Firmware, VectorPatch};
use bmlink_session::{
    expand_command, Session, Status, TargetInfo,
};

#[derive(Parser)]
#[clap(name = "bmlink", version, max_term_width = 80)]
/// Talk to a Black Magic Probe: flash, verify, dump and trace ARM
/// Cortex-M targets over the probe's GDB server.
struct Args {
    /// Index of the USB probe to use (see `bmlink list`)
    #[clap(long, short = 'p', default_value = "0", global = true)]
    probe: usize,

    /// Connect to a network probe (ctxLink) at this address instead
    #[clap(long, value_name = "ADDR", global = true)]
    ip: Option<String>,

    /// Turn on the probe's target-power switch if no voltage is sensed
    #[clap(long, global = true)]
    autopower: bool,

    /// Hold the target in reset while connecting
    #[clap(long, global = true)]
    connect_reset: bool,

    /// Override the detected MCU family name
    #[clap(long, value_name = "FAMILY", global = true)]
    mcu: Option<String>,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List detected probes and serial ports
    List,
    /// Scan the local network for ctxLink probes
    Scan {
        /// Stop after this many probes
        #[clap(long, default_value = "8")]
        max: usize,
    },
    /// Show probe identity, part id and monitor commands
    Info,
    /// Program a firmware image (ELF, Intel HEX or BIN) into flash
    Flash {
        file: PathBuf,
        /// Check the programmed flash against the image afterwards
        #[clap(long)]
        verify: bool,
        /// Erase all of flash first, not just the sectors written
        #[clap(long)]
        full_erase: bool,
        /// Set the NXP code-read-protection level (1, 2, 3, 4 or 9)
        #[clap(long, value_name = "LEVEL")]
        crp: Option<u8>,
        /// Load address for BIN images (hex)
        #[clap(long, value_name = "ADDR")]
        offset: Option<String>,
        /// Fix up the NXP LPC vector-table checksum before writing
        #[clap(long)]
        patch_vecttable: bool,
    },
    /// Compare target flash against a firmware image
    Verify {
        file: PathBuf,
        /// Load address for BIN images (hex)
        #[clap(long, value_name = "ADDR")]
        offset: Option<String>,
    },
    /// Erase target flash
    Erase {
        /// Erase only this many bytes
        #[clap(long, value_name = "BYTES")]
        size: Option<u32>,
    },
    /// Check that target flash is fully erased
    BlankCheck {
        #[clap(long, value_name = "BYTES")]
        size: Option<u32>,
    },
    /// Read target flash into a BIN file
    Dump {
        out: PathBuf,
        #[clap(long, value_name = "BYTES")]
        size: Option<u32>,
    },
    /// Configure the target for SWO trace and enable capture
    Trace {
        /// Async (NRZ) bitrate; omit for Manchester coding
        #[clap(long)]
        bitrate: Option<u32>,
        /// Target core clock, used to derive the trace divisor
        #[clap(long, value_name = "HZ")]
        clock: Option<u32>,
        /// Stimulus channel mask to enable
        #[clap(long, default_value = "1")]
        channels: u32,
    },
    /// Run a raw monitor command (prefixes are expanded)
    Monitor {
        #[clap(required = true)]
        words: Vec<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.cmd {
        Cmd::List => return list(),
        Cmd::Scan { max } => return scan(*max),
        _ => {}
    }

    let mut session = Session::new();
    session.set_status_handler(Box::new(|status, msg| {
        if status.is_error() {
            eprintln!("error: {}", msg);
        } else if status == Status::Success {
            eprintln!("{}", msg);
        } else {
            eprintln!("  {}", msg);
        }
    }));
    session
        .connect(args.probe, args.ip.as_deref())
        .context("cannot connect to the probe")?;

    if args.connect_reset {
        // The probe decides what its reset-on-connect command is called;
        // find it by prefix rather than hard-coding a firmware vintage.
        let list = session.monitor_commands()?;
        match expand_command("connect", &list) {
            Some(cmd) => {
                let cmd = format!("{} enable", cmd);
                session.monitor(&cmd)?;
            }
            None => log::warn!("probe has no connect-reset command"),
        }
    }

    let result = run(&mut session, &args);
    session.disconnect();
    result
}

fn run(session: &mut Session, args: &Args) -> Result<()> {
    match &args.cmd {
        Cmd::List | Cmd::Scan { .. } => unreachable!("handled in main"),
        Cmd::Info => info(session),
        Cmd::Flash {
            file,
            verify,
            full_erase,
            crp,
            offset,
            patch_vecttable,
        } => {
            let mut fw = load_image(file, offset.as_deref())?;
            let target = attach(session, args)?;
            let driver =
                args.mcu.clone().unwrap_or_else(|| target.driver.clone());

            if *patch_vecttable {
                match fw.patch_vector_table(&driver) {
                    VectorPatch::Patched => {
                        eprintln!("vector-table checksum patched")
                    }
                    VectorPatch::AlreadySet => {}
                    VectorPatch::NotNxp => {
                        bail!("{} takes no vector-table checksum", driver)
                    }
                    VectorPatch::NoVectorTable => {
                        bail!("image has no vector table to patch")
                    }
                }
            }
            if let Some(level) = crp {
                fw.set_crp_level(*level)
                    .context("cannot set the CRP level")?;
            }
            if *full_erase {
                session.full_erase(None)?;
            }
            session.download(&fw)?;
            let (written, _) = session.progress();
            eprintln!("{} bytes programmed", fw.byte_count());
            log::debug!("progress counter finished at {}", written);

            if *verify && !session.verify(&fw)? {
                bail!("verification failed");
            }
            session.detach(false)?;
            Ok(())
        }
        Cmd::Verify { file, offset } => {
            let fw = load_image(file, offset.as_deref())?;
            attach(session, args)?;
            if !session.verify(&fw)? {
                bail!("verification failed");
            }
            Ok(())
        }
        Cmd::Erase { size } => {
            attach(session, args)?;
            session.full_erase(*size)?;
            Ok(())
        }
        Cmd::BlankCheck { size } => {
            attach(session, args)?;
            if !session.blank_check(*size)? {
                bail!("flash is not blank");
            }
            Ok(())
        }
        Cmd::Dump { out, size } => {
            attach(session, args)?;
            session.dump_flash(out, *size)?;
            Ok(())
        }
        Cmd::Trace { bitrate, clock, channels } => {
            let target = attach(session, args)?;
            let driver =
                args.mcu.clone().unwrap_or_else(|| target.driver.clone());
            trace(session, &driver, &target.arch, *bitrate, *clock, *channels)
        }
        Cmd::Monitor { words } => {
            let list = session.monitor_commands()?;
            let mut words = words.clone();
            if let Some(full) = expand_command(&words[0], &list) {
                words[0] = full.to_string();
            }
            let cmd = words.join(" ");
            if !session.monitor(&cmd)? {
                bail!("monitor command failed");
            }
            Ok(())
        }
    }
}

fn list() -> Result<()> {
    let probes = bmlink_transport::find_probes();
    if probes.is_empty() {
        println!("no probes found");
    }
    for (index, probe) in probes.iter().enumerate() {
        match &probe.serial {
            Some(serial) => {
                println!("{}: {} (serial {})", index, probe.port, serial)
            }
            None => println!("{}: {}", index, probe.port),
        }
    }
    println!();
    println!("serial ports:");
    for port in bmlink_transport::collect_ports() {
        println!("  {}", port);
    }
    Ok(())
}

fn scan(max: usize) -> Result<()> {
    if let Some(ip) = bmlink_transport::local_ip() {
        eprintln!("scanning from {}", ip);
    }
    let found = bmlink_transport::scan_network(max)
        .context("network scan failed")?;
    if found.is_empty() {
        println!("no network probes answered");
    }
    for addr in found {
        println!("{}", addr);
    }
    Ok(())
}

fn info(session: &mut Session) -> Result<()> {
    println!("probe: {:?}", session.probe_kind()?);
    let commands = session.monitor_commands()?;
    println!("monitor commands: {}", commands);

    // Attach so the target-side queries have something to talk to.
    let target = session.attach(false)?;
    println!("target: {} {}", target.driver, target.arch);
    if let Some(id) = session.part_id()? {
        println!("part id: {:#010x}", id);
    }
    for region in session.regions() {
        println!(
            "flash: {:#010x} + {:#x} (sector {:#x})",
            region.base, region.size, region.block_size
        );
    }
    Ok(())
}

fn attach(session: &mut Session, args: &Args) -> Result<TargetInfo> {
    session
        .attach(args.autopower)
        .context("cannot attach to the target")
}

fn trace(
    session: &mut Session,
    driver: &str,
    arch: &str,
    bitrate: Option<u32>,
    clock: Option<u32>,
    channels: u32,
) -> Result<()> {
    // Pin routing first; not every family needs one.
    match bmlink_script::run("swo-device", driver, arch, &mut [], session) {
        Err(bmlink_script::ScriptError::UnknownScript { .. }) => {
            log::debug!("no swo-device script for {}", driver);
        }
        other => other.context("SWO pin setup failed")?,
    }

    // 1 = Manchester, 2 = NRZ; the divisor only matters for NRZ.
    let protocol: u32 = if bitrate.is_some() { 2 } else { 1 };
    let divisor = match (clock, bitrate) {
        (Some(clock), Some(bitrate)) if bitrate > 0 => {
            clock / bitrate - 1
        }
        _ => 0,
    };
    bmlink_script::run(
        "swo-trace",
        driver,
        arch,
        &mut [protocol, divisor],
        session,
    )
    .context("SWO trace setup failed")?;
    bmlink_script::run(
        "swo-channels",
        driver,
        arch,
        &mut [channels],
        session,
    )
    .context("cannot enable trace channels")?;

    let endpoint = session.enable_trace(bitrate)?;
    println!("trace capture enabled on USB endpoint {:#04x}", endpoint);
    Ok(())
}

fn load_image(path: &Path, offset: Option<&str>) -> Result<Firmware> {
    let mut fw = Firmware::load(path)
        .with_context(|| format!("cannot load {}", path.display()))?;
    if let Some(offset) = offset {
        let hex = offset
            .strip_prefix("0x")
            .or_else(|| offset.strip_prefix("0X"))
            .unwrap_or(offset);
        let addr = u32::from_str_radix(hex, 16)
            .with_context(|| format!("bad load address {:?}", offset))?;
        fw.relocate(addr);
    }
    Ok(fw)
}
