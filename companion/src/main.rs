// companion/src/main.rs — vmscope guest companion entrypoint
//
// Runs inside the guest and publishes beacons the host engine finds by
// scanning the memory-backend file. Two modes: a continuous service that
// cycles PID generations, round-robin detail, and heartbeats through a
// category arena; and a triggered single-shot that writes one beacon,
// prints BEACON_READY, and exits.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use vmscope_protocol::{Category, MapRecord};

mod pagemap;
mod procfs;
mod triggered;
mod writer;

use writer::BeaconArena;

/// PIDs given full detail per round-robin cycle.
const PIDS_PER_BATCH: usize = 5;
/// Sections stored per process.
const MAX_SECTIONS: usize = 100;

#[derive(Parser)]
#[command(
    name = "vmscope-companion",
    version,
    about = "Publishes process and memory-map beacons for a host-side introspector",
    long_about = "Triggered mode (default) writes one beacon snapshot and exits; \
--serve runs the continuous category writer until killed."
)]
struct Cli {
    /// Request id (hex) stamped into the triggered beacon
    #[arg(long, value_parser = parse_hex_id)]
    request: Option<u32>,

    /// PID to include detailed memory maps for
    #[arg(long, default_value_t = 0)]
    focus: u32,

    /// Keep the beacon memory mapped after writing (triggered mode)
    #[arg(long)]
    keep_alive: bool,

    /// Run the continuous beacon service instead of a single shot
    #[arg(long)]
    serve: bool,

    /// Seconds between service cycles
    #[arg(long, default_value_t = 1)]
    interval: u64,

    /// Log verbosely
    #[arg(long)]
    verbose: bool,
}

fn parse_hex_id(s: &str) -> Result<u32, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).map_err(|e| format!("bad hex id: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    if cli.serve {
        serve(cli.focus, cli.interval);
        // The service loop only returns if the arena could not be set up.
        return ExitCode::from(1);
    }

    // Triggered single shot. Derive a request id when none was given so
    // the ready line is always actionable.
    let request_id = cli.request.unwrap_or_else(|| {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        secs ^ std::process::id()
    });
    match triggered::run(request_id, cli.focus, cli.keep_alive) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!("triggered beacon failed: {e}");
            ExitCode::from(1)
        }
    }
}

/// The continuous service: every cycle refreshes the discovery directory,
/// writes a full PID generation, advances the round-robin detail window,
/// feeds the camera, and stamps the heartbeat.
fn serve(camera_pid: u32, interval_secs: u64) {
    let session_id = std::process::id();
    let mut arena = BeaconArena::new(session_id);
    arena.init_message_rings();

    // Hints are a one-time measurement: the pages never move, and pagemap
    // reads are privileged on hardened kernels.
    let mut pagemap = pagemap::PagemapReader::open_self()
        .map_err(|e| warn!("pagemap unavailable, publishing without hints: {e}"))
        .ok();
    arena.write_discovery(pagemap.as_mut());

    info!(
        "serving session {session_id:#x}: {} pages at {:p}",
        arena.total_pages(),
        arena.base_ptr()
    );

    let mut roundrobin_index = 0usize;
    let mut carry: Vec<MapRecord> = Vec::new();
    loop {
        let pids = procfs::scan_pids();
        arena.write_pid_generation(&pids);

        // Round-robin detail: a few PIDs per cycle, carrying overflow
        // records into the next page.
        let mut records = std::mem::take(&mut carry);
        for i in 0..PIDS_PER_BATCH {
            let Some(&pid) = pids.get(roundrobin_index + i) else {
                break;
            };
            collect_detail(pid, &mut records);
        }
        roundrobin_index += PIDS_PER_BATCH;
        if roundrobin_index >= pids.len() {
            roundrobin_index = 0;
            info!("round-robin completed a full pass over {} PIDs", pids.len());
        }
        carry = arena.write_detail(Category::RoundRobin, records);

        if camera_pid > 0 {
            let mut focus_records = Vec::new();
            collect_detail(camera_pid, &mut focus_records);
            arena.write_detail(Category::Camera, focus_records);
        }

        arena.write_discovery(None);
        arena.write_heartbeat();
        arena.write_log(&[format!(
            "cycle gen={} pids={} pages={}",
            arena.generation(),
            pids.len(),
            arena.pages_written()
        )]);

        thread::sleep(Duration::from_secs(interval_secs.max(1)));
    }
}

/// One process's detail: its entry record followed by its section records.
fn collect_detail(pid: u32, out: &mut Vec<MapRecord>) {
    let Ok(mut entry) = procfs::read_process_entry(pid) else {
        return; // raced with process exit
    };
    let sections = procfs::read_sections(pid, MAX_SECTIONS).unwrap_or_default();
    entry.num_sections = sections.len() as u32;
    out.push(MapRecord::Process(entry));
    out.extend(sections.into_iter().map(MapRecord::Section));
}
